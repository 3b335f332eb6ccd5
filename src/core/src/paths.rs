use std::path::{Path, PathBuf};

use directories::BaseDirs;

const PENDING_DIR: &str = "_pending";
const ATTACHMENTS_DIR: &str = "attachments";

pub fn user_home_dir() -> Option<PathBuf> {
    if let Some(base) = BaseDirs::new() {
        return Some(base.home_dir().to_path_buf());
    }
    std::env::var_os("HOME")
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
}

/// Resolve the Corazon data root.
///
/// Order: `CORAZON_ROOT_DIR`, an existing legacy `~/.corazon`, then the
/// platform config directory (`~/.config/corazon`, `Application Support`,
/// `%APPDATA%`).
pub fn corazon_root_dir() -> Result<PathBuf, String> {
    if let Some(configured) = std::env::var_os("CORAZON_ROOT_DIR") {
        let path = PathBuf::from(configured);
        if path.is_relative() {
            return Err("CORAZON_ROOT_DIR must be an absolute path".to_string());
        }
        return Ok(path);
    }

    let home = user_home_dir().ok_or_else(|| {
        "failed to resolve user home; set CORAZON_ROOT_DIR or HOME".to_string()
    })?;
    let legacy = home.join(".corazon");
    if legacy.exists() {
        return Ok(legacy);
    }
    if let Some(base) = BaseDirs::new() {
        let dir_name = if cfg!(target_os = "linux") {
            "corazon"
        } else {
            "Corazon"
        };
        return Ok(base.config_dir().join(dir_name));
    }
    Ok(home.join(".config").join("corazon"))
}

/// Whether `id` names exactly one directory entry below its parent.
pub fn is_path_component(id: &str) -> bool {
    !id.trim().is_empty() && id != "." && id != ".." && !id.contains(['/', '\\', '\0'])
}

/// Filesystem layout of per-thread working directories and attachments.
///
/// ```text
/// <root>/threads/
///   _pending/<upload-id>/      staged uploads of a not-yet-sent message
///   <thread-id>/               engine working directory
///     attachments/             relocated uploads
/// ```
#[derive(Debug, Clone)]
pub struct ThreadPaths {
    root: PathBuf,
}

impl ThreadPaths {
    pub fn new(data_root: &Path) -> Self {
        Self {
            root: data_root.join("threads"),
        }
    }

    /// Threads root, created on demand.
    pub fn ensure_root(&self) -> Result<PathBuf, String> {
        std::fs::create_dir_all(&self.root)
            .map_err(|e| format!("create threads root {}: {e}", self.root.display()))?;
        Ok(self.root.clone())
    }

    pub fn thread_dir(&self, thread_id: &str) -> PathBuf {
        self.root.join(thread_id)
    }

    pub fn ensure_thread_dir(&self, thread_id: &str) -> Result<PathBuf, String> {
        let dir = self.thread_dir(thread_id);
        std::fs::create_dir_all(&dir)
            .map_err(|e| format!("create thread dir {}: {e}", dir.display()))?;
        Ok(dir)
    }

    pub fn ensure_attachments_dir(&self, thread_id: &str) -> Result<PathBuf, String> {
        let dir = self.ensure_thread_dir(thread_id)?.join(ATTACHMENTS_DIR);
        std::fs::create_dir_all(&dir)
            .map_err(|e| format!("create attachments dir {}: {e}", dir.display()))?;
        Ok(dir)
    }

    /// Callers must check `upload_id` with [`is_path_component`].
    pub fn pending_dir(&self, upload_id: &str) -> PathBuf {
        self.root.join(PENDING_DIR).join(upload_id)
    }

    pub fn remove_thread_dir(&self, thread_id: &str) -> Result<(), String> {
        let dir = self.thread_dir(thread_id);
        if !dir.exists() {
            return Ok(());
        }
        std::fs::remove_dir_all(&dir).map_err(|e| format!("remove {}: {e}", dir.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_nests_attachments_under_thread() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ThreadPaths::new(dir.path());
        let attachments = paths.ensure_attachments_dir("t1").unwrap();
        assert_eq!(
            attachments,
            dir.path().join("threads").join("t1").join("attachments")
        );
        assert!(attachments.is_dir());
        assert_eq!(
            paths.pending_dir("u1"),
            dir.path().join("threads").join("_pending").join("u1")
        );
    }

    #[test]
    fn remove_thread_dir_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let paths = ThreadPaths::new(dir.path());
        paths.ensure_thread_dir("t1").unwrap();
        paths.remove_thread_dir("t1").unwrap();
        assert!(!paths.thread_dir("t1").exists());
        paths.remove_thread_dir("t1").unwrap();
    }

    #[test]
    fn path_components_cannot_climb_out() {
        assert!(is_path_component("019a-upload"));
        for bad in ["", "  ", ".", "..", "../victim", "a/b", "a\\b", "nul\0"] {
            assert!(!is_path_component(bad), "{bad:?} should be rejected");
        }
    }
}
