use std::collections::HashMap;
use std::path::{Path, PathBuf};

use corazon_protocol::{UiMessage, UiPart};

use super::input::strip_file_url;
use crate::paths::{is_path_component, ThreadPaths};

/// Move staged uploads of `upload_id` into the thread's attachment
/// directory. Returns the old → new path mapping; empty when nothing was
/// staged.
pub fn relocate_pending(
    paths: &ThreadPaths,
    upload_id: &str,
    thread_id: &str,
) -> Result<HashMap<String, String>, String> {
    if !is_path_component(upload_id) {
        return Err(format!("invalid upload id {upload_id:?}"));
    }
    let pending = paths.pending_dir(upload_id);
    let mut moved = HashMap::new();
    if !pending.is_dir() {
        return Ok(moved);
    }

    let target = paths.ensure_attachments_dir(thread_id)?;
    let entries =
        std::fs::read_dir(&pending).map_err(|e| format!("read {}: {e}", pending.display()))?;
    for entry in entries {
        let entry = entry.map_err(|e| format!("read {}: {e}", pending.display()))?;
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if !is_file {
            continue;
        }
        let from = entry.path();
        let to = unique_path(&target, &entry.file_name().to_string_lossy());
        std::fs::rename(&from, &to)
            .map_err(|e| format!("move {} -> {}: {e}", from.display(), to.display()))?;
        moved.insert(from.display().to_string(), to.display().to_string());
    }

    if let Err(e) = std::fs::remove_dir_all(&pending) {
        tracing::warn!(%upload_id, "failed to remove pending uploads: {e}");
    }
    Ok(moved)
}

/// First free `name`, `name-1`, `name-2`, ... in `dir`, keeping the
/// extension.
fn unique_path(dir: &Path, filename: &str) -> PathBuf {
    let candidate = dir.join(filename);
    if !candidate.exists() {
        return candidate;
    }
    let as_path = Path::new(filename);
    let (stem, extension) = match (as_path.file_stem(), as_path.extension()) {
        (Some(stem), Some(ext)) => (
            stem.to_string_lossy().to_string(),
            format!(".{}", ext.to_string_lossy()),
        ),
        _ => (filename.to_string(), String::new()),
    };
    (1..)
        .map(|index| dir.join(format!("{stem}-{index}{extension}")))
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}

/// Point `file://` parts at relocated paths, filling in a filename when the
/// part had none.
pub fn rewrite_attachment_urls(messages: &mut [UiMessage], moved: &HashMap<String, String>) {
    if moved.is_empty() {
        return;
    }
    for message in messages {
        for part in &mut message.parts {
            let UiPart::File { url, filename, .. } = part else {
                continue;
            };
            let Some(next) = strip_file_url(url).and_then(|path| moved.get(path)) else {
                continue;
            };
            let next = next.clone();
            if filename.is_none() {
                *filename = Path::new(&next)
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string());
            }
            *url = format!("file://{next}");
        }
    }
}
