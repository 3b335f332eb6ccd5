use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Primary bind address (default: 127.0.0.1:3210).
    pub bind: SocketAddr,
    /// Override for the data root; `None` resolves via [`crate::paths`].
    pub root_dir: Option<PathBuf>,
    /// How long a reconnect to an already-terminal run waits for further
    /// chunks before synthesizing `finish`.
    pub reconnect_idle_timeout: Duration,
    /// How long a finished run's buffer stays replayable once unattached.
    pub run_retention: Duration,
    /// Interval of the background sweep evicting finished runs.
    pub run_sweep_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 3210),
            root_dir: None,
            reconnect_idle_timeout: Duration::from_millis(1_000),
            run_retention: Duration::from_secs(300),
            run_sweep_interval: Duration::from_secs(30),
        }
    }
}
