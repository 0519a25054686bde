//! Agent configuration.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::api::ExecutorResources;
use crate::callback::CallbackPolicy;

/// Agent configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control-plane bind address
    pub listen_addr: SocketAddr,

    /// Declared node capacity across the three admission axes
    pub capacity: ExecutorResources,

    /// Scratch space for download staging and upload compression
    pub temp_dir: PathBuf,

    /// Download cache directory
    pub cache_dir: PathBuf,

    /// Sandbox root for the local backend
    pub sandbox_dir: PathBuf,

    /// Retry policy for complete-url callbacks
    pub callback: CallbackPolicy,
}

impl Config {
    /// Load configuration from `BERTH_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let listen_addr: SocketAddr = std::env::var("BERTH_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:1700".to_string())
            .parse()?;

        let capacity = ExecutorResources {
            memory_mb: env_u64("BERTH_MEMORY_MB", 4096),
            disk_mb: env_u64("BERTH_DISK_MB", 16384),
            containers: env_u64("BERTH_CONTAINERS", 256),
        };

        let work_dir = std::env::var("BERTH_WORK_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("berth"));

        let temp_dir = std::env::var("BERTH_TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| work_dir.join("tmp"));
        let cache_dir = std::env::var("BERTH_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| work_dir.join("cache"));
        let sandbox_dir = std::env::var("BERTH_SANDBOX_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| work_dir.join("sandboxes"));

        let callback = CallbackPolicy {
            max_attempts: env_u64("BERTH_CALLBACK_ATTEMPTS", 5) as u32,
            base_delay: Duration::from_millis(env_u64("BERTH_CALLBACK_BASE_DELAY_MS", 500)),
        };

        Ok(Config {
            listen_addr,
            capacity,
            temp_dir,
            cache_dir,
            sandbox_dir,
            callback,
        })
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::from_env().expect("config");
        assert!(config.capacity.memory_mb > 0);
        assert!(config.capacity.containers > 0);
        assert!(config.callback.max_attempts > 0);
    }
}
