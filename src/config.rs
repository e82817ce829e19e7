//! Runtime configuration.
//!
//! Plain structs with defaults, loadable from the environment. A `.env` file
//! is honoured when present.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_write_timeout_ms() -> u64 {
    30_000
}

/// Tunnel proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Fixed upstream `host:port` for transparent mode; `None` means
    /// CONNECT-only, with the target taken from each request's authority.
    #[serde(default)]
    pub server_address: Option<String>,

    /// Timeout for establishing (and confirming) the upstream connection.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-wait timeout for draining writes to a slow peer.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            server_address: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

impl ProxyConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let server_address = env::var("TUNNEL_SERVER_ADDRESS")
            .ok()
            .filter(|address| !address.trim().is_empty());
        let connect_timeout_ms = env::var("TUNNEL_CONNECT_TIMEOUT_MS")
            .unwrap_or_else(|_| default_connect_timeout_ms().to_string())
            .parse()
            .context("Invalid TUNNEL_CONNECT_TIMEOUT_MS")?;
        let write_timeout_ms = env::var("TUNNEL_WRITE_TIMEOUT_MS")
            .unwrap_or_else(|_| default_write_timeout_ms().to_string())
            .parse()
            .context("Invalid TUNNEL_WRITE_TIMEOUT_MS")?;

        if connect_timeout_ms == 0 {
            bail!("TUNNEL_CONNECT_TIMEOUT_MS must be greater than 0");
        }
        if write_timeout_ms == 0 {
            bail!("TUNNEL_WRITE_TIMEOUT_MS must be greater than 0");
        }

        Ok(Self {
            server_address,
            connect_timeout_ms,
            write_timeout_ms,
        })
    }
}

fn default_max_cache_size() -> u64 {
    256_000_000
}

fn default_max_cached_file_size() -> u64 {
    200_000_000
}

fn default_max_cached_files() -> usize {
    2_048
}

/// Resource cache budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum total bytes held by the cache.
    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: u64,

    /// Maximum size of a single cacheable file; larger files are served
    /// read-through only.
    #[serde(default = "default_max_cached_file_size")]
    pub max_cached_file_size: u64,

    /// Maximum number of cached entries.
    #[serde(default = "default_max_cached_files")]
    pub max_cached_files: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_size: default_max_cache_size(),
            max_cached_file_size: default_max_cached_file_size(),
            max_cached_files: default_max_cached_files(),
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let max_cache_size = env::var("CACHE_MAX_SIZE")
            .unwrap_or_else(|_| default_max_cache_size().to_string())
            .parse()
            .context("Invalid CACHE_MAX_SIZE")?;
        let max_cached_file_size = env::var("CACHE_MAX_FILE_SIZE")
            .unwrap_or_else(|_| default_max_cached_file_size().to_string())
            .parse()
            .context("Invalid CACHE_MAX_FILE_SIZE")?;
        let max_cached_files = env::var("CACHE_MAX_FILES")
            .unwrap_or_else(|_| default_max_cached_files().to_string())
            .parse()
            .context("Invalid CACHE_MAX_FILES")?;

        if max_cached_files == 0 {
            bail!("CACHE_MAX_FILES must be greater than 0");
        }

        Ok(Self {
            max_cache_size,
            max_cached_file_size,
            max_cached_files,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env vars are process-global; serialize the tests that touch them.
    static TEST_MUTEX: Mutex<()> = Mutex::new(());

    fn clear_env() {
        env::remove_var("TUNNEL_SERVER_ADDRESS");
        env::remove_var("TUNNEL_CONNECT_TIMEOUT_MS");
        env::remove_var("TUNNEL_WRITE_TIMEOUT_MS");
        env::remove_var("CACHE_MAX_SIZE");
        env::remove_var("CACHE_MAX_FILE_SIZE");
        env::remove_var("CACHE_MAX_FILES");
    }

    #[test]
    fn proxy_defaults_match_documented_values() {
        let config = ProxyConfig::default();
        assert_eq!(config.server_address, None);
        assert_eq!(config.connect_timeout_ms, 5_000);
        assert_eq!(config.write_timeout_ms, 30_000);
    }

    #[test]
    fn proxy_config_reads_environment() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_env();
        env::set_var("TUNNEL_SERVER_ADDRESS", "backend.internal:8080");
        env::set_var("TUNNEL_CONNECT_TIMEOUT_MS", "1500");

        let config = ProxyConfig::from_env().unwrap();
        assert_eq!(
            config.server_address.as_deref(),
            Some("backend.internal:8080")
        );
        assert_eq!(config.connect_timeout_ms, 1_500);
        assert_eq!(config.write_timeout_ms, 30_000);

        clear_env();
    }

    #[test]
    fn proxy_config_rejects_zero_timeouts() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_env();
        env::set_var("TUNNEL_CONNECT_TIMEOUT_MS", "0");

        let err = ProxyConfig::from_env().unwrap_err().to_string();
        assert!(err.contains("TUNNEL_CONNECT_TIMEOUT_MS"), "{err}");

        clear_env();
    }

    #[test]
    fn proxy_config_rejects_garbage_timeouts() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_env();
        env::set_var("TUNNEL_WRITE_TIMEOUT_MS", "soon");

        let err = ProxyConfig::from_env().unwrap_err().to_string();
        assert!(err.contains("TUNNEL_WRITE_TIMEOUT_MS"), "{err}");

        clear_env();
    }

    #[test]
    fn cache_config_reads_environment() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_env();
        env::set_var("CACHE_MAX_SIZE", "95");
        env::set_var("CACHE_MAX_FILE_SIZE", "85");
        env::set_var("CACHE_MAX_FILES", "4");

        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.max_cache_size, 95);
        assert_eq!(config.max_cached_file_size, 85);
        assert_eq!(config.max_cached_files, 4);

        clear_env();
    }

    #[test]
    fn cache_config_rejects_zero_file_count() {
        let _lock = TEST_MUTEX.lock().unwrap();
        clear_env();
        env::set_var("CACHE_MAX_FILES", "0");

        let err = CacheConfig::from_env().unwrap_err().to_string();
        assert!(err.contains("CACHE_MAX_FILES"), "{err}");

        clear_env();
    }
}
