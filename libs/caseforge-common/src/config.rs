use crate::types::{DEFAULT_MAX_ATTEMPTS, DEFAULT_TIMEOUT_MS};
use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    Memory,
}

impl StoreBackend {
    pub fn from_str(s: &str) -> Option<StoreBackend> {
        match s.to_lowercase().as_str() {
            "redis" => Some(StoreBackend::Redis),
            "memory" => Some(StoreBackend::Memory),
            _ => None,
        }
    }
}

/// Settings shared by producer and worker
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub store_backend: StoreBackend,
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub max_attempts: u32,
}

pub fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            store_backend: env::var("STORE_BACKEND")
                .ok()
                .and_then(|v| StoreBackend::from_str(&v))
                .unwrap_or(StoreBackend::Redis),
            default_timeout_ms: env_or("DEFAULT_TIMEOUT_MS", DEFAULT_TIMEOUT_MS),
            max_timeout_ms: env_or("MAX_TIMEOUT_MS", 30_000),
            max_attempts: env_or("MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS),
        }
    }

    /// Clamp a requested per-run timeout into the allowed range
    pub fn clamp_timeout(&self, requested_ms: Option<u64>) -> u64 {
        requested_ms
            .unwrap_or(self.default_timeout_ms)
            .clamp(1, self.max_timeout_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
