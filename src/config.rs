use std::env;
use std::num::ParseIntError;
use thiserror::Error;

/// Default cadence at which recorders slice media into chunks.
pub const DEFAULT_SEGMENT_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct Config {
    /// Endpoint of the signaling server, e.g. `wss://signal.example.com/ws`.
    pub signal_endpoint: String,
    /// STUN server used for ICE gathering.
    pub stun_url: String,
    /// Base URL of the backing media server; playback URLs are derived from it.
    pub media_base_url: String,
    /// Recorder segmentation interval in milliseconds.
    pub segment_ms: u64,
    pub rust_log: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is required")]
    MissingVariable(String),
    #[error("SEGMENT_MS must be a positive integer (got '{0}': {1})")]
    InvalidSegment(String, ParseIntError),
    #[error("SEGMENT_MS must be greater than zero")]
    SegmentOutOfRange,
}

/// Validates environment variables and returns a Config object.
/// Returns an error if any required variable is missing or invalid.
pub fn validate_env() -> Result<Config, ConfigError> {
    // Required: SIGNAL_ENDPOINT
    let signal_endpoint = env::var("SIGNAL_ENDPOINT")
        .map_err(|_| ConfigError::MissingVariable("SIGNAL_ENDPOINT".to_string()))?;

    // Required: MEDIA_BASE_URL (the playback URL convention needs it)
    let media_base_url = env::var("MEDIA_BASE_URL")
        .map_err(|_| ConfigError::MissingVariable("MEDIA_BASE_URL".to_string()))?;

    // Optional: STUN_URL (defaults to the public Google STUN server)
    let stun_url =
        env::var("STUN_URL").unwrap_or_else(|_| "stun:stun.l.google.com:19302".to_string());

    // Optional: SEGMENT_MS (defaults to 1-second slices)
    let segment_ms = match env::var("SEGMENT_MS") {
        Ok(raw) => {
            let parsed: u64 = raw
                .parse()
                .map_err(|e| ConfigError::InvalidSegment(raw.clone(), e))?;
            if parsed == 0 {
                return Err(ConfigError::SegmentOutOfRange);
            }
            parsed
        }
        Err(_) => DEFAULT_SEGMENT_MS,
    };

    // Optional: RUST_LOG (defaults to "info")
    let rust_log = env::var("RUST_LOG").unwrap_or_else(|_| {
        tracing::warn!("RUST_LOG not set, using default: info");
        "info".to_string()
    });

    let config = Config {
        signal_endpoint,
        stun_url,
        media_base_url,
        segment_ms,
        rust_log,
    };

    tracing::info!(
        signal_endpoint = %config.signal_endpoint,
        stun_url = %config.stun_url,
        segment_ms = config.segment_ms,
        "Configuration validated"
    );

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    use std::sync::Mutex;

    lazy_static::lazy_static! {
        static ref ENV_MUTEX: Mutex<()> = Mutex::new(());
    }

    // Helper to set up and tear down environment variables for tests
    struct EnvGuard<'a> {
        vars: Vec<String>,
        _guard: std::sync::MutexGuard<'a, ()>,
    }

    impl<'a> EnvGuard<'a> {
        fn new() -> Self {
            let guard = ENV_MUTEX.lock().unwrap();
            let mut this = EnvGuard {
                vars: Vec::new(),
                _guard: guard,
            };
            // Start from a clean slate for the variables under test.
            for key in ["SIGNAL_ENDPOINT", "MEDIA_BASE_URL", "STUN_URL", "SEGMENT_MS"] {
                this.unset(key);
            }
            this
        }

        fn set(&mut self, key: &str, value: &str) {
            env::set_var(key, value);
            self.vars.push(key.to_string());
        }

        fn unset(&mut self, key: &str) {
            env::remove_var(key);
            self.vars.push(key.to_string());
        }
    }

    impl<'a> Drop for EnvGuard<'a> {
        fn drop(&mut self) {
            for var in &self.vars {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_validate_env_valid_configuration() {
        let mut guard = EnvGuard::new();
        guard.set("SIGNAL_ENDPOINT", "wss://signal.test/ws");
        guard.set("MEDIA_BASE_URL", "https://media.test");
        guard.set("STUN_URL", "stun:stun.test:3478");
        guard.set("SEGMENT_MS", "500");

        let config = validate_env().expect("Expected valid configuration");
        assert_eq!(config.signal_endpoint, "wss://signal.test/ws");
        assert_eq!(config.media_base_url, "https://media.test");
        assert_eq!(config.stun_url, "stun:stun.test:3478");
        assert_eq!(config.segment_ms, 500);
    }

    #[test]
    fn test_validate_env_missing_signal_endpoint() {
        let mut guard = EnvGuard::new();
        guard.set("MEDIA_BASE_URL", "https://media.test");

        let result = validate_env();
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::MissingVariable(_)));
        assert!(err.to_string().contains("SIGNAL_ENDPOINT is required"));
    }

    #[test]
    fn test_validate_env_missing_media_base_url() {
        let mut guard = EnvGuard::new();
        guard.set("SIGNAL_ENDPOINT", "wss://signal.test/ws");

        let err = validate_env().unwrap_err();
        assert!(err.to_string().contains("MEDIA_BASE_URL is required"));
    }

    #[test]
    fn test_validate_env_invalid_segment() {
        let mut guard = EnvGuard::new();
        guard.set("SIGNAL_ENDPOINT", "wss://signal.test/ws");
        guard.set("MEDIA_BASE_URL", "https://media.test");
        guard.set("SEGMENT_MS", "not-a-number");

        let err = validate_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidSegment(_, _)));
    }

    #[test]
    fn test_validate_env_zero_segment() {
        let mut guard = EnvGuard::new();
        guard.set("SIGNAL_ENDPOINT", "wss://signal.test/ws");
        guard.set("MEDIA_BASE_URL", "https://media.test");
        guard.set("SEGMENT_MS", "0");

        let err = validate_env().unwrap_err();
        assert!(matches!(err, ConfigError::SegmentOutOfRange));
    }

    #[test]
    fn test_validate_env_defaults() {
        let mut guard = EnvGuard::new();
        guard.set("SIGNAL_ENDPOINT", "wss://signal.test/ws");
        guard.set("MEDIA_BASE_URL", "https://media.test");

        let config = validate_env().expect("Expected valid configuration");
        assert_eq!(config.stun_url, "stun:stun.l.google.com:19302");
        assert_eq!(config.segment_ms, DEFAULT_SEGMENT_MS);
    }
}
