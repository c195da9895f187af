use crate::error::Error;

fn default_server_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".into()
}

fn default_request_timeout() -> u64 {
    300
}

fn default_max_concurrent_requests() -> usize {
    100
}

/// Which persistence backend to use for sessions and requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// In-memory maps; pending requests are lost on restart.
    InMemory,
    /// PostgreSQL; pending requests resume after a restart.
    Postgres { dsn: String },
}

/// Runtime configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Telegram bot token. Startup aborts when absent or empty.
    pub telegram_bot_token: String,
    pub server_port: u16,
    pub log_level: String,
    /// Default per-request timeout in seconds when a submission omits one.
    pub request_timeout_seconds: u64,
    /// Ceiling on simultaneously pending requests; submissions above it fail
    /// fast with `Overloaded`.
    pub max_concurrent_requests: usize,
    pub storage: StorageBackend,
}

impl Config {
    /// Load configuration from process environment variables.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// Unparsable numeric values fall back to their defaults; a missing or
    /// empty `TELEGRAM_BOT_TOKEN` is a hard error.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let telegram_bot_token = match get("TELEGRAM_BOT_TOKEN") {
            Some(token) if !token.is_empty() => token,
            _ => {
                return Err(Error::InvalidArgument(
                    "TELEGRAM_BOT_TOKEN environment variable is required".into(),
                ));
            }
        };

        let server_port = get("SERVER_PORT")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_server_port);

        let log_level = get("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);

        let request_timeout_seconds = get("REQUEST_TIMEOUT")
            .and_then(|v| v.parse().ok())
            .filter(|&secs: &u64| secs > 0)
            .unwrap_or_else(default_request_timeout);

        let max_concurrent_requests = get("MAX_CONCURRENT_REQUESTS")
            .and_then(|v| v.parse().ok())
            .filter(|&n: &usize| n > 0)
            .unwrap_or_else(default_max_concurrent_requests);

        let storage = match get("STORAGE_ADAPTER").as_deref() {
            None | Some("") | Some("inmemory") => StorageBackend::InMemory,
            Some("postgres") => match get("POSTGRES_DSN") {
                Some(dsn) if !dsn.is_empty() => StorageBackend::Postgres { dsn },
                _ => {
                    return Err(Error::InvalidArgument(
                        "POSTGRES_DSN is required when STORAGE_ADAPTER=postgres".into(),
                    ));
                }
            },
            Some(other) => {
                return Err(Error::InvalidArgument(format!(
                    "invalid storage adapter: {other}"
                )));
            }
        };

        Ok(Self {
            telegram_bot_token,
            server_port,
            log_level,
            request_timeout_seconds,
            max_concurrent_requests,
            storage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        let map: HashMap<&str, &str> = vars.iter().copied().collect();
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn defaults_applied() {
        let config = Config::from_lookup(lookup(&[("TELEGRAM_BOT_TOKEN", "123:ABC")])).unwrap();
        assert_eq!(config.telegram_bot_token, "123:ABC");
        assert_eq!(config.server_port, 8080);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.request_timeout_seconds, 300);
        assert_eq!(config.max_concurrent_requests, 100);
        assert_eq!(config.storage, StorageBackend::InMemory);
    }

    #[test]
    fn missing_token_rejected() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(err.to_string().contains("TELEGRAM_BOT_TOKEN"));
    }

    #[test]
    fn empty_token_rejected() {
        let err = Config::from_lookup(lookup(&[("TELEGRAM_BOT_TOKEN", "")])).unwrap_err();
        assert!(err.to_string().contains("TELEGRAM_BOT_TOKEN"));
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("TELEGRAM_BOT_TOKEN", "123:ABC"),
            ("SERVER_PORT", "9090"),
            ("LOG_LEVEL", "debug"),
            ("REQUEST_TIMEOUT", "60"),
            ("MAX_CONCURRENT_REQUESTS", "10"),
        ]))
        .unwrap();
        assert_eq!(config.server_port, 9090);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.request_timeout_seconds, 60);
        assert_eq!(config.max_concurrent_requests, 10);
    }

    #[test]
    fn unparsable_numbers_keep_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("TELEGRAM_BOT_TOKEN", "123:ABC"),
            ("SERVER_PORT", "not-a-port"),
            ("REQUEST_TIMEOUT", "zero"),
            ("MAX_CONCURRENT_REQUESTS", "-5"),
        ]))
        .unwrap();
        assert_eq!(config.server_port, 8080);
        assert_eq!(config.request_timeout_seconds, 300);
        assert_eq!(config.max_concurrent_requests, 100);
    }

    #[test]
    fn zero_timeout_keeps_default() {
        let config = Config::from_lookup(lookup(&[
            ("TELEGRAM_BOT_TOKEN", "123:ABC"),
            ("REQUEST_TIMEOUT", "0"),
        ]))
        .unwrap();
        assert_eq!(config.request_timeout_seconds, 300);
    }

    #[test]
    fn postgres_storage_requires_dsn() {
        let err = Config::from_lookup(lookup(&[
            ("TELEGRAM_BOT_TOKEN", "123:ABC"),
            ("STORAGE_ADAPTER", "postgres"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("POSTGRES_DSN"));
    }

    #[test]
    fn postgres_storage_with_dsn() {
        let config = Config::from_lookup(lookup(&[
            ("TELEGRAM_BOT_TOKEN", "123:ABC"),
            ("STORAGE_ADAPTER", "postgres"),
            ("POSTGRES_DSN", "postgres://localhost/greenlight"),
        ]))
        .unwrap();
        assert_eq!(
            config.storage,
            StorageBackend::Postgres {
                dsn: "postgres://localhost/greenlight".into()
            }
        );
    }

    #[test]
    fn unknown_storage_adapter_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("TELEGRAM_BOT_TOKEN", "123:ABC"),
            ("STORAGE_ADAPTER", "mongodb"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("invalid storage adapter"));
    }
}
