use crate::error::CallbackError;

/// Flat process config, loaded once at startup. Every field has a typed
/// default except `database_url`, which is required.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bus_type: BusType,
    pub nats_url: String,
    pub host: String,
    pub port: u16,

    pub polling_interval_ms: u64,
    pub fetch_size: i64,
    pub publish_retry_delay_ms: i64,
    pub max_publish_attempts: i32,
    pub parallelism: usize,
    pub max_delivery_attempts: i32,
    pub delivery_retry_delay_ms: i64,
    pub callback_timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusType {
    InMemory,
    Nats,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Reads the environment. Returns `CallbackError::Fatal` on a missing
    /// or invalid required key; the process must not continue half
    /// configured.
    pub fn from_env() -> Result<Self, CallbackError> {
        let database_url =
            std::env::var("DATABASE_URL").map_err(|_| CallbackError::Fatal("DATABASE_URL must be set".into()))?;

        let bus_type = match std::env::var("BUS_TYPE")
            .unwrap_or_else(|_| "inmemory".to_string())
            .to_lowercase()
            .as_str()
        {
            "inmemory" => BusType::InMemory,
            "nats" => BusType::Nats,
            other => return Err(CallbackError::Fatal(format!("invalid BUS_TYPE: {other}, must be 'inmemory' or 'nats'"))),
        };

        Ok(Self {
            database_url,
            bus_type,
            nats_url: std::env::var("NATS_URL").unwrap_or_else(|_| "nats://localhost:4222".to_string()),
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_or("PORT", 8090u16),

            polling_interval_ms: env_or("POLLING_INTERVAL_MS", 1000u64),
            fetch_size: env_or("FETCH_SIZE", 100i64),
            publish_retry_delay_ms: env_or("PUBLISH_RETRY_DELAY_MS", 10_000i64),
            max_publish_attempts: env_or("MAX_PUBLISH_ATTEMPTS", 3i32),
            parallelism: env_or("PARALLELISM", 1000usize),
            max_delivery_attempts: env_or("MAX_DELIVERY_ATTEMPTS", 3i32),
            delivery_retry_delay_ms: env_or("DELIVERY_RETRY_DELAY_MS", 10_000i64),
            callback_timeout_ms: env_or("CALLBACK_TIMEOUT_MS", 10_000u64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_or_falls_back_on_missing_or_invalid() {
        assert_eq!(env_or::<u16>("CALLBACK_DELIVERY_TEST_UNSET_KEY", 42), 42);
    }
}
