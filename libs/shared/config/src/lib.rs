use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

pub const MIN_SWEEP_INTERVAL_SECS: u64 = 1;
/// One year; keeps `now + ttl` far from chrono's range limits.
pub const MAX_PENDING_TTL_HOURS: i64 = 24 * 365;
pub const MAX_AUDIT_RETRY_DELAY_MS: u64 = 60_000;
pub const MAX_RETRY_ATTEMPTS: u32 = 100;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_path: String,
    pub jwt_secret: String,
    pub port: u16,
    /// Lock wait bound for every store transaction.
    pub statement_timeout_secs: u64,
    pub transient_retry_attempts: u32,
    pub pending_ttl_hours: i64,
    pub expiry_sweep_interval_secs: u64,
    pub audit_retry_attempts: u32,
    pub audit_retry_delay_ms: u64,
    pub anomaly_threshold: i64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: "clinic.db".to_string(),
            jwt_secret: String::new(),
            port: 3000,
            statement_timeout_secs: 5,
            transient_retry_attempts: 3,
            pending_ttl_hours: 24,
            expiry_sweep_interval_secs: 300,
            audit_retry_attempts: 5,
            audit_retry_delay_ms: 500,
            anomaly_threshold: 20,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let config = Self {
            database_path: env::var("DATABASE_PATH")
                .unwrap_or_else(|_| {
                    warn!("DATABASE_PATH not set, using default");
                    defaults.database_path.clone()
                }),
            jwt_secret: env::var("JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("JWT_SECRET not set, using empty value");
                    String::new()
                }),
            port: parse_or("PORT", defaults.port),
            statement_timeout_secs: parse_or("STORE_STATEMENT_TIMEOUT_SECS", defaults.statement_timeout_secs),
            transient_retry_attempts: clamp_setting(
                "TRANSIENT_RETRY_ATTEMPTS",
                parse_or("TRANSIENT_RETRY_ATTEMPTS", defaults.transient_retry_attempts),
                0,
                MAX_RETRY_ATTEMPTS,
            ),
            pending_ttl_hours: clamp_setting(
                "PENDING_TTL_HOURS",
                parse_or("PENDING_TTL_HOURS", defaults.pending_ttl_hours),
                1,
                MAX_PENDING_TTL_HOURS,
            ),
            expiry_sweep_interval_secs: clamp_setting(
                "EXPIRY_SWEEP_INTERVAL_SECS",
                parse_or("EXPIRY_SWEEP_INTERVAL_SECS", defaults.expiry_sweep_interval_secs),
                MIN_SWEEP_INTERVAL_SECS,
                u64::MAX,
            ),
            audit_retry_attempts: clamp_setting(
                "AUDIT_RETRY_ATTEMPTS",
                parse_or("AUDIT_RETRY_ATTEMPTS", defaults.audit_retry_attempts),
                1,
                MAX_RETRY_ATTEMPTS,
            ),
            audit_retry_delay_ms: clamp_setting(
                "AUDIT_RETRY_DELAY_MS",
                parse_or("AUDIT_RETRY_DELAY_MS", defaults.audit_retry_delay_ms),
                0,
                MAX_AUDIT_RETRY_DELAY_MS,
            ),
            anomaly_threshold: parse_or("ANOMALY_THRESHOLD", defaults.anomaly_threshold),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.jwt_secret.is_empty() && !self.database_path.is_empty()
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_secs(self.statement_timeout_secs)
    }

    pub fn audit_retry_delay(&self) -> Duration {
        Duration::from_millis(self.audit_retry_delay_ms.min(MAX_AUDIT_RETRY_DELAY_MS))
    }

    pub fn pending_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.pending_ttl_hours.clamp(1, MAX_PENDING_TTL_HOURS))
    }

    /// Never zero: a zero period would stop the sweep timer.
    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.expiry_sweep_interval_secs.max(MIN_SWEEP_INTERVAL_SECS))
    }
}

fn parse_or<T>(key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("{} has invalid value {:?}, using default {}", key, raw, default);
            default
        }),
        Err(_) => default,
    }
}

fn clamp_setting<T>(key: &str, value: T, min: T, max: T) -> T
where
    T: PartialOrd + Copy + std::fmt::Display,
{
    if value < min {
        warn!("{} is {}, raising it to {}", key, value, min);
        min
    } else if value > max {
        warn!("{} is {}, lowering it to {}", key, value, max);
        max
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.statement_timeout(), Duration::from_secs(5));
        assert_eq!(config.pending_ttl(), chrono::Duration::hours(24));
        assert_eq!(config.anomaly_threshold, 20);
        assert!(!config.is_configured());
    }

    #[test]
    fn invalid_numbers_fall_back() {
        env::set_var("CLINIC_TEST_BAD_PORT", "not-a-port");
        assert_eq!(parse_or::<u16>("CLINIC_TEST_BAD_PORT", 3000), 3000);
        env::set_var("CLINIC_TEST_GOOD_PORT", "8080");
        assert_eq!(parse_or::<u16>("CLINIC_TEST_GOOD_PORT", 3000), 8080);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        assert_eq!(clamp_setting("EXPIRY_SWEEP_INTERVAL_SECS", 0u64, MIN_SWEEP_INTERVAL_SECS, u64::MAX), 1);
        assert_eq!(clamp_setting("PENDING_TTL_HOURS", i64::MAX, 1, MAX_PENDING_TTL_HOURS), MAX_PENDING_TTL_HOURS);
        assert_eq!(clamp_setting("PENDING_TTL_HOURS", 48, 1, MAX_PENDING_TTL_HOURS), 48);

        env::set_var("EXPIRY_SWEEP_INTERVAL_SECS", "0");
        env::set_var("PENDING_TTL_HOURS", "9223372036854775807");
        let config = AppConfig::from_env();
        env::remove_var("EXPIRY_SWEEP_INTERVAL_SECS");
        env::remove_var("PENDING_TTL_HOURS");

        assert_eq!(config.expiry_sweep_interval_secs, 1);
        assert_eq!(config.pending_ttl_hours, MAX_PENDING_TTL_HOURS);
    }

    #[test]
    fn accessors_never_panic_on_hand_built_values() {
        let config = AppConfig {
            expiry_sweep_interval_secs: 0,
            pending_ttl_hours: i64::MAX,
            ..AppConfig::default()
        };
        assert_eq!(config.expiry_sweep_interval(), Duration::from_secs(1));
        assert_eq!(config.pending_ttl(), chrono::Duration::hours(MAX_PENDING_TTL_HOURS));
        let _ = chrono::Utc::now() + config.pending_ttl();
    }
}
