//! Runtime configuration.
//!
//! Defaults mirror the deployment the prober was built against: 15s write
//! cadence, 1m long-write continuation cadence, 30s reads, 60s searches, and
//! a 336h retention window. Environment overrides follow the same
//! parse-or-warn-and-keep-default policy used for `OTEL_BSP_*` variables in
//! the batch span processor.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;
use url::Url;

pub const ENV_PUSH_ENDPOINT: &str = "VULTURE_PUSH_ENDPOINT";
pub const ENV_QUERY_ENDPOINT: &str = "VULTURE_QUERY_ENDPOINT";
pub const ENV_TENANT: &str = "VULTURE_TENANT";
pub const ENV_WRITE_BACKOFF_SECS: &str = "VULTURE_WRITE_BACKOFF_SECS";
pub const ENV_LONG_WRITE_BACKOFF_SECS: &str = "VULTURE_LONG_WRITE_BACKOFF_SECS";
pub const ENV_READ_BACKOFF_SECS: &str = "VULTURE_READ_BACKOFF_SECS";
pub const ENV_SEARCH_BACKOFF_SECS: &str = "VULTURE_SEARCH_BACKOFF_SECS";
pub const ENV_RETENTION_HOURS: &str = "VULTURE_RETENTION_HOURS";
pub const ENV_VALIDATION_CYCLES: &str = "VULTURE_VALIDATION_CYCLES";
pub const ENV_VALIDATION_TIMEOUT_SECS: &str = "VULTURE_VALIDATION_TIMEOUT_SECS";
pub const ENV_SEARCH_SETTLE_SECS: &str = "VULTURE_SEARCH_SETTLE_SECS";
pub const ENV_TRACKER_BACKOFF_SECS: &str = "VULTURE_TRACKER_BACKOFF_SECS";
pub const ENV_AUTH_TOKEN: &str = "VULTURE_AUTH_TOKEN";

/// Configuration errors surfaced before any loop starts.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("write backoff must be greater than zero")]
    ZeroWriteBackoff,

    #[error("at least one of read backoff or search backoff must be non-zero")]
    NothingToValidate,

    #[error("invalid {name} endpoint {value:?}: {source}")]
    InvalidEndpoint {
        name: &'static str,
        value: String,
        source: url::ParseError,
    },
}

/// All knobs for both soak mode and one-shot validation mode.
#[derive(Clone, Debug)]
pub struct VultureConfig {
    /// Base URL traces are pushed to.
    pub push_endpoint: String,
    /// Base URL queries and searches go to.
    pub query_endpoint: String,
    /// Tenant/org id attached to every outbound call.
    pub tenant: String,
    /// Pause between write ticks; also the seed bucketing interval.
    pub write_backoff: Duration,
    /// Pause between continuation rounds of a long trace.
    pub long_write_backoff: Duration,
    /// Pause between read-validation ticks. Zero disables the read loop.
    pub read_backoff: Duration,
    /// Pause between search-validation ticks. Zero disables the search loop.
    pub search_backoff: Duration,
    /// Pause between tracked-batch ticks. Zero disables the tracked loop.
    pub tracker_backoff: Duration,
    /// Secret paired with the tenant as basic-auth credentials on every
    /// outbound call. `None` sends no credentials.
    pub auth_token: Option<String>,
    /// Backend block retention; lookups never target seeds older than this.
    pub retention: Duration,
    /// Number of one-shot validation cycles. Zero selects soak mode.
    pub validation_cycles: usize,
    /// Overall deadline for a one-shot validation run.
    pub validation_timeout: Duration,
    /// Delay before the search phase of a validation run, giving the backend
    /// time to index the written traces.
    pub search_settle: Duration,
}

impl Default for VultureConfig {
    fn default() -> Self {
        VultureConfig {
            push_endpoint: String::new(),
            query_endpoint: String::new(),
            tenant: String::new(),
            write_backoff: Duration::from_secs(15),
            long_write_backoff: Duration::from_secs(60),
            read_backoff: Duration::from_secs(30),
            search_backoff: Duration::from_secs(60),
            tracker_backoff: Duration::from_secs(30),
            auth_token: None,
            retention: Duration::from_secs(336 * 60 * 60),
            validation_cycles: 0,
            validation_timeout: Duration::from_secs(10 * 60),
            search_settle: Duration::from_secs(60),
        }
    }
}

impl VultureConfig {
    /// Defaults overlaid with `VULTURE_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = VultureConfig::default();
        VultureConfig {
            push_endpoint: env::var(ENV_PUSH_ENDPOINT).unwrap_or(defaults.push_endpoint),
            query_endpoint: env::var(ENV_QUERY_ENDPOINT).unwrap_or(defaults.query_endpoint),
            tenant: env::var(ENV_TENANT).unwrap_or(defaults.tenant),
            write_backoff: env_duration_secs(ENV_WRITE_BACKOFF_SECS, defaults.write_backoff),
            long_write_backoff: env_duration_secs(
                ENV_LONG_WRITE_BACKOFF_SECS,
                defaults.long_write_backoff,
            ),
            read_backoff: env_duration_secs(ENV_READ_BACKOFF_SECS, defaults.read_backoff),
            search_backoff: env_duration_secs(ENV_SEARCH_BACKOFF_SECS, defaults.search_backoff),
            tracker_backoff: env_duration_secs(ENV_TRACKER_BACKOFF_SECS, defaults.tracker_backoff),
            auth_token: env::var(ENV_AUTH_TOKEN).ok().filter(|t| !t.is_empty()),
            retention: env_duration_hours(ENV_RETENTION_HOURS, defaults.retention),
            validation_cycles: env_parse(ENV_VALIDATION_CYCLES, defaults.validation_cycles),
            validation_timeout: env_duration_secs(
                ENV_VALIDATION_TIMEOUT_SECS,
                defaults.validation_timeout,
            ),
            search_settle: env_duration_secs(ENV_SEARCH_SETTLE_SECS, defaults.search_settle),
        }
    }

    /// Check invariants that would otherwise surface as broken loops.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.write_backoff.is_zero() {
            return Err(ConfigError::ZeroWriteBackoff);
        }
        if self.validation_cycles == 0
            && self.read_backoff.is_zero()
            && self.search_backoff.is_zero()
            && self.tracker_backoff.is_zero()
        {
            return Err(ConfigError::NothingToValidate);
        }
        for (name, value) in [
            ("push", &self.push_endpoint),
            ("query", &self.query_endpoint),
        ] {
            if !value.is_empty() {
                Url::parse(value).map_err(|source| ConfigError::InvalidEndpoint {
                    name,
                    value: value.clone(),
                    source,
                })?;
            }
        }
        Ok(())
    }
}

fn env_parse<T: FromStr + Copy>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(name, raw, "unparseable environment override, keeping default");
                default
            }
        },
        Err(_) => default,
    }
}

fn env_duration_secs(name: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parse(name, default.as_secs()))
}

fn env_duration_hours(name: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parse(name, default.as_secs() / 3600) * 3600)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn soak_config() -> VultureConfig {
        VultureConfig {
            tenant: "test-org".to_owned(),
            ..VultureConfig::default()
        }
    }

    #[test]
    fn defaults_are_valid() {
        soak_config().validate().unwrap();
    }

    #[test]
    fn zero_write_backoff_is_rejected() {
        let config = VultureConfig {
            write_backoff: Duration::ZERO,
            ..soak_config()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroWriteBackoff)
        ));
    }

    #[test]
    fn disabling_every_probe_loop_is_rejected() {
        let config = VultureConfig {
            read_backoff: Duration::ZERO,
            search_backoff: Duration::ZERO,
            tracker_backoff: Duration::ZERO,
            ..soak_config()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NothingToValidate)
        ));
    }

    #[test]
    fn validation_mode_needs_no_probe_loops() {
        let config = VultureConfig {
            read_backoff: Duration::ZERO,
            search_backoff: Duration::ZERO,
            tracker_backoff: Duration::ZERO,
            validation_cycles: 3,
            ..soak_config()
        };
        config.validate().unwrap();
    }

    #[test]
    fn auth_token_defaults_to_none() {
        assert_eq!(VultureConfig::default().auth_token, None);
    }

    // one test body so parallel test threads never race on the variable
    #[test]
    fn auth_token_comes_from_the_environment() {
        env::set_var(ENV_AUTH_TOKEN, "s3cret");
        assert_eq!(
            VultureConfig::from_env().auth_token.as_deref(),
            Some("s3cret")
        );

        env::set_var(ENV_AUTH_TOKEN, "");
        assert_eq!(VultureConfig::from_env().auth_token, None);

        env::remove_var(ENV_AUTH_TOKEN);
        assert_eq!(VultureConfig::from_env().auth_token, None);
    }

    #[test]
    fn malformed_endpoint_is_rejected() {
        let config = VultureConfig {
            query_endpoint: "not a url".to_owned(),
            ..soak_config()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidEndpoint { name: "query", .. })
        ));
    }
}
