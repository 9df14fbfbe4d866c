use std::sync::OnceLock;

use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;

mod log_config;
pub use log_config::LogConfig;

use crate::error::BrokerError;

pub static CONFIG: OnceLock<ServerConfig> = OnceLock::new();

/// Loads and validates the process configuration. The caller decides what
/// to do with a failure (this binary's `main` prints it and exits); this
/// function only ever builds the typed error, never exits itself.
pub fn init() -> Result<(), BrokerError> {
    let config = load()?;
    validate(&config)?;
    crate::config::CONFIG
        .set(config)
        .expect("config should be set");
    Ok(())
}

fn validate(config: &ServerConfig) -> Result<(), BrokerError> {
    if config.jwt_secret.is_empty() {
        return Err(BrokerError::ConfigValidation(
            "APP_JWT_SECRET is not set".to_string(),
        ));
    }
    Ok(())
}

/// Merges `config.toml` (or the file named by `APP_CONFIG`) under
/// `APP_`-prefixed environment overrides. Split out from [`init`] so tests
/// can exercise the merge behavior through [`figment::Jail`] without
/// touching the real process environment.
fn load() -> Result<ServerConfig, figment::Error> {
    Figment::new()
        .merge(Toml::file(
            Env::var("APP_CONFIG").as_deref().unwrap_or("config.toml"),
        ))
        .merge(Env::prefixed("APP_").global())
        .extract()
}

pub fn get() -> &'static ServerConfig {
    CONFIG.get().expect("config should be set")
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Shared HMAC secret used to validate the bearer token presented on
    /// websocket upgrade. See [`crate::auth`].
    pub jwt_secret: String,
    /// Origins allowed to open the websocket connection; `*` disables the check.
    #[serde(default = "default_cors_origin")]
    pub cors_origin: String,
    pub log: LogConfig,
    #[serde(default)]
    pub broker: BrokerTuning,
}

/// Tunables for the session/rate-limit/heartbeat machinery. All have
/// defaults matching the behavior described for the broker; operators
/// can override any of them per-deployment.
#[derive(Deserialize, Clone, Debug)]
pub struct BrokerTuning {
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,
}

impl Default for BrokerTuning {
    fn default() -> Self {
        Self {
            session_timeout_ms: default_session_timeout_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            scan_interval_ms: default_scan_interval_ms(),
            rate_window_ms: default_rate_window_ms(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1".into()
}

fn default_listen_port() -> u16 {
    8080
}

fn default_cors_origin() -> String {
    "*".into()
}

fn default_session_timeout_ms() -> u64 {
    5 * 60 * 1000
}

fn default_heartbeat_timeout_ms() -> u64 {
    90 * 1000
}

fn default_scan_interval_ms() -> u64 {
    30 * 1000
}

fn default_rate_window_ms() -> u64 {
    60 * 1000
}

#[cfg(test)]
mod tests {
    use figment::Jail;

    use super::*;

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                jwt_secret = "test-secret"
                "#,
            )?;

            let config = load().unwrap();
            assert_eq!(config.jwt_secret, "test-secret");
            assert_eq!(config.listen_addr, default_listen_addr());
            assert_eq!(config.listen_port, default_listen_port());
            assert_eq!(config.cors_origin, default_cors_origin());
            assert_eq!(
                config.broker.session_timeout_ms,
                default_session_timeout_ms()
            );
            Ok(())
        });
    }

    #[test]
    fn app_prefixed_env_vars_override_the_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                jwt_secret = "file-secret"
                listen_port = 8080
                "#,
            )?;
            jail.set_env("APP_JWT_SECRET", "env-secret");
            jail.set_env("APP_LISTEN_PORT", "9999");

            let config = load().unwrap();
            assert_eq!(config.jwt_secret, "env-secret");
            assert_eq!(config.listen_port, 9999);
            Ok(())
        });
    }

    #[test]
    fn invalid_toml_is_rejected() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                jwt_secret = "test-secret
                this is not valid toml
                "#,
            )?;

            assert!(load().is_err());
            Ok(())
        });
    }

    #[test]
    fn validate_rejects_an_empty_jwt_secret() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config.toml",
                r#"
                jwt_secret = ""
                "#,
            )?;

            let config = load().unwrap();
            assert!(validate(&config).is_err());
            Ok(())
        });
    }
}
