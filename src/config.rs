// Configuration management for the CertHub control plane.
//
// Settings are flat environment variables (optionally seeded from an adjacent
// `certhub.toml`), matching the deployment contract: DATABASE_URL, JWT_SECRET,
// CERTS_ROOT_PATH and friends.

use serde::Deserialize;
use std::path::PathBuf;

fn default_env() -> String {
    "dev".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_database_url() -> String {
    "postgres://localhost/certhub".to_string()
}

fn default_org_id() -> i32 {
    1
}

fn default_jwt_secret() -> String {
    "insecure-dev-secret".to_string()
}

fn default_access_ttl() -> i64 {
    30
}

fn default_device_ttl() -> i64 {
    10
}

fn default_refresh_ttl_days() -> i64 {
    14
}

fn default_set_password_ttl() -> i64 {
    10
}

fn default_reset_password_ttl() -> i64 {
    30
}

fn default_bcrypt_cost() -> u32 {
    12
}

fn default_lockout_max_attempts() -> i32 {
    5
}

fn default_lockout_minutes() -> i64 {
    15
}

fn default_certs_root() -> PathBuf {
    PathBuf::from("certs")
}

fn default_openssl_path() -> PathBuf {
    PathBuf::from("openssl")
}

fn default_retention_max_hours() -> i64 {
    24
}

fn default_true() -> bool {
    true
}

fn default_samesite() -> String {
    "strict".to_string()
}

fn default_redis_url() -> String {
    "redis://localhost:6379/0".to_string()
}

fn default_queue_name() -> String {
    "certs".to_string()
}

fn default_debounce_seconds() -> f64 {
    2.0
}

fn default_max_events_per_minute() -> u32 {
    60
}

fn default_smtp_port() -> u16 {
    587
}

/// Application settings loaded from the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_org_id")]
    pub default_org_id: i32,

    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
    #[serde(default = "default_access_ttl")]
    pub access_token_ttl_min: i64,
    #[serde(default = "default_device_ttl")]
    pub device_token_ttl_min: i64,
    #[serde(default = "default_refresh_ttl_days")]
    pub refresh_ttl_days: i64,
    #[serde(default = "default_set_password_ttl")]
    pub set_password_token_ttl_min: i64,
    #[serde(default = "default_reset_password_ttl")]
    pub reset_password_token_ttl_min: i64,
    #[serde(default = "default_bcrypt_cost")]
    pub bcrypt_cost: u32,
    #[serde(default = "default_lockout_max_attempts")]
    pub lockout_max_attempts: i32,
    #[serde(default = "default_lockout_minutes")]
    pub lockout_minutes: i64,

    #[serde(default = "default_certs_root")]
    pub certs_root_path: PathBuf,
    #[serde(default = "default_openssl_path")]
    pub openssl_path: PathBuf,

    #[serde(default = "default_retention_max_hours")]
    pub retention_keep_until_max_hours: i64,

    #[serde(default = "default_true")]
    pub cookie_secure: bool,
    #[serde(default = "default_samesite")]
    pub cookie_samesite: String,
    #[serde(default = "default_true")]
    pub cookie_httponly: bool,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_queue_name")]
    pub rq_queue_name: String,

    #[serde(default = "default_debounce_seconds")]
    pub watcher_debounce_seconds: f64,
    #[serde(default = "default_max_events_per_minute")]
    pub watcher_max_events_per_minute: u32,
    #[serde(default = "default_true")]
    pub watcher_enabled: bool,
    #[serde(default = "default_true")]
    pub worker_enabled: bool,

    #[serde(default)]
    pub smtp_host: Option<String>,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub smtp_user: Option<String>,
    #[serde(default)]
    pub smtp_pass: Option<String>,
    #[serde(default)]
    pub smtp_from: Option<String>,
    #[serde(default)]
    pub frontend_base_url: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            env: default_env(),
            host: default_host(),
            port: default_port(),
            database_url: default_database_url(),
            default_org_id: default_org_id(),
            jwt_secret: default_jwt_secret(),
            access_token_ttl_min: default_access_ttl(),
            device_token_ttl_min: default_device_ttl(),
            refresh_ttl_days: default_refresh_ttl_days(),
            set_password_token_ttl_min: default_set_password_ttl(),
            reset_password_token_ttl_min: default_reset_password_ttl(),
            bcrypt_cost: default_bcrypt_cost(),
            lockout_max_attempts: default_lockout_max_attempts(),
            lockout_minutes: default_lockout_minutes(),
            certs_root_path: default_certs_root(),
            openssl_path: default_openssl_path(),
            retention_keep_until_max_hours: default_retention_max_hours(),
            cookie_secure: true,
            cookie_samesite: default_samesite(),
            cookie_httponly: true,
            redis_url: default_redis_url(),
            rq_queue_name: default_queue_name(),
            watcher_debounce_seconds: default_debounce_seconds(),
            watcher_max_events_per_minute: default_max_events_per_minute(),
            watcher_enabled: true,
            worker_enabled: true,
            smtp_host: None,
            smtp_port: default_smtp_port(),
            smtp_user: None,
            smtp_pass: None,
            smtp_from: None,
            frontend_base_url: None,
        }
    }
}

impl Settings {
    /// Load configuration from an optional `certhub.toml` plus the environment.
    pub fn load() -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("certhub").required(false))
            .add_source(config::Environment::default().try_parsing(true))
            .build()?;

        let mut loaded: Settings = settings.try_deserialize()?;

        // Outside prod, relax cookie flags unless they were set explicitly.
        if !loaded.is_prod() {
            if std::env::var("COOKIE_SECURE").is_err() {
                loaded.cookie_secure = false;
            }
            if std::env::var("COOKIE_SAMESITE").is_err() {
                loaded.cookie_samesite = "lax".to_string();
            }
        }

        Ok(loaded)
    }

    pub fn is_prod(&self) -> bool {
        self.env.eq_ignore_ascii_case("prod")
    }

    pub fn is_dev(&self) -> bool {
        self.env.eq_ignore_ascii_case("dev")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.env, "dev");
        assert_eq!(settings.port, 8000);
        assert_eq!(settings.access_token_ttl_min, 30);
        assert_eq!(settings.device_token_ttl_min, 10);
        assert_eq!(settings.bcrypt_cost, 12);
        assert_eq!(settings.retention_keep_until_max_hours, 24);
        assert_eq!(settings.rq_queue_name, "certs");
        assert!(settings.watcher_enabled);
    }

    #[test]
    fn test_env_flags() {
        let mut settings = Settings::default();
        assert!(settings.is_dev());
        assert!(!settings.is_prod());
        settings.env = "PROD".to_string();
        assert!(settings.is_prod());
    }
}
