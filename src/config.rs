use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for the berth orchestrator.
///
/// Everything is sourced from environment variables (a `.env` file is
/// honored via dotenvy at startup) with documented defaults, so a bare
/// `berth serve` boots a working single-node instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port for the REST API.
    pub http_port: u16,
    /// SQLite database location.
    pub db_path: PathBuf,
    /// Platform super-domain; deployed apps live at `<subdomain>.<super_domain>`.
    pub super_domain: String,
    /// Operator-supplied vault master secret. When absent the process runs
    /// in read-only degraded mode: secrets cannot be sealed or unsealed.
    pub vault_secret: Option<String>,
    /// Salt for vault key derivation.
    pub vault_salt: String,
    /// HMAC secret for bearer-token verification.
    pub auth_secret: String,
    /// Name of the shared container network all apps join.
    pub network_name: String,
    /// Wall-clock budget for fetch + build + image bake, in seconds.
    pub build_timeout_secs: u64,
    /// Readiness-probe grace period after container start, in seconds.
    pub probe_grace_secs: u64,
    /// Interval between readiness probes, in milliseconds.
    pub probe_interval_ms: u64,
    /// Maximum retained log lines per deployment; oldest evicted first.
    pub log_buffer_lines: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 7070,
            db_path: PathBuf::from("berth.db"),
            super_domain: "localhost".to_string(),
            vault_secret: None,
            vault_salt: "berth-vault-v1".to_string(),
            auth_secret: String::new(),
            network_name: "berth-net".to_string(),
            build_timeout_secs: 600,
            probe_grace_secs: 30,
            probe_interval_ms: 1000,
            log_buffer_lines: 1000,
        }
    }
}

impl Config {
    /// Build a Config from the process environment, falling back to defaults
    /// for anything unset. Malformed numeric values fall back too rather
    /// than aborting startup.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            http_port: env_parse("BERTH_PORT", defaults.http_port),
            db_path: std::env::var("BERTH_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            super_domain: std::env::var("BERTH_SUPER_DOMAIN").unwrap_or(defaults.super_domain),
            vault_secret: std::env::var("BERTH_VAULT_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
            vault_salt: std::env::var("BERTH_VAULT_SALT").unwrap_or(defaults.vault_salt),
            auth_secret: std::env::var("BERTH_AUTH_SECRET").unwrap_or(defaults.auth_secret),
            network_name: std::env::var("BERTH_NETWORK").unwrap_or(defaults.network_name),
            build_timeout_secs: env_parse("BERTH_BUILD_TIMEOUT_SECS", defaults.build_timeout_secs),
            probe_grace_secs: env_parse("BERTH_PROBE_GRACE_SECS", defaults.probe_grace_secs),
            probe_interval_ms: env_parse("BERTH_PROBE_INTERVAL_MS", defaults.probe_interval_ms),
            log_buffer_lines: env_parse("BERTH_LOG_BUFFER_LINES", defaults.log_buffer_lines),
        }
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn probe_grace(&self) -> Duration {
        Duration::from_secs(self.probe_grace_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    /// Public URL for a deployed app's subdomain.
    pub fn app_url(&self, subdomain: &str) -> String {
        format!("http://{}.{}", subdomain, self.super_domain)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.http_port, 7070);
        assert_eq!(config.build_timeout_secs, 600);
        assert_eq!(config.probe_grace_secs, 30);
        assert_eq!(config.log_buffer_lines, 1000);
        assert_eq!(config.network_name, "berth-net");
        assert!(config.vault_secret.is_none());
    }

    #[test]
    fn app_url_composes_subdomain_and_super_domain() {
        let config = Config {
            super_domain: "apps.example.com".into(),
            ..Config::default()
        };
        assert_eq!(config.app_url("demo"), "http://demo.apps.example.com");
    }

    #[test]
    fn durations_derive_from_seconds() {
        let config = Config::default();
        assert_eq!(config.build_timeout(), Duration::from_secs(600));
        assert_eq!(config.probe_grace(), Duration::from_secs(30));
        assert_eq!(config.probe_interval(), Duration::from_millis(1000));
    }
}
