//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TurnstileError};
use crate::ratelimit::BucketSettings;

/// Prefix of environment variables that override file settings.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the admission layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Token bucket configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Client identity resolution
    #[serde(default)]
    pub identity: IdentityConfig,

    /// Cost ledger configuration
    #[serde(default)]
    pub ledger: LedgerConfig,
}

/// Token bucket configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Bucket size, i.e. the burst allowance
    #[serde(default = "default_capacity")]
    pub capacity: u32,

    /// Tokens added per second
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,

    /// Shared store URL; without one the limiter runs locally
    #[serde(default)]
    pub backend_url: Option<String>,

    /// Namespace for bucket records in the shared store
    #[serde(default = "default_bucket_key_prefix")]
    pub bucket_key_prefix: String,

    /// Bound on a single remote call in milliseconds
    #[serde(default = "default_backend_timeout_ms")]
    pub backend_timeout_ms: u64,

    /// How long a drained local bucket is kept when it never refills
    #[serde(default = "default_no_refill_ttl_secs")]
    pub no_refill_ttl_secs: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_rate: default_refill_rate(),
            backend_url: None,
            bucket_key_prefix: default_bucket_key_prefix(),
            backend_timeout_ms: default_backend_timeout_ms(),
            no_refill_ttl_secs: default_no_refill_ttl_secs(),
        }
    }
}

fn default_capacity() -> u32 {
    10
}

fn default_refill_rate() -> f64 {
    5.0
}

fn default_bucket_key_prefix() -> String {
    "turnstile_bucket".to_string()
}

fn default_backend_timeout_ms() -> u64 {
    250
}

fn default_no_refill_ttl_secs() -> u64 {
    3600
}

impl LimiterConfig {
    pub fn validate(&self) -> Result<()> {
        self.bucket_settings()?;
        if self.backend_timeout_ms == 0 {
            return Err(TurnstileError::Config(
                "backend_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.no_refill_ttl_secs == 0 {
            return Err(TurnstileError::Config(
                "no_refill_ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.bucket_key_prefix.is_empty() {
            return Err(TurnstileError::Config(
                "bucket_key_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bucket_settings(&self) -> Result<BucketSettings> {
        BucketSettings::new(self.capacity as f64, self.refill_rate)
    }
}

/// Client identity resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Whether a forwarding header may override the peer address
    #[serde(default)]
    pub trust_proxy_headers: bool,

    /// The single header trusted when `trust_proxy_headers` is set
    #[serde(default)]
    pub trusted_header_name: Option<String>,

    /// Also charge the peer address when a credential is supplied
    #[serde(default = "default_enforce_peer_budget")]
    pub enforce_peer_budget: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            trust_proxy_headers: false,
            trusted_header_name: None,
            enforce_peer_budget: default_enforce_peer_budget(),
        }
    }
}

fn default_enforce_peer_budget() -> bool {
    true
}

impl IdentityConfig {
    pub fn validate(&self) -> Result<()> {
        let named = self
            .trusted_header_name
            .as_deref()
            .map(|h| !h.trim().is_empty())
            .unwrap_or(false);
        if self.trust_proxy_headers && !named {
            return Err(TurnstileError::Config(
                "trust_proxy_headers requires a non-empty trusted_header_name".to_string(),
            ));
        }
        Ok(())
    }
}

/// Cost ledger configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Namespace for cost records in the shared store
    #[serde(default = "default_ledger_key_prefix")]
    pub key_prefix: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_ledger_key_prefix(),
        }
    }
}

fn default_ledger_key_prefix() -> String {
    "turnstile_cost".to_string()
}

impl TurnstileConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Layer an optional file under `TURNSTILE__SECTION__FIELD` environment
    /// variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path));
        }
        let config: TurnstileConfig = builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.limiter.validate()?;
        self.identity.validate()?;
        if self.ledger.key_prefix.is_empty() {
            return Err(TurnstileError::Config(
                "ledger key_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = TurnstileConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.limiter.capacity, 10);
        assert_eq!(config.limiter.refill_rate, 5.0);
        assert!(config.limiter.backend_url.is_none());
        assert!(!config.identity.trust_proxy_headers);
        assert!(config.identity.enforce_peer_budget);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
limiter:
  capacity: 2
  refill_rate: 0
  backend_url: redis://cache:6379/0
  bucket_key_prefix: api_bucket
identity:
  trust_proxy_headers: true
  trusted_header_name: X-Forwarded-For
ledger:
  key_prefix: api_cost
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.limiter.capacity, 2);
        assert_eq!(config.limiter.refill_rate, 0.0);
        assert_eq!(
            config.limiter.backend_url.as_deref(),
            Some("redis://cache:6379/0")
        );
        assert_eq!(config.limiter.backend_timeout_ms, 250);
        assert_eq!(
            config.identity.trusted_header_name.as_deref(),
            Some("X-Forwarded-For")
        );
        assert_eq!(config.ledger.key_prefix, "api_cost");
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = TurnstileConfig::from_yaml("limiter:\n  capacity: 0\n").unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
    }

    #[test]
    fn test_negative_refill_rejected() {
        let err = TurnstileConfig::from_yaml("limiter:\n  refill_rate: -1.5\n").unwrap_err();
        assert!(err.to_string().contains("refill_rate"));
    }

    #[test]
    fn test_trust_without_header_rejected() {
        let yaml = "identity:\n  trust_proxy_headers: true\n";
        assert!(TurnstileConfig::from_yaml(yaml).is_err());

        let yaml = "identity:\n  trust_proxy_headers: true\n  trusted_header_name: \"  \"\n";
        assert!(TurnstileConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_malformed_yaml_is_config_error() {
        let err = TurnstileConfig::from_yaml("limiter: [unterminated").unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
    }

    #[test]
    fn test_load_from_file_and_environment() {
        let dir = std::env::temp_dir().join(format!("turnstile-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("turnstile.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "limiter:\n  capacity: 7\n  refill_rate: 0.5").unwrap();

        let path = path.to_string_lossy().to_string();
        let loaded = TurnstileConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.limiter.capacity, 7);
        assert_eq!(loaded.limiter.refill_rate, 0.5);

        let parsed = TurnstileConfig::from_file(&path).unwrap();
        assert_eq!(parsed, loaded);

        // Environment variables override the file section by section.
        std::env::set_var("TURNSTILE__LIMITER__CAPACITY", "3");
        std::env::set_var("TURNSTILE__IDENTITY__ENFORCE_PEER_BUDGET", "false");
        let layered = TurnstileConfig::load(Some(&path));
        std::env::set_var("TURNSTILE__LIMITER__CAPACITY", "0");
        let invalid = TurnstileConfig::load(Some(&path));
        std::env::remove_var("TURNSTILE__LIMITER__CAPACITY");
        std::env::remove_var("TURNSTILE__IDENTITY__ENFORCE_PEER_BUDGET");

        let layered = layered.unwrap();
        assert_eq!(layered.limiter.capacity, 3);
        assert_eq!(layered.limiter.refill_rate, 0.5);
        assert!(!layered.identity.enforce_peer_budget);
        assert!(layered.validate().is_ok());
        assert!(matches!(invalid, Err(TurnstileError::Config(_))));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = TurnstileConfig::from_file("/nonexistent/turnstile.yaml").unwrap_err();
        assert!(matches!(err, TurnstileError::Io(_)));
    }
}
