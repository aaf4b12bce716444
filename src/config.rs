//! Engine settings and the buyer directory file.
//!
//! Settings are layered: built-in defaults, then `config/default.toml`,
//! then an environment-specific file (`PINGPOST_ENV`), then
//! `PINGPOST_`-prefixed environment variables. The buyer directory is a
//! separate TOML export loaded into the registry at startup.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::auction::AuctionTuning;
use crate::breaker::BreakerConfig;
use crate::domain::{BuyerConfig, EngineDefaults, RetryPolicy, ZipEligibility};
use crate::error::{EngineError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSettings {
    pub auction: AuctionConfig,
    pub breaker: BreakerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Path to the buyer directory TOML export
    #[serde(default)]
    pub buyer_directory: Option<String>,
    /// Health server port; disabled when unset
    #[serde(default)]
    pub health_port: Option<u16>,
}

/// Auction timing and fallback webhook policy. Per-buyer webhook
/// overrides win over these defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct AuctionConfig {
    pub ping_timeout_ms: u64,
    pub post_timeout_ms: u64,
    /// Hard bound on the whole ping phase
    pub ping_deadline_ms: u64,
    /// Hard bound on the whole auction, delivery cascade included
    pub auction_deadline_ms: u64,
    /// Leads processed in parallel by the batch runner
    pub max_concurrent_auctions: usize,
    #[serde(default)]
    pub ping_retry: RetryPolicy,
    #[serde(default)]
    pub post_retry: RetryPolicy,
}

impl AuctionConfig {
    pub fn tuning(&self) -> AuctionTuning {
        AuctionTuning {
            defaults: EngineDefaults {
                ping_timeout_ms: self.ping_timeout_ms,
                post_timeout_ms: self.post_timeout_ms,
                ping_retry: self.ping_retry.clone(),
                post_retry: self.post_retry.clone(),
            },
            ping_deadline: Duration::from_millis(self.ping_deadline_ms),
            auction_deadline: Duration::from_millis(self.auction_deadline_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres URL for the durable ledger; in-memory ledger when unset
    #[serde(default)]
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON log lines instead of the human format
    #[serde(default)]
    pub json: bool,
    /// Directory for daily-rolled log files; stderr only when unset
    #[serde(default)]
    pub file_dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file_dir: None,
        }
    }
}

impl EngineSettings {
    /// Load configuration from files and environment
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> std::result::Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();
        let env_name =
            std::env::var("PINGPOST_ENV").unwrap_or_else(|_| "development".to_string());

        let builder = Config::builder()
            // Start with default values
            .set_default("auction.ping_timeout_ms", 2_000)?
            .set_default("auction.post_timeout_ms", 10_000)?
            .set_default("auction.ping_deadline_ms", 5_000)?
            .set_default("auction.auction_deadline_ms", 30_000)?
            .set_default("auction.max_concurrent_auctions", 8)?
            .set_default("breaker.failure_threshold", 5)?
            .set_default("breaker.cooldown_secs", 60)?
            .set_default("breaker.half_open_probes", 1)?
            .set_default("breaker.half_open_success_threshold", 1)?
            .set_default("database.max_connections", 5)?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(File::from(config_dir.join(format!("{env_name}.toml"))).required(false))
            // Override with environment variables (PINGPOST_DATABASE__URL, etc.)
            .add_source(
                Environment::with_prefix("PINGPOST")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.auction.ping_deadline_ms < self.auction.ping_timeout_ms {
            errors.push(
                "ping_deadline_ms must be at least ping_timeout_ms or no first attempt can finish"
                    .to_string(),
            );
        }
        if self.auction.auction_deadline_ms < self.auction.ping_deadline_ms {
            errors.push("auction_deadline_ms must be at least ping_deadline_ms".to_string());
        }
        if self.auction.max_concurrent_auctions == 0 {
            errors.push("max_concurrent_auctions must be at least 1".to_string());
        }
        if let Err(e) = self.auction.ping_retry.validate() {
            errors.push(format!("ping_retry: {e}"));
        }
        if let Err(e) = self.auction.post_retry.validate() {
            errors.push(format!("post_retry: {e}"));
        }
        if self.breaker.failure_threshold == 0 {
            errors.push("breaker.failure_threshold must be at least 1".to_string());
        }
        if self.breaker.half_open_probes == 0 {
            errors.push("breaker.half_open_probes must be at least 1".to_string());
        }
        if self.database.max_connections == 0 {
            errors.push("database.max_connections must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            auction: AuctionConfig {
                ping_timeout_ms: 2_000,
                post_timeout_ms: 10_000,
                ping_deadline_ms: 5_000,
                auction_deadline_ms: 30_000,
                max_concurrent_auctions: 8,
                ping_retry: RetryPolicy::default(),
                post_retry: RetryPolicy::default(),
            },
            breaker: BreakerConfig::default(),
            database: DatabaseConfig {
                url: None,
                max_connections: 5,
            },
            logging: LoggingConfig::default(),
            buyer_directory: None,
            health_port: Some(8080),
        }
    }
}

/// A buyer directory export: buyers plus their ZIP entitlement rows.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuyerDirectory {
    #[serde(default)]
    pub buyers: Vec<BuyerConfig>,
    #[serde(default)]
    pub eligibility: Vec<ZipEligibility>,
}

/// Parse a buyer directory TOML file. Semantic problems in a single
/// buyer are caught later at registry insert, so one bad buyer names
/// itself instead of failing the whole file.
pub fn load_buyer_directory<P: AsRef<Path>>(path: P) -> Result<BuyerDirectory> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .map_err(|e| EngineError::BuyerDirectory(format!("cannot read {}: {e}", path.display())))?;
    let directory: BuyerDirectory = toml::from_str(&raw)?;
    Ok(directory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn defaults_load_without_any_files() {
        let settings = EngineSettings::load_from("this-directory-does-not-exist").unwrap();
        assert_eq!(settings.auction.ping_timeout_ms, 2_000);
        assert_eq!(settings.auction.max_concurrent_auctions, 8);
        assert_eq!(settings.breaker.failure_threshold, 5);
        assert!(settings.database.url.is_none());
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn inverted_deadlines_fail_validation() {
        let mut settings = EngineSettings::default();
        settings.auction.ping_deadline_ms = 100;
        settings.auction.ping_timeout_ms = 2_000;

        let errors = settings.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("ping_deadline_ms")));
    }

    #[test]
    fn tuning_carries_the_defaults_through() {
        let settings = EngineSettings::default();
        let tuning = settings.auction.tuning();
        assert_eq!(tuning.ping_deadline, Duration::from_millis(5_000));
        assert_eq!(tuning.defaults.post_timeout_ms, 10_000);
    }

    #[test]
    fn buyer_directory_parses_templates_and_rows() {
        let raw = r#"
            [[buyers]]
            buyer_id = "ca"
            display_name = "California Solar Co"

            [buyers.auth]
            mode = "bearer"
            token = "tok-1"

            [[buyers.services]]
            service_type_id = "solar"
            priority = 10
            bounds = { min_bid = "5.00", max_bid = "500.00" }

            [buyers.services.ping_template]
            fields = [
                { source = "zip", target = "zip", required = true },
                { source = "answers.phone", target = "contact.phone", required = false },
            ]

            [buyers.services.post_template]
            fields = [
                { source = "lead_id", target = "ref", required = true },
                { source = "attestations.tcpa_consent_text", target = "tcpa", required = true },
            ]

            [buyers.services.webhook]
            ping_url = "https://ca.example/ping"
            post_url = "https://ca.example/post"
            ping_timeout_ms = 750

            [[eligibility]]
            buyer_id = "ca"
            service_type_id = "solar"
            zip = "90210"
            daily_cap = 25
        "#;

        let directory: BuyerDirectory = toml::from_str(raw).unwrap();
        assert_eq!(directory.buyers.len(), 1);
        assert_eq!(directory.eligibility.len(), 1);

        let buyer = &directory.buyers[0];
        assert!(buyer.active);
        assert_eq!(buyer.services[0].bounds.min_bid, dec!(5));
        assert_eq!(buyer.services[0].webhook.ping_timeout_ms, Some(750));
        assert_eq!(buyer.services[0].ping_template.fields.len(), 2);
        assert!(buyer.validate().is_ok());

        assert_eq!(directory.eligibility[0].daily_cap, Some(25));
        assert!(directory.eligibility[0].active);
    }

    #[test]
    fn unknown_template_source_fails_the_parse() {
        let raw = r#"
            [[buyers]]
            buyer_id = "ca"
            display_name = "CA"

            [[buyers.services]]
            service_type_id = "solar"
            priority = 10
            bounds = { min_bid = "1", max_bid = "2" }

            [buyers.services.ping_template]
            fields = [{ source = "homeowner", target = "h", required = true }]

            [buyers.services.post_template]

            [buyers.services.webhook]
            ping_url = "https://ca.example/ping"
            post_url = "https://ca.example/post"
        "#;

        assert!(toml::from_str::<BuyerDirectory>(raw).is_err());
    }

    #[test]
    fn missing_directory_file_is_a_named_error() {
        let err = load_buyer_directory("/nonexistent/buyers.toml").unwrap_err();
        assert!(matches!(err, EngineError::BuyerDirectory(_)));
    }
}
