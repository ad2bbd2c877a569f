use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_CURRENCY: &str = "SAR";
const DEFAULT_PHONE_REGION: &str = "SA";

/// Tabby (installment lender) credentials and wire settings
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct TabbyConfig {
    #[validate(url)]
    #[serde(default = "default_tabby_base_url")]
    pub base_url: String,

    /// Secret API key; the gateway is disabled while empty
    #[serde(default)]
    pub secret_key: String,

    #[serde(default)]
    pub public_key: String,

    #[validate(length(min = 1))]
    #[serde(default = "default_tabby_merchant_code")]
    pub merchant_code: String,

    /// Category reported for every order line
    #[serde(default = "default_item_category")]
    pub item_category: String,

    /// Comma-separated ISO codes
    #[serde(default = "default_tabby_currencies")]
    pub supported_currencies: String,

    #[validate(length(min = 1))]
    #[serde(default = "default_tabby_signature_header")]
    pub webhook_signature_header: String,

    /// Expected signature header value; verification is skipped when unset
    #[serde(default)]
    pub webhook_signature_value: Option<String>,
}

impl Default for TabbyConfig {
    fn default() -> Self {
        Self {
            base_url: default_tabby_base_url(),
            secret_key: String::new(),
            public_key: String::new(),
            merchant_code: default_tabby_merchant_code(),
            item_category: default_item_category(),
            supported_currencies: default_tabby_currencies(),
            webhook_signature_header: default_tabby_signature_header(),
            webhook_signature_value: None,
        }
    }
}

impl TabbyConfig {
    pub fn is_configured(&self) -> bool {
        !self.secret_key.trim().is_empty()
    }

    pub fn supports_currency(&self, code: &str) -> bool {
        currency_listed(&self.supported_currencies, code)
    }
}

/// HyperPay (card processor) credentials
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct HyperPayConfig {
    #[validate(url)]
    #[serde(default = "default_hyperpay_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub entity_id: String,

    #[serde(default)]
    pub access_token: String,

    /// Adds the 3-D Secure challenge parameters used by the sandbox
    #[serde(default = "default_true_bool")]
    pub test_mode: bool,

    #[serde(default = "default_hyperpay_currencies")]
    pub supported_currencies: String,
}

impl Default for HyperPayConfig {
    fn default() -> Self {
        Self {
            base_url: default_hyperpay_base_url(),
            entity_id: String::new(),
            access_token: String::new(),
            test_mode: true,
            supported_currencies: default_hyperpay_currencies(),
        }
    }
}

impl HyperPayConfig {
    pub fn is_configured(&self) -> bool {
        !self.entity_id.trim().is_empty() && !self.access_token.trim().is_empty()
    }

    pub fn supports_currency(&self, code: &str) -> bool {
        currency_listed(&self.supported_currencies, code)
    }
}

/// Application configuration
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    #[validate(length(min = 1))]
    pub database_url: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[validate(custom = "validate_log_level")]
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default = "default_true_bool")]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,

    /// Public base URL used to build provider return URLs
    #[validate(url)]
    #[serde(default = "default_app_base_url")]
    pub app_base_url: String,

    /// Currency for empty carts
    #[validate(length(equal = 3))]
    #[serde(default = "default_currency")]
    pub default_currency: String,

    #[validate(custom = "validate_vat_rate")]
    #[serde(default = "default_vat_rate")]
    pub vat_rate: Decimal,

    /// Region used when a buyer phone number has no country code
    #[validate(length(equal = 2))]
    #[serde(default = "default_phone_region")]
    pub default_phone_region: String,

    /// Previous orders reported to the installment lender
    #[serde(default = "default_order_history_limit")]
    pub order_history_limit: u64,

    #[serde(default = "default_checkout_success_url")]
    pub checkout_success_url: String,

    #[serde(default = "default_checkout_error_url")]
    pub checkout_error_url: String,

    /// Timeout for every outbound provider call
    #[validate(range(min = 1, max = 120))]
    #[serde(default = "default_provider_timeout_secs")]
    pub provider_timeout_secs: u64,

    #[validate(range(min = 1, max = 20))]
    #[serde(default = "default_capture_max_attempts")]
    pub capture_max_attempts: i32,

    /// Age after which a `processing` claim is considered abandoned
    #[validate(range(min = 1))]
    #[serde(default = "default_claim_ttl_secs")]
    pub claim_ttl_secs: u64,

    #[validate]
    #[serde(default)]
    pub tabby: TabbyConfig,

    #[validate]
    #[serde(default)]
    pub hyperpay: HyperPayConfig,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the essentials
    pub fn new(database_url: String, environment: String) -> Self {
        Self {
            database_url,
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: true,
            cors_allowed_origins: None,
            request_timeout_secs: default_request_timeout_secs(),
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            app_base_url: default_app_base_url(),
            default_currency: default_currency(),
            vat_rate: default_vat_rate(),
            default_phone_region: default_phone_region(),
            order_history_limit: default_order_history_limit(),
            checkout_success_url: default_checkout_success_url(),
            checkout_error_url: default_checkout_error_url(),
            provider_timeout_secs: default_provider_timeout_secs(),
            capture_max_attempts: default_capture_max_attempts(),
            claim_ttl_secs: default_claim_ttl_secs(),
            tabby: TabbyConfig::default(),
            hyperpay: HyperPayConfig::default(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Gets log level reference
    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_secs(self.claim_ttl_secs)
    }

    /// Joins a path onto the public base URL
    pub fn public_url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.app_base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.is_production() && self.tabby.is_configured() {
            let unsigned = self
                .tabby
                .webhook_signature_value
                .as_deref()
                .map(|v| v.trim().is_empty())
                .unwrap_or(true);
            if unsigned {
                let mut err = ValidationError::new("tabby_webhook_signature_required");
                err.message = Some(
                    "Set APP__TABBY__WEBHOOK_SIGNATURE_VALUE before enabling Tabby in production"
                        .into(),
                );
                errors.add("tabby", err);
            }
        }

        if self.is_production() && self.hyperpay.is_configured() && self.hyperpay.test_mode {
            let mut err = ValidationError::new("hyperpay_test_mode_in_production");
            err.message = Some("APP__HYPERPAY__TEST_MODE must be false in production".into());
            errors.add("hyperpay", err);
        }

        if errors.errors().is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

fn currency_listed(list: &str, code: &str) -> bool {
    list.split(',')
        .map(str::trim)
        .any(|c| c.eq_ignore_ascii_case(code))
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true_bool() -> bool {
    true
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}

fn default_app_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_vat_rate() -> Decimal {
    dec!(0.15)
}

fn default_phone_region() -> String {
    DEFAULT_PHONE_REGION.to_string()
}

fn default_order_history_limit() -> u64 {
    10
}

fn default_checkout_success_url() -> String {
    "/checkout/success".to_string()
}

fn default_checkout_error_url() -> String {
    "/checkout/error".to_string()
}

fn default_provider_timeout_secs() -> u64 {
    20
}

fn default_capture_max_attempts() -> i32 {
    3
}

fn default_claim_ttl_secs() -> u64 {
    120
}

fn default_tabby_base_url() -> String {
    "https://api.tabby.ai".to_string()
}

fn default_tabby_merchant_code() -> String {
    "NWSA".to_string()
}

fn default_item_category() -> String {
    "General".to_string()
}

fn default_tabby_currencies() -> String {
    "SAR,AED,KWD".to_string()
}

fn default_tabby_signature_header() -> String {
    "X-Tabby-Signature".to_string()
}

fn default_hyperpay_base_url() -> String {
    "https://eu-test.oppwa.com".to_string()
}

fn default_hyperpay_currencies() -> String {
    "SAR".to_string()
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_vat_rate(rate: &Decimal) -> Result<(), ValidationError> {
    if rate.is_sign_negative() || *rate > Decimal::ONE {
        let mut err = ValidationError::new("vat_rate");
        err.message = Some("vat_rate must be between 0 and 1".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("storefront_payments={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init();
    } else {
        let _ = fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*, nested with `__`, e.g. APP__TABBY__SECRET_KEY)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("APP_ENV").unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://storefront.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT)?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        AppConfig::new("sqlite::memory:".into(), "production".into())
    }

    #[test]
    fn defaults_match_storefront_policy() {
        let cfg = base_config();
        assert_eq!(cfg.default_currency, "SAR");
        assert_eq!(cfg.vat_rate, dec!(0.15));
        assert_eq!(cfg.default_phone_region, "SA");
        assert_eq!(cfg.provider_timeout(), Duration::from_secs(20));
        assert_eq!(cfg.tabby.merchant_code, "NWSA");
        assert_eq!(cfg.tabby.webhook_signature_header, "X-Tabby-Signature");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn gateways_are_disabled_without_credentials() {
        let cfg = base_config();
        assert!(!cfg.tabby.is_configured());
        assert!(!cfg.hyperpay.is_configured());
    }

    #[test]
    fn currency_lists_are_case_insensitive() {
        let tabby = TabbyConfig::default();
        assert!(tabby.supports_currency("sar"));
        assert!(tabby.supports_currency("AED"));
        assert!(!tabby.supports_currency("USD"));
    }

    #[test]
    fn production_tabby_requires_webhook_signature() {
        let mut cfg = base_config();
        cfg.tabby.secret_key = "sk_test".into();
        assert!(cfg.validate_additional_constraints().is_err());

        cfg.tabby.webhook_signature_value = Some("secret-signature".into());
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn production_rejects_hyperpay_test_mode() {
        let mut cfg = base_config();
        cfg.hyperpay.entity_id = "entity".into();
        cfg.hyperpay.access_token = "token".into();
        assert!(cfg.validate_additional_constraints().is_err());
        cfg.hyperpay.test_mode = false;
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn vat_rate_out_of_range_fails_validation() {
        let mut cfg = base_config();
        cfg.vat_rate = dec!(1.5);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn public_url_joins_paths() {
        let mut cfg = base_config();
        cfg.app_base_url = "https://shop.example.com/".into();
        assert_eq!(
            cfg.public_url("/payments/callback"),
            "https://shop.example.com/payments/callback"
        );
    }
}
