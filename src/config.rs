use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError, ValidationErrors};

use crate::services::orders::TransitionPolicy;

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEV_DEFAULT_JWT_SECRET: &str = "ferremas_development_secret_key_not_for_production_use";

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL
    pub database_url: String,

    /// JWT secret key (minimum 32 characters)
    #[validate(length(min = 32), custom = "validate_jwt_secret")]
    pub jwt_secret: String,

    /// JWT expiration time in seconds
    #[serde(default = "default_jwt_expiration")]
    #[validate(range(min = 60, max = 604800))]
    pub jwt_expiration: u64,

    /// JWT issuer name
    #[serde(default = "default_auth_issuer")]
    pub auth_issuer: String,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins (production)
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// Allow permissive CORS fallback
    #[serde(default)]
    pub cors_allow_any_origin: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_idle_timeout_secs")]
    pub db_idle_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    // ========== API Pagination Configuration ==========
    #[serde(default = "default_api_page_size")]
    pub api_default_page_size: u64,

    #[serde(default = "default_api_max_page_size")]
    #[validate(range(min = 1))]
    pub api_max_page_size: u64,

    // ========== Order Pricing & Lifecycle ==========
    /// Currency assigned to new orders
    #[serde(default = "default_currency")]
    #[validate(length(equal = 3))]
    pub default_currency: String,

    /// Tax rate applied to the discounted subtotal (0.19 = 19%)
    #[serde(default = "default_tax_rate")]
    #[validate(custom = "validate_rate")]
    pub tax_rate: Decimal,

    /// Discount rate applied to bulk orders
    #[serde(default = "default_bulk_discount_rate")]
    #[validate(custom = "validate_rate")]
    pub bulk_discount_rate: Decimal,

    /// Orders with a total quantity strictly above this receive the bulk discount
    #[serde(default = "default_bulk_discount_min_quantity")]
    pub bulk_discount_min_quantity: i32,

    /// "strict" or "permissive"
    #[serde(default = "default_transition_policy")]
    #[validate(custom = "validate_transition_policy")]
    pub order_transition_policy: String,

    // ========== MercadoPago ==========
    #[serde(default)]
    pub mercadopago_access_token: String,

    #[serde(default = "default_mercadopago_base_url")]
    pub mercadopago_base_url: String,

    /// Redirect buyers to the sandbox checkout
    #[serde(default)]
    pub mercadopago_sandbox: bool,

    #[serde(default = "default_mercadopago_timeout_secs")]
    pub mercadopago_timeout_secs: u64,

    /// Secret used to verify the `x-signature` header on notifications
    #[serde(default)]
    pub mercadopago_webhook_secret: Option<String>,

    #[serde(default = "default_checkout_success_url")]
    pub checkout_success_url: String,
    #[serde(default = "default_checkout_failure_url")]
    pub checkout_failure_url: String,
    #[serde(default = "default_checkout_pending_url")]
    pub checkout_pending_url: String,
    #[serde(default)]
    pub checkout_notification_url: Option<String>,

    // ========== Circuit Breaker Configuration ==========
    #[serde(default = "default_circuit_breaker_failures")]
    pub circuit_breaker_failure_threshold: u32,

    #[serde(default = "default_circuit_breaker_timeout")]
    pub circuit_breaker_timeout_secs: u64,

    #[serde(default = "default_circuit_breaker_successes")]
    pub circuit_breaker_success_threshold: u32,

    // ========== Currency ==========
    #[serde(default = "default_currency_rates_ttl_secs")]
    pub currency_rates_ttl_secs: u64,

    /// Units of CLP per unit of each currency
    #[serde(default = "default_currency_rates")]
    pub currency_rates: HashMap<String, Decimal>,
}

impl AppConfig {
    /// Creates a configuration with defaults for every optional setting.
    pub fn new(
        database_url: String,
        jwt_secret: String,
        host: String,
        port: u16,
        environment: String,
    ) -> Self {
        Self {
            database_url,
            jwt_secret,
            jwt_expiration: default_jwt_expiration(),
            auth_issuer: default_auth_issuer(),
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            cors_allow_any_origin: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            api_default_page_size: default_api_page_size(),
            api_max_page_size: default_api_max_page_size(),
            default_currency: default_currency(),
            tax_rate: default_tax_rate(),
            bulk_discount_rate: default_bulk_discount_rate(),
            bulk_discount_min_quantity: default_bulk_discount_min_quantity(),
            order_transition_policy: default_transition_policy(),
            mercadopago_access_token: String::new(),
            mercadopago_base_url: default_mercadopago_base_url(),
            mercadopago_sandbox: false,
            mercadopago_timeout_secs: default_mercadopago_timeout_secs(),
            mercadopago_webhook_secret: None,
            checkout_success_url: default_checkout_success_url(),
            checkout_failure_url: default_checkout_failure_url(),
            checkout_pending_url: default_checkout_pending_url(),
            checkout_notification_url: None,
            circuit_breaker_failure_threshold: default_circuit_breaker_failures(),
            circuit_breaker_timeout_secs: default_circuit_breaker_timeout(),
            circuit_breaker_success_threshold: default_circuit_breaker_successes(),
            currency_rates_ttl_secs: default_currency_rates_ttl_secs(),
            currency_rates: default_currency_rates(),
        }
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Returns true if explicit CORS origins are configured
    pub fn has_cors_allowed_origins(&self) -> bool {
        self.cors_allowed_origins
            .as_ref()
            .map(|raw| raw.split(',').any(|origin| !origin.trim().is_empty()))
            .unwrap_or(false)
    }

    /// Whether we should fall back to permissive CORS
    pub fn should_allow_permissive_cors(&self) -> bool {
        self.is_development() || self.cors_allow_any_origin
    }

    /// Parsed order transition policy. Unknown values fall back to strict.
    pub fn transition_policy(&self) -> TransitionPolicy {
        self.order_transition_policy
            .parse()
            .unwrap_or(TransitionPolicy::Strict)
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.mercadopago_timeout_secs)
    }

    pub fn currency_rates_ttl(&self) -> Duration {
        Duration::from_secs(self.currency_rates_ttl_secs)
    }

    fn validate_additional_constraints(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if !self.should_allow_permissive_cors() && !self.has_cors_allowed_origins() {
            let mut err = ValidationError::new("cors_allowed_origins_required");
            err.message = Some(
                "Set APP__CORS_ALLOWED_ORIGINS for non-development environments or explicitly opt-in via APP__CORS_ALLOW_ANY_ORIGIN=true".into(),
            );
            errors.add("cors_allowed_origins", err);
        }

        if !self.is_development() && self.jwt_secret.trim() == DEV_DEFAULT_JWT_SECRET {
            let mut err = ValidationError::new("jwt_secret_default_dev");
            err.message = Some(
                "The bundled development JWT secret must not be used outside development. Set APP__JWT_SECRET to a unique, secure value."
                    .into(),
            );
            errors.add("jwt_secret", err);
        }

        if self.is_production() && self.mercadopago_access_token.trim().is_empty() {
            let mut err = ValidationError::new("mercadopago_access_token_required");
            err.message = Some("Set APP__MERCADOPAGO_ACCESS_TOKEN in production".into());
            errors.add("mercadopago_access_token", err);
        }

        if self.api_default_page_size == 0 || self.api_default_page_size > self.api_max_page_size
        {
            let mut err = ValidationError::new("api_default_page_size");
            err.message = Some("Must be between 1 and api_max_page_size".into());
            errors.add("api_default_page_size", err);
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

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_jwt_expiration() -> u64 {
    86_400
}

fn default_auth_issuer() -> String {
    "ferremas-api".to_string()
}

fn default_db_max_connections() -> u32 {
    16
}
fn default_db_min_connections() -> u32 {
    2
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_idle_timeout_secs() -> u64 {
    600
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_api_page_size() -> u64 {
    20
}

fn default_api_max_page_size() -> u64 {
    100
}

fn default_currency() -> String {
    "CLP".to_string()
}

fn default_tax_rate() -> Decimal {
    dec!(0.19)
}

fn default_bulk_discount_rate() -> Decimal {
    dec!(0.05)
}

fn default_bulk_discount_min_quantity() -> i32 {
    4
}

fn default_transition_policy() -> String {
    "strict".to_string()
}

fn default_mercadopago_base_url() -> String {
    "https://api.mercadopago.com".to_string()
}

fn default_mercadopago_timeout_secs() -> u64 {
    10
}

fn default_checkout_success_url() -> String {
    "http://localhost:3000/payment/success".to_string()
}

fn default_checkout_failure_url() -> String {
    "http://localhost:3000/payment/failure".to_string()
}

fn default_checkout_pending_url() -> String {
    "http://localhost:3000/payment/pending".to_string()
}

fn default_circuit_breaker_failures() -> u32 {
    5
}

fn default_circuit_breaker_timeout() -> u64 {
    30
}

fn default_circuit_breaker_successes() -> u32 {
    1
}

fn default_currency_rates_ttl_secs() -> u64 {
    3600
}

pub fn default_currency_rates() -> HashMap<String, Decimal> {
    HashMap::from([
        ("USD".to_string(), dec!(800)),
        ("EUR".to_string(), dec!(900)),
        ("CLP".to_string(), dec!(1)),
    ])
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

fn validate_jwt_secret(secret: &str) -> Result<(), ValidationError> {
    let trimmed = secret.trim();

    const DISALLOWED: [&str; 3] = [
        "CHANGE_THIS_SECRET_IN_PRODUCTION",
        "your-secret-key",
        "default-secret-key",
    ];
    if DISALLOWED
        .iter()
        .any(|&bad| trimmed.eq_ignore_ascii_case(bad))
    {
        let mut err = ValidationError::new("jwt_secret");
        err.message = Some("JWT secret must be overridden with a secure random value".into());
        return Err(err);
    }

    if let Some(first) = trimmed.chars().next() {
        if trimmed.chars().all(|c| c == first) {
            let mut err = ValidationError::new("jwt_secret");
            err.message = Some("JWT secret cannot be a repeated character sequence".into());
            return Err(err);
        }
    }

    Ok(())
}

fn validate_rate(rate: &Decimal) -> Result<(), ValidationError> {
    if rate.is_sign_negative() || *rate > Decimal::ONE {
        let mut err = ValidationError::new("rate");
        err.message = Some("Rates must be between 0 and 1".into());
        return Err(err);
    }
    Ok(())
}

fn validate_transition_policy(value: &str) -> Result<(), ValidationError> {
    match value.parse::<TransitionPolicy>() {
        Ok(_) => Ok(()),
        Err(_) => {
            let mut err = ValidationError::new("order_transition_policy");
            err.message = Some("Must be one of: strict, permissive".into());
            Err(err)
        }
    }
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::fmt;

    let default_directive = format!("ferremas_api={},tower_http=info", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    if json {
        let _ = fmt().with_env_filter(filter_directive).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter_directive).try_init();
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Default config (config/default.toml)
/// 2. Environment-specific config (config/{env}.toml)
/// 3. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    // jwt_secret has no default and must come from a file or APP__JWT_SECRET.
    let config = Config::builder()
        .set_default("database_url", "sqlite://ferremas.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    if config.get_string("jwt_secret").is_err() {
        error!("JWT secret is not configured. Set APP__JWT_SECRET to a random string of at least 32 characters.");
        return Err(AppConfigError::Load(ConfigError::NotFound(
            "jwt_secret is required but not configured. Set APP__JWT_SECRET environment variable."
                .into(),
        )));
    }

    let app_config: AppConfig = config.try_deserialize()?;
    validate_config(&app_config)?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}

/// Runs field-level and cross-field validation.
pub fn validate_config(app_config: &AppConfig) -> Result<(), AppConfigError> {
    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration security validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> AppConfig {
        let mut cfg = AppConfig::new(
            "sqlite://ferremas.db?mode=memory".into(),
            "super_secure_jwt_secret_that_is_long_enough_123".into(),
            "127.0.0.1".into(),
            8080,
            "production".into(),
        );
        cfg.mercadopago_access_token = "TEST-token".into();
        cfg
    }

    #[test]
    fn non_dev_requires_cors_origins() {
        let cfg = base_config();
        assert!(cfg.validate_additional_constraints().is_err());
    }

    #[test]
    fn non_dev_allows_override_flag() {
        let mut cfg = base_config();
        cfg.cors_allow_any_origin = true;
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn non_dev_with_origins_passes() {
        let mut cfg = base_config();
        cfg.cors_allowed_origins = Some("https://ferremas.cl".into());
        assert!(cfg.validate_additional_constraints().is_ok());
    }

    #[test]
    fn production_requires_gateway_token() {
        let mut cfg = base_config();
        cfg.cors_allow_any_origin = true;
        cfg.mercadopago_access_token.clear();
        let errors = cfg.validate_additional_constraints().unwrap_err();
        assert!(errors
            .field_errors()
            .contains_key("mercadopago_access_token"));
    }

    #[test]
    fn rejects_out_of_range_tax_rate() {
        let mut cfg = base_config();
        cfg.tax_rate = dec!(1.5);
        let errors = cfg.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("tax_rate"));
    }

    #[test]
    fn rejects_unknown_transition_policy() {
        let mut cfg = base_config();
        cfg.order_transition_policy = "anything-goes".into();
        assert!(cfg.validate().is_err());
        assert_eq!(cfg.transition_policy(), TransitionPolicy::Strict);

        cfg.order_transition_policy = "permissive".into();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.transition_policy(), TransitionPolicy::Permissive);
    }

    #[test]
    fn defaults_match_store_conventions() {
        let cfg = base_config();
        assert_eq!(cfg.default_currency, "CLP");
        assert_eq!(cfg.jwt_expiration, 86_400);
        assert_eq!(cfg.currency_rates.get("USD"), Some(&dec!(800)));
    }
}
