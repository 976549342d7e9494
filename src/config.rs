use config::{
    builder::{ConfigBuilder, DefaultState},
    Config, ConfigError, Environment, File,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_SESSION_TTL_MINUTES: i64 = 5;
const DEFAULT_PAYMENT_WINDOW_MINUTES: i64 = 30;
const DEFAULT_RESERVATION_RETENTION_HOURS: i64 = 24;
const DEFAULT_SWEEPER_INTERVAL_SECS: u64 = 60;
const DEFAULT_STALE_CLAIM_MINUTES: i64 = 10;
const DEFAULT_SHIPROCKET_TOKEN_TTL_HOURS: u64 = 9 * 24;

/// Checkout engine tuning
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields, default)]
pub struct CheckoutConfig {
    /// Lifetime of a fresh session and its reservations
    #[validate(range(min = 1, max = 1440))]
    pub session_ttl_minutes: i64,

    /// Lifetime once the shopper enters the payment window
    #[validate(range(min = 1, max = 1440))]
    pub payment_window_minutes: i64,

    /// Price drift tolerated before stored totals are refreshed
    pub price_epsilon: Decimal,

    /// ISO currency used for gateway orders
    #[validate(length(equal = 3))]
    pub currency: String,

    /// How long expired reservations are kept before deletion
    #[validate(range(min = 1))]
    pub reservation_retention_hours: i64,

    /// Interval between sweeper passes
    #[validate(range(min = 1))]
    pub sweeper_interval_secs: u64,

    /// Age after which a `processing` claim with no order is handed back to `active`
    #[validate(range(min = 1, max = 1440))]
    pub stale_claim_minutes: i64,

    /// Attempts for coupon apply/remove when a session save races
    #[validate(range(min = 1, max = 10))]
    pub save_retry_attempts: u32,
}

impl Default for CheckoutConfig {
    fn default() -> Self {
        Self {
            session_ttl_minutes: DEFAULT_SESSION_TTL_MINUTES,
            payment_window_minutes: DEFAULT_PAYMENT_WINDOW_MINUTES,
            price_epsilon: dec!(0.01),
            currency: "INR".to_string(),
            reservation_retention_hours: DEFAULT_RESERVATION_RETENTION_HOURS,
            sweeper_interval_secs: DEFAULT_SWEEPER_INTERVAL_SECS,
            stale_claim_minutes: DEFAULT_STALE_CLAIM_MINUTES,
            save_retry_attempts: 3,
        }
    }
}

impl CheckoutConfig {
    pub fn session_ttl(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.session_ttl_minutes)
    }

    pub fn payment_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.payment_window_minutes)
    }

    pub fn reservation_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.reservation_retention_hours)
    }

    pub fn stale_claim_after(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.stale_claim_minutes)
    }

    pub fn sweeper_interval(&self) -> Duration {
        Duration::from_secs(self.sweeper_interval_secs)
    }
}

/// Razorpay payment gateway credentials
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields, default)]
pub struct RazorpayConfig {
    pub key_id: String,
    pub key_secret: String,
    /// Secret used to sign webhook deliveries
    pub webhook_secret: Option<String>,
    #[validate(url)]
    pub base_url: String,
    #[validate(range(min = 1, max = 120))]
    pub timeout_secs: u64,
}

impl Default for RazorpayConfig {
    fn default() -> Self {
        Self {
            key_id: String::new(),
            key_secret: String::new(),
            webhook_secret: None,
            base_url: "https://api.razorpay.com/v1".to_string(),
            timeout_secs: 10,
        }
    }
}

/// Shiprocket carrier aggregator credentials
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields, default)]
pub struct ShiprocketConfig {
    pub email: String,
    pub password: String,
    #[validate(url)]
    pub base_url: String,
    /// Lifetime of the cached login token
    #[validate(range(min = 1))]
    pub token_ttl_hours: u64,
    /// Pending shipment requests held before new ones are dropped
    #[validate(range(min = 1))]
    pub queue_capacity: usize,
    #[validate(range(min = 1, max = 120))]
    pub timeout_secs: u64,
}

impl Default for ShiprocketConfig {
    fn default() -> Self {
        Self {
            email: String::new(),
            password: String::new(),
            base_url: "https://apiv2.shiprocket.in/v1/external".to_string(),
            token_ttl_hours: DEFAULT_SHIPROCKET_TOKEN_TTL_HOURS,
            queue_capacity: 256,
            timeout_secs: 10,
        }
    }
}

impl ShiprocketConfig {
    /// Shipments are only requested when carrier credentials are present.
    pub fn is_configured(&self) -> bool {
        !self.email.is_empty() && !self.password.is_empty()
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_hours * 3600)
    }
}

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
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
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// Whether to run database migrations on startup
    #[serde(default)]
    pub auto_migrate: bool,

    /// CORS: comma-separated list of allowed origins
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    #[validate(range(min = 1))]
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

    /// Request timeout applied by the HTTP stack (seconds)
    #[serde(default = "default_request_timeout_secs")]
    #[validate(range(min = 1, max = 300))]
    pub request_timeout_secs: u64,

    /// Event channel capacity for async event processing
    #[serde(default = "default_event_channel_capacity")]
    #[validate(range(min = 1))]
    pub event_channel_capacity: usize,

    #[serde(default)]
    #[validate]
    pub checkout: CheckoutConfig,

    #[serde(default)]
    #[validate]
    pub razorpay: RazorpayConfig,

    #[serde(default)]
    #[validate]
    pub shiprocket: ShiprocketConfig,
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the connection target.
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            auto_migrate: false,
            cors_allowed_origins: None,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_idle_timeout_secs: default_db_idle_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            event_channel_capacity: default_event_channel_capacity(),
            checkout: CheckoutConfig::default(),
            razorpay: RazorpayConfig::default(),
            shiprocket: ShiprocketConfig::default(),
        }
    }

    /// Checks if running in production environment
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    /// Checks if running in development environment
    pub fn is_development(&self) -> bool {
        self.environment.eq_ignore_ascii_case("development")
    }

    /// Parsed CORS origins, empty when none are configured
    pub fn cors_origins(&self) -> Vec<String> {
        self.cors_allowed_origins
            .as_deref()
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn validate_additional_constraints(&self) -> Result<(), validator::ValidationErrors> {
        let mut errors = validator::ValidationErrors::new();

        if self.db_min_connections > self.db_max_connections {
            let mut err = ValidationError::new("db_min_connections");
            err.message = Some("db_min_connections must not exceed db_max_connections".into());
            errors.add("db_min_connections", err);
        }

        if self.checkout.payment_window_minutes < self.checkout.session_ttl_minutes {
            let mut err = ValidationError::new("payment_window_minutes");
            err.message =
                Some("checkout.payment_window_minutes must be at least the session TTL".into());
            errors.add("checkout", err);
        }

        if self.checkout.price_epsilon.is_sign_negative() {
            let mut err = ValidationError::new("price_epsilon");
            err.message = Some("checkout.price_epsilon must not be negative".into());
            errors.add("checkout", err);
        }

        if self.is_production()
            && (self.razorpay.key_id.is_empty() || self.razorpay.key_secret.is_empty())
        {
            let mut err = ValidationError::new("razorpay_credentials");
            err.message = Some(
                "Set APP__RAZORPAY__KEY_ID and APP__RAZORPAY__KEY_SECRET in production".into(),
            );
            errors.add("razorpay", err);
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

fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
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

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_event_channel_capacity() -> usize {
    1024
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

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("checkout_engine={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let filter = EnvFilter::new(filter_directive);
    if json {
        let _ = fmt().with_env_filter(filter).json().try_init();
    } else {
        let _ = fmt().with_env_filter(filter).try_init();
    }
}

fn base_builder() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("database_url", "sqlite://checkout.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", DEFAULT_PORT as i64)?
        .set_default("environment", DEFAULT_ENV)?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .set_default("log_json", false)
}

fn finish(config: Config) -> Result<AppConfig, AppConfigError> {
    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration constraint validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    Ok(app_config)
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*, nested sections split on `__`)
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

    let config = base_builder()?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config = finish(config)?;
    info!("Configuration loaded successfully");
    Ok(app_config)
}
