use passpool_catalog::PricingConfig;
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub kafka: KafkaConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub rebalance: RebalanceConfig,
    #[serde(default)]
    pub membership: MembershipConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout")]
    pub acquire_timeout_seconds: u64,
}

fn default_max_connections() -> u32 { 5 }

fn default_acquire_timeout() -> u64 { 3 }

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct KafkaConfig {
    pub brokers: String,
    /// Change events are only produced when a topic is set
    pub topic: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AuthConfig {
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RebalanceConfig {
    pub max_attempts: u32,
    pub attempt_timeout_ms: u64,
    pub backoff_ms: u64,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout_ms: 2_000,
            backoff_ms: 25,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MembershipConfig {
    /// Join and leave close this many minutes before departure
    pub cutoff_minutes: i64,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self { cutoff_minutes: 10 }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    pub requests: i64,
    pub window_seconds: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests: 30,
            window_seconds: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NotifierConfig {
    pub channel_capacity: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // optional per-environment overrides
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // never checked in
            .add_source(config::File::with_name("config/local").required(false))
            // e.g. PASSPOOL_DATABASE__URL
            .add_source(config::Environment::with_prefix("PASSPOOL").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
