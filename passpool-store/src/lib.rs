pub mod app_config;
pub mod database;
#[cfg(feature = "kafka")]
pub mod events;
pub mod group_repo;
pub mod memory;
pub mod redis_repo;

pub use database::DbClient;
#[cfg(feature = "kafka")]
pub use events::EventProducer;
pub use group_repo::PgGroupStore;
pub use memory::InMemoryStore;
pub use redis_repo::{RateLimiter, RedisClient};
