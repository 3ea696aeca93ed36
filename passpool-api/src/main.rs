use passpool_api::{app, state::{AppState, AuthConfig}};
use passpool_catalog::PricingTable;
use passpool_group::{
    ChangeNotifier, GatewayConfig, RebalanceCoordinator, RebalanceMetrics, RebalancePolicy, TripGateway,
};
use passpool_store::{app_config::Config, DbClient, RedisClient};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "passpool_api=debug,passpool_group=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    tracing::info!("Starting PassPool API on port {}", config.server.port);

    let db = DbClient::connect(&config.database).await?;
    db.migrate().await?;
    let store = Arc::new(db.group_store());

    let redis = RedisClient::new(&config.redis.url).await?;

    let pricing = PricingTable::new(&config.pricing)?;

    #[allow(unused_mut)]
    let mut notifier = ChangeNotifier::new(config.notifier.channel_capacity);
    #[cfg(feature = "kafka")]
    if let Some(topic) = &config.kafka.topic {
        let producer = passpool_store::EventProducer::new(&config.kafka.brokers, topic.clone())?;
        notifier = notifier.with_sink(Arc::new(producer));
        tracing::info!("Forwarding trip changes to Kafka topic {}", topic);
    }

    let registry = prometheus::Registry::new();
    let metrics = RebalanceMetrics::new(&registry)?;

    let policy = RebalancePolicy {
        max_attempts: config.rebalance.max_attempts,
        attempt_timeout: Duration::from_millis(config.rebalance.attempt_timeout_ms),
        backoff: Duration::from_millis(config.rebalance.backoff_ms),
    };
    let coordinator = RebalanceCoordinator::new(store.clone(), pricing, policy, notifier.clone(), metrics);
    let gateway = TripGateway::new(
        coordinator,
        store.clone(),
        store,
        notifier,
        GatewayConfig {
            cutoff: chrono::Duration::minutes(config.membership.cutoff_minutes),
        },
    );

    let app_state = AppState {
        gateway,
        rate_limiter: Some(Arc::new(redis)),
        rate_limit: config.rate_limit.clone(),
        auth: AuthConfig {
            secret: config.auth.jwt_secret.clone(),
        },
        registry,
    };

    let app = app(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
