pub mod actions;
pub mod coordinator;
pub mod error;
pub mod gateway;
pub mod lock;
pub mod metrics;
pub mod notifier;
pub mod partition;
pub mod planner;
pub mod reconcile;

pub use actions::GroupAction;
pub use coordinator::{RebalanceCoordinator, RebalancePolicy, TripCommand};
pub use error::{GroupError, GroupResult};
pub use gateway::{GatewayConfig, TripGateway};
pub use metrics::RebalanceMetrics;
pub use notifier::ChangeNotifier;
