pub mod pricing;

pub use pricing::{PricingConfig, PricingError, PricingTable};
