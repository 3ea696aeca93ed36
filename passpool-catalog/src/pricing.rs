use serde::{Deserialize, Serialize};

/// Fare configuration, all amounts in minor currency units (cents)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PricingConfig {
    /// Flat fare for a rider travelling without a shared pass
    pub individual_fare: i32,

    /// Total price of a pass covering 2 riders
    pub pass_price_2: i32,

    /// Total price of a pass covering 3 riders
    pub pass_price_3: i32,

    /// Total price of a pass covering 4 riders
    pub pass_price_4: i32,

    /// Total price of a pass covering 5 riders
    pub pass_price_5: i32,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            individual_fare: 2_490,
            pass_price_2: 3_200,
            pass_price_3: 4_200,
            pass_price_4: 5_000,
            pass_price_5: 5_800,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PricingError {
    #[error("No fare defined for a group of {0}")]
    InvalidGroupSize(usize),

    #[error("Invalid pricing configuration: {0}")]
    InvalidConfig(String),
}

/// Per-person cost by group size.
///
/// Sizes 2 to 5 split a shared pass; size 1 pays the individual fare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricingTable {
    individual_fare: i32,
    /// Index 0 is the 2-rider pass
    pass_prices: [i32; 4],
}

impl PricingTable {
    pub fn new(config: &PricingConfig) -> Result<Self, PricingError> {
        let table = Self {
            individual_fare: config.individual_fare,
            pass_prices: [
                config.pass_price_2,
                config.pass_price_3,
                config.pass_price_4,
                config.pass_price_5,
            ],
        };

        if table.individual_fare <= 0 || table.pass_prices.iter().any(|p| *p <= 0) {
            return Err(PricingError::InvalidConfig(
                "fares must be positive".to_string(),
            ));
        }

        for size in 2..=5 {
            let shared = table.cost_per_person(size)?;
            if shared >= table.individual_fare {
                return Err(PricingError::InvalidConfig(format!(
                    "sharing among {} costs {} per person, not below the individual fare {}",
                    size, shared, table.individual_fare
                )));
            }
        }

        Ok(table)
    }

    /// Cost each member pays in a group of `group_size`, rounded up to the next cent
    pub fn cost_per_person(&self, group_size: usize) -> Result<i32, PricingError> {
        let total = self.pass_price(group_size)?;
        let size = group_size as i32;
        Ok((total + size - 1) / size)
    }

    /// Total price of the ticket covering `group_size` riders
    fn pass_price(&self, group_size: usize) -> Result<i32, PricingError> {
        match group_size {
            1 => Ok(self.individual_fare),
            2..=5 => Ok(self.pass_prices[group_size - 2]),
            other => Err(PricingError::InvalidGroupSize(other)),
        }
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        let config = PricingConfig::default();
        Self {
            individual_fare: config.individual_fare,
            pass_prices: [
                config.pass_price_2,
                config.pass_price_3,
                config.pass_price_4,
                config.pass_price_5,
            ],
        }
    }
}
