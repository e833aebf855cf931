//! Exchange instrument metadata.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Step sizes and contract metadata for one instrument.
///
/// All computed order sizes and prices must be rounded to these steps
/// before being sent to the exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    /// Minimum size increment (contracts).
    pub lot_size: Decimal,
    /// Minimum price increment.
    pub tick_size: Decimal,
    /// Minimum order size (contracts).
    pub min_size: Decimal,
    /// Value of one contract in base units.
    pub contract_value: Decimal,
}

impl Default for InstrumentSpec {
    /// Whole-contract fallback used when the instrument query fails.
    fn default() -> Self {
        Self {
            lot_size: Decimal::ONE,
            tick_size: dec!(0.00001),
            min_size: Decimal::ONE,
            contract_value: Decimal::ONE,
        }
    }
}
