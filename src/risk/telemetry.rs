//! Risk telemetry snapshot retained per symbol after each sizing pass.
//!
//! Observability only: these values are never fed back into the next
//! sizing decision, which stays a pure function of its current inputs.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskTelemetry {
    /// Realized volatility of the sized symbol
    pub volatility: Decimal,
    /// Exposure-weighted portfolio volatility proxy
    pub portfolio_vol: Decimal,
    /// Volatility-targeting scale, always within [0, 5]
    pub scaling_factor: Decimal,
    /// Normalized total exposure (1 when any position exists, else 0)
    pub total_exposure: Decimal,
    /// Per-symbol fraction of total absolute notional
    pub symbol_exposure: HashMap<String, Decimal>,
    /// Kill condition: any panic rule fired during this pass
    pub panic: bool,
}

impl Default for RiskTelemetry {
    fn default() -> Self {
        Self {
            volatility: Decimal::ZERO,
            portfolio_vol: Decimal::ZERO,
            scaling_factor: Decimal::ONE,
            total_exposure: Decimal::ZERO,
            symbol_exposure: HashMap::new(),
            panic: false,
        }
    }
}
