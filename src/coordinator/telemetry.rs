//! Coordinator Telemetry — aggregate snapshots for external consumers

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::queue::QueueStats;
use crate::risk::{BreakerStatus, RiskTelemetry};
use crate::scheduler::SchedulerStatus;

/// Per-symbol view: scheduler state plus the last risk pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolTelemetry {
    pub scheduler: SchedulerStatus,
    pub risk: Option<RiskTelemetry>,
}

/// Portfolio-level aggregate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioTelemetry {
    pub queue: QueueStats,
    pub in_flight_count: usize,
    pub loop_latency_ms: u64,
    pub portfolio_equity: Decimal,
    pub kill_switch: bool,
    pub global_risk_off: bool,
}

/// Full coordinator snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorTelemetry {
    pub symbols: HashMap<String, SymbolTelemetry>,
    pub portfolio: PortfolioTelemetry,
    pub breaker: BreakerStatus,
}
