//! Drawdown Circuit Breaker
//!
//! Per-portfolio state machine halting new entries on intraday drawdown,
//! daily loss, or a panic regime. While active, every position-opening
//! decision upstream must resolve to hold; the breaker never flattens
//! existing risk on its own. Flattening is an explicit caller operation.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;
use crate::engine::Regime;

/// Why the breaker tripped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerReason {
    IntradayDrawdown,
    DailyLoss,
    PanicRegime,
}

impl std::fmt::Display for BreakerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerReason::IntradayDrawdown => write!(f, "intraday_dd"),
            BreakerReason::DailyLoss => write!(f, "daily_loss"),
            BreakerReason::PanicRegime => write!(f, "panic"),
        }
    }
}

/// Composite breaker state.
///
/// `active` and `cooldown_until` always change together under the write
/// lock; readers never observe one without the other.
#[derive(Debug, Clone, Default)]
struct BreakerState {
    day_start_equity: Decimal,
    trailing_peak: Decimal,
    active: bool,
    cooldown_until: Option<DateTime<Utc>>,
    last_reason: Option<BreakerReason>,
    day_anchor: Option<NaiveDate>,
}

/// Read-only view for sizing decisions and telemetry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerStatus {
    pub active: bool,
    pub reason: Option<BreakerReason>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub day_start_equity: Decimal,
    pub trailing_peak: Decimal,
}

/// Drawdown-triggered circuit breaker
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: RwLock<BreakerState>,
    total_trips: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(BreakerState::default()),
            total_trips: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(BreakerConfig::default())
    }

    /// Feed the latest equity and regime through the state machine.
    ///
    /// Re-tripping while already active replaces `cooldown_until` with
    /// `now + cooldown_secs`, which can only extend the halt. Deactivation
    /// happens here once the cooldown has elapsed, resetting the trailing
    /// peak to current equity. `day_start_equity` re-anchors once per UTC
    /// calendar day.
    pub async fn update(&self, equity: Decimal, regime: Regime) -> BreakerStatus {
        let now = Utc::now();
        let today = now.date_naive();
        let mut state = self.state.write().await;

        if state.day_anchor != Some(today) || state.day_start_equity <= Decimal::ZERO {
            state.day_start_equity = equity;
            state.day_anchor = Some(today);
        }
        state.trailing_peak = state.trailing_peak.max(equity);

        let drawdown = if state.day_start_equity > Decimal::ZERO {
            (state.day_start_equity - equity) / state.day_start_equity
        } else {
            Decimal::ZERO
        };

        let reason = if drawdown >= self.config.max_intraday_dd_pct {
            Some(BreakerReason::IntradayDrawdown)
        } else if regime == Regime::Panic {
            Some(BreakerReason::PanicRegime)
        } else if drawdown >= self.config.max_daily_loss_pct {
            Some(BreakerReason::DailyLoss)
        } else {
            None
        };

        if let Some(reason) = reason {
            let until = now + ChronoDuration::seconds(self.config.cooldown_secs as i64);
            if !state.active {
                self.total_trips.fetch_add(1, Ordering::SeqCst);
                warn!(%reason, drawdown = %drawdown, cooldown_until = %until, "circuit breaker TRIPPED");
            } else {
                debug!(%reason, cooldown_until = %until, "circuit breaker cooldown extended");
            }
            state.active = true;
            state.cooldown_until = Some(until);
            state.last_reason = Some(reason);
        } else if state.active && state.cooldown_until.is_some_and(|t| now >= t) {
            state.active = false;
            state.cooldown_until = None;
            state.last_reason = None;
            state.trailing_peak = equity;
            info!(equity = %equity, "circuit breaker cooldown elapsed, resuming");
        }

        Self::status_of(&state)
    }

    /// Whether new entries are currently halted.
    pub async fn is_active(&self) -> bool {
        self.state.read().await.active
    }

    pub async fn status(&self) -> BreakerStatus {
        Self::status_of(&*self.state.read().await)
    }

    pub fn total_trips(&self) -> u64 {
        self.total_trips.load(Ordering::SeqCst)
    }

    fn status_of(state: &BreakerState) -> BreakerStatus {
        BreakerStatus {
            active: state.active,
            reason: state.last_reason,
            cooldown_until: state.cooldown_until,
            day_start_equity: state.day_start_equity,
            trailing_peak: state.trailing_peak,
        }
    }
}
