//! Risk Engine
//!
//! Exposure-cap enforcement, realized-volatility estimation,
//! volatility-targeted scaling, and panic detection, composed into a
//! bounded position size for a proposed trade. Every step degrades to its
//! safest value on numeric failure (volatility 0, scaling 1, size 0);
//! a sizing call never errors out.

mod breaker;
mod telemetry;

pub use breaker::{BreakerReason, BreakerStatus, CircuitBreaker};
pub use telemetry::RiskTelemetry;

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::RiskConfig;
use crate::engine::{Regime, Signal};

/// Retained volatility samples per symbol for shock detection
const VOL_BUFFER_LEN: usize = 20;
/// Minimum samples before the shock rule can fire
const SHOCK_MIN_SAMPLES: usize = 5;

/// Descriptive exposure snapshot: per-symbol fractions of total absolute
/// notional, plus the normalized total (1 if any position exists, else 0).
#[derive(Debug, Clone, Default)]
pub struct ExposureSnapshot {
    pub symbol_exposure: HashMap<String, Decimal>,
    pub total_exposure: Decimal,
}

/// Compute the exposure snapshot from current position notionals.
pub fn compute_exposure(positions: &HashMap<String, Decimal>) -> ExposureSnapshot {
    if positions.is_empty() {
        return ExposureSnapshot::default();
    }

    let total_abs: Decimal = positions.values().map(|v| v.abs()).sum();
    if total_abs == Decimal::ZERO {
        return ExposureSnapshot {
            symbol_exposure: positions
                .keys()
                .map(|s| (s.clone(), Decimal::ZERO))
                .collect(),
            total_exposure: Decimal::ZERO,
        };
    }

    ExposureSnapshot {
        symbol_exposure: positions
            .iter()
            .map(|(s, v)| (s.clone(), v.abs() / total_abs))
            .collect(),
        total_exposure: Decimal::ONE,
    }
}

/// Realized volatility: population standard deviation of the last `window`
/// log returns. Degenerate or insufficient data yields zero.
pub fn realized_volatility(prices: &[Decimal], window: usize) -> Decimal {
    if prices.len() < 2 {
        return Decimal::ZERO;
    }

    let take = window.min(prices.len() - 1);
    let tail = &prices[prices.len() - take - 1..];
    let mut rets = Vec::with_capacity(take);
    for pair in tail.windows(2) {
        let (p0, p1) = (pair[0], pair[1]);
        if p0 > Decimal::ZERO && p1 > Decimal::ZERO {
            if let (Some(a), Some(b)) = (p0.to_f64(), p1.to_f64()) {
                let r = (b / a).ln();
                if r.is_finite() {
                    rets.push(r);
                }
            }
        }
    }
    if rets.len() < 2 {
        return Decimal::ZERO;
    }

    let mean = rets.iter().sum::<f64>() / rets.len() as f64;
    let var = rets.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / rets.len() as f64;
    let sd = var.sqrt();
    if !sd.is_finite() {
        return Decimal::ZERO;
    }
    Decimal::from_f64(sd).unwrap_or(Decimal::ZERO)
}

/// Volatility-targeting scale: `clamp(target / portfolio_vol, 0, 5)`,
/// with non-positive portfolio volatility yielding the neutral 1.
pub fn scaling_factor(portfolio_vol: Decimal, target_vol: Decimal) -> Decimal {
    if portfolio_vol <= Decimal::ZERO {
        return Decimal::ONE;
    }
    match target_vol.checked_div(portfolio_vol) {
        Some(ratio) => ratio.clamp(Decimal::ZERO, Decimal::from(5)),
        None => Decimal::ONE,
    }
}

/// Inputs for one sizing pass
#[derive(Debug)]
pub struct SizingRequest<'a> {
    pub symbol: &'a str,
    pub signal: Signal,
    pub prices: &'a [Decimal],
    /// Open position notionals (USD) keyed by symbol, signed
    pub positions: &'a HashMap<String, Decimal>,
    pub equity: Decimal,
}

/// Bounded sizing output. `notional` is always >= 0 and respects both
/// exposure caps; `panic` true forces it to exactly zero.
#[derive(Debug, Clone)]
pub struct SizingDecision {
    pub notional: Decimal,
    pub panic: bool,
    pub telemetry: RiskTelemetry,
}

/// Volatility-aware position sizer with exposure caps and panic kill rules
pub struct RiskEngine {
    config: RiskConfig,
    /// Per-symbol trailing volatility samples (shock detection input)
    recent_vols: RwLock<HashMap<String, VecDeque<Decimal>>>,
    /// Last computed values, retained for observability only
    last_telemetry: RwLock<HashMap<String, RiskTelemetry>>,
}

impl RiskEngine {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            recent_vols: RwLock::new(HashMap::new()),
            last_telemetry: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RiskConfig::default())
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Run the fixed sizing pipeline for one proposed trade.
    ///
    /// Order is load-bearing: exposure snapshot, volatility estimate,
    /// portfolio-vol proxy, vol-target scaling, panic evaluation, capped
    /// sizing. The portfolio proxy weights by *current* exposure, not the
    /// position being sized, so a brand-new position contributes nothing
    /// until it shows up in `positions`.
    pub async fn apply(&self, req: &SizingRequest<'_>) -> SizingDecision {
        let exposure = compute_exposure(req.positions);
        let vol = realized_volatility(req.prices, self.config.vol_window);

        let shock = self.record_vol_and_check_shock(req.symbol, vol).await;

        // Exposure-weighted proxy; with no positions it falls back to the
        // symbol's own estimate.
        let weight_sum: Decimal = exposure.symbol_exposure.values().copied().sum();
        let portfolio_vol = if weight_sum > Decimal::ZERO {
            vol * weight_sum
        } else {
            vol
        };

        let scaling = scaling_factor(portfolio_vol, self.config.target_vol);

        let panic = vol >= self.config.vol_kill
            || portfolio_vol >= self.config.portfolio_vol_kill
            || shock;
        if panic {
            warn!(
                symbol = req.symbol,
                volatility = %vol,
                portfolio_vol = %portfolio_vol,
                shock,
                "risk panic: sizing forced to zero"
            );
        }

        let notional = self.size(req, vol, panic);

        let telemetry = RiskTelemetry {
            volatility: vol,
            portfolio_vol,
            scaling_factor: scaling,
            total_exposure: exposure.total_exposure,
            symbol_exposure: exposure.symbol_exposure,
            panic,
        };
        self.last_telemetry
            .write()
            .await
            .insert(req.symbol.to_string(), telemetry.clone());

        debug!(symbol = req.symbol, notional = %notional, panic, "sizing decision");
        SizingDecision {
            notional,
            panic,
            telemetry,
        }
    }

    /// Last telemetry snapshot for a symbol, if any pass has run.
    pub async fn telemetry(&self, symbol: &str) -> Option<RiskTelemetry> {
        self.last_telemetry.read().await.get(symbol).cloned()
    }

    async fn record_vol_and_check_shock(&self, symbol: &str, vol: Decimal) -> bool {
        let mut buffers = self.recent_vols.write().await;
        let buffer = buffers.entry(symbol.to_string()).or_default();
        buffer.push_back(vol);
        while buffer.len() > VOL_BUFFER_LEN {
            buffer.pop_front();
        }
        if buffer.len() < SHOCK_MIN_SAMPLES {
            return false;
        }
        let mean: Decimal =
            buffer.iter().copied().sum::<Decimal>() / Decimal::from(buffer.len());
        mean > Decimal::ZERO && vol > self.config.shock_mult * mean
    }

    /// Sizing step: baseline fraction dampened by volatility, overridden to
    /// zero on hold or panic, clamped by the global and per-symbol caps.
    fn size(&self, req: &SizingRequest<'_>, vol: Decimal, panic: bool) -> Decimal {
        if !req.signal.is_entry() || panic || req.equity <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let damp = Decimal::ONE
            .checked_div(Decimal::ONE + vol.max(Decimal::ZERO))
            .unwrap_or(Decimal::ONE);
        let mut notional = req.equity * self.config.base_fraction * damp;

        let global_max = req.equity * self.config.global_cap;
        notional = notional.min(global_max);

        let current_symbol_exposure = req
            .positions
            .get(req.symbol)
            .map(|v| v.abs())
            .unwrap_or(Decimal::ZERO);
        let headroom =
            (req.equity * self.config.symbol_cap - current_symbol_exposure).max(Decimal::ZERO);
        notional = notional.min(headroom);

        notional.max(Decimal::ZERO)
    }
}

impl Default for RiskEngine {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Combined risk gate: breaker veto layered over the sizing pipeline.
///
/// The breaker is updated first and takes priority: while it is active
/// every position-opening decision resolves to zero, whatever the sizing
/// pipeline says.
pub struct RiskGate {
    breaker: Arc<CircuitBreaker>,
    engine: Arc<RiskEngine>,
}

/// Gate output for one cycle
#[derive(Debug, Clone)]
pub struct GateDecision {
    pub notional: Decimal,
    pub panic: bool,
    pub breaker: BreakerStatus,
    pub telemetry: RiskTelemetry,
}

impl RiskGate {
    pub fn new(breaker: Arc<CircuitBreaker>, engine: Arc<RiskEngine>) -> Self {
        Self { breaker, engine }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn engine(&self) -> &Arc<RiskEngine> {
        &self.engine
    }

    pub async fn evaluate(&self, req: &SizingRequest<'_>, regime: Regime) -> GateDecision {
        let breaker = self.breaker.update(req.equity, regime).await;
        let decision = self.engine.apply(req).await;

        let notional = if breaker.active {
            Decimal::ZERO
        } else {
            decision.notional
        };

        GateDecision {
            notional,
            panic: decision.panic,
            breaker,
            telemetry: decision.telemetry,
        }
    }
}
