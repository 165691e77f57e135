//! Paper Engine
//!
//! Self-contained [`EngineHandle`] implementation over a synthetic
//! random-walk price series. Lets the orchestrator run end to end with no
//! exchange connectivity: a momentum rule produces signals, a volatility
//! band classifies the regime, and a nominal demo position tracks PnL.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{CycleOutcome, EngineHandle, Regime, Signal};

/// Tunables for the synthetic walk and the demo strategy
#[derive(Debug, Clone)]
pub struct PaperEngineConfig {
    /// Initial price of the synthetic series
    pub start_price: Decimal,
    /// Initial account equity (USD)
    pub start_equity: Decimal,
    /// Per-step standard deviation of log returns
    pub step_vol: f64,
    /// Lookback for the momentum average and realized vol
    pub momentum_window: usize,
    /// Fractional deviation from the average that triggers an entry
    pub entry_band: f64,
    /// Notional of the demo position (USD)
    pub trade_notional: Decimal,
    /// Maximum retained price history length
    pub history_cap: usize,
}

impl Default for PaperEngineConfig {
    fn default() -> Self {
        Self {
            start_price: Decimal::from(100),
            start_equity: Decimal::from(10_000),
            step_vol: 0.004,
            momentum_window: 20,
            entry_band: 0.002,
            trade_notional: Decimal::from(100),
            history_cap: 512,
        }
    }
}

struct PaperState {
    rng: StdRng,
    prices: Vec<Decimal>,
    /// Signed demo position notional (USD), positive = long
    position: Decimal,
    equity: Decimal,
    last_signal: Signal,
    last_regime: Regime,
}

/// Demo strategy engine over a synthetic price walk
pub struct PaperEngine {
    symbol: String,
    config: PaperEngineConfig,
    state: Mutex<PaperState>,
    risk_off: AtomicBool,
    global_risk_off: AtomicBool,
}

impl PaperEngine {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self::with_seed(symbol, rand::random())
    }

    /// Deterministic constructor for tests and reproducible runs
    pub fn with_seed(symbol: impl Into<String>, seed: u64) -> Self {
        Self::with_config(symbol, PaperEngineConfig::default(), seed)
    }

    pub fn with_config(symbol: impl Into<String>, config: PaperEngineConfig, seed: u64) -> Self {
        let state = PaperState {
            rng: StdRng::seed_from_u64(seed),
            prices: vec![config.start_price],
            position: Decimal::ZERO,
            equity: config.start_equity,
            last_signal: Signal::Hold,
            last_regime: Regime::Normal,
        };
        Self {
            symbol: symbol.into(),
            config,
            state: Mutex::new(state),
            risk_off: AtomicBool::new(false),
            global_risk_off: AtomicBool::new(false),
        }
    }

    fn entries_suppressed(&self) -> bool {
        self.risk_off.load(Ordering::SeqCst) || self.global_risk_off.load(Ordering::SeqCst)
    }

    /// Approximate standard normal via the sum of twelve uniforms.
    fn gauss(rng: &mut StdRng) -> f64 {
        (0..12).map(|_| rng.gen::<f64>()).sum::<f64>() - 6.0
    }

    fn classify(&self, vol: f64, deviation: f64) -> Regime {
        if vol >= self.config.step_vol * 4.0 {
            Regime::Panic
        } else if deviation.abs() >= self.config.entry_band * 2.0 {
            Regime::Trend
        } else if vol <= self.config.step_vol * 0.5 {
            Regime::Chop
        } else {
            Regime::Normal
        }
    }
}

impl EngineHandle for PaperEngine {
    fn run_once(&self) -> Result<CycleOutcome, String> {
        let mut state = self.state.lock().map_err(|e| e.to_string())?;

        // Advance the walk one step
        let step = self.config.step_vol * Self::gauss(&mut state.rng);
        let last = state
            .prices
            .last()
            .and_then(|p| p.to_f64())
            .unwrap_or(100.0);
        let next = last * step.exp();
        let next_price = Decimal::from_f64(next).ok_or("non-finite synthetic price")?;
        state.prices.push(next_price);
        if state.prices.len() > self.config.history_cap {
            let overflow = state.prices.len() - self.config.history_cap;
            state.prices.drain(..overflow);
        }

        // Momentum vs the rolling average, realized vol over the same window
        let window = self.config.momentum_window.min(state.prices.len());
        let tail: Vec<f64> = state.prices[state.prices.len() - window..]
            .iter()
            .filter_map(|p| p.to_f64())
            .collect();
        let mean = tail.iter().sum::<f64>() / tail.len().max(1) as f64;
        let deviation = if mean > 0.0 { (next - mean) / mean } else { 0.0 };

        let rets: Vec<f64> = tail.windows(2).map(|w| (w[1] / w[0]).ln()).collect();
        let vol = if rets.len() >= 2 {
            let m = rets.iter().sum::<f64>() / rets.len() as f64;
            (rets.iter().map(|r| (r - m).powi(2)).sum::<f64>() / rets.len() as f64).sqrt()
        } else {
            0.0
        };

        let regime = self.classify(vol, deviation);

        let signal = if self.entries_suppressed() {
            Signal::Hold
        } else if deviation > self.config.entry_band {
            Signal::Buy
        } else if deviation < -self.config.entry_band {
            Signal::Sell
        } else {
            Signal::Hold
        };

        // Demo position bookkeeping: the held notional earns the step return
        let pnl = state.position * Decimal::from_f64(step).unwrap_or(Decimal::ZERO);
        state.equity += pnl;
        match signal {
            Signal::Buy => state.position = self.config.trade_notional,
            Signal::Sell => state.position = -self.config.trade_notional,
            Signal::Hold => {}
        }

        state.last_signal = signal;
        state.last_regime = regime;
        Ok(CycleOutcome { signal, regime })
    }

    fn last_signal(&self) -> Signal {
        self.state
            .lock()
            .map(|s| s.last_signal)
            .unwrap_or(Signal::Hold)
    }

    fn last_regime(&self) -> Regime {
        self.state
            .lock()
            .map(|s| s.last_regime)
            .unwrap_or(Regime::Normal)
    }

    fn set_risk_off(&self, value: bool) {
        self.risk_off.store(value, Ordering::SeqCst);
    }

    fn set_global_risk_off(&self, value: bool) {
        self.global_risk_off.store(value, Ordering::SeqCst);
    }

    fn price_history(&self) -> Vec<Decimal> {
        self.state
            .lock()
            .map(|s| s.prices.clone())
            .unwrap_or_default()
    }

    fn positions(&self) -> HashMap<String, Decimal> {
        let mut out = HashMap::new();
        if let Ok(state) = self.state.lock() {
            if state.position != Decimal::ZERO {
                out.insert(self.symbol.clone(), state.position);
            }
        }
        out
    }

    fn equity(&self) -> Decimal {
        self.state
            .lock()
            .map(|s| s.equity)
            .unwrap_or(Decimal::ZERO)
    }
}
