//! External Engine Boundary
//!
//! The orchestrator never talks to a concrete strategy implementation.
//! It only sees [`EngineHandle`], a narrow capability interface with a
//! blocking `run_once` call and a handful of readback accessors. A missing
//! collaborator is represented by [`NullEngine`], which always holds, so
//! degraded subsystems resolve to safe decisions rather than errors.

mod paper;

pub use paper::{PaperEngine, PaperEngineConfig};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Trading signal emitted by a decision cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

impl Signal {
    /// Whether this signal proposes opening a position
    pub fn is_entry(&self) -> bool {
        matches!(self, Signal::Buy | Signal::Sell)
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signal::Buy => write!(f, "buy"),
            Signal::Sell => write!(f, "sell"),
            Signal::Hold => write!(f, "hold"),
        }
    }
}

/// Coarse market-state classification consumed for cadence and risk gating
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Regime {
    Trend,
    Normal,
    Chop,
    Panic,
}

impl Regime {
    /// Parse a regime label, mapping anything unrecognized to `Normal`
    pub fn parse_lossy(label: &str) -> Self {
        match label.to_ascii_lowercase().as_str() {
            "trend" => Regime::Trend,
            "chop" => Regime::Chop,
            "panic" => Regime::Panic,
            _ => Regime::Normal,
        }
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Regime::Trend => write!(f, "trend"),
            Regime::Normal => write!(f, "normal"),
            Regime::Chop => write!(f, "chop"),
            Regime::Panic => write!(f, "panic"),
        }
    }
}

/// Result of one decision cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleOutcome {
    pub signal: Signal,
    pub regime: Regime,
}

/// Capability interface required from the external strategy engine.
///
/// `run_once` is blocking by contract; the scheduler dispatches it through
/// the runtime's blocking pool so the cooperative loop never stalls on it.
/// All other methods must be cheap and non-blocking.
#[cfg_attr(test, mockall::automock)]
pub trait EngineHandle: Send + Sync {
    /// Execute one decision cycle and return its signal and regime.
    fn run_once(&self) -> Result<CycleOutcome, String>;

    /// Signal recorded by the most recent completed cycle.
    fn last_signal(&self) -> Signal;

    /// Regime recorded by the most recent completed cycle.
    fn last_regime(&self) -> Regime;

    /// Suppress new entries for this engine's symbol.
    fn set_risk_off(&self, value: bool);

    /// Suppress new entries portfolio-wide.
    fn set_global_risk_off(&self, value: bool);

    /// Recent close prices, oldest first.
    fn price_history(&self) -> Vec<Decimal>;

    /// Current open position notionals (USD) keyed by symbol.
    fn positions(&self) -> HashMap<String, Decimal>;

    /// Current account equity (USD).
    fn equity(&self) -> Decimal;
}

/// Null-object engine: always holds, owns nothing, never fails.
///
/// Stands in when no collaborator is wired so every sizing decision
/// degrades to zero instead of erroring.
#[derive(Debug, Default)]
pub struct NullEngine;

impl EngineHandle for NullEngine {
    fn run_once(&self) -> Result<CycleOutcome, String> {
        Ok(CycleOutcome {
            signal: Signal::Hold,
            regime: Regime::Normal,
        })
    }

    fn last_signal(&self) -> Signal {
        Signal::Hold
    }

    fn last_regime(&self) -> Regime {
        Regime::Normal
    }

    fn set_risk_off(&self, _value: bool) {}

    fn set_global_risk_off(&self, _value: bool) {}

    fn price_history(&self) -> Vec<Decimal> {
        Vec::new()
    }

    fn positions(&self) -> HashMap<String, Decimal> {
        HashMap::new()
    }

    fn equity(&self) -> Decimal {
        Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regime_parse_lossy() {
        assert_eq!(Regime::parse_lossy("trend"), Regime::Trend);
        assert_eq!(Regime::parse_lossy("PANIC"), Regime::Panic);
        assert_eq!(Regime::parse_lossy("sideways"), Regime::Normal);
        assert_eq!(Regime::parse_lossy(""), Regime::Normal);
    }

    #[test]
    fn test_signal_entry() {
        assert!(Signal::Buy.is_entry());
        assert!(Signal::Sell.is_entry());
        assert!(!Signal::Hold.is_entry());
    }

    #[test]
    fn test_null_engine_is_safe() {
        let engine = NullEngine;
        let outcome = engine.run_once().unwrap();
        assert_eq!(outcome.signal, Signal::Hold);
        assert_eq!(outcome.regime, Regime::Normal);
        assert!(engine.positions().is_empty());
        assert_eq!(engine.equity(), Decimal::ZERO);
    }
}
