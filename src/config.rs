use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Symbols to orchestrate (one scheduler per entry)
    pub symbols: Vec<String>,
    #[serde(default)]
    pub cadence: CadenceConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub kill_switch: KillSwitchConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Sleep interval between decision cycles, keyed by detected regime
#[derive(Debug, Clone, Deserialize)]
pub struct CadenceConfig {
    /// Seconds between cycles in a trending market
    #[serde(default = "default_trend_secs")]
    pub trend_secs: f64,
    /// Seconds between cycles in a normal market
    #[serde(default = "default_normal_secs")]
    pub normal_secs: f64,
    /// Seconds between cycles in a choppy market
    #[serde(default = "default_chop_secs")]
    pub chop_secs: f64,
    /// Seconds between cycles in a panic market
    #[serde(default = "default_panic_secs")]
    pub panic_secs: f64,
    /// Poll interval while a scheduler is paused (milliseconds)
    #[serde(default = "default_pause_poll_ms")]
    pub pause_poll_ms: u64,
}

fn default_trend_secs() -> f64 {
    1.0
}

fn default_normal_secs() -> f64 {
    3.0
}

fn default_chop_secs() -> f64 {
    7.0
}

fn default_panic_secs() -> f64 {
    15.0
}

fn default_pause_poll_ms() -> u64 {
    300
}

impl Default for CadenceConfig {
    fn default() -> Self {
        Self {
            trend_secs: default_trend_secs(),
            normal_secs: default_normal_secs(),
            chop_secs: default_chop_secs(),
            panic_secs: default_panic_secs(),
            pause_poll_ms: default_pause_poll_ms(),
        }
    }
}

/// Task queue and manager loop configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Seconds a dequeued task stays protected from re-delivery
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// Maximum delivery attempts before a task is dropped permanently
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Manager loop tick interval (milliseconds)
    #[serde(default = "default_manager_tick_ms")]
    pub manager_tick_ms: u64,
}

fn default_visibility_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_manager_tick_ms() -> u64 {
    1_000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_attempts: default_max_attempts(),
            manager_tick_ms: default_manager_tick_ms(),
        }
    }
}

/// Risk engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Maximum portfolio exposure as a fraction of equity
    #[serde(default = "default_global_cap")]
    pub global_cap: Decimal,
    /// Maximum per-symbol exposure as a fraction of equity
    #[serde(default = "default_symbol_cap")]
    pub symbol_cap: Decimal,
    /// Baseline fraction of equity committed per trade
    #[serde(default = "default_base_fraction")]
    pub base_fraction: Decimal,
    /// Target portfolio volatility for scaling
    #[serde(default = "default_target_vol")]
    pub target_vol: Decimal,
    /// Log-return window for realized volatility
    #[serde(default = "default_vol_window")]
    pub vol_window: usize,
    /// Symbol volatility at or above this forces size to zero
    #[serde(default = "default_vol_kill")]
    pub vol_kill: Decimal,
    /// Portfolio volatility at or above this forces size to zero
    #[serde(default = "default_portfolio_vol_kill")]
    pub portfolio_vol_kill: Decimal,
    /// Shock rule: current vol > shock_mult x trailing mean vol
    #[serde(default = "default_shock_mult")]
    pub shock_mult: Decimal,
}

fn default_global_cap() -> Decimal {
    Decimal::new(50, 2) // 0.50
}

fn default_symbol_cap() -> Decimal {
    Decimal::new(25, 2) // 0.25
}

fn default_base_fraction() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_target_vol() -> Decimal {
    Decimal::new(20, 2) // 0.20
}

fn default_vol_window() -> usize {
    20
}

fn default_vol_kill() -> Decimal {
    Decimal::new(15, 2) // 0.15
}

fn default_portfolio_vol_kill() -> Decimal {
    Decimal::new(20, 2) // 0.20
}

fn default_shock_mult() -> Decimal {
    Decimal::from(4)
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            global_cap: default_global_cap(),
            symbol_cap: default_symbol_cap(),
            base_fraction: default_base_fraction(),
            target_vol: default_target_vol(),
            vol_window: default_vol_window(),
            vol_kill: default_vol_kill(),
            portfolio_vol_kill: default_portfolio_vol_kill(),
            shock_mult: default_shock_mult(),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BreakerConfig {
    /// Intraday drawdown fraction that trips the breaker
    #[serde(default = "default_max_intraday_dd_pct")]
    pub max_intraday_dd_pct: Decimal,
    /// Daily loss fraction (vs start-of-day equity) that trips the breaker
    #[serde(default = "default_max_daily_loss_pct")]
    pub max_daily_loss_pct: Decimal,
    /// Cooldown before the breaker deactivates (seconds)
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_max_intraday_dd_pct() -> Decimal {
    Decimal::new(3, 2) // 0.03
}

fn default_max_daily_loss_pct() -> Decimal {
    Decimal::new(3, 2) // 0.03
}

fn default_cooldown_secs() -> u64 {
    900
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_intraday_dd_pct: default_max_intraday_dd_pct(),
            max_daily_loss_pct: default_max_daily_loss_pct(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

/// Persisted snapshot configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    /// Path of the JSON snapshot file
    #[serde(default = "default_state_path")]
    pub path: String,
}

fn default_state_path() -> String {
    "runtime/orchestrator_state.json".to_string()
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: default_state_path(),
        }
    }
}

/// Kill switch configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KillSwitchConfig {
    /// Path of the file-backed kill flag (present = engaged)
    #[serde(default = "default_kill_switch_path")]
    pub path: String,
}

fn default_kill_switch_path() -> String {
    "runtime/KILL".to_string()
}

impl Default for KillSwitchConfig {
    fn default() -> Self {
        Self {
            path: default_kill_switch_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("symbols", vec!["BTC/USDT".to_string()])?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("CONDUCTOR_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (CONDUCTOR_RISK__GLOBAL_CAP, etc.)
            .add_source(
                Environment::with_prefix("CONDUCTOR")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Create a default configuration for CLI usage
    pub fn default_config(symbols: &[String]) -> Self {
        Self {
            symbols: if symbols.is_empty() {
                vec!["BTC/USDT".to_string()]
            } else {
                symbols.to_vec()
            },
            cadence: CadenceConfig::default(),
            queue: QueueConfig::default(),
            risk: RiskConfig::default(),
            breaker: BreakerConfig::default(),
            state: StateConfig::default(),
            kill_switch: KillSwitchConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.symbols.is_empty() {
            errors.push("at least one symbol is required".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for sym in &self.symbols {
            if !seen.insert(sym) {
                errors.push(format!("duplicate symbol: {sym}"));
            }
        }

        // Validate cadence params
        for (name, secs) in [
            ("trend_secs", self.cadence.trend_secs),
            ("normal_secs", self.cadence.normal_secs),
            ("chop_secs", self.cadence.chop_secs),
            ("panic_secs", self.cadence.panic_secs),
        ] {
            if secs <= 0.0 || !secs.is_finite() {
                errors.push(format!("cadence.{name} must be positive"));
            }
        }

        // Validate queue params
        if self.queue.max_attempts == 0 {
            errors.push("queue.max_attempts must be at least 1".to_string());
        }
        if self.queue.visibility_timeout_secs == 0 {
            errors.push("queue.visibility_timeout_secs must be positive".to_string());
        }
        if self.queue.manager_tick_ms == 0 {
            errors.push("queue.manager_tick_ms must be positive".to_string());
        }

        // Validate risk params
        for (name, frac) in [
            ("global_cap", self.risk.global_cap),
            ("symbol_cap", self.risk.symbol_cap),
            ("base_fraction", self.risk.base_fraction),
        ] {
            if frac <= Decimal::ZERO || frac > Decimal::ONE {
                errors.push(format!("risk.{name} must be in (0, 1]"));
            }
        }
        if self.risk.vol_window < 2 {
            errors.push("risk.vol_window must be at least 2".to_string());
        }
        if self.risk.target_vol <= Decimal::ZERO {
            errors.push("risk.target_vol must be positive".to_string());
        }
        if self.risk.shock_mult <= Decimal::ONE {
            errors.push("risk.shock_mult must be greater than 1".to_string());
        }

        // Validate breaker params
        for (name, pct) in [
            ("max_intraday_dd_pct", self.breaker.max_intraday_dd_pct),
            ("max_daily_loss_pct", self.breaker.max_daily_loss_pct),
        ] {
            if pct <= Decimal::ZERO || pct >= Decimal::ONE {
                errors.push(format!("breaker.{name} must be between 0 and 1"));
            }
        }

        if self.state.path.trim().is_empty() {
            errors.push("state.path must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
