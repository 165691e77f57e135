//! State Store
//!
//! Crash-recoverable JSON snapshot of last-known cycle results. Writes go
//! to a temp file first and are published with an atomic rename, so a
//! reader never observes a half-written snapshot. All mutation goes
//! through one async write lock (single-writer).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::engine::{Regime, Signal};
use crate::error::{ConductorError, Result};

/// Last-known record for one symbol
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SymbolRecord {
    pub last_run_ts: Option<DateTime<Utc>>,
    pub last_signal: Option<Signal>,
    pub last_regime: Option<Regime>,
    pub last_cycle_latency_ms: Option<u64>,
}

/// Manager-loop aggregate written once per tick
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorRecord {
    pub kill: bool,
    pub queue_length: usize,
    pub in_flight: usize,
    pub loop_latency_ms: u64,
    pub symbols_active: Vec<String>,
    pub portfolio_equity: Decimal,
    /// Highest portfolio equity seen this run
    pub portfolio_peak_equity: Decimal,
    /// Drawdown fraction against the peak
    pub portfolio_drawdown: Decimal,
    pub last_tick_ts: Option<DateTime<Utc>>,
}

/// Full persisted snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreData {
    pub last_run_ts: Option<DateTime<Utc>>,
    pub last_signal: Option<Signal>,
    pub last_regime: Option<Regime>,
    pub last_exception: Option<String>,
    #[serde(default)]
    pub per_symbol: HashMap<String, SymbolRecord>,
    #[serde(default)]
    pub orchestrator: OrchestratorRecord,
}

/// Persistent snapshot store with atomic replace semantics
pub struct StateStore {
    path: PathBuf,
    data: RwLock<StoreData>,
}

impl StateStore {
    /// Open the store, recovering any snapshot left by a previous run.
    ///
    /// A missing or unreadable file yields an empty snapshot; corruption is
    /// logged, never fatal.
    pub async fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let data = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<StoreData>(&bytes) {
                Ok(data) => {
                    debug!(path = %path.display(), "state store recovered");
                    data
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "state store corrupt, starting empty");
                    StoreData::default()
                }
            },
            Err(_) => StoreData::default(),
        };
        Self {
            path,
            data: RwLock::new(data),
        }
    }

    /// Record one completed cycle for a symbol.
    pub async fn mark_run(
        &self,
        symbol: &str,
        signal: Signal,
        regime: Regime,
        latency_ms: u64,
    ) -> Result<()> {
        let mut data = self.data.write().await;
        let now = Utc::now();
        data.last_run_ts = Some(now);
        data.last_signal = Some(signal);
        data.last_regime = Some(regime);
        let record = data.per_symbol.entry(symbol.to_string()).or_default();
        record.last_run_ts = Some(now);
        record.last_signal = Some(signal);
        record.last_regime = Some(regime);
        record.last_cycle_latency_ms = Some(latency_ms);
        self.persist(&data).await
    }

    /// Record a terminal failure (dropped task, cycle exception).
    pub async fn record_exception(&self, err: &str) -> Result<()> {
        let mut data = self.data.write().await;
        data.last_exception = Some(err.to_string());
        self.persist(&data).await
    }

    /// Replace the manager-loop aggregate section.
    pub async fn update_orchestrator(&self, record: OrchestratorRecord) -> Result<()> {
        let mut data = self.data.write().await;
        data.orchestrator = record;
        self.persist(&data).await
    }

    /// Clone the current snapshot for telemetry consumers.
    pub async fn snapshot(&self) -> StoreData {
        self.data.read().await.clone()
    }

    /// Write-then-publish: serialize to a sibling temp file, then rename
    /// over the live snapshot. Called with the write lock held.
    async fn persist(&self, data: &StoreData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let bytes = serde_json::to_vec_pretty(data)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| ConductorError::StateStore(format!("publish failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_mark_run_and_recover() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = StateStore::open(&path).await;
        store
            .mark_run("BTC/USDT", Signal::Buy, Regime::Trend, 12)
            .await
            .unwrap();
        drop(store);

        let recovered = StateStore::open(&path).await;
        let snap = recovered.snapshot().await;
        assert_eq!(snap.last_signal, Some(Signal::Buy));
        assert_eq!(snap.last_regime, Some(Regime::Trend));
        let record = &snap.per_symbol["BTC/USDT"];
        assert_eq!(record.last_cycle_latency_ms, Some(12));
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();

        let store = StateStore::open(&path).await;
        let snap = store.snapshot().await;
        assert!(snap.per_symbol.is_empty());
        assert!(snap.last_signal.is_none());
    }

    #[tokio::test]
    async fn test_record_exception_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = StateStore::open(&path).await;
        store.record_exception("task train-x dropped").await.unwrap();

        let recovered = StateStore::open(&path).await;
        assert_eq!(
            recovered.snapshot().await.last_exception.as_deref(),
            Some("task train-x dropped")
        );
    }

    #[tokio::test]
    async fn test_orchestrator_section_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = StateStore::open(&path).await;
        store
            .update_orchestrator(OrchestratorRecord {
                queue_length: 2,
                in_flight: 1,
                loop_latency_ms: 4,
                symbols_active: vec!["BTC/USDT".to_string()],
                portfolio_equity: dec!(10000),
                last_tick_ts: Some(Utc::now()),
                ..Default::default()
            })
            .await
            .unwrap();

        let snap = StateStore::open(&path).await.snapshot().await;
        assert_eq!(snap.orchestrator.queue_length, 2);
        assert_eq!(snap.orchestrator.portfolio_equity, dec!(10000));
    }

    #[tokio::test]
    async fn test_no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = StateStore::open(&path).await;
        store
            .mark_run("ETH/USDT", Signal::Hold, Regime::Chop, 3)
            .await
            .unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }
}
