//! Kill Switch
//!
//! Process-wide emergency stop, injected into the coordinator at
//! construction and polled once per manager tick. When engaged it is the
//! highest-priority stop condition, overriding pause and risk-off state.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Source of the emergency-stop flag
pub trait KillSwitchSource: Send + Sync {
    /// Whether the kill switch is currently engaged. Must be cheap; the
    /// coordinator polls this every manager tick.
    fn is_engaged(&self) -> bool;
}

/// File-backed kill switch: engaged while the flag file exists.
///
/// Externally togglable by any process (`touch` to engage, delete to
/// clear), which keeps the operator workflow a one-liner.
pub struct FileKillSwitch {
    path: PathBuf,
}

impl FileKillSwitch {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl KillSwitchSource for FileKillSwitch {
    fn is_engaged(&self) -> bool {
        self.path.exists()
    }
}

/// In-memory kill switch for tests and embedded control surfaces
#[derive(Default)]
pub struct StaticKillSwitch {
    engaged: AtomicBool,
}

impl StaticKillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engage(&self) {
        self.engaged.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.engaged.store(false, Ordering::SeqCst);
    }
}

impl KillSwitchSource for StaticKillSwitch {
    fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_kill_switch_toggles() {
        let ks = StaticKillSwitch::new();
        assert!(!ks.is_engaged());
        ks.engage();
        assert!(ks.is_engaged());
        ks.clear();
        assert!(!ks.is_engaged());
    }

    #[test]
    fn test_file_kill_switch_follows_flag_file() {
        let dir = tempfile::tempdir().unwrap();
        let flag = dir.path().join("KILL");
        let ks = FileKillSwitch::new(&flag);

        assert!(!ks.is_engaged());
        std::fs::write(&flag, b"stop").unwrap();
        assert!(ks.is_engaged());
        std::fs::remove_file(&flag).unwrap();
        assert!(!ks.is_engaged());
    }
}
