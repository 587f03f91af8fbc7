//! Shared runtime state for one managed program.
//!
//! Every field has a single writer (the worker that owns the matching
//! operation); status pollers only read. Reads never wait on I/O.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;

use crate::engine::fetch::ProgressSink;
use crate::engine::lifecycle::ProcessHandle;
use crate::registry::ProgramKind;

/// Process lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    NotRunning,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotRunning => write!(f, "NOT_RUNNING"),
            Self::Starting => write!(f, "STARTING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Stopping => write!(f, "STOPPING"),
        }
    }
}

/// Point-in-time view of a program, for presentation layers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgramStatus {
    pub kind: ProgramKind,
    pub installed: bool,
    pub installed_version: Option<String>,
    pub state: ProcessState,
    pub running: bool,
    pub pids: Vec<u32>,
    pub downloading: bool,
    pub download_percent: Option<f64>,
    pub rpc_valid: bool,
    pub config_in_sync: bool,
    pub busy: bool,
    pub data_dir: PathBuf,
}

/// A supervised program and its mutable status.
pub struct ManagedProgram {
    kind: ProgramKind,
    data_dir: RwLock<PathBuf>,
    executable: RwLock<Option<PathBuf>>,
    installed_version: RwLock<Option<String>>,
    process: Mutex<Option<Box<dyn ProcessHandle>>>,
    discovered_pids: RwLock<Vec<u32>>,
    state: RwLock<ProcessState>,
    downloading: AtomicBool,
    download_percent: RwLock<Option<f64>>,
    rpc_valid: AtomicBool,
    config_in_sync: AtomicBool,
    busy: AtomicBool,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl ManagedProgram {
    pub fn new(kind: ProgramKind, data_dir: PathBuf) -> Self {
        Self {
            kind,
            data_dir: RwLock::new(data_dir),
            executable: RwLock::new(None),
            installed_version: RwLock::new(None),
            process: Mutex::new(None),
            discovered_pids: RwLock::new(Vec::new()),
            state: RwLock::new(ProcessState::NotRunning),
            downloading: AtomicBool::new(false),
            download_percent: RwLock::new(None),
            rpc_valid: AtomicBool::new(false),
            config_in_sync: AtomicBool::new(false),
            busy: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> ProgramKind {
        self.kind
    }

    pub fn data_dir(&self) -> PathBuf {
        read(&self.data_dir).clone()
    }

    pub fn set_data_dir(&self, path: &Path) {
        *write(&self.data_dir) = path.to_path_buf();
    }

    pub fn executable(&self) -> Option<PathBuf> {
        read(&self.executable).clone()
    }

    pub fn installed_version(&self) -> Option<String> {
        read(&self.installed_version).clone()
    }

    /// Record the detected install, or clear it with `None`.
    pub fn set_installed(&self, executable: Option<PathBuf>, version: Option<String>) {
        *write(&self.executable) = executable;
        *write(&self.installed_version) = version;
    }

    pub fn is_installed(&self) -> bool {
        read(&self.executable).is_some()
    }

    pub fn state(&self) -> ProcessState {
        *read(&self.state)
    }

    pub fn set_state(&self, state: ProcessState) {
        let mut current = write(&self.state);
        if *current != state {
            log::debug!("{} state {} -> {}", self.kind, *current, state);
            *current = state;
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    pub fn discovered_pids(&self) -> Vec<u32> {
        read(&self.discovered_pids).clone()
    }

    pub fn set_discovered_pids(&self, pids: Vec<u32>) {
        *write(&self.discovered_pids) = pids;
    }

    /// Adopt a process handle, replacing any previous one.
    pub fn attach_process(&self, handle: Box<dyn ProcessHandle>) {
        *self.process_slot() = Some(handle);
    }

    pub fn take_process(&self) -> Option<Box<dyn ProcessHandle>> {
        self.process_slot().take()
    }

    pub fn has_process(&self) -> bool {
        self.process_slot().is_some()
    }

    /// PID of the owned handle, if any.
    pub fn owned_pid(&self) -> Option<u32> {
        self.process_slot().as_ref().map(|h| h.pid())
    }

    pub(crate) fn process_slot(&self) -> MutexGuard<'_, Option<Box<dyn ProcessHandle>>> {
        self.process.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_downloading(&self) -> bool {
        self.downloading.load(Ordering::SeqCst)
    }

    pub fn set_downloading(&self, downloading: bool) {
        self.downloading.store(downloading, Ordering::SeqCst);
    }

    pub fn download_percent(&self) -> Option<f64> {
        *read(&self.download_percent)
    }

    pub fn rpc_valid(&self) -> bool {
        self.rpc_valid.load(Ordering::SeqCst)
    }

    pub fn set_rpc_valid(&self, valid: bool) {
        self.rpc_valid.store(valid, Ordering::SeqCst);
    }

    pub fn config_in_sync(&self) -> bool {
        self.config_in_sync.load(Ordering::SeqCst)
    }

    pub fn set_config_in_sync(&self, in_sync: bool) {
        self.config_in_sync.store(in_sync, Ordering::SeqCst);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Claim the program for one start/stop/install/delete operation.
    ///
    /// Returns `None` while another operation holds it.
    pub fn try_begin(&self) -> Option<BusyGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| BusyGuard { program: self })
    }

    pub fn status(&self) -> ProgramStatus {
        let state = self.state();
        ProgramStatus {
            kind: self.kind,
            installed: self.is_installed(),
            installed_version: self.installed_version(),
            state,
            running: state == ProcessState::Running,
            pids: self
                .owned_pid()
                .map(|pid| vec![pid])
                .unwrap_or_else(|| self.discovered_pids()),
            downloading: self.is_downloading(),
            download_percent: self.download_percent(),
            rpc_valid: self.rpc_valid(),
            config_in_sync: self.config_in_sync(),
            busy: self.is_busy(),
            data_dir: self.data_dir(),
        }
    }
}

impl ProgressSink for ManagedProgram {
    fn report(&self, percent: f64) {
        *write(&self.download_percent) = Some(percent);
    }

    fn clear(&self) {
        *write(&self.download_percent) = None;
    }
}

/// Releases the busy flag on drop.
pub struct BusyGuard<'a> {
    program: &'a ManagedProgram,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.program.busy.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_guard_is_exclusive() {
        let program = ManagedProgram::new(ProgramKind::Node, PathBuf::from("/tmp/node"));
        let guard = program.try_begin();
        assert!(guard.is_some());
        assert!(program.try_begin().is_none());
        assert!(program.status().busy);
        drop(guard);
        assert!(program.try_begin().is_some());
    }

    #[test]
    fn test_progress_sink_updates_percent() {
        let program = ManagedProgram::new(ProgramKind::Wallet, PathBuf::from("/tmp/xlite"));
        program.report(42.5);
        assert_eq!(program.status().download_percent, Some(42.5));
        program.clear();
        assert_eq!(program.download_percent(), None);
    }

    #[test]
    fn test_status_reports_discovered_pids_when_unowned() {
        let program = ManagedProgram::new(ProgramKind::Node, PathBuf::from("/tmp/node"));
        program.set_discovered_pids(vec![10, 11]);
        program.set_state(ProcessState::Running);
        let status = program.status();
        assert!(status.running);
        assert_eq!(status.pids, vec![10, 11]);
        assert!(!status.installed);
    }
}
