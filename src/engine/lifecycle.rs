//! Process lifecycle management for one managed program.
//!
//! Provides the `ProcessSupervisor` which handles:
//! - Provisioning the binary on first start
//! - Detached process spawning with a data-directory argument
//! - Graceful-then-forced shutdown, of an owned child or of PIDs found by a scan
//! - PID file recovery after the engine itself restarts

use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::defaults;
use crate::engine::fetch::BinaryProvisioner;
use crate::engine::multiprocess::{
    pid_is_alive, pid_matches, read_pid_file, send_kill, send_terminate, wait_for_exit,
    write_pid_file,
};
use crate::program::{ManagedProgram, ProcessState};
use crate::registry::{ArchiveKind, ProgramSpec, Registry};

/// Errors that can occur during process lifecycle management.
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("{0} is already running")]
    AlreadyRunning(String),

    #[error("Startup failed: {0}")]
    StartupFailed(String),

    #[error("Shutdown failed: {0}")]
    ShutdownFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Fetch error: {0}")]
    Fetch(#[from] crate::engine::fetch::FetchError),
}

pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Control over one OS process.
pub trait ProcessHandle: Send {
    fn pid(&self) -> u32;

    /// Ask the process to exit. `ErrorKind::NotFound` means it is already gone.
    fn terminate(&mut self) -> io::Result<()>;

    /// Kill the process. `ErrorKind::NotFound` means it is already gone.
    fn kill(&mut self) -> io::Result<()>;

    fn has_exited(&mut self) -> bool;
}

/// A child spawned by this engine.
pub struct OwnedChild {
    child: Child,
}

impl OwnedChild {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

impl ProcessHandle for OwnedChild {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    fn terminate(&mut self) -> io::Result<()> {
        if self.has_exited() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "child already exited"));
        }
        send_terminate(self.child.id())
    }

    fn kill(&mut self) -> io::Result<()> {
        if self.has_exited() {
            return Err(io::Error::new(io::ErrorKind::NotFound, "child already exited"));
        }
        self.child.kill()
    }

    fn has_exited(&mut self) -> bool {
        !matches!(self.child.try_wait(), Ok(None))
    }
}

/// A process found by PID, not spawned by this engine instance.
pub struct ExternalProcess {
    pid: u32,
}

impl ExternalProcess {
    pub fn new(pid: u32) -> Self {
        Self { pid }
    }
}

impl ProcessHandle for ExternalProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn terminate(&mut self) -> io::Result<()> {
        send_terminate(self.pid)
    }

    fn kill(&mut self) -> io::Result<()> {
        send_kill(self.pid)
    }

    fn has_exited(&mut self) -> bool {
        wait_for_exit(self.pid, Duration::ZERO)
    }
}

/// How a stop request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing to stop, or the process vanished before it was signalled.
    AlreadyExited,
    /// Exited within the graceful timeout.
    Graceful,
    /// Needed the forceful kill.
    Forced,
}

fn wait_until_exited(handle: &mut dyn ProcessHandle, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if handle.has_exited() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    handle.has_exited()
}

/// Terminate, wait up to `timeout`, then kill exactly once.
///
/// A process that disappears at any point counts as stopped.
pub fn stop_with_escalation(
    handle: &mut dyn ProcessHandle,
    timeout: Duration,
    kill_wait: Duration,
) -> Result<StopOutcome> {
    let pid = handle.pid();

    match handle.terminate() {
        Ok(()) => {
            if wait_until_exited(handle, timeout) {
                return Ok(StopOutcome::Graceful);
            }
            log::warn!("Process {} did not exit within {:?}, killing", pid, timeout);
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            log::debug!("Process {} already exited", pid);
            return Ok(StopOutcome::AlreadyExited);
        }
        Err(e) => {
            log::warn!("Failed to terminate process {}: {}, killing", pid, e);
        }
    }

    match handle.kill() {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(StopOutcome::Graceful),
        Err(e) => {
            return Err(LifecycleError::ShutdownFailed(format!(
                "failed to kill process {}: {}",
                pid, e
            )))
        }
    }

    if wait_until_exited(handle, kill_wait) {
        Ok(StopOutcome::Forced)
    } else {
        Err(LifecycleError::ShutdownFailed(format!(
            "process {} survived SIGKILL",
            pid
        )))
    }
}

/// Starts and stops one managed program.
pub struct ProcessSupervisor {
    spec: ProgramSpec,
    program: Arc<ManagedProgram>,
    provisioner: Arc<BinaryProvisioner>,
    pid_file: PathBuf,
    log_file: PathBuf,
    disk_image: Option<String>,
    stop_timeout: Duration,
    kill_wait: Duration,
    startup_timeout: Duration,
}

impl ProcessSupervisor {
    pub fn new(
        registry: &Registry,
        spec: ProgramSpec,
        program: Arc<ManagedProgram>,
        provisioner: Arc<BinaryProvisioner>,
    ) -> Self {
        let name = spec.kind.to_string();
        let disk_image = spec
            .release_for(registry.platform)
            .filter(|a| a.archive_kind() == Some(ArchiveKind::DiskImage))
            .map(|a| a.file_name().to_string());

        Self {
            pid_file: registry.home.join("run").join(format!("{}.pid", name)),
            log_file: registry.log_dir().join(format!("{}.log", name)),
            stop_timeout: spec.stop_timeout,
            kill_wait: defaults::kill_wait(),
            startup_timeout: defaults::startup_timeout(),
            disk_image,
            spec,
            program,
            provisioner,
        }
    }

    /// Override the graceful and post-kill wait times.
    pub fn with_timeouts(mut self, stop_timeout: Duration, kill_wait: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self.kill_wait = kill_wait;
        self
    }

    pub fn program(&self) -> &Arc<ManagedProgram> {
        &self.program
    }

    pub fn spec(&self) -> &ProgramSpec {
        &self.spec
    }

    /// Refresh the installed flags from the install root.
    pub fn refresh_installed(&self) -> bool {
        let executable = self.provisioner.executable_path(&self.spec);
        let installed = executable.is_some();
        self.program.set_installed(
            executable,
            installed.then(|| self.spec.version.clone()),
        );
        installed
    }

    /// Adopt a process recorded in the PID file by an earlier engine instance.
    pub fn recover(&self) -> Option<u32> {
        if self.program.has_process() {
            return None;
        }
        let pid = self.pid_from_file()?;
        log::info!("Recovered running {} with PID {}", self.spec.kind, pid);
        self.program.set_discovered_pids(vec![pid]);
        self.program.set_state(ProcessState::Running);
        Some(pid)
    }

    /// The PID file's PID when it still names a live process of this program.
    ///
    /// A stale or reused PID removes the file.
    fn pid_from_file(&self) -> Option<u32> {
        let pid = read_pid_file(&self.pid_file)?;
        let executable = self.provisioner.executable_path(&self.spec);
        if pid_is_alive(pid) && pid_matches(pid, &self.spec.process_names, executable.as_deref()) {
            return Some(pid);
        }

        log::warn!("Ignoring stale {} PID file (PID {})", self.spec.kind, pid);
        let _ = std::fs::remove_file(&self.pid_file);
        None
    }

    /// Launch the program, installing it first if needed.
    ///
    /// Returns the PID of the new process.
    pub async fn start(&self) -> Result<u32> {
        if self.program.is_running() {
            return Err(LifecycleError::AlreadyRunning(self.spec.kind.to_string()));
        }

        self.program.set_state(ProcessState::Starting);
        match self.launch().await {
            Ok(pid) => {
                self.program.set_state(ProcessState::Running);
                log::info!("{} running with PID {}", self.spec.kind, pid);
                Ok(pid)
            }
            Err(e) => {
                self.program.set_state(ProcessState::NotRunning);
                log::error!("Failed to start {}: {}", self.spec.kind, e);
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<u32> {
        let executable = self.ensure_installed().await?;

        if let Some(image) = &self.disk_image {
            if !executable.exists() {
                let root = self.provisioner.install_root().to_path_buf();
                let image_path = root.join(image);
                tokio::task::spawn_blocking(move || copy_from_disk_image(&image_path, &root))
                    .await
                    .map_err(|e| LifecycleError::StartupFailed(e.to_string()))??;
            }
        }

        if !executable.exists() {
            return Err(LifecycleError::StartupFailed(format!(
                "executable {:?} not found",
                executable
            )));
        }

        let data_dir = self.program.data_dir();
        std::fs::create_dir_all(&data_dir)?;
        if let Some(parent) = self.log_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)?;

        log::info!("Launching {} from {:?}", self.spec.kind, executable);

        let mut command = Command::new(&executable);
        command
            .args(self.spec.launch_args(&data_dir))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file.try_clone()?))
            .stderr(Stdio::from(log_file));
        detach(&mut command);

        let mut child = command
            .spawn()
            .map_err(|e| LifecycleError::StartupFailed(format!("failed to spawn: {}", e)))?;
        let pid = child.id();

        let deadline = Instant::now() + self.startup_timeout;
        loop {
            if let Ok(Some(status)) = child.try_wait() {
                return Err(LifecycleError::StartupFailed(format!(
                    "process exited immediately with {}",
                    status
                )));
            }
            if pid_is_alive(pid) {
                break;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                return Err(LifecycleError::StartupFailed(format!(
                    "no live process after {:?}",
                    self.startup_timeout
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        if let Err(e) = write_pid_file(&self.pid_file, pid) {
            log::warn!("Failed to write PID file: {}", e);
        }
        self.program.attach_process(Box::new(OwnedChild::new(child)));
        self.program.set_discovered_pids(Vec::new());
        Ok(pid)
    }

    async fn ensure_installed(&self) -> Result<PathBuf> {
        if let Some(executable) = self.provisioner.executable_path(&self.spec) {
            if executable.exists() || self.disk_image.is_some() {
                return Ok(executable);
            }
        }

        self.program.set_downloading(true);
        let result = self
            .provisioner
            .install(&self.spec, self.program.as_ref())
            .await;
        self.program.set_downloading(false);

        let executable = result?;
        self.refresh_installed();
        Ok(executable)
    }

    /// Stop the program, escalating to a kill after the stop timeout.
    ///
    /// Blocks while waiting; run it on a blocking worker.
    pub fn stop(&self) -> Result<StopOutcome> {
        self.program.set_state(ProcessState::Stopping);

        let result = match self.program.take_process() {
            Some(mut handle) => {
                let result =
                    stop_with_escalation(handle.as_mut(), self.stop_timeout, self.kill_wait);
                if result.is_err() {
                    self.program.attach_process(handle);
                }
                result
            }
            None => self.stop_discovered(),
        };

        match result {
            Ok(outcome) => {
                let _ = std::fs::remove_file(&self.pid_file);
                self.program.set_discovered_pids(Vec::new());
                self.program.set_state(ProcessState::NotRunning);
                log::info!("{} stopped ({:?})", self.spec.kind, outcome);
                Ok(outcome)
            }
            Err(e) => {
                self.program.set_state(ProcessState::Running);
                log::error!("Failed to stop {}: {}", self.spec.kind, e);
                Err(e)
            }
        }
    }

    fn stop_discovered(&self) -> Result<StopOutcome> {
        let mut pids = self.program.discovered_pids();
        if pids.is_empty() {
            pids.extend(self.pid_from_file());
        }

        let mut outcome = StopOutcome::AlreadyExited;
        let mut failures = Vec::new();

        for pid in pids {
            let mut handle = ExternalProcess::new(pid);
            match stop_with_escalation(&mut handle, self.stop_timeout, self.kill_wait) {
                Ok(StopOutcome::Forced) => outcome = StopOutcome::Forced,
                Ok(StopOutcome::Graceful) if outcome != StopOutcome::Forced => {
                    outcome = StopOutcome::Graceful
                }
                Ok(_) => {}
                Err(e) => failures.push(e.to_string()),
            }
        }

        if failures.is_empty() {
            Ok(outcome)
        } else {
            Err(LifecycleError::ShutdownFailed(failures.join("; ")))
        }
    }

    /// Feed the result of an external process scan.
    ///
    /// Without an owned handle the scan decides whether the program runs.
    /// With one, the handle is dropped once its process has exited.
    pub fn update_discovered_pids(&self, pids: Vec<u32>) {
        let state = self.program.state();
        if matches!(state, ProcessState::Starting | ProcessState::Stopping) {
            return;
        }

        {
            let mut slot = self.program.process_slot();
            if let Some(handle) = slot.as_mut() {
                if !handle.has_exited() {
                    return;
                }
                log::info!("{} (PID {}) exited", self.spec.kind, handle.pid());
                *slot = None;
                let _ = std::fs::remove_file(&self.pid_file);
            }
        }

        let running = !pids.is_empty();
        self.program.set_discovered_pids(pids);
        self.program.set_state(if running {
            ProcessState::Running
        } else {
            ProcessState::NotRunning
        });
    }
}

#[cfg(unix)]
fn detach(command: &mut Command) {
    use std::os::unix::process::CommandExt;

    unsafe {
        command.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

#[cfg(windows)]
fn detach(command: &mut Command) {
    use std::os::windows::process::CommandExt;

    const DETACHED_PROCESS: u32 = 0x0000_0008;
    const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
    command.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
}

#[cfg(not(any(unix, windows)))]
fn detach(_command: &mut Command) {}

/// Mount a disk image, copy its `.app` bundle into `root`, unmount.
fn copy_from_disk_image(image: &Path, root: &Path) -> Result<()> {
    let mount_point = root.join(".mount");
    std::fs::create_dir_all(&mount_point)?;

    let status = Command::new("hdiutil")
        .arg("attach")
        .args(["-nobrowse", "-readonly", "-mountpoint"])
        .arg(&mount_point)
        .arg(image)
        .stdout(Stdio::null())
        .status()?;
    if !status.success() {
        return Err(LifecycleError::StartupFailed(format!(
            "hdiutil attach {:?} exited with {}",
            image, status
        )));
    }

    let copied = copy_app_bundle(&mount_point, root);

    let detached = Command::new("hdiutil")
        .arg("detach")
        .arg(&mount_point)
        .stdout(Stdio::null())
        .status();
    if !matches!(detached, Ok(s) if s.success()) {
        log::warn!("Failed to detach {:?}", mount_point);
    }

    copied
}

fn copy_app_bundle(mount_point: &Path, root: &Path) -> Result<()> {
    let bundle = std::fs::read_dir(mount_point)?
        .flatten()
        .map(|e| e.path())
        .find(|p| p.extension().is_some_and(|ext| ext == "app"))
        .ok_or_else(|| LifecycleError::StartupFailed("disk image contains no .app".into()))?;

    log::info!("Copying {:?} into {:?}", bundle, root);
    let status = Command::new("cp").arg("-R").arg(&bundle).arg(root).status()?;
    if !status.success() {
        return Err(LifecycleError::StartupFailed(format!("cp exited with {}", status)));
    }
    Ok(())
}
