//! Process-level utilities.
//!
//! Provides PID file management, liveness checks, signal delivery and the
//! process-table scan used to rediscover programs started by an earlier
//! engine instance.

use std::fs;
use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System, UpdateKind};

/// Check if a process is still alive.
pub fn pid_is_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }

    #[cfg(unix)]
    {
        if pid_is_zombie(pid) {
            return false;
        }

        // Signal 0 doesn't send a signal but checks if the process exists
        let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if result == 0 {
            return true;
        }
        // EPERM means it exists but we don't have permission
        io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    {
        let mut system = System::new();
        let target = sysinfo::Pid::from_u32(pid);
        system.refresh_processes(sysinfo::ProcessesToUpdate::Some(&[target]), true);
        system.process(target).is_some()
    }
}

#[cfg(target_os = "macos")]
fn pid_is_zombie(pid: u32) -> bool {
    let mut info: libc::proc_bsdinfo = unsafe { std::mem::zeroed() };
    let info_size = std::mem::size_of::<libc::proc_bsdinfo>() as libc::c_int;
    let result = unsafe {
        libc::proc_pidinfo(
            pid as libc::c_int,
            libc::PROC_PIDTBSDINFO,
            0,
            &mut info as *mut _ as *mut libc::c_void,
            info_size,
        )
    };
    result == info_size && info.pbi_status == libc::SZOMB
}

#[cfg(target_os = "linux")]
fn pid_is_zombie(pid: u32) -> bool {
    // Third field of /proc/<pid>/stat, after the parenthesised command name.
    fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            let after_comm = stat.rsplit_once(')')?.1;
            after_comm.split_whitespace().next().map(|s| s == "Z")
        })
        .unwrap_or(false)
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
fn pid_is_zombie(_pid: u32) -> bool {
    false
}

/// Read a PID from a file.
pub fn read_pid_file(path: &Path) -> Option<u32> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .filter(|&pid| pid > 0)
}

/// Write a PID to a file.
pub fn write_pid_file(path: &Path, pid: u32) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, format!("{}\n", pid))
}

/// Ask a process to exit.
///
/// A process that no longer exists yields `ErrorKind::NotFound`.
pub fn send_terminate(pid: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        send_signal(pid, libc::SIGTERM)
    }

    #[cfg(not(unix))]
    {
        taskkill(pid, false)
    }
}

/// Kill a process outright.
pub fn send_kill(pid: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        send_signal(pid, libc::SIGKILL)
    }

    #[cfg(not(unix))]
    {
        taskkill(pid, true)
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> io::Result<()> {
    if pid == 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "pid 0"));
    }
    if unsafe { libc::kill(pid as libc::pid_t, signal) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Err(io::Error::new(io::ErrorKind::NotFound, err));
    }
    Err(err)
}

#[cfg(not(unix))]
fn taskkill(pid: u32, force: bool) -> io::Result<()> {
    let mut command = std::process::Command::new("taskkill");
    if force {
        command.arg("/F");
    }
    let status = command
        .args(["/PID", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()?;
    if status.success() {
        Ok(())
    } else if !pid_is_alive(pid) {
        Err(io::Error::new(io::ErrorKind::NotFound, "process not found"))
    } else {
        Err(io::Error::new(io::ErrorKind::Other, format!("taskkill exited with {}", status)))
    }
}

/// Wait for a process to exit.
pub fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if !pid_is_alive(pid) {
            return true;
        }

        #[cfg(unix)]
        {
            // Try to reap the process if it's our child
            let result = unsafe {
                let mut status: libc::c_int = 0;
                libc::waitpid(pid as libc::pid_t, &mut status, libc::WNOHANG)
            };

            if result == pid as libc::pid_t {
                return true;
            }
        }

        std::thread::sleep(Duration::from_millis(50));
    }

    !pid_is_alive(pid)
}

/// Check that a live PID still belongs to the program.
///
/// A process matches by name, or by running `executable` directly or as a
/// script argument. Guards PID-file entries against PID reuse.
pub fn pid_matches(pid: u32, names: &[String], executable: Option<&Path>) -> bool {
    if pid == 0 || pid == std::process::id() {
        return false;
    }

    let target = Pid::from_u32(pid);
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[target]),
        true,
        ProcessRefreshKind::nothing()
            .with_exe(UpdateKind::Always)
            .with_cmd(UpdateKind::Always),
    );
    let Some(process) = system.process(target) else {
        return false;
    };

    let name = process.name().to_string_lossy();
    if names.iter().any(|n| n.as_str() == name) {
        return true;
    }

    let Some(executable) = executable else {
        return false;
    };
    process.exe() == Some(executable)
        || process
            .cmd()
            .iter()
            .any(|arg| Path::new(arg) == executable)
}

/// Find running processes whose name matches one of `names`.
///
/// The engine's own PID is never reported.
pub fn discover_pids(names: &[String]) -> Vec<u32> {
    let system = System::new_with_specifics(
        RefreshKind::nothing().with_processes(ProcessRefreshKind::nothing()),
    );
    let own_pid = std::process::id();

    let mut pids: Vec<u32> = system
        .processes()
        .iter()
        .filter(|(_, process)| {
            let name = process.name().to_string_lossy();
            names.iter().any(|n| n.as_str() == name)
        })
        .map(|(pid, _)| pid.as_u32())
        .filter(|&pid| pid != own_pid)
        .collect();
    pids.sort_unstable();
    pids
}
