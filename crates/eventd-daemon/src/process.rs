use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use daemonize::Daemonize;
use eventd_core::EventdError;
use signal_hook::consts::{SIGINT, SIGTERM};

/// Owns the two independent shutdown signals the design notes call out: a received
/// SIGTERM/SIGINT, and the pid file being removed out from under the process by an
/// external orchestrator. Either one flips the same atomic; the engine's main loop
/// only ever has to ask `should_continue()` once per iteration.
pub struct ProcessSupervisor {
    pid_file: PathBuf,
    signaled: Arc<AtomicBool>,
}

impl ProcessSupervisor {
    pub fn new(pid_file: PathBuf) -> Self {
        Self { pid_file, signaled: Arc::new(AtomicBool::new(false)) }
    }

    /// Refuses to start if a pid file is already present — the presence of the file
    /// *is* the "another instance is running" signal, per the external-interfaces
    /// contract.
    pub fn ensure_not_already_running(&self) -> eventd_core::error::Result<()> {
        if self.pid_file.exists() {
            return Err(EventdError::DuplicateDaemon);
        }
        Ok(())
    }

    /// Double-forks into the background and writes the pid file, for the `start`
    /// verb. `foreground` skips this and writes the pid file directly instead.
    pub fn daemonize(&self) -> Result<()> {
        Daemonize::new()
            .pid_file(&self.pid_file)
            .start()
            .context("failed to daemonize")
    }

    pub fn write_pid_file_foreground(&self) -> Result<()> {
        fs::write(&self.pid_file, format!("{}\n", std::process::id())).context("failed to write pid file")
    }

    pub fn install_signal_handlers(&self) -> Result<()> {
        signal_hook::flag::register(SIGTERM, self.signaled.clone())?;
        signal_hook::flag::register(SIGINT, self.signaled.clone())?;
        Ok(())
    }

    pub fn should_continue(&self) -> bool {
        !self.signaled.load(Ordering::SeqCst) && self.pid_file.exists()
    }

    pub fn cleanup(&self) {
        let _ = fs::remove_file(&self.pid_file);
    }

    /// Sends the signal that stops a running daemon, for the `stop` verb: reads the
    /// pid out of the pid file and removes the file. Removing the file is sufficient
    /// on its own (the running process polls for it), but a direct SIGTERM also wakes
    /// it promptly if it is mid-sleep.
    pub fn stop_running(&self) -> Result<()> {
        let contents = fs::read_to_string(&self.pid_file).context("no pid file; is the daemon running?")?;
        let pid: i32 = contents.trim().parse().context("pid file does not contain a valid process id")?;
        fs::remove_file(&self.pid_file).ok();
        unsafe {
            libc::kill(pid, SIGTERM);
        }
        Ok(())
    }
}
