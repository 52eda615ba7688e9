#![allow(unsafe_code)]

use crate::config::ProcessSpec;
use crate::error::Result;
use crate::port::Liveness;
use std::{
    fs,
    io::{self, Read},
    process::{Child, Command, Stdio},
    sync::{Mutex, PoisonError},
    thread,
    time::{Duration, Instant, SystemTime},
};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A launched process together with the streams left to drain.
pub struct Spawned {
    pub process: SupervisedProcess,
    /// Standard output, with standard error merged in unless it is captured separately.
    pub stdout: Box<dyn Read + Send>,
    pub stderr: Option<Box<dyn Read + Send>>,
}

/// Launches the process described by `spec`.
///
/// The working directory is created first. The child inherits this process's
/// environment with `spec.environment` applied on top, and stays in its
/// process group, so a terminal interrupt reaches both. Without a separate
/// stderr destination, stdout and stderr share one OS pipe.
pub fn spawn(spec: &ProcessSpec) -> Result<Spawned> {
    fs::create_dir_all(&spec.working_dir)?;

    let mut command = Command::new(&spec.executable);
    command
        .args(&spec.args)
        .current_dir(&spec.working_dir)
        .envs(&spec.environment)
        .stdin(Stdio::null());

    let merged = if spec.stderr.is_none() {
        let (reader, writer) = io::pipe()?;
        command.stdout(writer.try_clone()?).stderr(writer);
        Some(reader)
    } else {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        None
    };

    debug!("Assembled command {:?}", command);
    let spawned = command.spawn();
    // Our copies of the pipe's write end live in `command`; they must be
    // closed for the reader to ever see the end of the stream.
    drop(command);
    let mut child = spawned?;

    let (stdout, stderr): (Box<dyn Read + Send>, Option<Box<dyn Read + Send>>) = match merged {
        Some(reader) => (Box::new(reader), None),
        None => {
            let stdout = child.stdout.take().ok_or_else(|| missing_stream("stdout"))?;
            let stderr = child.stderr.take().ok_or_else(|| missing_stream("stderr"))?;
            (Box::new(stdout), Some(Box::new(stderr)))
        }
    };

    Ok(Spawned {
        process: SupervisedProcess::new(child),
        stdout,
        stderr,
    })
}

fn missing_stream(name: &str) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("child {} was not captured", name))
}

/// Runtime handle to a launched OS process.
pub struct SupervisedProcess {
    child: Mutex<Child>,
    pid: u32,
    started_at: SystemTime,
}

impl SupervisedProcess {
    fn new(child: Child) -> Self {
        Self {
            pid: child.id(),
            child: Mutex::new(child),
            started_at: SystemTime::now(),
        }
    }

    pub const fn pid(&self) -> u32 {
        self.pid
    }

    pub const fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// Asks the process to shut down on its own.
    ///
    /// Windows has no equivalent of SIGTERM for arbitrary processes, so there
    /// this is the same as [`kill`][Self::kill].
    #[cfg(unix)]
    pub fn request_termination(&self) -> io::Result<()> {
        // Holding the lock keeps the pid from being reaped, and reused, under us.
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        if child.try_wait()?.is_some() {
            return Ok(());
        }

        debug!("Sending SIGTERM to pid {}", self.pid);
        signal_pid(self.pid, false)
    }

    #[cfg(not(unix))]
    pub fn request_termination(&self) -> io::Result<()> {
        debug!("No graceful termination available, killing pid {}", self.pid);
        self.kill()
    }

    /// Kills the process immediately.
    pub fn kill(&self) -> io::Result<()> {
        debug!("Killing pid {}", self.pid);
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        match child.try_wait()? {
            Some(_) => Ok(()),
            None => child.kill(),
        }
    }

    /// Waits up to `timeout` for the process to exit, returning whether it did.
    pub fn wait_timeout(&self, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.exited()? {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    fn exited(&self) -> io::Result<bool> {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(child.try_wait()?.is_some())
    }
}

impl Liveness for SupervisedProcess {
    fn is_alive(&self) -> bool {
        matches!(self.exited(), Ok(false))
    }
}

/// Sends the termination (or, with `force`, the kill) signal to any process.
///
/// A process that is already gone is not an error.
#[cfg(unix)]
pub fn signal_pid(pid: u32, force: bool) -> io::Result<()> {
    use nix::{
        errno::Errno,
        sys::signal::{kill, Signal},
        unistd::Pid,
    };
    use std::convert::TryFrom;

    let raw = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("pid {} out of range", pid)))?;
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };

    match kill(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(errno) => Err(io::Error::from(errno)),
    }
}

#[cfg(windows)]
pub fn signal_pid(pid: u32, _force: bool) -> io::Result<()> {
    use winapi::{
        shared::minwindef::FALSE,
        um::{
            handleapi::CloseHandle,
            processthreadsapi::{OpenProcess, TerminateProcess},
            winnt::PROCESS_TERMINATE,
        },
    };

    let handle = unsafe { OpenProcess(PROCESS_TERMINATE, FALSE, pid) };
    if handle.is_null() {
        // Most likely gone already.
        debug!("Could not open pid {}: {}", pid, io::Error::last_os_error());
        return Ok(());
    }

    let terminated = unsafe { TerminateProcess(handle, 1) };
    let err = io::Error::last_os_error();
    unsafe {
        CloseHandle(handle);
    }

    if terminated == 0 {
        Err(err)
    } else {
        Ok(())
    }
}

#[cfg(not(any(unix, windows)))]
pub fn signal_pid(pid: u32, _force: bool) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Other,
        format!("cannot signal pid {} on this platform", pid),
    ))
}
