//! The lifecycle of one supervised background process.

use crate::binding::derive_stop_name;
use crate::config::ProcessSpec;
use crate::error::{Error, Result};
use crate::pipe::StreamPipe;
use crate::port::{self, Liveness};
use crate::process::{self, SupervisedProcess};
use crate::registry::{self, Stoppable};
use crate::sink::{file_sink, LogSink};
use crate::tree::{self, ProcessTree};
use std::{
    fmt,
    io::Write,
    sync::{Arc, Mutex, PoisonError},
    thread,
    time::{Duration, Instant, SystemTime},
};

/// How long a process gets to exit after each termination step, unless overridden.
pub const STOP_GRACE_PERIOD: Duration = Duration::from_secs(15);

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessState {
    NotStarted,
    Starting,
    Running,
    FailedToStart,
    Stopping,
    Stopped,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = match self {
            Self::NotStarted => "not started",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::FailedToStart => "failed to start",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        };
        f.write_str(state)
    }
}

/// What `start()` hands back about the launched process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub started_at: SystemTime,
}

/// Owns one background process from launch to termination.
///
/// Handles are cheap to clone and all refer to the same process. A
/// terminator must be associated (see [`LifecycleBinding`]) before the
/// process can be started, so that something is guaranteed to stop it.
///
/// When the last handle goes away while the process still runs, it is
/// stopped.
///
/// [`LifecycleBinding`]: crate::binding::LifecycleBinding
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    spec: ProcessSpec,
    tree: Box<dyn ProcessTree>,
    grace_period: Duration,
    terminator: Mutex<Option<String>>,
    state: Mutex<ProcessState>,
    process: Mutex<Option<Arc<SupervisedProcess>>>,
    pipes: Mutex<Vec<StreamPipe>>,
}

impl Supervisor {
    pub fn new(name: impl Into<String>, spec: ProcessSpec) -> Self {
        Self::with_tree(name, spec, tree::platform())
    }

    /// Like [`new`][Self::new], with an explicit way of finding descendants.
    pub fn with_tree(name: impl Into<String>, spec: ProcessSpec, tree: Box<dyn ProcessTree>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                spec,
                tree,
                grace_period: STOP_GRACE_PERIOD,
                terminator: Mutex::new(None),
                state: Mutex::new(ProcessState::NotStarted),
                process: Mutex::new(None),
                pipes: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Replaces [`STOP_GRACE_PERIOD`] for this supervisor.
    ///
    /// Only takes effect on a fresh supervisor, before any clone exists.
    pub(crate) fn with_grace_period(mut self, grace_period: Duration) -> Self {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => inner.grace_period = grace_period,
            None => warn!(
                "`{}` is already shared, keeping its grace period",
                self.inner.name
            ),
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.inner.spec
    }

    pub fn state(&self) -> ProcessState {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Name of the associated terminator, if any.
    pub fn terminator(&self) -> Option<String> {
        self.inner
            .terminator
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Pid of the current (or most recent) process.
    pub fn pid(&self) -> Option<u32> {
        self.inner.current().map(|p| p.pid())
    }

    pub fn is_alive(&self) -> bool {
        self.inner.current().map_or(false, |p| p.is_alive())
    }

    /// Whether both handles refer to the same supervisor.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Records `name` as the one action allowed to stop this supervisor.
    ///
    /// Associating the same name again is fine; a different one is not.
    pub(crate) fn associate_terminator(&self, name: &str) -> Result<()> {
        let mut terminator = self.inner.terminator.lock()?;
        match terminator.as_deref() {
            Some(existing) if existing != name => Err(Error::Configuration(format!(
                "`{}` is already stopped by `{}`, it cannot also be stopped by `{}`",
                self.inner.name, existing, name
            ))),
            _ => {
                *terminator = Some(name.to_string());
                Ok(())
            }
        }
    }

    /// Launches the process and blocks until it is ready.
    ///
    /// Ready means the configured stderr pattern, then stdout pattern, then
    /// port have all been observed, each within the configured timeout.
    /// Without any of those the process is ready as soon as it is spawned.
    ///
    /// On failure the process may still be running; [`stop`][Self::stop]
    /// takes care of it.
    pub fn start(&self) -> Result<ProcessInfo> {
        if self.inner.terminator.lock()?.is_none() {
            return Err(Error::Configuration(format!(
                "`{}` has no terminator: associate one (such as `{}`) before starting it, \
                 otherwise nothing would ever stop the process",
                self.inner.name,
                derive_stop_name(&self.inner.name)
            )));
        }

        {
            let mut state = self.inner.state.lock()?;
            match *state {
                ProcessState::NotStarted | ProcessState::Stopped => *state = ProcessState::Starting,
                other => {
                    return Err(Error::Configuration(format!(
                        "`{}` cannot be started while it is {}",
                        self.inner.name, other
                    )))
                }
            }
        }

        let launched = self.launch();

        let mut state = self.inner.state.lock()?;
        match launched {
            Ok(info) if *state == ProcessState::Starting => {
                *state = ProcessState::Running;
                info!("`{}` is running (pid {})", self.inner.name, info.pid);
                Ok(info)
            }
            Ok(_) => Err(Error::Generic(format!(
                "`{}` was stopped while starting",
                self.inner.name
            ))),
            Err(err) => {
                if *state == ProcessState::Starting {
                    *state = ProcessState::FailedToStart;
                }
                Err(err)
            }
        }
    }

    fn launch(&self) -> Result<ProcessInfo> {
        let inner = &self.inner;
        let spec = &inner.spec;
        info!("Running `{}`: {}", inner.name, spec.command_line());

        let stdout_sink: Box<dyn Write + Send> = match &spec.stdout {
            Some(path) => Box::new(file_sink(path)?),
            None => Box::new(LogSink::new(inner.name.clone())),
        };
        let stderr_sink = match &spec.stderr {
            Some(path) => Some(file_sink(path)?),
            None => {
                if let Some(pattern) = &spec.wait_for_error {
                    warn!(
                        "`{}` merges stderr into stdout, not waiting for `{}` on stderr; wait for it on stdout instead",
                        inner.name, pattern
                    );
                }
                None
            }
        };

        let spawned = {
            let mut slot = inner.process.lock()?;
            if *inner.state.lock()? != ProcessState::Starting {
                return Err(Error::Generic(format!(
                    "`{}` was stopped while starting",
                    inner.name
                )));
            }

            let spawned = process::spawn(spec)?;
            let process = Arc::new(spawned.process);
            *slot = Some(process.clone());
            (process, spawned.stdout, spawned.stderr)
        };
        let (process, stdout, stderr) = spawned;

        let entry: Arc<dyn Stoppable> = inner.clone();
        registry::register(&entry);

        let stdout_pipe = StreamPipe::new(
            format!("stdout of `{}`", inner.name),
            stdout,
            stdout_sink,
            spec.wait_for_output.clone(),
        )?;
        let stderr_pipe = match (stderr, stderr_sink) {
            (Some(stderr), Some(sink)) => Some(StreamPipe::new(
                format!("stderr of `{}`", inner.name),
                stderr,
                sink,
                spec.wait_for_error.clone(),
            )?),
            _ => None,
        };

        let ready = wait_until_ready(spec, &process, &stdout_pipe, stderr_pipe.as_ref())
            .map_err(|err| err.attributed_to(&inner.name));

        let mut pipes = inner.pipes.lock()?;
        pipes.push(stdout_pipe);
        pipes.extend(stderr_pipe);
        drop(pipes);

        ready.map(|()| ProcessInfo {
            pid: process.pid(),
            started_at: process.started_at(),
        })
    }

    /// Terminates descendants (if configured) and then the process itself.
    ///
    /// Does nothing if the process was never started or is already stopped.
    pub fn stop(&self) -> Result<()> {
        self.inner.stop()
    }

    /// Blocks until the current process exits by itself or is stopped.
    pub fn wait_for_exit(&self) -> Result<()> {
        if let Some(process) = self.inner.current() {
            while !process.wait_timeout(EXIT_POLL_INTERVAL)? {}
            debug!("`{}` (pid {}) exited", self.inner.name, process.pid());
        }

        Ok(())
    }
}

fn wait_until_ready(
    spec: &ProcessSpec,
    process: &SupervisedProcess,
    stdout: &StreamPipe,
    stderr: Option<&StreamPipe>,
) -> Result<()> {
    if let Some(stderr) = stderr {
        stderr.wait_for_pattern_timeout(spec.timeout)?;
    }
    stdout.wait_for_pattern_timeout(spec.timeout)?;

    if let Some(port) = spec.wait_for_port {
        port::wait_for_port_open(port, spec.timeout, process)?;
    }

    Ok(())
}

/// Gives the pipes a moment to copy what is left.
///
/// A process we did not stop (a descendant, with `kill_descendants` off) may
/// keep a stream open indefinitely; such pipes are left to finish on their own.
fn drain(pipes: Vec<StreamPipe>) {
    let deadline = Instant::now() + PIPE_DRAIN_TIMEOUT;
    for pipe in pipes {
        while !pipe.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }

        if !pipe.is_finished() {
            debug!("{} is still open, not waiting for it", pipe.name());
            continue;
        }

        let name = pipe.name().to_string();
        if let Err(err) = pipe.join() {
            debug!("Copying {} ended with: {}", name, err);
        }
    }
}

impl Inner {
    fn current(&self) -> Option<Arc<SupervisedProcess>> {
        self.process
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn terminate(&self, process: &SupervisedProcess) -> Result<()> {
        let pid = process.pid();
        info!("Stopping `{}` (pid {})", self.name, pid);

        if self.spec.kill_descendants && process.is_alive() {
            self.terminate_descendants(pid);
        }

        if !self.spec.force_kill {
            match process.request_termination() {
                Ok(()) => {
                    if process.wait_timeout(self.grace_period)? {
                        return Ok(());
                    }
                    warn!(
                        "`{}` did not exit within {}s, killing it",
                        self.name,
                        self.grace_period.as_secs_f64()
                    );
                }
                Err(err) => warn!("Could not ask `{}` to stop, killing it: {}", self.name, err),
            }
        }

        process.kill()?;
        if process.wait_timeout(self.grace_period)? {
            Ok(())
        } else {
            Err(Error::Generic(format!(
                "`{}` (pid {}) was killed but did not exit within {}s",
                self.name,
                pid,
                self.grace_period.as_secs_f64()
            )))
        }
    }

    /// Best effort: failures are logged and never stop the root's termination.
    fn terminate_descendants(&self, pid: u32) {
        let descendants = match self.tree.descendants(pid) {
            Ok(descendants) => descendants,
            Err(err) => {
                warn!("Could not list the descendants of `{}`: {}", self.name, err);
                return;
            }
        };

        debug!("Terminating descendants of `{}`: {:?}", self.name, descendants);
        for child in descendants.iter().rev() {
            if let Err(err) = process::signal_pid(*child, self.spec.force_kill) {
                warn!(
                    "Could not terminate pid {} spawned by `{}`: {}",
                    child, self.name, err
                );
            }
        }
    }
}

impl Stoppable for Inner {
    fn name(&self) -> &str {
        &self.name
    }

    fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock()?;
            match *state {
                ProcessState::NotStarted | ProcessState::Stopping | ProcessState::Stopped => {
                    return Ok(())
                }
                ProcessState::Starting | ProcessState::Running | ProcessState::FailedToStart => {
                    *state = ProcessState::Stopping
                }
            }
        }

        let result = match self.current() {
            Some(process) => self.terminate(&process),
            None => Ok(()),
        };

        *self.state.lock()? = ProcessState::Stopped;

        let pipes: Vec<StreamPipe> = self.pipes.lock()?.drain(..).collect();
        drain(pipes);

        if result.is_ok() {
            info!("`{}` stopped", self.name);
        }
        result
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let state = *self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let live = match state {
            ProcessState::Starting | ProcessState::Running | ProcessState::FailedToStart => {
                self.current().map_or(false, |p| p.is_alive())
            }
            _ => false,
        };

        if live {
            debug!("Last handle to `{}` dropped, stopping it", self.name);
            if let Err(err) = <Self as Stoppable>::stop(self) {
                error!("Failed to stop `{}`: {}", self.name, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ProcessState, Supervisor};
    use crate::config::ProcessSpecBuilder;
    use crate::error::Error;
    use std::time::{Duration, Instant};

    fn supervisor(name: &str) -> Supervisor {
        let spec = ProcessSpecBuilder::default()
            .executable("true")
            .working_dir(".")
            .build()
            .expect("spec");
        Supervisor::new(name, spec)
    }

    #[test]
    fn refuses_to_start_without_terminator() {
        let server = supervisor("startServer");
        let err = server.start().expect_err("no terminator");

        assert!(matches!(err, Error::Configuration(_)));
        let message = err.to_string();
        assert!(message.contains("startServer"), "{}", message);
        assert!(message.contains("stopServer"), "{}", message);
        assert_eq!(server.state(), ProcessState::NotStarted);
        assert_eq!(server.pid(), None);
    }

    #[test]
    fn stop_is_a_no_op_before_start() {
        let server = supervisor("idle");
        server.stop().expect("first stop");
        server.stop().expect("second stop");
        assert_eq!(server.state(), ProcessState::NotStarted);
        assert!(!server.is_alive());
    }

    #[test]
    fn at_most_one_terminator() {
        let server = supervisor("startServer");
        server.associate_terminator("stopServer").expect("first");
        server.associate_terminator("stopServer").expect("same again");

        let err = server
            .associate_terminator("killServer")
            .expect_err("different terminator");
        assert!(err.to_string().contains("stopServer"));
        assert_eq!(server.terminator().as_deref(), Some("stopServer"));
    }

    #[test]
    fn clones_share_state() {
        let server = supervisor("shared");
        let other = server.clone();
        assert!(server.ptr_eq(&other));
        assert!(!server.ptr_eq(&supervisor("shared")));

        other.associate_terminator("shared_stop").unwrap();
        assert_eq!(server.terminator().as_deref(), Some("shared_stop"));
    }

    #[test]
    #[cfg(unix)]
    fn kills_a_process_ignoring_sigterm_after_the_grace_period() {
        let dir = tempfile::tempdir().expect("tempdir");
        let spec = ProcessSpecBuilder::default()
            .executable("sh")
            .args(vec![
                "-c".to_string(),
                "trap '' TERM; echo ready; while true; do sleep 1; done".to_string(),
            ])
            .working_dir(dir.path())
            .wait_for_output("ready")
            .timeout(Duration::from_secs(10))
            .force_kill(false)
            .build()
            .expect("spec");

        let grace_period = Duration::from_millis(500);
        let server = Supervisor::new("startStubborn", spec).with_grace_period(grace_period);
        server.associate_terminator("stopStubborn").unwrap();
        server.start().expect("starts");

        let stopping = Instant::now();
        server.stop().expect("killed after the grace period");
        let elapsed = stopping.elapsed();

        assert!(elapsed >= grace_period, "stopped after {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(5), "stopped after {:?}", elapsed);
        assert_eq!(server.state(), ProcessState::Stopped);
        assert!(!server.is_alive());
    }

    #[test]
    #[cfg(unix)]
    fn graceful_stop_does_not_wait_out_the_grace_period() {
        let spec = ProcessSpecBuilder::default()
            .executable("sleep")
            .arg("30")
            .working_dir(std::env::temp_dir())
            .build()
            .expect("spec");

        let server = Supervisor::new("startSleep", spec).with_grace_period(Duration::from_secs(30));
        server.associate_terminator("stopSleep").unwrap();
        server.start().expect("starts");

        let stopping = Instant::now();
        server.stop().expect("stops on SIGTERM");
        assert!(stopping.elapsed() < Duration::from_secs(5));
        assert!(!server.is_alive());
    }
}
