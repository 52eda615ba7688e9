//! Background copying of a process stream, with optional pattern detection.

use crate::error::{Error, Result};
use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    sync::{Arc, Condvar, Mutex, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LatchState {
    Waiting,
    Released,
    Closed,
}

/// Single-fire signal released when the pattern is first seen.
///
/// The latch is also closed when the stream ends, so that waiters do not sit
/// out their whole timeout for a pattern that can no longer appear.
struct PatternLatch {
    state: Mutex<LatchState>,
    cvar: Condvar,
}

impl PatternLatch {
    fn new(armed: bool) -> Self {
        Self {
            state: Mutex::new(if armed {
                LatchState::Waiting
            } else {
                LatchState::Released
            }),
            cvar: Condvar::new(),
        }
    }

    fn transition(&self, to: LatchState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == LatchState::Waiting {
            *state = to;
            self.cvar.notify_all();
        }
    }

    fn release(&self) {
        self.transition(LatchState::Released);
    }

    fn close(&self) {
        self.transition(LatchState::Closed);
    }

    fn current(&self) -> LatchState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until the latch leaves `Waiting` or the timeout elapses.
    fn wait(&self, timeout: Option<Duration>) -> LatchState {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let waiting = |s: &mut LatchState| *s == LatchState::Waiting;
        let state = match timeout {
            Some(timeout) => {
                self.cvar
                    .wait_timeout_while(state, timeout, waiting)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => self
                .cvar
                .wait_while(state, waiting)
                .unwrap_or_else(PoisonError::into_inner),
        };
        *state
    }
}

/// Sliding window over the last `pattern.len()` bytes of a stream.
///
/// Matching compares the whole window on every byte, which is fine for the
/// short readiness markers this is meant for.
// TODO: switch to a KMP failure table if multi-kilobyte patterns ever show up
pub struct PatternWindow {
    pattern: Vec<u8>,
    window: VecDeque<u8>,
}

impl PatternWindow {
    pub fn new(pattern: &[u8]) -> Self {
        Self {
            pattern: pattern.to_vec(),
            window: VecDeque::with_capacity(pattern.len()),
        }
    }

    /// Appends a byte, returning whether the window now equals the pattern.
    pub fn push(&mut self, byte: u8) -> bool {
        if self.pattern.is_empty() {
            return false;
        }

        if self.window.len() == self.pattern.len() {
            self.window.pop_front();
        }
        self.window.push_back(byte);

        self.window.len() == self.pattern.len() && self.window.iter().eq(self.pattern.iter())
    }
}

/// Copies one input stream into one sink on a dedicated thread.
///
/// The pipe owns both ends for its whole life. Output is mirrored in the exact
/// order it is read, partial lines included, and the sink is closed once when
/// the input ends.
pub struct StreamPipe {
    name: String,
    pattern: Option<String>,
    latch: Arc<PatternLatch>,
    thread: Option<JoinHandle<io::Result<()>>>,
}

impl StreamPipe {
    /// Starts copying `input` into `output` right away.
    ///
    /// `name` only shows up in thread names and messages, e.g. "stdout of `startServer`".
    pub fn new<R, W>(
        name: impl Into<String>,
        input: R,
        output: W,
        pattern: Option<String>,
    ) -> io::Result<Self>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        let name = name.into();
        let pattern = pattern.filter(|p| !p.is_empty());
        let latch = Arc::new(PatternLatch::new(pattern.is_some()));
        let window = pattern.as_ref().map(|p| PatternWindow::new(p.as_bytes()));

        let thread = {
            let latch = latch.clone();
            let name = name.clone();
            thread::Builder::new()
                .name(format!("execfork pipe: {}", name))
                .spawn(move || pump(&name, input, output, window, &latch))?
        };

        Ok(Self {
            name,
            pattern,
            latch,
            thread: Some(thread),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the pattern has been seen (always true without a pattern).
    pub fn pattern_seen(&self) -> bool {
        self.latch.current() == LatchState::Released
    }

    /// Blocks until the pattern has been seen, however long that takes.
    pub fn wait_for_pattern(&self) -> Result<()> {
        let state = self.latch.wait(None);
        self.settle(state, None)
    }

    /// Blocks until the pattern has been seen or `timeout` elapses.
    pub fn wait_for_pattern_timeout(&self, timeout: Duration) -> Result<()> {
        let state = self.latch.wait(Some(timeout));
        self.settle(state, Some(timeout))
    }

    fn settle(&self, state: LatchState, timeout: Option<Duration>) -> Result<()> {
        let pattern = match &self.pattern {
            Some(pattern) => pattern.clone(),
            None => return Ok(()),
        };

        match state {
            LatchState::Released => Ok(()),
            LatchState::Closed => Err(Error::ProcessDiedEarly {
                awaited: format!("the `{}` pattern appeared on {}", pattern, self.name),
                process: None,
            }),
            LatchState::Waiting => Err(Error::PatternTimeout {
                stream: self.name.clone(),
                pattern,
                timeout: timeout.unwrap_or_default(),
            }),
        }
    }

    /// Whether copying has ended, successfully or not.
    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Waits for the input to be exhausted and reports how copying ended.
    pub fn join(mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => match thread.join() {
                Ok(result) => result.map_err(Error::from),
                Err(_) => Err(Error::Generic(format!("pipe for {} panicked", self.name))),
            },
            None => Ok(()),
        }
    }
}

fn pump<R: Read, W: Write>(
    name: &str,
    mut input: R,
    mut output: W,
    window: Option<PatternWindow>,
    latch: &PatternLatch,
) -> io::Result<()> {
    let result = copy(&mut input, &mut output, window, latch);

    debug!("Closing sink for {}", name);
    let flushed = output.flush();
    drop(output);
    latch.close();

    if let Err(err) = &result {
        error!("Copying {} failed: {}", name, err);
    }

    result.and(flushed)
}

fn copy<R: Read, W: Write>(
    input: &mut R,
    output: &mut W,
    mut window: Option<PatternWindow>,
    latch: &PatternLatch,
) -> io::Result<()> {
    let mut buf = [0_u8; 8192];

    loop {
        let read = match input.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) if is_closed(&err) => {
                debug!("Input stream was closed: {}", err);
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let chunk = &buf[..read];

        let matched_at = window
            .as_mut()
            .and_then(|w| chunk.iter().position(|&byte| w.push(byte)));

        match matched_at {
            Some(last) => {
                // The latch must not fire before the matching bytes are mirrored.
                output.write_all(&chunk[..=last])?;
                output.flush()?;
                trace!("Pattern seen, releasing waiters");
                latch.release();
                window = None;
                output.write_all(&chunk[last + 1..])?;
            }
            None => output.write_all(chunk)?,
        }

        output.flush()?;
    }
}

/// Whether a read error only means the other end of the stream is gone.
fn is_closed(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::UnexpectedEof => true,
        #[cfg(unix)]
        _ => err.raw_os_error() == Some(nix::errno::Errno::EBADF as i32),
        #[cfg(not(unix))]
        _ => false,
    }
}
