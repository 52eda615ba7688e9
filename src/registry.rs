#![allow(unsafe_code)]

//! Process-wide list of running supervisors, stopped together on shutdown.
//!
//! Supervisors add themselves when they start; entries are weak so that a
//! dropped supervisor simply falls out. [`install_handler`] hooks interrupt and
//! termination signals (console control events on Windows) up to [`stop_all`].

use crate::error::Result;
use std::sync::{Arc, Mutex, Once, PoisonError, Weak};

pub(crate) trait Stoppable: Send + Sync {
    fn name(&self) -> &str;
    fn stop(&self) -> Result<()>;
}

lazy_static! {
    static ref ACTIVE: Mutex<Vec<Weak<dyn Stoppable>>> = Mutex::new(Vec::new());
}

static INSTALL: Once = Once::new();

pub(crate) fn register(supervisor: &Arc<dyn Stoppable>) {
    insert(
        &mut ACTIVE.lock().unwrap_or_else(PoisonError::into_inner),
        supervisor,
    );
}

fn insert(active: &mut Vec<Weak<dyn Stoppable>>, supervisor: &Arc<dyn Stoppable>) {
    active.retain(|entry| entry.strong_count() > 0);
    if !active
        .iter()
        .any(|entry| entry.as_ptr() as *const () == Arc::as_ptr(supervisor) as *const ())
    {
        active.push(Arc::downgrade(supervisor));
    }
}

/// Number of registered supervisors that are still around.
pub fn active() -> usize {
    ACTIVE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .filter(|entry| entry.strong_count() > 0)
        .count()
}

/// Stops every registered supervisor, most recently started first.
///
/// A supervisor that fails to stop is logged and skipped so the rest still
/// get their turn.
pub fn stop_all() {
    let supervisors = take_live(&mut ACTIVE.lock().unwrap_or_else(PoisonError::into_inner));
    stop_each(&supervisors);
}

fn take_live(active: &mut Vec<Weak<dyn Stoppable>>) -> Vec<Arc<dyn Stoppable>> {
    active.drain(..).filter_map(|entry| entry.upgrade()).collect()
}

fn stop_each(supervisors: &[Arc<dyn Stoppable>]) {
    for supervisor in supervisors.iter().rev() {
        debug!("Stopping `{}` on shutdown", supervisor.name());
        if let Err(err) = supervisor.stop() {
            error!("Failed to stop `{}`: {}", supervisor.name(), err);
        }
    }
}

/// Runs [`stop_all`] when this process is interrupted or asked to terminate.
///
/// Only the first call installs anything. On unix, SIGINT, SIGTERM and SIGHUP
/// are blocked for the calling thread and every thread started afterwards, so
/// call this early. After cleanup the signal is re-raised with its default
/// action, so the exit status stays what it would have been.
#[cfg(unix)]
pub fn install_handler() -> Result<()> {
    use nix::sys::signal::{raise, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use std::thread;

    let mut result = Ok(());
    INSTALL.call_once(|| {
        let mut mask = SigSet::empty();
        mask.add(Signal::SIGTERM);
        mask.add(Signal::SIGINT);
        mask.add(Signal::SIGHUP);

        result = mask
            .thread_block()
            .map_err(|errno| crate::error::Error::from(std::io::Error::from(errno)))
            .and_then(|()| {
                thread::Builder::new()
                    .name("execfork signals".into())
                    .spawn(move || {
                        let signal = match mask.wait() {
                            Ok(signal) => signal,
                            Err(errno) => {
                                error!("Unable to wait for signals: {}", errno);
                                return;
                            }
                        };
                        debug!("Received {:?}", signal);

                        stop_all();

                        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
                        unsafe {
                            let _ = sigaction(signal, &default);
                        }

                        let mut unmask = SigSet::empty();
                        unmask.add(signal);
                        let _ = unmask.thread_unblock();
                        let _ = raise(signal);
                    })
                    .map(|_| ())
                    .map_err(crate::error::Error::from)
            });
    });

    result
}

#[cfg(windows)]
pub fn install_handler() -> Result<()> {
    use winapi::{
        shared::minwindef::{BOOL, DWORD, FALSE, TRUE},
        um::consoleapi::SetConsoleCtrlHandler,
    };

    unsafe extern "system" fn ctrl_handler(_: DWORD) -> BOOL {
        stop_all();

        FALSE
    }

    let mut result = Ok(());
    INSTALL.call_once(|| {
        if unsafe { SetConsoleCtrlHandler(Some(ctrl_handler), TRUE) } == FALSE {
            result = Err(std::io::Error::last_os_error().into());
        }
    });

    result
}

#[cfg(not(any(unix, windows)))]
pub fn install_handler() -> Result<()> {
    INSTALL.call_once(|| warn!("No shutdown handler available on this platform"));
    Ok(())
}
