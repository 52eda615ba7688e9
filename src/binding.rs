//! Ties a supervisor to the action that stops it.
//!
//! A [`Terminator`] is the one action allowed to stop a supervisor. A
//! [`Trigger`] is some other piece of work after which the supervisor should
//! be stopped. A [`LifecycleBinding`] owns both and guarantees the terminator
//! runs once the trigger has finished, whichever of the two was set first.

use crate::error::{Error, Result};
use crate::supervisor::{ProcessInfo, Supervisor};
use std::fmt;

/// Lexical markers of a start-like name and their stop-like counterparts.
const MARKERS: [(&str, &str); 9] = [
    ("start", "stop"),
    ("Start", "Stop"),
    ("START", "STOP"),
    ("run", "stop"),
    ("Run", "Stop"),
    ("RUN", "STOP"),
    ("exec", "stop"),
    ("Exec", "Stop"),
    ("EXEC", "STOP"),
];

/// Derives the name of the action that stops what `name` starts.
///
/// The first marker found at the beginning or end of `name` is swapped for
/// "stop" in the same case; names without one get a `_stop` suffix.
///
/// ```
/// # use execfork::binding::derive_stop_name;
/// assert_eq!(derive_stop_name("startServer"), "stopServer");
/// assert_eq!(derive_stop_name("server_RUN"), "server_STOP");
/// assert_eq!(derive_stop_name("server"), "server_stop");
/// ```
pub fn derive_stop_name(name: &str) -> String {
    for (marker, stop) in MARKERS.iter() {
        if !name.starts_with(marker) && !name.ends_with(marker) {
            continue;
        }

        let (head, rest) = match name.strip_prefix(marker) {
            Some(rest) => (*stop, rest),
            None => ("", name),
        };
        let (body, tail) = match rest.strip_suffix(marker) {
            Some(body) => (body, *stop),
            None => (rest, ""),
        };

        return format!("{}{}{}", head, body, tail);
    }

    format!("{}_stop", name)
}

/// The action that stops a supervisor.
pub struct Terminator {
    name: String,
    supervisor: Supervisor,
}

impl Terminator {
    /// A terminator named after the supervisor, see [`derive_stop_name`].
    pub fn new(supervisor: &Supervisor) -> Self {
        Self::named(derive_stop_name(supervisor.name()), supervisor)
    }

    pub fn named(name: impl Into<String>, supervisor: &Supervisor) -> Self {
        Self {
            name: name.into(),
            supervisor: supervisor.clone(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn run(&self) -> Result<()> {
        info!("Running `{}`", self.name);
        self.supervisor.stop()
    }
}

impl fmt::Debug for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Terminator")
            .field("name", &self.name)
            .field("supervisor", &self.supervisor.name())
            .finish()
    }
}

/// Work after which a supervised process is no longer needed.
pub struct Trigger {
    name: String,
    action: Box<dyn FnOnce() -> Result<()> + Send>,
}

impl Trigger {
    pub fn new<F>(name: impl Into<String>, action: F) -> Self
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        Self {
            name: name.into(),
            action: Box::new(action),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn run(self) -> Result<()> {
        info!("Running `{}`", self.name);
        (self.action)()
    }
}

impl fmt::Debug for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Trigger").field("name", &self.name).finish()
    }
}

/// One supervisor, at most one terminator, at most one stop-after trigger.
pub struct LifecycleBinding {
    supervisor: Supervisor,
    terminator: Option<Terminator>,
    stop_after: Option<Trigger>,
}

impl LifecycleBinding {
    pub fn new(supervisor: Supervisor) -> Self {
        Self {
            supervisor,
            terminator: None,
            stop_after: None,
        }
    }

    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    pub fn terminator(&self) -> Option<&Terminator> {
        self.terminator.as_ref()
    }

    pub fn has_stop_after(&self) -> bool {
        self.stop_after.is_some()
    }

    /// Makes `terminator` the action that stops this binding's supervisor.
    ///
    /// Fails if it belongs to another supervisor, or if the supervisor
    /// already has a different terminator.
    pub fn set_terminator(&mut self, terminator: Terminator) -> Result<()> {
        if !terminator.supervisor.ptr_eq(&self.supervisor) {
            return Err(Error::Configuration(format!(
                "`{}` stops `{}`, not `{}`",
                terminator.name,
                terminator.supervisor.name(),
                self.supervisor.name()
            )));
        }

        self.supervisor.associate_terminator(&terminator.name)?;
        if let Some(trigger) = &self.stop_after {
            debug!("`{}` will run after `{}`", terminator.name, trigger.name);
        }

        self.terminator = Some(terminator);
        Ok(())
    }

    /// Schedules the terminator to run once `trigger` has finished.
    pub fn set_stop_after(&mut self, trigger: Trigger) -> Result<()> {
        if let Some(existing) = &self.stop_after {
            return Err(Error::Configuration(format!(
                "`{}` is already stopped after `{}`, it cannot also be stopped after `{}`",
                self.supervisor.name(),
                existing.name,
                trigger.name
            )));
        }

        if let Some(terminator) = &self.terminator {
            debug!("`{}` will run after `{}`", terminator.name, trigger.name);
        }

        self.stop_after = Some(trigger);
        Ok(())
    }

    pub fn start(&self) -> Result<ProcessInfo> {
        self.supervisor.start()
    }

    /// Runs the stop-after trigger, then the terminator.
    ///
    /// The terminator runs even when the trigger fails; the trigger's error
    /// is the one reported if both fail.
    pub fn run_trigger(&mut self) -> Result<()> {
        let trigger = self.stop_after.take().ok_or_else(|| {
            Error::Configuration(format!(
                "`{}` has no trigger to stop after",
                self.supervisor.name()
            ))
        })?;

        let triggered = trigger.run();
        if let Err(err) = &triggered {
            warn!("Trigger failed, stopping `{}` anyway: {}", self.supervisor.name(), err);
        }

        let finished = self.finish();
        triggered.and(finished)
    }

    /// Runs the terminator, or stops the supervisor directly if there is none.
    pub fn finish(&self) -> Result<()> {
        match &self.terminator {
            Some(terminator) => terminator.run(),
            None => self.supervisor.stop(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{derive_stop_name, LifecycleBinding, Terminator, Trigger};
    use crate::config::ProcessSpecBuilder;
    use crate::error::Error;
    use crate::supervisor::Supervisor;
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    fn supervisor(name: &str) -> Supervisor {
        let spec = ProcessSpecBuilder::default()
            .executable("server")
            .working_dir(".")
            .build()
            .expect("spec");
        Supervisor::new(name, spec)
    }

    fn assert_name(start: &str, stop: &str) {
        assert_eq!(derive_stop_name(start), stop, "derived from {}", start);
    }

    #[test]
    fn derives_stop_names_from_start_markers() {
        assert_name("startJohnnie", "stopJohnnie");
        assert_name("johnnie_start", "johnnie_stop");
        assert_name("johnnieStart", "johnnieStop");
        assert_name("johnnie_Start", "johnnie_Stop");
        assert_name("johnnieSTART", "johnnieSTOP");
        assert_name("STARTjohnnie", "STOPjohnnie");
    }

    #[test]
    fn derives_stop_names_from_run_markers() {
        assert_name("runJohnnie", "stopJohnnie");
        assert_name("johnnie_run", "johnnie_stop");
        assert_name("johnnieRun", "johnnieStop");
        assert_name("johnnie_Run", "johnnie_Stop");
        assert_name("johnnieRUN", "johnnieSTOP");
        assert_name("RUNjohnnie", "STOPjohnnie");
    }

    #[test]
    fn derives_stop_names_from_exec_markers() {
        assert_name("execJohnnie", "stopJohnnie");
        assert_name("johnnie_exec", "johnnie_stop");
        assert_name("johnnieExec", "johnnieStop");
        assert_name("johnnie_Exec", "johnnie_Stop");
        assert_name("johnnieEXEC", "johnnieSTOP");
        assert_name("EXECjohnnie", "STOPjohnnie");
    }

    #[test]
    fn falls_back_to_suffix() {
        assert_name("joseph", "joseph_stop");
        assert_name("johnnieStartServer", "johnnieStartServer_stop");
        assert_name("", "_stop");
    }

    #[test]
    fn replaces_both_ends_of_the_name() {
        assert_name("startAndstart", "stopAndstop");
        assert_name("start", "stop");
    }

    #[test]
    fn terminator_is_named_after_the_supervisor() {
        let server = supervisor("startServer");
        let terminator = Terminator::new(&server);
        assert_eq!(terminator.name(), "stopServer");
        assert!(terminator.supervisor().ptr_eq(&server));
    }

    #[test]
    fn terminator_must_stop_the_bound_supervisor() {
        let mut binding = LifecycleBinding::new(supervisor("startServer"));
        let stranger = supervisor("startOther");

        let err = binding
            .set_terminator(Terminator::new(&stranger))
            .expect_err("wrong supervisor");
        assert!(matches!(err, Error::Configuration(_)));
        assert!(binding.terminator().is_none());
        assert_eq!(binding.supervisor().terminator(), None);
    }

    #[test]
    fn at_most_one_terminator_per_supervisor() {
        let server = supervisor("startServer");
        let mut first = LifecycleBinding::new(server.clone());
        let mut second = LifecycleBinding::new(server.clone());

        first.set_terminator(Terminator::new(&server)).unwrap();
        let err = second
            .set_terminator(Terminator::named("killServer", &server))
            .expect_err("second terminator");
        assert!(err.to_string().contains("stopServer"));
        assert_eq!(server.terminator().as_deref(), Some("stopServer"));
    }

    #[test]
    fn at_most_one_trigger() {
        let mut binding = LifecycleBinding::new(supervisor("startServer"));
        binding.set_stop_after(Trigger::new("test", || Ok(()))).unwrap();
        assert!(binding.has_stop_after());
        assert!(binding
            .set_stop_after(Trigger::new("integrationTest", || Ok(())))
            .is_err());
    }

    #[test]
    fn run_trigger_needs_a_trigger() {
        let mut binding = LifecycleBinding::new(supervisor("startServer"));
        assert!(matches!(
            binding.run_trigger(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn trigger_error_wins_and_terminator_still_runs() {
        let server = supervisor("startServer");
        let mut binding = LifecycleBinding::new(server.clone());
        let ran = Arc::new(AtomicBool::new(false));

        let flag = ran.clone();
        binding
            .set_stop_after(Trigger::new("test", move || {
                flag.store(true, Ordering::SeqCst);
                Err(Error::Generic("tests failed".into()))
            }))
            .unwrap();
        binding.set_terminator(Terminator::new(&server)).unwrap();

        let err = binding.run_trigger().expect_err("trigger failed");
        assert!(ran.load(Ordering::SeqCst));
        assert!(matches!(err, Error::Generic(ref message) if message == "tests failed"));
        assert!(!binding.has_stop_after());
    }
}
