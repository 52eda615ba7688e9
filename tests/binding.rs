#![cfg(unix)]

use execfork::{
    Error, LifecycleBinding, ProcessSpecBuilder, ProcessState, Result, Supervisor, Terminator,
    Trigger,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

fn sleeper(name: &str) -> Supervisor {
    let dir = std::env::temp_dir();
    let spec = ProcessSpecBuilder::default()
        .executable("sleep")
        .arg("30")
        .working_dir(dir)
        .timeout(Duration::from_secs(10))
        .build()
        .expect("spec");
    Supervisor::new(name, spec)
}

/// A trigger that records whether the supervised process was alive while it ran.
fn observing(supervisor: &Supervisor, seen_alive: &Arc<AtomicBool>) -> Trigger {
    let supervisor = supervisor.clone();
    let seen_alive = seen_alive.clone();
    Trigger::new("integrationTest", move || {
        seen_alive.store(supervisor.is_alive(), Ordering::SeqCst);
        Ok(())
    })
}

#[test]
fn terminator_runs_after_trigger_when_set_first() -> Result<()> {
    let server = sleeper("startServer");
    let seen_alive = Arc::new(AtomicBool::new(false));

    let mut binding = LifecycleBinding::new(server.clone());
    binding.set_terminator(Terminator::new(&server))?;
    binding.set_stop_after(observing(&server, &seen_alive))?;

    binding.start()?;
    binding.run_trigger()?;

    assert!(seen_alive.load(Ordering::SeqCst));
    assert_eq!(server.state(), ProcessState::Stopped);
    Ok(())
}

#[test]
fn terminator_runs_after_trigger_when_set_last() -> Result<()> {
    let server = sleeper("startServer");
    let seen_alive = Arc::new(AtomicBool::new(false));

    let mut binding = LifecycleBinding::new(server.clone());
    binding.set_stop_after(observing(&server, &seen_alive))?;
    binding.set_terminator(Terminator::new(&server))?;

    binding.start()?;
    binding.run_trigger()?;

    assert!(seen_alive.load(Ordering::SeqCst));
    assert_eq!(server.state(), ProcessState::Stopped);
    Ok(())
}

#[test]
fn failing_trigger_still_stops_the_process() -> Result<()> {
    let server = sleeper("runServer");
    let mut binding = LifecycleBinding::new(server.clone());
    binding.set_terminator(Terminator::new(&server))?;
    binding.set_stop_after(Trigger::new("test", || {
        Err(Error::Generic("3 tests failed".into()))
    }))?;

    binding.start()?;
    let err = binding.run_trigger().expect_err("trigger failed");

    assert!(err.to_string().contains("3 tests failed"));
    assert_eq!(server.state(), ProcessState::Stopped);
    assert!(!server.is_alive());
    Ok(())
}

#[test]
fn start_without_terminator_names_the_missing_one() {
    let server = sleeper("execServer");
    let binding = LifecycleBinding::new(server.clone());

    let err = binding.start().expect_err("no terminator");
    assert!(matches!(err, Error::Configuration(_)));
    assert!(err.to_string().contains("stopServer"), "{}", err);
    assert_eq!(server.pid(), None);
}
