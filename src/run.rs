use crate::binding::{LifecycleBinding, Terminator, Trigger};
use crate::cli::Args;
use crate::error::{Error, Result};
use crate::port;
use crate::registry;
use crate::sink::OUTPUT_TARGET;
use crate::supervisor::Supervisor;
use std::{io::Write, process::Command};

pub fn init_logger(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    env_logger::Builder::new()
        .format(|buf, r| {
            if r.target() == OUTPUT_TARGET {
                writeln!(buf, "{}", r.args())
            } else {
                writeln!(buf, "*** {}", r.args())
            }
        })
        .filter(None, level)
        .init();
}

pub fn run(args: Args) -> Result<()> {
    if args.find_port {
        println!("{}", port::find_open_port()?);
        return Ok(());
    }

    registry::install_handler()?;

    let supervisor = Supervisor::new(args.name.clone(), args.to_spec()?);
    let mut binding = LifecycleBinding::new(supervisor.clone());
    binding.set_terminator(Terminator::new(&supervisor))?;
    if let Some(then) = &args.then {
        binding.set_stop_after(shell_trigger(then))?;
    }

    let result = supervise(&mut binding);
    registry::stop_all();
    result
}

fn supervise(binding: &mut LifecycleBinding) -> Result<()> {
    if let Err(err) = binding.start() {
        let stopped = binding.finish();
        if let Err(stop_err) = stopped {
            error!("{}", stop_err);
        }
        return Err(err);
    }

    if binding.has_stop_after() {
        binding.run_trigger()
    } else {
        binding.supervisor().wait_for_exit()?;
        binding.finish()
    }
}

fn shell_trigger(cmd: &str) -> Trigger {
    let cmd = cmd.to_string();
    Trigger::new(cmd.clone(), move || {
        let status = shell(&cmd).status()?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::Generic(format!("`{}` failed with {}", cmd, status)))
        }
    })
}

#[cfg(windows)]
fn shell(cmd: &str) -> Command {
    let mut command = Command::new("cmd.exe");
    command.arg("/C").arg(cmd);
    command
}

#[cfg(not(windows))]
fn shell(cmd: &str) -> Command {
    let mut command = Command::new("sh");
    command.arg("-c").arg(cmd);
    command
}
