use crate::config::{ProcessSpec, ProcessSpecBuilder};
use crate::error::{Error, Result};
use clap::{App, AppSettings, Arg, ArgMatches};
use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Debug)]
pub struct Args {
    pub cmd: Vec<String>,
    pub name: String,
    pub workdir: PathBuf,
    pub env: Vec<(String, String)>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub wait_for_output: Option<String>,
    pub wait_for_error: Option<String>,
    pub wait_for_port: Option<u16>,
    pub timeout: Duration,
    pub force_kill: bool,
    pub kill_descendants: bool,
    pub then: Option<String>,
    pub verbose: bool,
    pub find_port: bool,
}

impl Args {
    /// The launch parameters these arguments describe.
    pub fn to_spec(&self) -> Result<ProcessSpec> {
        let (executable, args) = self
            .cmd
            .split_first()
            .ok_or_else(|| Error::Configuration("no command to run".into()))?;

        let mut builder = ProcessSpecBuilder::default();
        builder
            .executable(executable)
            .args(args.to_vec())
            .working_dir(&self.workdir)
            .timeout(self.timeout)
            .force_kill(self.force_kill)
            .kill_descendants(self.kill_descendants);

        for (key, value) in &self.env {
            builder.env(key.as_str(), value.as_str());
        }
        if let Some(path) = &self.stdout {
            builder.stdout(path);
        }
        if let Some(path) = &self.stderr {
            builder.stderr(path);
        }
        if let Some(pattern) = &self.wait_for_output {
            builder.wait_for_output(pattern.as_str());
        }
        if let Some(pattern) = &self.wait_for_error {
            builder.wait_for_error(pattern.as_str());
        }
        if let Some(port) = self.wait_for_port {
            builder.wait_for_port(port);
        }

        builder.build().map_err(Error::Configuration)
    }
}

pub fn app() -> App<'static, 'static> {
    App::new("execfork")
        .version(crate_version!())
        .about("Run a command in the background until it is ready, and stop it afterwards")
        .setting(AppSettings::TrailingVarArg)
        .arg(Arg::with_name("command")
                 .help("Command to run")
                 .multiple(true)
                 .required_unless("find-port"))
        .arg(Arg::with_name("workdir")
                 .help("Directory to run the command in, created if missing [default: .]")
                 .short("w")
                 .long("workdir")
                 .takes_value(true)
                 .value_name("dir"))
        .arg(Arg::with_name("env")
                 .help("Set an environment variable for the command")
                 .short("e")
                 .long("env")
                 .number_of_values(1)
                 .multiple(true)
                 .takes_value(true)
                 .value_name("KEY=VALUE"))
        .arg(Arg::with_name("stdout")
                 .help("Write the command's output to a file instead of the log")
                 .long("stdout")
                 .takes_value(true)
                 .value_name("path"))
        .arg(Arg::with_name("stderr")
                 .help("Write the command's errors to a file instead of merging them into its output")
                 .long("stderr")
                 .takes_value(true)
                 .value_name("path"))
        .arg(Arg::with_name("wait-for-output")
                 .help("Wait until the command prints this text")
                 .long("wait-for-output")
                 .takes_value(true)
                 .value_name("pattern"))
        .arg(Arg::with_name("wait-for-error")
                 .help("Wait until the command prints this text on stderr (needs --stderr)")
                 .long("wait-for-error")
                 .takes_value(true)
                 .value_name("pattern"))
        .arg(Arg::with_name("wait-for-port")
                 .help("Wait until something accepts connections on this local port")
                 .short("p")
                 .long("wait-for-port")
                 .takes_value(true)
                 .value_name("port"))
        .arg(Arg::with_name("timeout")
                 .help("Give up waiting after this many seconds")
                 .short("t")
                 .long("timeout")
                 .takes_value(true)
                 .value_name("seconds")
                 .default_value("60"))
        .arg(Arg::with_name("force-kill")
                 .help("Kill the command right away instead of asking it to stop first")
                 .long("force-kill"))
        .arg(Arg::with_name("no-kill-descendants")
                 .help("Leave processes started by the command alone when stopping it")
                 .long("no-kill-descendants"))
        .arg(Arg::with_name("name")
                 .help("Name used in log messages [default: the command's file name]")
                 .long("name")
                 .takes_value(true))
        .arg(Arg::with_name("then")
                 .help("Once the command is ready, run this shell command, then stop the command")
                 .long("then")
                 .takes_value(true)
                 .value_name("command"))
        .arg(Arg::with_name("verbose")
                 .help("Print debugging messages to stderr")
                 .short("v")
                 .long("verbose"))
        .arg(Arg::with_name("find-port")
                 .help("Print a free local port and exit")
                 .long("find-port"))
}

pub fn get_args() -> Result<Args> {
    let matches = app().get_matches();
    parse(&matches)
}

pub fn get_args_from<I, T>(args: I) -> Result<Args>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = app()
        .get_matches_from_safe(args)
        .map_err(|err| Error::Configuration(err.message))?;
    parse(&matches)
}

pub fn parse(args: &ArgMatches) -> Result<Args> {
    let cmd: Vec<String> = args
        .values_of("command")
        .map(|values| values.map(String::from).collect())
        .unwrap_or_default();

    let name = match args.value_of("name") {
        Some(name) => name.to_string(),
        None => cmd
            .first()
            .and_then(|exe| Path::new(exe).file_stem())
            .map_or_else(|| "execfork".to_string(), |stem| stem.to_string_lossy().into_owned()),
    };

    let env = args
        .values_of("env")
        .map(|values| values.map(parse_env).collect::<Result<Vec<_>>>())
        .transpose()?
        .unwrap_or_default();

    let wait_for_port = args
        .value_of("wait-for-port")
        .map(|port| {
            port.parse::<u16>()
                .map_err(|err| Error::Configuration(format!("invalid port `{}`: {}", port, err)))
        })
        .transpose()?;

    let timeout = args.value_of("timeout").unwrap_or("60");
    let timeout = timeout
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|err| Error::Configuration(format!("invalid timeout `{}`: {}", timeout, err)))?;

    Ok(Args {
        cmd,
        name,
        workdir: PathBuf::from(args.value_of("workdir").unwrap_or(".")),
        env,
        stdout: args.value_of("stdout").map(PathBuf::from),
        stderr: args.value_of("stderr").map(PathBuf::from),
        wait_for_output: args.value_of("wait-for-output").map(String::from),
        wait_for_error: args.value_of("wait-for-error").map(String::from),
        wait_for_port,
        timeout,
        force_kill: args.is_present("force-kill"),
        kill_descendants: !args.is_present("no-kill-descendants"),
        then: args.value_of("then").map(String::from),
        verbose: args.is_present("verbose"),
        find_port: args.is_present("find-port"),
    })
}

fn parse_env(pair: &str) -> Result<(String, String)> {
    pair.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| Error::Configuration(format!("`{}` is not of the form KEY=VALUE", pair)))
}
