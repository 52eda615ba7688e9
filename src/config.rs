//! Launch parameters for a supervised process.
//!
//! The [`ProcessSpec`] struct is not constructable, use [`ProcessSpecBuilder`].
//!
//! # Examples
//!
//! ```
//! # use execfork::config::ProcessSpecBuilder;
//! # use std::time::Duration;
//! ProcessSpecBuilder::default()
//!     .executable("java")
//!     .args(vec!["-jar".into(), "server.jar".into()])
//!     .working_dir("build/server")
//!     .wait_for_port(8080_u16)
//!     .timeout(Duration::from_secs(30))
//!     .build()
//!     .expect("mission failed");
//! ```

use std::{collections::HashMap, path::PathBuf, time::Duration};

/// How long a supervised process gets to start before waits fail.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Everything needed to launch and later stop one background process.
#[derive(Builder, Clone, Debug)]
#[builder(setter(into, strip_option))]
#[builder(build_fn(validate = "Self::validate"))]
#[non_exhaustive]
pub struct ProcessSpec {
    /// Program to run.
    pub executable: PathBuf,
    /// Arguments passed to the program, in order.
    #[builder(default)]
    pub args: Vec<String>,
    /// Directory the program runs in. Created if missing.
    pub working_dir: PathBuf,
    /// Variables set on top of the inherited environment.
    #[builder(default)]
    pub environment: HashMap<String, String>,
    /// File to write standard output to. When absent, output is logged line by line.
    #[builder(default)]
    pub stdout: Option<PathBuf>,
    /// File to write standard error to. When absent, stderr is merged into stdout.
    #[builder(default)]
    pub stderr: Option<PathBuf>,
    /// Block `start()` until this text is seen on stdout.
    #[builder(default)]
    pub wait_for_output: Option<String>,
    /// Block `start()` until this text is seen on stderr.
    ///
    /// Only honoured when stderr is captured separately.
    #[builder(default)]
    pub wait_for_error: Option<String>,
    /// Block `start()` until this local TCP port accepts connections.
    #[builder(default)]
    pub wait_for_port: Option<u16>,
    /// Upper bound for each of the waits above.
    #[builder(default = "DEFAULT_TIMEOUT")]
    pub timeout: Duration,
    /// Skip the graceful termination attempt when stopping.
    #[builder(default)]
    pub force_kill: bool,
    /// Also terminate processes spawned by the supervised one.
    #[builder(default = "true")]
    pub kill_descendants: bool,
}

impl ProcessSpec {
    /// The command line as it would be typed, for log messages.
    pub fn command_line(&self) -> String {
        let mut line = self.executable.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

impl ProcessSpecBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(executable) = &self.executable {
            if executable.as_os_str().is_empty() {
                return Err("executable must not be empty".into());
            }
        }

        if let Some(Some(0)) = self.wait_for_port {
            return Err("wait_for_port must not be 0".into());
        }

        for (name, pattern) in &[
            ("wait_for_output", &self.wait_for_output),
            ("wait_for_error", &self.wait_for_error),
        ] {
            if let Some(Some(pattern)) = pattern {
                if pattern.is_empty() {
                    return Err(format!("{} must not be empty", name));
                }
            }
        }

        if self.timeout.map_or(false, |t| t == Duration::from_secs(0)) {
            return Err("timeout must be greater than zero".into());
        }

        Ok(())
    }

    /// Append a single argument.
    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.get_or_insert_with(Vec::new).push(arg.into());
        self
    }

    /// Set a single environment variable, keeping the others.
    pub fn env(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.environment
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::{ProcessSpecBuilder, DEFAULT_TIMEOUT};
    use std::time::Duration;

    fn minimal() -> ProcessSpecBuilder {
        let mut builder = ProcessSpecBuilder::default();
        builder.executable("server").working_dir("/tmp");
        builder
    }

    #[test]
    fn defaults_follow_the_documented_surface() {
        let spec = minimal().build().expect("minimal spec builds");
        assert!(spec.args.is_empty());
        assert!(spec.environment.is_empty());
        assert_eq!(spec.stdout, None);
        assert_eq!(spec.stderr, None);
        assert_eq!(spec.wait_for_output, None);
        assert_eq!(spec.wait_for_error, None);
        assert_eq!(spec.wait_for_port, None);
        assert_eq!(spec.timeout, DEFAULT_TIMEOUT);
        assert_eq!(spec.timeout, Duration::from_secs(60));
        assert!(!spec.force_kill);
        assert!(spec.kill_descendants);
    }

    #[test]
    fn executable_and_working_dir_are_required() {
        assert!(ProcessSpecBuilder::default()
            .working_dir("/tmp")
            .build()
            .is_err());
        assert!(ProcessSpecBuilder::default()
            .executable("server")
            .build()
            .is_err());
        assert!(ProcessSpecBuilder::default()
            .executable("")
            .working_dir("/tmp")
            .build()
            .is_err());
    }

    #[test]
    fn rejects_degenerate_waits() {
        assert!(minimal().wait_for_port(0_u16).build().is_err());
        assert!(minimal().wait_for_output("").build().is_err());
        assert!(minimal().wait_for_error("").build().is_err());
        assert!(minimal()
            .timeout(Duration::from_secs(0))
            .build()
            .is_err());
    }

    #[test]
    fn incremental_setters_accumulate() {
        let spec = minimal()
            .arg("--port")
            .arg("8080")
            .env("A", "1")
            .env("B", "2")
            .env("A", "3")
            .build()
            .expect("spec builds");
        assert_eq!(spec.args, vec!["--port".to_string(), "8080".to_string()]);
        assert_eq!(spec.environment.len(), 2);
        assert_eq!(spec.environment["A"], "3");
        assert_eq!(spec.command_line(), "server --port 8080");
    }
}
