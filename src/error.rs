use std::{error::Error as StdError, fmt, io, sync::PoisonError, time::Duration};

pub type Result<T> = ::std::result::Result<T, Error>;

#[non_exhaustive]
pub enum Error {
    /// The supervisor was misconfigured, e.g. started without a terminator.
    Configuration(String),
    /// The awaited output pattern did not show up in time.
    PatternTimeout {
        stream: String,
        pattern: String,
        timeout: Duration,
    },
    /// Nothing accepted connections on the awaited port in time.
    PortTimeout {
        port: u16,
        timeout: Duration,
        /// Name of the supervised process, once known.
        process: Option<String>,
    },
    /// The process went away before the awaited condition was met.
    ///
    /// `awaited` reads as the end of "died before ...", e.g. `port 8080 was opened`.
    ProcessDiedEarly {
        awaited: String,
        process: Option<String>,
    },
    Io(io::Error),
    PoisonedLock,
    Generic(String),
}

impl StdError for Error {}

impl Error {
    /// Names the supervised process in errors that do not mention it yet.
    pub fn attributed_to(self, name: &str) -> Self {
        match self {
            Self::PortTimeout {
                port,
                timeout,
                process: None,
            } => Self::PortTimeout {
                port,
                timeout,
                process: Some(name.to_string()),
            },
            Self::ProcessDiedEarly {
                awaited,
                process: None,
            } => Self::ProcessDiedEarly {
                awaited,
                process: Some(name.to_string()),
            },
            other => other,
        }
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Self::Generic(err)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_err: PoisonError<T>) -> Self {
        Self::PoisonedLock
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (error_type, error) = match self {
            Self::Configuration(err) => ("Configuration", err.clone()),
            Self::PatternTimeout {
                stream,
                pattern,
                timeout,
            } => (
                "Pattern",
                format!(
                    "the `{}` pattern did not appear on {} before the timeout of {}s was reached",
                    pattern,
                    stream,
                    timeout.as_secs_f64()
                ),
            ),
            Self::PortTimeout {
                port,
                timeout,
                process,
            } => (
                "Port",
                format!(
                    "timed out after {}s waiting for port {} to be opened{}",
                    timeout.as_secs_f64(),
                    port,
                    process
                        .as_ref()
                        .map(|name| format!(" by `{}`", name))
                        .unwrap_or_default()
                ),
            ),
            Self::ProcessDiedEarly { awaited, process } => (
                "Process",
                match process {
                    Some(name) => format!("process `{}` died before {}", name, awaited),
                    None => format!("process died before {}", awaited),
                },
            ),
            Self::Io(err) => ("I/O", err.to_string()),
            Self::PoisonedLock => ("Internal", "poisoned lock".to_string()),
            Self::Generic(err) => ("Execfork", err.clone()),
        };

        write!(f, "{} error: {}", error_type, error)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
