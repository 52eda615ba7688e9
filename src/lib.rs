//! Execfork: run a process in the background for as long as it is needed
//!
//! A [`Supervisor`] launches one external process, mirrors its output to files
//! or to the log, and blocks until the process is ready: until a pattern shows
//! up in its output, a local port starts accepting connections, or both. It
//! later stops the process, gracefully first, together with everything the
//! process spawned.
//!
//! A supervisor refuses to start until a [`Terminator`] has been attached
//! through a [`LifecycleBinding`], so that every background process has
//! something responsible for stopping it.
//!
//! [`Supervisor`]: supervisor::Supervisor
//! [`Terminator`]: binding::Terminator
//! [`LifecycleBinding`]: binding::LifecycleBinding

#![deny(unsafe_code)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::default_trait_access,
    clippy::module_name_repetitions,
    clippy::missing_errors_doc
)]

#[macro_use]
extern crate clap;
#[macro_use]
extern crate derive_builder;
#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;

pub mod binding;
pub mod cli;
pub mod config;
pub mod error;
pub mod pipe;
pub mod port;
pub mod process;
pub mod registry;
pub mod run;
pub mod sink;
pub mod supervisor;
pub mod tree;

pub use binding::{LifecycleBinding, Terminator, Trigger};
pub use config::{ProcessSpec, ProcessSpecBuilder};
pub use error::{Error, Result};
pub use supervisor::{ProcessInfo, ProcessState, Supervisor};
