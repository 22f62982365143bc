//! Command line front end of the callprof sampling profiler.
//!
//! The binary links the engine from `callprof-agent`, runs a built-in
//! workload under it and renders the resulting call-trace profile with
//! symbols read from its own executable.

pub mod cli;
pub mod commands;
pub mod error;
pub mod process;
pub mod symbols;
pub mod workload;

pub use error::{Error, Result};
