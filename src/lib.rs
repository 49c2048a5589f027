#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

pub mod archive;
pub mod classfile;
pub mod compile;
pub mod config;
mod core;
pub mod engine;
mod error;
pub mod fingerprint;
pub mod package;
pub mod pipeline;
pub mod relocate;
pub mod resolve;
pub mod stage;
pub mod template;
pub mod utils;

#[cfg(test)]
mod testing;

pub use crate::config::{CONFIG_FILE, ProjectConfig};
pub use crate::core::{Fingerprint, Hash32};
pub use crate::engine::{BuildReport, Graph, GraphBuilder, Outcome, SkipReason, TaskState};
pub use crate::error::*;
pub use crate::pipeline::{Invocation, Pipeline};
