#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod alloc;
pub mod code;
pub mod config;
pub mod console;
pub mod error;
pub mod hook;
pub mod module;
pub mod orchestrator;
pub mod patcher;
pub mod policy;
pub mod symbol;
pub mod targets;

pub use error::FixError;
pub use orchestrator::{Orchestrator, Wrappers};
