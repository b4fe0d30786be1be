//! Shroud Core - shared error taxonomy and process types
//!
//! This crate provides the types every other Shroud crate reports through.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{ChildExit, ProcessId};
