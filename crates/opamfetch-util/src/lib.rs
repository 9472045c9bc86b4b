#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Shared utilities for opamfetch.
//!
//! This crate provides pure helper functions with no logging/tracing dependencies.
//! Logging happens in `opamfetch-core` where the I/O is orchestrated.

pub mod fs;
pub mod hash;
