//! twopenced
//!
//! Thin library half of the daemon: logging setup shared between
//! `main.rs` and anything that wants to drive the daemon
//! programmatically (e.g. an integration test spawning it in-process).
//! The request-servicing core itself lives in `twopence-core`; this
//! crate is only the CLI front door.

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod dev_tracing;
