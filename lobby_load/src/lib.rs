//! The lobby-load identity and lobby load testing tool.
//!
//! This library supports the `lobby-load` binary found elsewhere in this
//! project: a seeding tool that resolves user emails to user IDs through the
//! IAM admin API, and a driver that holds many concurrent lobby WebSocket
//! sessions open for a bounded test window.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]
#![deny(clippy::dbg_macro)]
#![deny(unused_extern_crates)]
#![deny(unused_allocation)]
#![deny(unused_assignments)]
#![deny(unused_comparisons)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_copy_implementations)]
#![deny(missing_debug_implementations)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod deadline;
pub mod iam;
pub mod identity;
pub mod notification;
pub mod ramp;
pub mod seed;
pub mod session;
