//! The tagserve synthetic tag request generator.
//!
//! This library supports the tagserve binary found elsewhere in this project.
//! Traffic models, sampling and marshalling live in `tagserve_payload`; the
//! bits here drive that core from concurrent virtual users and publish what
//! they produce.

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
pub mod generator;
pub mod harness;
pub mod publish;
pub mod signals;
