#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Reelgate shared types and utilities
//!
//! Types, errors, and database helpers shared across the Reelgate services.

pub mod db;
pub mod types;

pub use db::*;
pub use types::*;
