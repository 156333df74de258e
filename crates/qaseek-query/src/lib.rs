//! Query execution for qaseek.
//!
//! [`QueryEngine`] embeds a free-text question once, runs a kNN search
//! against a vector collection and returns the hits in the index's order.

pub mod executor;

pub use executor::QueryEngine;
