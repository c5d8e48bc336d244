//! Controller module for cockroach-operator.
//!
//! Contains the reconciliation loop, the reconciler context, and error
//! handling shared by the actors.

pub mod context;
pub mod error;
pub mod reconciler;

pub use context::Context;
pub use error::{Error, Result};
