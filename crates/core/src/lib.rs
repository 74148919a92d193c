//! Domain logic for the orbital job engine.
//!
//! Zero internal dependencies: everything here is usable from the
//! persistence layer, the worker, and tests without a database.

pub mod error;
pub mod execution;
pub mod retry;
pub mod status;
pub mod types;
