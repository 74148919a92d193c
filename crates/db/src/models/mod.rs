//! Row models and DTOs.
//!
//! Each submodule contains a `FromRow` + `Serialize` struct matching the
//! table row, plus the input DTOs its repository accepts.

pub mod dead_letter;
pub mod job;
pub mod outbox;
pub mod status;
pub mod worker_presence;
