//! Worker process for the orbital job engine.
//!
//! Wires the queue, the execution adapter and the database into four
//! background loops: the poller, the outbox relay, the claim reaper and
//! the heartbeat. `main.rs` composes them; tests drive them directly.

pub mod active;
pub mod config;
pub mod error;
pub mod heartbeat;
pub mod poller;
pub mod reaper;
pub mod relay;
pub mod result_writer;

pub use config::WorkerConfig;
pub use error::WorkerError;
pub use poller::Worker;
