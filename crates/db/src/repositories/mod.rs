//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async methods. Methods
//! that stand alone take `&PgPool`; methods that must share a transaction
//! with other writes take `&mut PgConnection`.

pub mod dead_letter_repo;
pub mod job_repo;
pub mod outbox_repo;
pub mod worker_presence_repo;

pub use dead_letter_repo::DeadLetterRepo;
pub use job_repo::JobRepo;
pub use outbox_repo::OutboxRepo;
pub use worker_presence_repo::WorkerPresenceRepo;
