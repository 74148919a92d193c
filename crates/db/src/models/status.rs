//! Status enums live in `orbital_core::status`; re-exported here so
//! repositories and callers can import them next to the row models.

pub use orbital_core::status::{JobStatus, StatusId, WorkerStatus};
