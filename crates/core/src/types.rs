/// All database primary keys are PostgreSQL BIGSERIAL.
pub type DbId = i64;

/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Ordering value among ready jobs. Higher values are claimed first.
pub type Priority = i32;

/// Queue lane used when a submission does not name one.
pub const DEFAULT_QUEUE_NAME: &str = "default";

/// Retry ceiling applied to jobs submitted without an explicit one.
pub const DEFAULT_MAX_RETRIES: i32 = 5;
