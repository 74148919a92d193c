//! Status enums mapping to SMALLINT lookup tables, plus the job state machine.
//!
//! Each enum variant's discriminant matches the seed data order (1-based)
//! in the corresponding `*_statuses` database table.

use std::fmt;

use serde::{Serialize, Serializer};

/// Status ID type matching SMALLINT/SMALLSERIAL in the database.
pub type StatusId = i16;

macro_rules! define_status_enum {
    (
        $(#[$meta:meta])*
        $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $val:literal => $label:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[repr(i16)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $val ),+
        }

        impl $name {
            /// Every variant, in seed order.
            pub const ALL: &'static [$name] = &[$( $name::$variant ),+];

            /// Return the database status ID.
            pub fn id(self) -> StatusId {
                self as StatusId
            }

            /// Resolve a database status ID back to its variant.
            pub fn from_id(id: StatusId) -> Option<Self> {
                match id {
                    $( $val => Some($name::$variant), )+
                    _ => None,
                }
            }

            /// Lowercase name exposed to callers and stored in lookup tables.
            pub fn as_str(self) -> &'static str {
                match self {
                    $( $name::$variant => $label, )+
                }
            }
        }

        impl From<$name> for StatusId {
            fn from(value: $name) -> Self {
                value as StatusId
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }
    };
}

define_status_enum! {
    /// Job lifecycle status.
    JobStatus {
        Pending = 1 => "pending",
        Queued = 2 => "queued",
        Processing = 3 => "processing",
        Completed = 4 => "completed",
        Failed = 5 => "failed",
        DeadLettered = 6 => "dead_lettered",
        Cancelled = 7 => "cancelled",
    }
}

define_status_enum! {
    /// Worker presence status. Informational only.
    WorkerStatus {
        Idle = 1 => "idle",
        Busy = 2 => "busy",
        Draining = 3 => "draining",
        Offline = 4 => "offline",
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

impl JobStatus {
    /// Statuses reachable from `self` in one step.
    ///
    /// `Failed` is the only state with a backward edge (to `Queued`), taken by
    /// the retry handler while retry budget remains.
    pub fn valid_transitions(self) -> &'static [JobStatus] {
        use JobStatus::*;
        match self {
            Pending => &[Queued, Cancelled],
            Queued => &[Processing, Cancelled],
            Processing => &[Completed, Failed, Cancelled],
            Failed => &[Queued, DeadLettered],
            Completed | DeadLettered | Cancelled => &[],
        }
    }

    /// Check whether a transition from `self` to `to` is valid.
    pub fn can_transition(self, to: JobStatus) -> bool {
        self.valid_transitions().contains(&to)
    }

    /// Validate a transition, returning [`CoreError::InvalidTransition`] otherwise.
    ///
    /// [`CoreError::InvalidTransition`]: crate::error::CoreError::InvalidTransition
    pub fn validate_transition(self, to: JobStatus) -> Result<(), crate::error::CoreError> {
        if self.can_transition(to) {
            Ok(())
        } else {
            Err(crate::error::CoreError::InvalidTransition { from: self, to })
        }
    }

    /// Terminal statuses are immutable once written.
    pub fn is_terminal(self) -> bool {
        self.valid_transitions().is_empty()
    }

    /// Status IDs from which an external cancel request is honoured.
    pub fn cancellable_ids() -> Vec<StatusId> {
        JobStatus::ALL
            .iter()
            .filter(|s| s.can_transition(JobStatus::Cancelled))
            .map(|s| s.id())
            .collect()
    }

    /// Status IDs that may never be rewritten.
    pub fn terminal_ids() -> Vec<StatusId> {
        JobStatus::ALL
            .iter()
            .filter(|s| s.is_terminal())
            .map(|s| s.id())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_status_ids_match_seed_data() {
        assert_eq!(JobStatus::Pending.id(), 1);
        assert_eq!(JobStatus::Queued.id(), 2);
        assert_eq!(JobStatus::Processing.id(), 3);
        assert_eq!(JobStatus::Completed.id(), 4);
        assert_eq!(JobStatus::Failed.id(), 5);
        assert_eq!(JobStatus::DeadLettered.id(), 6);
        assert_eq!(JobStatus::Cancelled.id(), 7);
    }

    #[test]
    fn worker_status_ids_match_seed_data() {
        assert_eq!(WorkerStatus::Idle.id(), 1);
        assert_eq!(WorkerStatus::Busy.id(), 2);
        assert_eq!(WorkerStatus::Draining.id(), 3);
        assert_eq!(WorkerStatus::Offline.id(), 4);
    }

    #[test]
    fn from_id_round_trips_every_variant() {
        for status in JobStatus::ALL {
            assert_eq!(JobStatus::from_id(status.id()), Some(*status));
        }
        assert_eq!(JobStatus::from_id(0), None);
        assert_eq!(JobStatus::from_id(99), None);
    }

    #[test]
    fn status_serializes_as_lowercase_name() {
        let json = serde_json::to_string(&JobStatus::DeadLettered).unwrap();
        assert_eq!(json, "\"dead_lettered\"");
        assert_eq!(JobStatus::Queued.to_string(), "queued");
    }

    #[test]
    fn forward_path_is_valid() {
        assert!(JobStatus::Pending.can_transition(JobStatus::Queued));
        assert!(JobStatus::Queued.can_transition(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition(JobStatus::Completed));
        assert!(JobStatus::Processing.can_transition(JobStatus::Failed));
        assert!(JobStatus::Failed.can_transition(JobStatus::DeadLettered));
    }

    #[test]
    fn retry_edge_is_the_only_backward_edge() {
        assert!(JobStatus::Failed.can_transition(JobStatus::Queued));
        assert!(!JobStatus::Processing.can_transition(JobStatus::Queued));
        assert!(!JobStatus::Queued.can_transition(JobStatus::Pending));
        assert!(!JobStatus::Completed.can_transition(JobStatus::Queued));
    }

    #[test]
    fn terminal_statuses_have_no_exits() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::DeadLettered.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
        assert_eq!(JobStatus::terminal_ids(), vec![4, 6, 7]);
    }

    #[test]
    fn cancel_allowed_from_pending_queued_processing() {
        assert_eq!(JobStatus::cancellable_ids(), vec![1, 2, 3]);
    }

    #[test]
    fn validate_transition_reports_both_ends() {
        let err = JobStatus::Completed
            .validate_transition(JobStatus::Processing)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid job transition: completed -> processing"
        );
    }
}
