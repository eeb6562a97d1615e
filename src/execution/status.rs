//! Node execution status and its transition table.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Queued,
    Running,
    AsyncWaiting,
    TaskWaiting,
    ResourceWaiting,
    InterventionWaiting,
    Paused,
    Resumed,
    Discontinuing,
    Succeeded,
    Failed,
    Expired,
    Aborted,
    Skipped,
    Errored,
}

impl Status {
    pub const FINAL: [Status; 6] = [
        Status::Succeeded,
        Status::Failed,
        Status::Expired,
        Status::Aborted,
        Status::Skipped,
        Status::Errored,
    ];

    pub const BROKEN: [Status; 3] = [Status::Failed, Status::Expired, Status::Errored];

    /// Statuses a leaf can be interrupted in
    pub const ACTIVE: [Status; 7] = [
        Status::Queued,
        Status::Running,
        Status::AsyncWaiting,
        Status::TaskWaiting,
        Status::ResourceWaiting,
        Status::Paused,
        Status::Resumed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Queued => "QUEUED",
            Status::Running => "RUNNING",
            Status::AsyncWaiting => "ASYNC_WAITING",
            Status::TaskWaiting => "TASK_WAITING",
            Status::ResourceWaiting => "RESOURCE_WAITING",
            Status::InterventionWaiting => "INTERVENTION_WAITING",
            Status::Paused => "PAUSED",
            Status::Resumed => "RESUMED",
            Status::Discontinuing => "DISCONTINUING",
            Status::Succeeded => "SUCCEEDED",
            Status::Failed => "FAILED",
            Status::Expired => "EXPIRED",
            Status::Aborted => "ABORTED",
            Status::Skipped => "SKIPPED",
            Status::Errored => "ERRORED",
        }
    }

    pub fn is_final(&self) -> bool {
        Self::FINAL.contains(self)
    }

    pub fn is_broken(&self) -> bool {
        Self::BROKEN.contains(self)
    }

    pub fn is_positive(&self) -> bool {
        matches!(self, Status::Succeeded | Status::Skipped)
    }

    /// Suspended on a correlation (async results, task, resource grant)
    pub fn is_waiting(&self) -> bool {
        matches!(
            self,
            Status::AsyncWaiting | Status::TaskWaiting | Status::ResourceWaiting
        )
    }

    pub fn can_transition_to(&self, to: Status) -> bool {
        use Status::*;
        match self {
            Queued => matches!(
                to,
                Running | Paused | Discontinuing | Aborted | Expired | Skipped
            ),
            Running => matches!(
                to,
                AsyncWaiting
                    | TaskWaiting
                    | ResourceWaiting
                    | Paused
                    | Discontinuing
                    | Succeeded
                    | Failed
                    | Expired
                    | Aborted
                    | Skipped
                    | Errored
            ),
            AsyncWaiting | TaskWaiting | ResourceWaiting => matches!(
                to,
                Running | Paused | Discontinuing | Aborted | Expired | Failed
            ),
            Paused => matches!(to, Resumed | Discontinuing | Aborted | Expired),
            Resumed => matches!(
                to,
                Queued | Running | AsyncWaiting | TaskWaiting | ResourceWaiting | Aborted
            ),
            Discontinuing => matches!(to, Aborted | Expired | Failed),
            Failed | Expired | Errored => matches!(to, InterventionWaiting | Succeeded),
            InterventionWaiting => {
                matches!(to, Running | Succeeded | Failed | Expired | Aborted)
            }
            Succeeded | Aborted | Skipped => false,
        }
    }

    /// Status of a parent from its children's final statuses.
    ///
    /// Aborted dominates, then errored, failed and expired; a parent whose
    /// children were all skipped is skipped; otherwise it succeeded.
    pub fn aggregate<I>(statuses: I) -> Status
    where
        I: IntoIterator<Item = Status>,
    {
        let mut seen = Vec::new();
        for status in statuses {
            seen.push(status);
        }
        for dominant in [
            Status::Aborted,
            Status::Errored,
            Status::Failed,
            Status::Expired,
        ] {
            if seen.contains(&dominant) {
                return dominant;
            }
        }
        if !seen.is_empty() && seen.iter().all(|s| *s == Status::Skipped) {
            return Status::Skipped;
        }
        Status::Succeeded
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
