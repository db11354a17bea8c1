use chrono::{DateTime, Utc};

/// Run mode of the queue. At most one non-idle mode is active at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    Idle,
    /// User-initiated, highest priority.
    Immediate,
    /// Periodic run; only jobs due by the admission time are executed.
    Scheduled,
}

impl QueueMode {
    /// Whether a batch running in this mode may be replaced by `other`.
    pub fn can_be_interrupted_by(self, other: QueueMode) -> bool {
        matches!((self, other), (QueueMode::Idle, _) | (_, QueueMode::Immediate))
    }

    /// Date limiting which jobs run, given the time the batch was admitted.
    pub fn priority_date(self, admitted_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            QueueMode::Scheduled => Some(admitted_at),
            QueueMode::Idle | QueueMode::Immediate => None,
        }
    }

    pub fn is_idle(self) -> bool {
        self == QueueMode::Idle
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueueMode::Idle => "idle",
            QueueMode::Immediate => "immediate",
            QueueMode::Scheduled => "scheduled",
        }
    }
}

impl std::fmt::Display for QueueMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
