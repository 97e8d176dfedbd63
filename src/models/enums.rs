use crate::db::DatabaseError;
use serde::{Deserialize, Serialize};

/// Macro to generate enum with as_str + std::str::FromStr pattern
macro_rules! str_enum {
    ($name:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $s)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = DatabaseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok(Self::$variant)),+,
                    _ => Err(DatabaseError::InvalidEnum {
                        field: stringify!($name).into(),
                        value: s.into(),
                    }),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

str_enum!(JobStage {
    Pending => "pending",
    Extracting => "extracting",
    Deidentifying => "deidentifying",
    InferringCodes => "inferring_codes",
    Analyzing => "analyzing",
    Complete => "complete",
    Failed => "failed",
});

impl JobStage {
    /// The canonical forward order. `Failed` is absorbing and sits outside it.
    pub const ORDER: [JobStage; 6] = [
        JobStage::Pending,
        JobStage::Extracting,
        JobStage::Deidentifying,
        JobStage::InferringCodes,
        JobStage::Analyzing,
        JobStage::Complete,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStage::Complete | JobStage::Failed)
    }

    /// Position in the forward order; `Failed` maps to the end.
    pub fn order_index(&self) -> usize {
        match self {
            JobStage::Failed => Self::ORDER.len(),
            other => Self::ORDER
                .iter()
                .position(|s| s == other)
                .unwrap_or(Self::ORDER.len()),
        }
    }

    /// The next stage in forward order, or None if terminal.
    pub fn next(&self) -> Option<JobStage> {
        match self {
            JobStage::Pending => Some(JobStage::Extracting),
            JobStage::Extracting => Some(JobStage::Deidentifying),
            JobStage::Deidentifying => Some(JobStage::InferringCodes),
            JobStage::InferringCodes => Some(JobStage::Analyzing),
            JobStage::Analyzing => Some(JobStage::Complete),
            JobStage::Complete | JobStage::Failed => None,
        }
    }

    /// Fixed progress at each stage boundary, independent of call latency.
    pub fn progress_percent(&self) -> u8 {
        match self {
            JobStage::Pending => 0,
            JobStage::Extracting => 10,
            JobStage::Deidentifying => 35,
            JobStage::InferringCodes => 55,
            JobStage::Analyzing => 90,
            JobStage::Complete => 100,
            JobStage::Failed => 0, // actual value frozen at failure time
        }
    }

    /// Human-readable label for status responses.
    pub fn step_label(&self) -> &'static str {
        match self {
            JobStage::Pending => "Queued for processing",
            JobStage::Extracting => "Extracting document text",
            JobStage::Deidentifying => "Removing identifying information",
            JobStage::InferringCodes => "Inferring billing codes",
            JobStage::Analyzing => "Analyzing coding opportunities",
            JobStage::Complete => "Analysis complete",
            JobStage::Failed => "Processing failed",
        }
    }
}

str_enum!(ErrorKind {
    Validation => "validation",
    DuplicateInFlight => "duplicate_in_flight",
    TransientStageFailure => "transient_stage_failure",
    FatalStageFailure => "fatal_stage_failure",
    Cancelled => "cancelled",
    DeliveryExhausted => "delivery_exhausted",
    SignatureMismatch => "signature_mismatch",
});

impl ErrorKind {
    /// Templated, caller-safe detail string. Collaborator error bodies are
    /// never embedded here: they may contain note content.
    pub fn detail_template(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "The submission was malformed and was not accepted",
            ErrorKind::DuplicateInFlight => {
                "A processing job for this submission is already in progress"
            }
            ErrorKind::TransientStageFailure => {
                "A processing step kept failing after several retries"
            }
            ErrorKind::FatalStageFailure => {
                "A processing step could not handle this document"
            }
            ErrorKind::Cancelled => "Processing was cancelled before completion",
            ErrorKind::DeliveryExhausted => "Notification delivery attempts were exhausted",
            ErrorKind::SignatureMismatch => "Notification signature did not verify",
        }
    }
}

str_enum!(DeliveryStatus {
    Pending => "pending",
    Delivered => "delivered",
    Failed => "failed",
});

str_enum!(EventKind {
    JobCompleted => "job.completed",
    JobFailed => "job.failed",
    JobProgress => "job.progress",
});

str_enum!(DuplicateAction {
    Skip => "skip",
    Replace => "replace",
    ProcessAsNew => "process_as_new",
});

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn stage_order_is_strictly_forward() {
        let mut stage = JobStage::Pending;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            assert!(
                next.order_index() > stage.order_index(),
                "{stage} -> {next} must move forward"
            );
            seen.push(next);
            stage = next;
        }
        assert_eq!(seen, JobStage::ORDER.to_vec());
    }

    #[test]
    fn progress_is_monotonic_across_stages() {
        let mut last = 0;
        for stage in JobStage::ORDER {
            let p = stage.progress_percent();
            assert!(p >= last, "{stage} progress {p} regressed below {last}");
            last = p;
        }
        assert_eq!(last, 100);
    }

    #[test]
    fn terminal_stages_have_no_next() {
        assert!(JobStage::Complete.next().is_none());
        assert!(JobStage::Failed.next().is_none());
        assert!(JobStage::Complete.is_terminal());
        assert!(JobStage::Failed.is_terminal());
        assert!(!JobStage::Analyzing.is_terminal());
    }

    #[test]
    fn stage_round_trips_through_str() {
        for stage in JobStage::ORDER {
            assert_eq!(JobStage::from_str(stage.as_str()).unwrap(), stage);
        }
        assert_eq!(JobStage::from_str("failed").unwrap(), JobStage::Failed);
        assert!(JobStage::from_str("bogus").is_err());
    }

    #[test]
    fn event_kind_wire_names() {
        assert_eq!(EventKind::JobCompleted.as_str(), "job.completed");
        assert_eq!(EventKind::from_str("job.failed").unwrap(), EventKind::JobFailed);
    }

    #[test]
    fn error_kind_details_never_empty() {
        for kind in [
            ErrorKind::Validation,
            ErrorKind::DuplicateInFlight,
            ErrorKind::TransientStageFailure,
            ErrorKind::FatalStageFailure,
            ErrorKind::Cancelled,
            ErrorKind::DeliveryExhausted,
            ErrorKind::SignatureMismatch,
        ] {
            assert!(!kind.detail_template().is_empty());
        }
    }
}
