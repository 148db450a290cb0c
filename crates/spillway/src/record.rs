//! The persisted unit of pipeline state.
//!
//! A `Record` describes one bucket file as it moves through the pipeline:
//!
//! ```text
//! WRITING → WRITTEN → PREPARING → PREPARED → UPLOADING → UPLOADED
//!    ↓                    ↓                      ↓
//! WRITE_ERROR        PREP_ERROR              UPLOAD_ERROR
//! ```
//!
//! Records are only mutated through the tracker, which checks ownership and
//! transition legality on every update.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Pipeline state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Writing,
    Written,
    WriteError,
    Preparing,
    Prepared,
    PrepError,
    Uploading,
    Uploaded,
    UploadError,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Writing => "WRITING",
            State::Written => "WRITTEN",
            State::WriteError => "WRITE_ERROR",
            State::Preparing => "PREPARING",
            State::Prepared => "PREPARED",
            State::PrepError => "PREP_ERROR",
            State::Uploading => "UPLOADING",
            State::Uploaded => "UPLOADED",
            State::UploadError => "UPLOAD_ERROR",
        }
    }

    /// States a record may be in for a transition into `self` to be legal.
    ///
    /// Processing states list themselves so a sweep can re-drive a record
    /// abandoned mid-stage.
    pub fn legal_predecessors(&self) -> &'static [State] {
        match self {
            State::Writing => &[],
            State::Written | State::WriteError => &[State::Writing],
            State::Preparing => &[State::Written, State::Preparing, State::PrepError],
            State::Prepared | State::PrepError => &[State::Preparing],
            State::Uploading => &[State::Prepared, State::Uploading, State::UploadError],
            State::Uploaded | State::UploadError => &[State::Uploading],
        }
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: State) -> bool {
        next.legal_predecessors().contains(self)
    }

    /// No transition leaves these states.
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::WriteError | State::Uploaded)
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self,
            State::WriteError | State::PrepError | State::UploadError
        )
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Globally unique identity of a record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordId {
    pub cohort: String,
    pub serial: u64,
}

impl RecordId {
    pub fn new(cohort: impl Into<String>, serial: u64) -> Self {
        Self {
            cohort: cohort.into(),
            serial,
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.cohort, self.serial)
    }
}

/// One bucket file and everything the pipeline knows about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Bucket representation this file belongs to.
    pub cohort: String,
    /// Per-cohort sequence number, starting at 1.
    pub serial: u64,
    /// Start of the time bucket.
    pub start_time: DateTime<Utc>,
    /// Local file the ingest worker writes.
    pub origin_path: PathBuf,
    /// Output of the prepare transform.
    pub prepared_path: Option<PathBuf>,
    /// Metadata needed to reverse the prepare transform.
    pub archive_key: Option<String>,
    /// Remote location after upload.
    pub archive_uri: Option<String>,
    /// Remote grouping (bucket, container, tenant).
    pub archive_group: Option<String>,
    pub state: State,
    /// Node currently responsible for advancing this record.
    pub owner_uri: String,
    /// Bytes on disk once writing finished.
    pub byte_size: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Record {
    /// A fresh record in WRITING state.
    pub fn writing(
        id: RecordId,
        start_time: DateTime<Utc>,
        origin_path: PathBuf,
        owner_uri: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            cohort: id.cohort,
            serial: id.serial,
            start_time,
            origin_path,
            prepared_path: None,
            archive_key: None,
            archive_uri: None,
            archive_group: None,
            state: State::Writing,
            owner_uri: owner_uri.into(),
            byte_size: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> RecordId {
        RecordId::new(self.cohort.clone(), self.serial)
    }

    /// File the next stage should read: the prepared output if any.
    pub fn payload_path(&self) -> &std::path::Path {
        self.prepared_path.as_deref().unwrap_or(&self.origin_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [State; 9] = [
        State::Writing,
        State::Written,
        State::WriteError,
        State::Preparing,
        State::Prepared,
        State::PrepError,
        State::Uploading,
        State::Uploaded,
        State::UploadError,
    ];

    #[test]
    fn test_happy_path_is_legal() {
        let path = [
            State::Writing,
            State::Written,
            State::Preparing,
            State::Prepared,
            State::Uploading,
            State::Uploaded,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_retry_loops_are_legal() {
        assert!(State::PrepError.can_transition_to(State::Preparing));
        assert!(State::Preparing.can_transition_to(State::Preparing));
        assert!(State::UploadError.can_transition_to(State::Uploading));
        assert!(State::Uploading.can_transition_to(State::Uploading));
    }

    #[test]
    fn test_terminal_states_have_no_exit() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be illegal");
            }
        }
    }

    #[test]
    fn test_no_backwards_transitions() {
        assert!(!State::Prepared.can_transition_to(State::Written));
        assert!(!State::Uploaded.can_transition_to(State::Uploading));
        assert!(!State::Written.can_transition_to(State::WriteError));
        assert!(!State::Written.can_transition_to(State::Uploading));
    }

    #[test]
    fn test_state_serde_names() {
        let json = serde_json::to_string(&State::PrepError).unwrap();
        assert_eq!(json, "\"PREP_ERROR\"");
        let back: State = serde_json::from_str("\"UPLOAD_ERROR\"").unwrap();
        assert_eq!(back, State::UploadError);
        for state in ALL {
            assert_eq!(serde_json::to_string(&state).unwrap(), format!("\"{state}\""));
        }
    }

    #[test]
    fn test_record_id_display_and_order() {
        let a = RecordId::new("2020-01-01T03", 2);
        let b = RecordId::new("2020-01-01T03", 10);
        assert_eq!(a.to_string(), "2020-01-01T03#2");
        assert!(a < b);
    }

    #[test]
    fn test_payload_path_prefers_prepared() {
        let now = Utc::now();
        let mut record = Record::writing(
            RecordId::new("c", 1),
            now,
            PathBuf::from("/tmp/a.log"),
            "node://a",
            now,
        );
        assert_eq!(record.payload_path(), std::path::Path::new("/tmp/a.log"));
        record.prepared_path = Some(PathBuf::from("/tmp/a.log.gz"));
        assert_eq!(record.payload_path(), std::path::Path::new("/tmp/a.log.gz"));
    }
}
