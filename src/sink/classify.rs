use crate::sink::SinkError;

const PARTIAL_WRITE: &str = "partial write";
const FIELD_TYPE_CONFLICT: &str = "field type conflict";

/// Why a failed write still counts as written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DegradationKind {
    PartialWrite,
    FieldTypeConflict,
    /// Any other configured substring
    Accepted(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Success,
    /// Commit offsets, the sink dropped some points on purpose
    AcceptableDegradation(DegradationKind),
    /// Do not commit, back off and write the same points again
    Retryable,
}

impl WriteOutcome {
    pub fn should_commit(&self) -> bool {
        !matches!(self, WriteOutcome::Retryable)
    }
}

/// Maps sink write results onto commit decisions
#[derive(Debug, Clone)]
pub struct WriteClassifier {
    accepted_errors: Vec<String>,
}

impl WriteClassifier {
    pub fn new(accepted_errors: Vec<String>) -> Self {
        Self { accepted_errors }
    }

    pub fn classify(&self, result: &Result<(), SinkError>) -> WriteOutcome {
        let err = match result {
            Ok(()) => return WriteOutcome::Success,
            Err(err) => err,
        };

        let message = err.to_string();
        self.accepted_errors
            .iter()
            .find(|pattern| !pattern.is_empty() && message.contains(pattern.as_str()))
            .map(|pattern| WriteOutcome::AcceptableDegradation(degradation_kind(pattern)))
            .unwrap_or(WriteOutcome::Retryable)
    }
}

impl Default for WriteClassifier {
    fn default() -> Self {
        Self::new(crate::config::types::default_accepted_errors())
    }
}

fn degradation_kind(pattern: &str) -> DegradationKind {
    match pattern {
        PARTIAL_WRITE => DegradationKind::PartialWrite,
        FIELD_TYPE_CONFLICT => DegradationKind::FieldTypeConflict,
        other => DegradationKind::Accepted(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(status: u16, message: &str) -> Result<(), SinkError> {
        Err(SinkError::Server {
            status,
            message: message.to_string(),
        })
    }

    #[test]
    fn test_ok_is_success() {
        let outcome = WriteClassifier::default().classify(&Ok(()));
        assert_eq!(outcome, WriteOutcome::Success);
        assert!(outcome.should_commit());
    }

    #[test]
    fn test_default_degradations() {
        let classifier = WriteClassifier::default();

        assert_eq!(
            classifier.classify(&server_error(
                400,
                r#"{"error":"partial write: points beyond retention policy dropped=2"}"#
            )),
            WriteOutcome::AcceptableDegradation(DegradationKind::PartialWrite)
        );
        assert_eq!(
            classifier.classify(&server_error(
                400,
                r#"{"error":"field type conflict: input field \"value\" is type integer"}"#
            )),
            WriteOutcome::AcceptableDegradation(DegradationKind::FieldTypeConflict)
        );
    }

    #[test]
    fn test_generic_failure_is_retryable() {
        let classifier = WriteClassifier::default();

        let outcome = classifier.classify(&server_error(500, "internal error"));
        assert_eq!(outcome, WriteOutcome::Retryable);
        assert!(!outcome.should_commit());

        let outcome = classifier.classify(&Err(SinkError::Other("connection reset".into())));
        assert_eq!(outcome, WriteOutcome::Retryable);
    }

    #[test]
    fn test_configured_substrings() {
        let classifier = WriteClassifier::new(vec![
            "database not found".to_string(),
            String::new(),
        ]);

        assert_eq!(
            classifier.classify(&server_error(404, "database not found: \"metrics\"")),
            WriteOutcome::AcceptableDegradation(DegradationKind::Accepted(
                "database not found".to_string()
            ))
        );
        // Defaults are replaced, not extended
        assert_eq!(
            classifier.classify(&server_error(400, "partial write")),
            WriteOutcome::Retryable
        );
    }
}
