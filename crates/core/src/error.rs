//! Request error taxonomy.
//!
//! Pipeline plumbing uses `anyhow` throughout; a [`GradeError`] is attached
//! to the chain at the point where a failure becomes classifiable so that
//! the HTTP layer can map it to a status code without string matching.

use thiserror::Error;

/// Classified failure categories for a grading request.
///
/// A request either yields a complete output video or fails with one of
/// these; there is no partial-output state.
#[derive(Debug, Error)]
pub enum GradeError {
    /// Unreadable or unsupported input video/image. Surfaced immediately,
    /// never retried.
    #[error("input error: {0}")]
    Input(String),

    /// Extractor or diffuser raised, or returned malformed output. The
    /// models are deterministic, so an automatic retry would reproduce
    /// the same failure.
    #[error("model error: {0}")]
    Model(String),

    /// LUT reshape contract violated. Fatal to the request.
    #[error("LUT shape error: {0}")]
    Shape(String),

    /// Accelerator memory exhaustion or similar during a batch.
    #[error("resource error: {0}")]
    Resource(String),

    /// Downstream encoder process failed or exited non-zero.
    #[error("encode error: {0}")]
    Encode(String),
}

impl GradeError {
    /// Finds the first `GradeError` anywhere in an anyhow chain.
    pub fn classify(err: &anyhow::Error) -> Option<&GradeError> {
        err.chain().find_map(|cause| cause.downcast_ref::<GradeError>())
    }

    /// True for caller mistakes (bad input, bad LUT contract) as opposed
    /// to service-side failures.
    pub fn is_caller_fault(&self) -> bool {
        matches!(self, GradeError::Input(_) | GradeError::Shape(_))
    }
}

/// Free-function form of [`GradeError::classify`] for call sites that
/// only have an `anyhow::Error` in hand.
pub fn classify(err: &anyhow::Error) -> Option<&GradeError> {
    GradeError::classify(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classify_finds_error_through_context_chain() {
        let err = anyhow::Error::from(GradeError::Input("no such file".into()))
            .context("while opening video")
            .context("request failed");

        let classified = GradeError::classify(&err).expect("should classify");
        assert!(matches!(classified, GradeError::Input(_)));
        assert!(classified.is_caller_fault());
    }

    #[test]
    fn classify_returns_none_for_unclassified() {
        let err = anyhow::anyhow!("something else entirely");
        assert!(GradeError::classify(&err).is_none());
    }

    #[test]
    fn server_faults_are_not_caller_faults() {
        assert!(!GradeError::Model("diffuser failed".into()).is_caller_fault());
        assert!(!GradeError::Resource("out of memory".into()).is_caller_fault());
        assert!(!GradeError::Encode("ffmpeg exited 1".into()).is_caller_fault());
        assert!(GradeError::Shape("not a cube".into()).is_caller_fault());
    }

    #[test]
    fn display_includes_category_and_message() {
        let err = GradeError::Encode("exit status 1".into());
        assert_eq!(err.to_string(), "encode error: exit status 1");
    }
}
