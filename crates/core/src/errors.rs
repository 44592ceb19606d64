use thiserror::Error;

/// Failure taxonomy for the routing control plane.
///
/// Authorization and scope failures are intercepted before control returns to
/// the supervisor loop and never reach the classifier's context; callers
/// should surface [`AgentError::user_message`] rather than the raw error.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AgentError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("subject {subject_id} is outside the caller's permitted scope")]
    ScopeViolation { subject_id: i64 },
    #[error("no suspension is pending for conversation {conversation_id}")]
    NoPendingSuspension { conversation_id: String },
    #[error("a suspension is already pending for conversation {conversation_id}")]
    SuspensionAlreadyPending { conversation_id: String },
    #[error("resolution shape does not match the pending suspension kind")]
    SuspensionKindMismatch,
    #[error("classifier call failed: {0}")]
    ClassifierFailure(String),
    #[error("mutation failed after approval: {0}")]
    MutationFailure(String),
    #[error("storage failure: {0}")]
    Storage(String),
}

impl AgentError {
    /// User-safe rendering. Deliberately generic for auth failures so the
    /// error content cannot be used to enumerate identities.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Unauthorized => "Authentication failed.",
            Self::ScopeViolation { .. } => {
                "You are not permitted to act on that record. No changes were made."
            }
            Self::NoPendingSuspension { .. } => {
                "There is nothing awaiting confirmation on this conversation."
            }
            Self::SuspensionAlreadyPending { .. } => {
                "A confirmation is already pending. Resolve it before sending a new request."
            }
            Self::SuspensionKindMismatch => {
                "The supplied decision does not match the pending request."
            }
            Self::ClassifierFailure(_) => "The assistant is temporarily unavailable.",
            Self::MutationFailure(_) => {
                "The action was approved but could not be completed. No partial changes were kept."
            }
            Self::Storage(_) => "The service is temporarily unavailable. Please retry shortly.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::AgentError;

    #[test]
    fn unauthorized_message_carries_no_identity_detail() {
        let message = AgentError::Unauthorized.user_message();
        assert_eq!(message, "Authentication failed.");
        assert!(!message.to_ascii_lowercase().contains("employee"));
        assert!(!message.to_ascii_lowercase().contains("customer"));
    }

    #[test]
    fn scope_violation_renders_as_denial_not_crash() {
        let err = AgentError::ScopeViolation { subject_id: 62 };
        assert!(err.user_message().contains("No changes were made"));
        assert_eq!(err.to_string(), "subject 62 is outside the caller's permitted scope");
    }

    #[test]
    fn mutation_failure_tells_the_user_nothing_was_kept() {
        let err = AgentError::MutationFailure("invoice insert failed".to_string());
        assert!(err.user_message().contains("approved but could not be completed"));
    }
}
