use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use tunesmith_core::{AgentError, Identity, IdentityResolver, Role};
use tunesmith_db::repositories::SubjectRepository;

/// Identity resolution backed by the subject store.
///
/// A credential that matches nothing collapses to the same generic
/// [`AgentError::Unauthorized`] as a malformed one; nothing in the error or
/// the log line says which identity class was probed.
pub struct StoreIdentityResolver {
    subjects: Arc<dyn SubjectRepository>,
}

impl StoreIdentityResolver {
    pub fn new(subjects: Arc<dyn SubjectRepository>) -> Self {
        Self { subjects }
    }
}

#[async_trait]
impl IdentityResolver for StoreIdentityResolver {
    async fn resolve(&self, credential: &str) -> Result<Identity, AgentError> {
        if credential.trim().is_empty() {
            return Err(AgentError::Unauthorized);
        }

        match self.subjects.find_identity_by_credential(credential).await {
            Ok(Some(identity)) => Ok(identity),
            Ok(None) => {
                warn!(event_name = "identity.resolve_failed", "credential matched no subject");
                Err(AgentError::Unauthorized)
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn rehydrate(&self, role: Role, subject_id: i64) -> Result<Identity, AgentError> {
        match self.subjects.find_identity_by_subject(role, subject_id).await {
            Ok(Some(identity)) => Ok(identity),
            Ok(None) => {
                warn!(
                    event_name = "identity.rehydrate_failed",
                    subject_id, "stored subject no longer exists"
                );
                Err(AgentError::Unauthorized)
            }
            Err(error) => Err(error.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tunesmith_core::{AgentError, Identity, IdentityResolver, Role};
    use tunesmith_db::repositories::InMemorySubjectRepository;

    use super::StoreIdentityResolver;

    fn resolver_with(identities: Vec<Identity>) -> StoreIdentityResolver {
        let subjects = InMemorySubjectRepository::new();
        for identity in identities {
            subjects.insert(identity);
        }
        StoreIdentityResolver::new(Arc::new(subjects))
    }

    #[tokio::test]
    async fn unknown_credentials_fail_identically() {
        let resolver = resolver_with(vec![Identity::customer(61, "Astrid Gruber")]);

        let missing = resolver.resolve("nobody").await.expect_err("unknown");
        let empty = resolver.resolve("  ").await.expect_err("blank");
        assert_eq!(missing, AgentError::Unauthorized);
        assert_eq!(empty, AgentError::Unauthorized);
    }

    #[tokio::test]
    async fn rehydrate_rebuilds_the_stored_identity() {
        let employee = Identity::employee(3, "Jane Peacock", [60, 61]);
        let resolver = resolver_with(vec![employee.clone()]);

        let rehydrated = resolver.rehydrate(Role::Employee, 3).await.expect("rehydrate");
        assert_eq!(rehydrated, employee);

        let gone = resolver.rehydrate(Role::Customer, 3).await.expect_err("wrong role");
        assert_eq!(gone, AgentError::Unauthorized);
    }
}
