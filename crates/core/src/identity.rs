use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::AgentError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Employee,
    Customer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Employee => "employee",
            Self::Customer => "customer",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "employee" => Some(Self::Employee),
            "customer" => Some(Self::Customer),
            _ => None,
        }
    }
}

/// Resolved caller identity for one routing cycle.
///
/// `scope` is the set of customer ids an employee may act on behalf of.
/// Customers carry an empty scope and are always scoped to themselves.
/// An identity is never cached across requests; every inbound call resolves
/// it afresh against the subject store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub subject_id: i64,
    pub role: Role,
    pub name: String,
    pub scope: BTreeSet<i64>,
}

impl Identity {
    pub fn customer(subject_id: i64, name: impl Into<String>) -> Self {
        Self { subject_id, role: Role::Customer, name: name.into(), scope: BTreeSet::new() }
    }

    pub fn employee(
        subject_id: i64,
        name: impl Into<String>,
        scope: impl IntoIterator<Item = i64>,
    ) -> Self {
        Self {
            subject_id,
            role: Role::Employee,
            name: name.into(),
            scope: scope.into_iter().collect(),
        }
    }

    /// Whether this identity may act on the given subject id: customers only
    /// on themselves, employees only on customers they support.
    pub fn may_act_on(&self, subject_id: i64) -> bool {
        match self.role {
            Role::Customer => subject_id == self.subject_id,
            Role::Employee => self.scope.contains(&subject_id),
        }
    }

    pub fn check_scope(&self, subject_id: i64) -> Result<(), AgentError> {
        if self.may_act_on(subject_id) {
            Ok(())
        } else {
            Err(AgentError::ScopeViolation { subject_id })
        }
    }
}

/// Boundary to the external subject store.
///
/// `resolve` maps an opaque bearer credential to an identity; a miss is a
/// single generic [`AgentError::Unauthorized`] regardless of whether the
/// credential looked like an employee or a customer. `rehydrate` rebuilds an
/// identity from the `(role, subject_id)` a conversation was created under,
/// used by the resume path which carries no credential.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve(&self, credential: &str) -> Result<Identity, AgentError>;

    async fn rehydrate(&self, role: Role, subject_id: i64) -> Result<Identity, AgentError>;
}

#[cfg(test)]
mod tests {
    use super::{Identity, Role};
    use crate::errors::AgentError;

    #[test]
    fn customer_is_scoped_to_itself_only() {
        let identity = Identity::customer(61, "Astrid");
        assert!(identity.may_act_on(61));
        assert!(!identity.may_act_on(60));
        assert!(identity.scope.is_empty());
    }

    #[test]
    fn employee_is_scoped_to_supported_customers() {
        let identity = Identity::employee(3, "Jane", [60, 61]);
        assert!(identity.may_act_on(60));
        assert!(identity.may_act_on(61));
        assert!(!identity.may_act_on(62));
        // Employees are not implicitly in their own customer scope.
        assert!(!identity.may_act_on(3));
    }

    #[test]
    fn check_scope_reports_the_offending_subject() {
        let identity = Identity::employee(3, "Jane", [60, 61]);
        let err = identity.check_scope(62).expect_err("62 is out of scope");
        assert!(matches!(err, AgentError::ScopeViolation { subject_id: 62 }));
    }

    #[test]
    fn role_round_trips_through_strings() {
        assert_eq!(Role::parse("Employee"), Some(Role::Employee));
        assert_eq!(Role::parse(" customer "), Some(Role::Customer));
        assert_eq!(Role::parse("manager"), None);
        assert_eq!(Role::Employee.as_str(), "employee");
    }
}
