use serde::{Deserialize, Serialize};

use crate::identity::Role;

/// The closed set of task handlers the supervisor may dispatch to.
///
/// Classifier output is parsed against this enumeration; anything that does
/// not match is discarded, so free text can never name a handler outside it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerName {
    /// Catalog browsing and purchases (customer).
    Storefront,
    /// Own invoices and purchase history (customer).
    Account,
    /// Employee profile, supported customers, invoice mutations (employee).
    InvoiceDesk,
    /// Music recommendations (both roles).
    Discovery,
}

impl HandlerName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Storefront => "storefront",
            Self::Account => "account",
            Self::InvoiceDesk => "invoice_desk",
            Self::Discovery => "discovery",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "storefront" => Some(Self::Storefront),
            "account" => Some(Self::Account),
            "invoice_desk" => Some(Self::InvoiceDesk),
            "discovery" => Some(Self::Discovery),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RolePolicy {
    pub allowed: &'static [HandlerName],
    pub default: HandlerName,
}

impl RolePolicy {
    pub fn permits(&self, handler: HandlerName) -> bool {
        self.allowed.contains(&handler)
    }
}

const CUSTOMER_HANDLERS: &[HandlerName] =
    &[HandlerName::Account, HandlerName::Storefront, HandlerName::Discovery];

const EMPLOYEE_HANDLERS: &[HandlerName] = &[HandlerName::InvoiceDesk, HandlerName::Discovery];

/// Static role -> handler capability mapping. Pure, total, and read-only:
/// there is no failure path, and the mapping never changes at runtime.
#[derive(Clone, Copy, Debug, Default)]
pub struct CapabilityPolicy;

impl CapabilityPolicy {
    pub fn permitted_handlers(role: Role) -> RolePolicy {
        match role {
            Role::Customer => {
                RolePolicy { allowed: CUSTOMER_HANDLERS, default: HandlerName::Account }
            }
            Role::Employee => {
                RolePolicy { allowed: EMPLOYEE_HANDLERS, default: HandlerName::InvoiceDesk }
            }
        }
    }

    pub fn permits(role: Role, handler: HandlerName) -> bool {
        Self::permitted_handlers(role).permits(handler)
    }
}
