//! Core domain for the Tunesmith assistant.
//!
//! This crate holds the pieces of the routing control plane that have no I/O:
//! identities and their permitted scope, the capability policy that maps a
//! role to its handler set, the append-only conversation model, the routing
//! state with its loop-prevention budget, and the suspension/resolution
//! protocol that lets a handler park a gated mutation while a human decides.
//!
//! Everything that talks to the outside world (SQLite, the text-generation
//! service, HTTP) lives in the sibling crates and depends on the contracts
//! defined here.

pub mod audit;
pub mod config;
pub mod conversation;
pub mod errors;
pub mod identity;
pub mod policy;
pub mod routing;
pub mod suspension;

pub use audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink, InMemoryAuditSink};
pub use conversation::{Conversation, ConversationId, Message, MessageRole};
pub use errors::AgentError;
pub use identity::{Identity, IdentityResolver, Role};
pub use policy::{CapabilityPolicy, HandlerName, RolePolicy};
pub use routing::{Decision, RoutingState, MAX_TURNS};
pub use suspension::{Resolution, Suspension, SuspensionKind};
