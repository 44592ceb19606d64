//! The Tunesmith conversation runtime.
//!
//! The [`engine::ConversationEngine`] is the only entry point: it resolves
//! the caller's identity, routes each turn through the supervisor/classifier
//! loop, dispatches to role-scoped handlers, and owns the suspension
//! protocol for human-gated mutations. Handlers propose operations by asking
//! an external text-generation service to emit a small JSON object, then
//! execute them against the repositories; the model never touches storage
//! directly and its output is never trusted for authorization.

pub mod engine;
pub mod handlers;
pub mod llm;
pub mod resolver;
pub mod supervisor;

#[cfg(test)]
mod testing;

pub use engine::{ConversationEngine, EngineReply};
pub use handlers::{
    AccountHandler, DiscoveryHandler, Handler, HandlerTurn, InvoiceDeskHandler, StorefrontHandler,
};
pub use llm::{HttpLlmClient, LlmClient};
pub use resolver::StoreIdentityResolver;
pub use supervisor::Supervisor;
