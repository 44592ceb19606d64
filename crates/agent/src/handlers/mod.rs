//! The four task handlers and their shared contract.
//!
//! Handlers share one shape: look at the conversation through the bounded
//! context window, ask the text-generation service to propose a structured
//! operation (or a direct reply), execute the proposal against the store, and
//! hand control back to the supervisor. Irreversible operations never run
//! directly: the handler prepares them read-only, parks a [`Suspension`], and
//! the commit step runs only after a human resolution arrives.

use serde_json::{Map, Value};

use async_trait::async_trait;

use tunesmith_core::{AgentError, Conversation, HandlerName, Identity, Message, Suspension};

pub mod account;
pub mod discovery;
pub mod invoice_desk;
pub mod storefront;

pub use account::AccountHandler;
pub use discovery::DiscoveryHandler;
pub use invoice_desk::InvoiceDeskHandler;
pub use storefront::StorefrontHandler;

/// Output of one handler turn: messages to append to the transcript and, for
/// gated operations, the suspension to park.
#[derive(Debug, Default)]
pub struct HandlerTurn {
    pub messages: Vec<Message>,
    pub suspension: Option<Suspension>,
}

impl HandlerTurn {
    pub fn reply(text: impl Into<String>) -> Self {
        Self { messages: vec![Message::assistant(text)], suspension: None }
    }

    pub fn suspend(suspension: Suspension) -> Self {
        let prompt = suspension.prompt.clone();
        Self { messages: vec![Message::assistant(prompt)], suspension: Some(suspension) }
    }
}

/// Shared contract across the concrete handlers. `run` handles an ordinary
/// dispatch; `resolve` re-enters a handler after its parked suspension was
/// answered, carrying only the captured args and the human's decision.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> HandlerName;

    async fn run(
        &self,
        conversation: &Conversation,
        identity: &Identity,
    ) -> Result<HandlerTurn, AgentError>;

    async fn resolve(
        &self,
        suspension: &Suspension,
        accepted: bool,
        identity: &Identity,
    ) -> Result<HandlerTurn, AgentError> {
        let _ = (suspension, accepted, identity);
        Err(AgentError::MutationFailure(format!(
            "handler {} exposes no gated operations",
            self.name().as_str()
        )))
    }
}

/// A structured operation proposal parsed out of a model reply.
#[derive(Clone, Debug, PartialEq)]
pub struct Proposal {
    pub operation: String,
    pub args: Map<String, Value>,
}

impl Proposal {
    pub fn arg_i64(&self, key: &str) -> Option<i64> {
        match self.args.get(key) {
            Some(Value::Number(number)) => number.as_i64(),
            Some(Value::String(text)) => text.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn arg_str(&self, key: &str) -> Option<&str> {
        self.args.get(key).and_then(Value::as_str)
    }

    pub fn as_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("operation".to_string(), Value::String(self.operation.clone()));
        object.insert("args".to_string(), Value::Object(self.args.clone()));
        Value::Object(object)
    }
}

/// Extracts an `{"operation": ..., "args": {...}}` object from a model reply.
/// Code fences and surrounding prose are tolerated; anything else is treated
/// as a direct natural-language reply.
pub fn parse_proposal(reply: &str) -> Option<Proposal> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end <= start {
        return None;
    }

    let value: Value = serde_json::from_str(&reply[start..=end]).ok()?;
    let object = value.as_object()?;
    let operation = object.get("operation")?.as_str()?.trim().to_ascii_lowercase();
    let args = match object.get("args") {
        Some(Value::Object(args)) => args.clone(),
        None => Map::new(),
        Some(_) => return None,
    };

    Some(Proposal { operation, args })
}

/// System prompt shared by the handlers: identity context plus the JSON
/// proposal protocol and the handler's own operation list.
pub(crate) fn operation_instructions(
    identity: &Identity,
    purpose: &str,
    operations: &[(&str, &str)],
) -> String {
    let mut operation_lines = String::new();
    for (name, description) in operations {
        operation_lines.push_str("- ");
        operation_lines.push_str(name);
        operation_lines.push_str(": ");
        operation_lines.push_str(description);
        operation_lines.push('\n');
    }

    format!(
        "You are the {purpose} for a music store assistant.\n\
         The caller is a {role} named {name} (subject id {subject_id}).\n\
         To run an operation reply with a single JSON object:\n\
         {{\"operation\": \"<name>\", \"args\": {{...}}}}\n\
         Operations:\n{operation_lines}\
         If no operation applies, reply in plain language instead.",
        role = identity.role.as_str(),
        name = identity.name,
        subject_id = identity.subject_id,
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::parse_proposal;

    #[test]
    fn parses_a_bare_json_proposal() {
        let proposal =
            parse_proposal(r#"{"operation": "Purchase_Track", "args": {"track_id": 7}}"#)
                .expect("proposal");
        assert_eq!(proposal.operation, "purchase_track");
        assert_eq!(proposal.arg_i64("track_id"), Some(7));
    }

    #[test]
    fn parses_a_fenced_proposal_with_prose() {
        let reply = "Sure, running that now:\n```json\n\
                     {\"operation\": \"search_tracks\", \"args\": {\"query\": \"jazz\"}}\n```";
        let proposal = parse_proposal(reply).expect("proposal");
        assert_eq!(proposal.operation, "search_tracks");
        assert_eq!(proposal.arg_str("query"), Some("jazz"));
    }

    #[test]
    fn numeric_args_accept_string_encoding() {
        let proposal =
            parse_proposal(r#"{"operation": "invoice_detail", "args": {"invoice_id": "12"}}"#)
                .expect("proposal");
        assert_eq!(proposal.arg_i64("invoice_id"), Some(12));
    }

    #[test]
    fn plain_text_is_not_a_proposal() {
        assert!(parse_proposal("Here are some tracks you might like.").is_none());
        assert!(parse_proposal("").is_none());
    }

    #[test]
    fn missing_args_default_to_empty() {
        let proposal = parse_proposal(r#"{"operation": "purchase_history"}"#).expect("proposal");
        assert!(proposal.args.is_empty());
        assert_eq!(proposal.as_value()["args"], json!({}));
    }
}
