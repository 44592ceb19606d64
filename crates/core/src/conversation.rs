use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Number of trailing messages shown to the classifier.
pub const CONTEXT_WINDOW_MESSAGES: usize = 6;
/// Character budget per message inside the classifier window.
pub const CONTEXT_MESSAGE_CHAR_BUDGET: usize = 500;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(pub String);

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "tool" => Some(Self::Tool),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    /// Structured operation proposal that produced this message, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<Value>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: MessageRole::User, content: content.into(), tool_call: None }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: MessageRole::Assistant, content: content.into(), tool_call: None }
    }

    pub fn tool(content: impl Into<String>, tool_call: Value) -> Self {
        Self { role: MessageRole::Tool, content: content.into(), tool_call: Some(tool_call) }
    }
}

/// Append-only transcript of one conversation.
///
/// Handlers may only add messages; nothing ever mutates or removes a prior
/// entry, which is why the message list is not exposed mutably.
#[derive(Clone, Debug, PartialEq)]
pub struct Conversation {
    id: ConversationId,
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new(id: ConversationId) -> Self {
        Self { id, messages: Vec::new() }
    }

    pub fn with_messages(id: ConversationId, messages: Vec<Message>) -> Self {
        Self { id, messages }
    }

    pub fn id(&self) -> &ConversationId {
        &self.id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Whether the most recent message was authored directly by the end user,
    /// i.e. this is a fresh top-level request rather than handler output.
    pub fn last_is_user_authored(&self) -> bool {
        matches!(self.last(), Some(message) if message.role == MessageRole::User)
    }

    /// Bounded summary handed to the external classifier: the trailing
    /// [`CONTEXT_WINDOW_MESSAGES`] messages, each truncated to
    /// [`CONTEXT_MESSAGE_CHAR_BUDGET`] characters. This window is the only
    /// evidence the classifier ever sees.
    pub fn context_window(&self) -> String {
        let start = self.messages.len().saturating_sub(CONTEXT_WINDOW_MESSAGES);
        let mut lines = Vec::with_capacity(self.messages.len() - start);
        for message in &self.messages[start..] {
            let content = truncate_chars(&message.content, CONTEXT_MESSAGE_CHAR_BUDGET);
            lines.push(format!("{}: {}", message.role.as_str(), content));
        }
        lines.join("\n")
    }
}

fn truncate_chars(content: &str, budget: usize) -> String {
    if content.chars().count() <= budget {
        return content.to_string();
    }
    let mut truncated: String = content.chars().take(budget).collect();
    truncated.push_str("...");
    truncated
}
