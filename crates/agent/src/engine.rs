use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::info;

use tunesmith_core::{
    AgentError, AuditCategory, AuditEvent, AuditOutcome, AuditSink, Conversation, ConversationId,
    Decision, HandlerName, Identity, IdentityResolver, Message, MessageRole, Resolution,
    RoutingState, SuspensionKind,
};
use tunesmith_db::repositories::{ConversationRepository, RepositoryError};

use crate::handlers::Handler;
use crate::supervisor::Supervisor;

const STALLED_REPLY: &str =
    "I wasn't able to make progress on that request. Could you rephrase it?";

/// Terminal outcome of one inbound call: either the conversation produced a
/// reply, or it parked awaiting a human decision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineReply {
    Completed { message: String },
    Suspended { kind: SuspensionKind, prompt: String },
}

/// Drives the supervisor loop for one conversation at a time.
///
/// All conversation state is rehydrated from storage on every call, so a
/// parked conversation survives process restarts. Within one conversation a
/// single-writer discipline holds: concurrent calls for the same id queue on
/// a per-conversation mutex rather than interleaving, which is what keeps the
/// single-pending-suspension invariant safe.
pub struct ConversationEngine {
    resolver: Arc<dyn IdentityResolver>,
    conversations: Arc<dyn ConversationRepository>,
    supervisor: Supervisor,
    handlers: HashMap<HandlerName, Arc<dyn Handler>>,
    audit: Arc<dyn AuditSink>,
    locks: Mutex<HashMap<ConversationId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConversationEngine {
    pub fn new(
        resolver: Arc<dyn IdentityResolver>,
        conversations: Arc<dyn ConversationRepository>,
        supervisor: Supervisor,
        handlers: Vec<Arc<dyn Handler>>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let handlers = handlers.into_iter().map(|handler| (handler.name(), handler)).collect();
        Self {
            resolver,
            conversations,
            supervisor,
            handlers,
            audit,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// New-turn entry point. Fails with [`AgentError::SuspensionAlreadyPending`]
    /// while a suspension is parked; the caller must resume it first.
    pub async fn handle_message(
        &self,
        id: &ConversationId,
        credential: &str,
        text: &str,
    ) -> Result<EngineReply, AgentError> {
        let lock = self.conversation_lock(id);
        let reply = {
            let _guard = lock.lock().await;
            self.message_under_lock(id, credential, text).await
        };
        drop(lock);
        self.prune_lock(id);
        reply
    }

    async fn message_under_lock(
        &self,
        id: &ConversationId,
        credential: &str,
        text: &str,
    ) -> Result<EngineReply, AgentError> {
        let identity = self.resolver.resolve(credential).await?;

        let (mut conversation, mut routing) = match self.conversations.load(id).await? {
            Some(record) => {
                // A conversation stays bound to the subject that opened it.
                if record.subject_role != identity.role
                    || record.subject_id != identity.subject_id
                {
                    return Err(AgentError::Unauthorized);
                }
                if record.routing.pending_suspension.is_some() {
                    return Err(AgentError::SuspensionAlreadyPending {
                        conversation_id: id.0.clone(),
                    });
                }
                (record.conversation, record.routing)
            }
            None => {
                self.conversations.create(id, identity.role, identity.subject_id).await?;
                (Conversation::new(id.clone()), RoutingState::default())
            }
        };

        self.append(&mut conversation, vec![Message::user(text)]).await?;
        routing.begin_user_turn();
        self.conversations.set_turn_count(id, routing.turn_count).await?;

        self.run_loop(conversation, routing, identity).await
    }

    /// Resume entry point. Clearing the stored suspension is the exactly-once
    /// gate: a redelivered resolution finds nothing to clear and applies no
    /// second mutation.
    pub async fn handle_resolution(
        &self,
        id: &ConversationId,
        resolution: Resolution,
    ) -> Result<EngineReply, AgentError> {
        let lock = self.conversation_lock(id);
        let reply = {
            let _guard = lock.lock().await;
            self.resolution_under_lock(id, resolution).await
        };
        drop(lock);
        self.prune_lock(id);
        reply
    }

    async fn resolution_under_lock(
        &self,
        id: &ConversationId,
        resolution: Resolution,
    ) -> Result<EngineReply, AgentError> {
        let no_pending =
            || AgentError::NoPendingSuspension { conversation_id: id.0.clone() };

        let record = self.conversations.load(id).await?.ok_or_else(no_pending)?;
        let pending = record.routing.pending_suspension.as_ref().ok_or_else(no_pending)?;
        if !pending.matches(&resolution) {
            // The suspension stays parked; the caller may retry with the
            // right shape.
            return Err(AgentError::SuspensionKindMismatch);
        }

        let identity =
            self.resolver.rehydrate(record.subject_role, record.subject_id).await?;

        let suspension =
            self.conversations.clear_suspension(id).await?.ok_or_else(no_pending)?;

        let accepted = resolution.accepted();
        self.audit.emit(
            AuditEvent::new(
                Some(id.clone()),
                "suspension.resolved",
                AuditCategory::Suspension,
                identity.name.clone(),
                if accepted { AuditOutcome::Success } else { AuditOutcome::Rejected },
            )
            .with_metadata("action", suspension.action.clone())
            .with_metadata("kind", suspension.kind.as_str()),
        );

        let mut conversation = record.conversation;
        let mut routing = record.routing;
        routing.pending_suspension = None;

        let handler = self.handler(suspension.handler)?;
        match handler.resolve(&suspension, accepted, &identity).await {
            Ok(turn) => {
                if accepted {
                    self.audit.emit(
                        AuditEvent::new(
                            Some(id.clone()),
                            "mutation.committed",
                            AuditCategory::Mutation,
                            identity.name.clone(),
                            AuditOutcome::Success,
                        )
                        .with_metadata("action", suspension.action.clone()),
                    );
                }
                self.append(&mut conversation, turn.messages).await?;
            }
            Err(error @ (AgentError::MutationFailure(_) | AgentError::ScopeViolation { .. })) => {
                // The suspension is already cleared; the conversation must
                // not stay stuck on a failed commit.
                self.audit.emit(
                    AuditEvent::new(
                        Some(id.clone()),
                        "mutation.failed",
                        AuditCategory::Mutation,
                        identity.name.clone(),
                        AuditOutcome::Failed,
                    )
                    .with_metadata("action", suspension.action.clone())
                    .with_metadata("error", error.to_string()),
                );
                let text = error.user_message();
                self.append(&mut conversation, vec![Message::assistant(text)]).await?;
                return Ok(EngineReply::Completed { message: text.to_string() });
            }
            Err(other) => return Err(other),
        }

        // A resolution continues the same top-level request, so the loop
        // resumes with the budget it had when it parked.
        self.run_loop(conversation, routing, identity).await
    }

    async fn run_loop(
        &self,
        mut conversation: Conversation,
        mut routing: RoutingState,
        identity: Identity,
    ) -> Result<EngineReply, AgentError> {
        loop {
            let decision = self.supervisor.route(&conversation, &identity, &mut routing).await;
            self.conversations.set_turn_count(conversation.id(), routing.turn_count).await?;

            let handler_name = match decision {
                Decision::Finish => {
                    return self.completed(&mut conversation).await;
                }
                Decision::Dispatch(handler_name) => handler_name,
            };
            let handler = self.handler(handler_name)?;

            match handler.run(&conversation, &identity).await {
                Ok(turn) => {
                    let suspension = turn.suspension;
                    self.append(&mut conversation, turn.messages).await?;

                    if let Some(suspension) = suspension {
                        match self
                            .conversations
                            .install_suspension(conversation.id(), &suspension)
                            .await
                        {
                            Ok(()) => {}
                            Err(RepositoryError::SuspensionOccupied(conversation_id)) => {
                                return Err(AgentError::SuspensionAlreadyPending {
                                    conversation_id,
                                });
                            }
                            Err(error) => return Err(error.into()),
                        }

                        info!(
                            event_name = "suspension.installed",
                            conversation_id = %conversation.id(),
                            action = suspension.action,
                            kind = suspension.kind.as_str(),
                        );
                        self.audit.emit(
                            AuditEvent::new(
                                Some(conversation.id().clone()),
                                "suspension.installed",
                                AuditCategory::Suspension,
                                identity.name.clone(),
                                AuditOutcome::Success,
                            )
                            .with_metadata("action", suspension.action.clone())
                            .with_metadata("kind", suspension.kind.as_str()),
                        );

                        return Ok(EngineReply::Suspended {
                            kind: suspension.kind,
                            prompt: suspension.prompt,
                        });
                    }
                }
                Err(error @ AgentError::ScopeViolation { .. }) => {
                    // Scope failures become plain user-facing text before
                    // control returns to the supervisor loop; the classifier
                    // never sees policy internals.
                    self.audit.emit(
                        AuditEvent::new(
                            Some(conversation.id().clone()),
                            "handler.scope_violation",
                            AuditCategory::Handler,
                            identity.name.clone(),
                            AuditOutcome::Rejected,
                        )
                        .with_metadata("handler", handler_name.as_str())
                        .with_metadata("error", error.to_string()),
                    );
                    let text = error.user_message();
                    self.append(&mut conversation, vec![Message::assistant(text)]).await?;
                }
                Err(other) => return Err(other),
            }
        }
    }

    async fn append(
        &self,
        conversation: &mut Conversation,
        messages: Vec<Message>,
    ) -> Result<(), AgentError> {
        if messages.is_empty() {
            return Ok(());
        }
        let from_seq = conversation.messages().len() as i64;
        self.conversations.append_messages(conversation.id(), from_seq, &messages).await?;
        for message in messages {
            conversation.push(message);
        }
        Ok(())
    }

    async fn completed(
        &self,
        conversation: &mut Conversation,
    ) -> Result<EngineReply, AgentError> {
        let last_assistant = conversation
            .messages()
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::Assistant)
            .map(|message| message.content.clone());

        let message = match last_assistant {
            Some(message) => message,
            None => {
                // The reply the caller sees must also be in the stored
                // transcript.
                self.append(conversation, vec![Message::assistant(STALLED_REPLY)]).await?;
                STALLED_REPLY.to_string()
            }
        };
        Ok(EngineReply::Completed { message })
    }

    fn handler(&self, name: HandlerName) -> Result<&Arc<dyn Handler>, AgentError> {
        self.handlers
            .get(&name)
            .ok_or_else(|| AgentError::Storage(format!("handler {} is not wired", name.as_str())))
    }

    fn conversation_lock(&self, id: &ConversationId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(id.clone()).or_default().clone()
    }

    /// Drops a conversation's lock entry once no caller holds a clone of it.
    /// A queued caller keeps the strong count above one, so an entry is only
    /// removed when nothing can still lock it.
    fn prune_lock(&self, id: &ConversationId) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks.get(id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(id);
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).len()
    }
}
