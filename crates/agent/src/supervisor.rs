use std::sync::Arc;

use tracing::{debug, warn};

use tunesmith_core::{
    AuditCategory, AuditEvent, AuditOutcome, AuditSink, CapabilityPolicy, Conversation, Decision,
    HandlerName, Identity, RoutingState,
};

use crate::llm::LlmClient;

/// The routing decision-maker.
///
/// The classifier's reply is a single unconstrained line of text. It is never
/// executed as a command: the reply is normalized and matched against the
/// caller's permitted handler set, and anything else, including a classifier
/// transport failure, degrades to the role's default handler. The policy
/// decision always wins over the classifier's suggestion.
pub struct Supervisor {
    llm: Arc<dyn LlmClient>,
    audit: Arc<dyn AuditSink>,
}

impl Supervisor {
    pub fn new(llm: Arc<dyn LlmClient>, audit: Arc<dyn AuditSink>) -> Self {
        Self { llm, audit }
    }

    /// One supervisor pass. Always increments the turn counter, including for
    /// the decision to terminate.
    pub async fn route(
        &self,
        conversation: &Conversation,
        identity: &Identity,
        routing: &mut RoutingState,
    ) -> Decision {
        if routing.budget_exhausted() {
            routing.record_dispatch();
            self.audit.emit(
                AuditEvent::new(
                    Some(conversation.id().clone()),
                    "routing.budget_exhausted",
                    AuditCategory::Routing,
                    "supervisor",
                    AuditOutcome::Success,
                )
                .with_metadata("turn_count", routing.turn_count.to_string()),
            );
            return Decision::Finish;
        }

        let policy = CapabilityPolicy::permitted_handlers(identity.role);
        let system = routing_instructions(identity, policy.allowed);
        let window = conversation.context_window();

        let decision = match self.llm.complete(&system, &window).await {
            Ok(reply) => self.interpret(conversation, &reply, &policy),
            Err(error) => {
                // A failed classification must not end a request the user is
                // waiting on, and must not widen the handler set.
                warn!(
                    event_name = "routing.classifier_failed",
                    conversation_id = %conversation.id(),
                    error = %error,
                    "falling back to the role default handler"
                );
                self.audit.emit(
                    AuditEvent::new(
                        Some(conversation.id().clone()),
                        "routing.classifier_failed",
                        AuditCategory::Routing,
                        "supervisor",
                        AuditOutcome::Failed,
                    )
                    .with_metadata("fallback", policy.default.as_str()),
                );
                Decision::Dispatch(policy.default)
            }
        };

        routing.record_dispatch();
        debug!(
            event_name = "routing.decision",
            conversation_id = %conversation.id(),
            turn_count = routing.turn_count,
            decision = match decision {
                Decision::Dispatch(handler) => handler.as_str(),
                Decision::Finish => "finish",
            },
        );
        decision
    }

    fn interpret(
        &self,
        conversation: &Conversation,
        reply: &str,
        policy: &tunesmith_core::RolePolicy,
    ) -> Decision {
        let proposal = reply.lines().next().unwrap_or_default().trim().to_ascii_lowercase();

        if proposal == "finish" || proposal == "done" {
            return Decision::Finish;
        }

        if let Some(handler) = HandlerName::parse(&proposal) {
            if policy.permits(handler) {
                return Decision::Dispatch(handler);
            }
        }

        // Out-of-policy or unparseable proposals are corrected silently; the
        // override is recorded for operators, not surfaced to the user.
        self.audit.emit(
            AuditEvent::new(
                Some(conversation.id().clone()),
                "routing.policy_violation",
                AuditCategory::Routing,
                "supervisor",
                AuditOutcome::Rejected,
            )
            .with_metadata("proposed", proposal)
            .with_metadata("substituted", policy.default.as_str()),
        );
        Decision::Dispatch(policy.default)
    }
}

fn routing_instructions(identity: &Identity, allowed: &[HandlerName]) -> String {
    let mut handler_lines = String::new();
    for handler in allowed {
        handler_lines.push_str("- ");
        handler_lines.push_str(handler.as_str());
        handler_lines.push_str(": ");
        handler_lines.push_str(handler_summary(*handler));
        handler_lines.push('\n');
    }

    format!(
        "You are the routing supervisor for a music store assistant.\n\
         The caller is a {role} named {name}.\n\
         Pick the handler best suited to continue the conversation, or reply\n\
         `finish` if the last assistant message already answers the request.\n\
         Available handlers:\n{handler_lines}\
         Reply with exactly one word: a handler name or `finish`.",
        role = identity.role.as_str(),
        name = identity.name,
    )
}

fn handler_summary(handler: HandlerName) -> &'static str {
    match handler {
        HandlerName::Storefront => "search the catalog and buy tracks or albums",
        HandlerName::Account => "the caller's own invoices and purchase history",
        HandlerName::InvoiceDesk => {
            "employee desk: profile, supported customers, invoice corrections"
        }
        HandlerName::Discovery => "music recommendations and popular tracks",
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tunesmith_core::{
        Conversation, ConversationId, Decision, HandlerName, Identity, InMemoryAuditSink, Message,
        RoutingState, MAX_TURNS,
    };

    use super::Supervisor;
    use crate::testing::ScriptedLlm;

    fn conversation() -> Conversation {
        Conversation::with_messages(
            ConversationId("c-1".to_string()),
            vec![Message::user("show me my invoices")],
        )
    }

    #[tokio::test]
    async fn in_policy_proposal_is_dispatched() {
        let supervisor = Supervisor::new(
            Arc::new(ScriptedLlm::repeating("Account")),
            Arc::new(InMemoryAuditSink::default()),
        );
        let mut routing = RoutingState::default();

        let decision =
            supervisor.route(&conversation(), &Identity::customer(61, "Astrid"), &mut routing).await;
        assert_eq!(decision, Decision::Dispatch(HandlerName::Account));
        assert_eq!(routing.turn_count, 1);
    }

    #[tokio::test]
    async fn out_of_policy_proposal_is_replaced_by_the_default() {
        let audit = InMemoryAuditSink::default();
        let supervisor = Supervisor::new(
            Arc::new(ScriptedLlm::repeating("storefront")),
            Arc::new(audit.clone()),
        );
        let mut routing = RoutingState::default();

        let employee = Identity::employee(3, "Jane", [60, 61]);
        let decision = supervisor.route(&conversation(), &employee, &mut routing).await;
        assert_eq!(decision, Decision::Dispatch(HandlerName::InvoiceDesk));

        let events = audit.events();
        assert!(events.iter().any(|event| event.event_type == "routing.policy_violation"));
    }

    #[tokio::test]
    async fn classifier_failure_degrades_to_the_default_not_finish() {
        let supervisor = Supervisor::new(
            Arc::new(ScriptedLlm::failing()),
            Arc::new(InMemoryAuditSink::default()),
        );
        let mut routing = RoutingState::default();

        let decision =
            supervisor.route(&conversation(), &Identity::customer(61, "Astrid"), &mut routing).await;
        assert_eq!(decision, Decision::Dispatch(HandlerName::Account));
    }

    #[tokio::test]
    async fn finish_is_recognized_case_insensitively() {
        let supervisor = Supervisor::new(
            Arc::new(ScriptedLlm::repeating("  FINISH  ")),
            Arc::new(InMemoryAuditSink::default()),
        );
        let mut routing = RoutingState::default();

        let decision =
            supervisor.route(&conversation(), &Identity::customer(61, "Astrid"), &mut routing).await;
        assert_eq!(decision, Decision::Finish);
        assert_eq!(routing.turn_count, 1, "terminating still consumes budget");
    }

    #[tokio::test]
    async fn exhausted_budget_forces_finish_without_consulting_the_classifier() {
        let supervisor = Supervisor::new(
            Arc::new(ScriptedLlm::repeating("account")),
            Arc::new(InMemoryAuditSink::default()),
        );
        let mut routing = RoutingState { turn_count: MAX_TURNS, pending_suspension: None };

        let decision =
            supervisor.route(&conversation(), &Identity::customer(61, "Astrid"), &mut routing).await;
        assert_eq!(decision, Decision::Finish);
    }
}
