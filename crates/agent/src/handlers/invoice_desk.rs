use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::{json, Map};

use async_trait::async_trait;

use tunesmith_core::{
    AgentError, Conversation, HandlerName, Identity, Suspension, SuspensionKind,
};
use tunesmith_db::repositories::{InvoiceRepository, SubjectRepository};

use super::{operation_instructions, parse_proposal, Handler, HandlerTurn, Proposal};
use crate::llm::LlmClient;

const OPERATIONS: &[(&str, &str)] = &[
    ("my_profile", "args: {}; the employee's own record, including their manager"),
    ("supported_customers", "args: {}; customers in the employee's book with lifetime spend"),
    ("customer_invoices", "args: {customer_id}; invoices of one supported customer"),
    ("invoice_detail", "args: {invoice_id}; line items of an invoice in the employee's book"),
    (
        "update_invoice_total",
        "args: {invoice_id, new_total}; correct an invoice total (needs manager approval)",
    ),
    ("delete_invoice", "args: {invoice_id}; remove an invoice (needs manager approval)"),
];

/// Employee desk: profile and book lookups plus the two invoice mutations.
/// Mutations are gated behind a manager approval suspension; lookups and
/// mutations alike check the target customer against the employee's scope.
pub struct InvoiceDeskHandler {
    llm: Arc<dyn LlmClient>,
    invoices: Arc<dyn InvoiceRepository>,
    subjects: Arc<dyn SubjectRepository>,
}

impl InvoiceDeskHandler {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        invoices: Arc<dyn InvoiceRepository>,
        subjects: Arc<dyn SubjectRepository>,
    ) -> Self {
        Self { llm, invoices, subjects }
    }

    async fn execute(
        &self,
        proposal: Proposal,
        identity: &Identity,
    ) -> Result<HandlerTurn, AgentError> {
        match proposal.operation.as_str() {
            "my_profile" => {
                let Some(profile) = self.subjects.employee_profile(identity.subject_id).await?
                else {
                    return Ok(HandlerTurn::reply("I couldn't load your employee record."));
                };
                let manager = profile.manager_name.as_deref().unwrap_or("nobody");
                Ok(HandlerTurn::reply(format!(
                    "{} {} — {}. Reports to {}. Email: {}.",
                    profile.first_name,
                    profile.last_name,
                    profile.title.as_deref().unwrap_or("no title on file"),
                    manager,
                    profile.email.as_deref().unwrap_or("none on file"),
                )))
            }
            "supported_customers" => {
                let customers = self.subjects.supported_customers(identity.subject_id).await?;
                if customers.is_empty() {
                    return Ok(HandlerTurn::reply("No customers are assigned to you."));
                }
                let lines = customers
                    .iter()
                    .map(|customer| {
                        format!(
                            "- [{}] {} {} — {} invoices, ${} lifetime",
                            customer.customer_id,
                            customer.first_name,
                            customer.last_name,
                            customer.invoice_count,
                            customer.total_spent
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                Ok(HandlerTurn::reply(format!("Your customers:\n{lines}")))
            }
            "customer_invoices" => {
                let Some(customer_id) = proposal.arg_i64("customer_id") else {
                    return Ok(HandlerTurn::reply("Which customer? I need their id."));
                };
                identity.check_scope(customer_id)?;

                let invoices = self.invoices.invoices_for_customer(customer_id).await?;
                if invoices.is_empty() {
                    return Ok(HandlerTurn::reply(format!(
                        "Customer {customer_id} has no invoices."
                    )));
                }
                let lines = invoices
                    .iter()
                    .map(|invoice| {
                        format!(
                            "- Invoice {} on {}: ${}",
                            invoice.invoice_id,
                            invoice.invoice_date.format("%Y-%m-%d"),
                            invoice.total
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                Ok(HandlerTurn::reply(format!("Invoices for customer {customer_id}:\n{lines}")))
            }
            "invoice_detail" => {
                let Some(invoice_id) = proposal.arg_i64("invoice_id") else {
                    return Ok(HandlerTurn::reply("Which invoice? I need its number."));
                };
                let Some(header) = self.invoices.invoice_header(invoice_id).await? else {
                    return Ok(HandlerTurn::reply(format!(
                        "Invoice {invoice_id} doesn't exist."
                    )));
                };
                identity.check_scope(header.customer_id)?;

                let items = self.invoices.invoice_items(invoice_id).await?;
                let lines = items
                    .iter()
                    .map(|item| {
                        format!(
                            "- \"{}\" by {} — ${} x{}",
                            item.track, item.artist, item.unit_price, item.quantity
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                Ok(HandlerTurn::reply(format!(
                    "Invoice {} for {} ({}): total ${}\n{lines}",
                    header.invoice_id,
                    header.customer_name,
                    header.invoice_date.format("%Y-%m-%d"),
                    header.total
                )))
            }
            "update_invoice_total" => {
                let Some(invoice_id) = proposal.arg_i64("invoice_id") else {
                    return Ok(HandlerTurn::reply("Which invoice? I need its number."));
                };
                let Some(new_total) = proposal
                    .arg_str("new_total")
                    .and_then(|raw| raw.trim_start_matches('$').parse::<Decimal>().ok())
                    .or_else(|| {
                        proposal
                            .args
                            .get("new_total")
                            .and_then(serde_json::Value::as_f64)
                            .and_then(|raw| Decimal::try_from(raw).ok())
                    })
                else {
                    return Ok(HandlerTurn::reply("What should the new total be?"));
                };
                self.prepare_total_update(invoice_id, new_total, identity).await
            }
            "delete_invoice" => {
                let Some(invoice_id) = proposal.arg_i64("invoice_id") else {
                    return Ok(HandlerTurn::reply("Which invoice? I need its number."));
                };
                self.prepare_deletion(invoice_id, identity).await
            }
            _ => Ok(HandlerTurn::reply(capability_summary())),
        }
    }

    /// Read-only preparation: target must exist and be in the employee's
    /// book; the old and new totals are captured for the approval prompt and
    /// the eventual receipt.
    async fn prepare_total_update(
        &self,
        invoice_id: i64,
        new_total: Decimal,
        identity: &Identity,
    ) -> Result<HandlerTurn, AgentError> {
        let Some(header) = self.invoices.invoice_header(invoice_id).await? else {
            return Ok(HandlerTurn::reply(format!("Invoice {invoice_id} doesn't exist.")));
        };
        identity.check_scope(header.customer_id)?;

        let mut args = Map::new();
        args.insert("invoice_id".to_string(), json!(invoice_id));
        args.insert("customer_id".to_string(), json!(header.customer_id));
        args.insert("customer".to_string(), json!(header.customer_name));
        args.insert("old_total".to_string(), json!(header.total.to_string()));
        args.insert("new_total".to_string(), json!(new_total.to_string()));

        Ok(HandlerTurn::suspend(Suspension {
            kind: SuspensionKind::Approval,
            handler: HandlerName::InvoiceDesk,
            action: "update_invoice_total".to_string(),
            prompt: format!(
                "Approve changing invoice {} ({}) from ${} to ${new_total}?",
                invoice_id, header.customer_name, header.total
            ),
            args,
        }))
    }

    async fn prepare_deletion(
        &self,
        invoice_id: i64,
        identity: &Identity,
    ) -> Result<HandlerTurn, AgentError> {
        let Some(header) = self.invoices.invoice_header(invoice_id).await? else {
            return Ok(HandlerTurn::reply(format!("Invoice {invoice_id} doesn't exist.")));
        };
        identity.check_scope(header.customer_id)?;
        let items = self.invoices.invoice_items(invoice_id).await?;

        let mut args = Map::new();
        args.insert("invoice_id".to_string(), json!(invoice_id));
        args.insert("customer_id".to_string(), json!(header.customer_id));
        args.insert("customer".to_string(), json!(header.customer_name));
        args.insert("total".to_string(), json!(header.total.to_string()));
        args.insert("line_count".to_string(), json!(items.len()));

        Ok(HandlerTurn::suspend(Suspension {
            kind: SuspensionKind::Approval,
            handler: HandlerName::InvoiceDesk,
            action: "delete_invoice".to_string(),
            prompt: format!(
                "Approve deleting invoice {} ({}, ${}, {} lines)?",
                invoice_id,
                header.customer_name,
                header.total,
                items.len()
            ),
            args,
        }))
    }

    async fn commit(&self, suspension: &Suspension) -> Result<HandlerTurn, AgentError> {
        let invoice_id = suspension
            .arg_i64("invoice_id")
            .ok_or_else(|| AgentError::MutationFailure("missing invoice id".to_string()))?;
        let customer = suspension.arg_str("customer").unwrap_or("the customer");

        match suspension.action.as_str() {
            "update_invoice_total" => {
                let new_total: Decimal = suspension
                    .arg_str("new_total")
                    .and_then(|raw| raw.parse().ok())
                    .ok_or_else(|| {
                        AgentError::MutationFailure("captured new_total is unreadable".to_string())
                    })?;
                let old_total = suspension.arg_str("old_total").unwrap_or("?");

                let updated = self
                    .invoices
                    .update_total(invoice_id, new_total)
                    .await
                    .map_err(|error| AgentError::MutationFailure(error.to_string()))?;
                if !updated {
                    return Err(AgentError::MutationFailure(format!(
                        "invoice {invoice_id} no longer exists"
                    )));
                }

                Ok(HandlerTurn::reply(format!(
                    "Invoice {invoice_id} ({customer}) updated: ${old_total} -> ${new_total}."
                )))
            }
            "delete_invoice" => {
                let total = suspension.arg_str("total").unwrap_or("?");
                let deleted = self
                    .invoices
                    .delete_invoice(invoice_id)
                    .await
                    .map_err(|error| AgentError::MutationFailure(error.to_string()))?;
                if !deleted {
                    return Err(AgentError::MutationFailure(format!(
                        "invoice {invoice_id} no longer exists"
                    )));
                }

                Ok(HandlerTurn::reply(format!(
                    "Invoice {invoice_id} ({customer}, ${total}) has been deleted."
                )))
            }
            other => Err(AgentError::MutationFailure(format!("unknown action `{other}`"))),
        }
    }
}

fn capability_summary() -> &'static str {
    "I can show your profile, list your supported customers, pull up their \
     invoices, and, with manager approval, correct or delete an invoice."
}

#[async_trait]
impl Handler for InvoiceDeskHandler {
    fn name(&self) -> HandlerName {
        HandlerName::InvoiceDesk
    }

    async fn run(
        &self,
        conversation: &Conversation,
        identity: &Identity,
    ) -> Result<HandlerTurn, AgentError> {
        let system = operation_instructions(identity, "invoice desk", OPERATIONS);
        let reply = match self.llm.complete(&system, &conversation.context_window()).await {
            Ok(reply) => reply,
            Err(_) => return Ok(HandlerTurn::reply(capability_summary())),
        };

        match parse_proposal(&reply) {
            Some(proposal) => self.execute(proposal, identity).await,
            None => Ok(HandlerTurn::reply(reply.trim().to_string())),
        }
    }

    async fn resolve(
        &self,
        suspension: &Suspension,
        accepted: bool,
        identity: &Identity,
    ) -> Result<HandlerTurn, AgentError> {
        if !accepted {
            let invoice_id = suspension.arg_i64("invoice_id").unwrap_or_default();
            return Ok(HandlerTurn::reply(format!(
                "The change to invoice {invoice_id} was not approved. No changes were made."
            )));
        }

        // The employee's book may have changed while the approval was
        // parked; the captured customer must still be in scope at commit
        // time.
        let customer_id = suspension
            .arg_i64("customer_id")
            .ok_or_else(|| AgentError::MutationFailure("missing customer id".to_string()))?;
        identity.check_scope(customer_id)?;
        self.commit(suspension).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use rust_decimal::Decimal;

    use tunesmith_core::{
        AgentError, Conversation, ConversationId, Identity, Message, SuspensionKind,
    };
    use tunesmith_db::repositories::{
        InMemoryInvoiceRepository, InMemorySubjectRepository, InvoiceHeader, InvoiceRepository,
    };

    use super::InvoiceDeskHandler;
    use crate::handlers::Handler;
    use crate::testing::ScriptedLlm;

    fn jane() -> Identity {
        Identity::employee(3, "Jane Peacock", [60, 61])
    }

    fn header(invoice_id: i64, customer_id: i64, total: &str) -> InvoiceHeader {
        InvoiceHeader {
            invoice_id,
            customer_id,
            customer_name: "Astrid Gruber".to_string(),
            invoice_date: Utc::now(),
            billing_address: None,
            billing_city: None,
            billing_country: None,
            total: total.parse().expect("total"),
        }
    }

    fn conversation(text: &str) -> Conversation {
        Conversation::with_messages(
            ConversationId("c-1".to_string()),
            vec![Message::user(text)],
        )
    }

    fn handler_with(
        reply: &str,
        invoices: Arc<InMemoryInvoiceRepository>,
    ) -> InvoiceDeskHandler {
        InvoiceDeskHandler::new(
            Arc::new(ScriptedLlm::repeating(reply)),
            invoices,
            Arc::new(InMemorySubjectRepository::new()),
        )
    }

    #[tokio::test]
    async fn total_update_parks_an_approval_with_before_and_after() {
        let invoices = Arc::new(InMemoryInvoiceRepository::new());
        invoices.insert(header(5, 61, "9.90"), Vec::new());
        let handler = handler_with(
            r#"{"operation": "update_invoice_total", "args": {"invoice_id": 5, "new_total": "12.00"}}"#,
            invoices.clone(),
        );

        let turn = handler.run(&conversation("fix invoice 5"), &jane()).await.expect("run");
        let suspension = turn.suspension.expect("parked");
        assert_eq!(suspension.kind, SuspensionKind::Approval);
        assert_eq!(suspension.arg_str("old_total"), Some("9.90"));
        assert_eq!(suspension.arg_str("new_total"), Some("12.00"));
        assert!(suspension.prompt.contains("$9.90"));
        assert!(suspension.prompt.contains("$12.00"));

        // Nothing written during preparation.
        let stored = invoices.invoice_header(5).await.expect("header").expect("exists");
        assert_eq!(stored.total, "9.90".parse::<Decimal>().expect("total"));
    }

    #[tokio::test]
    async fn out_of_scope_customer_is_refused_before_any_suspension() {
        let invoices = Arc::new(InMemoryInvoiceRepository::new());
        invoices.insert(header(9, 62, "4.00"), Vec::new());
        let handler = handler_with(
            r#"{"operation": "delete_invoice", "args": {"invoice_id": 9}}"#,
            invoices.clone(),
        );

        let err = handler
            .run(&conversation("delete invoice 9"), &jane())
            .await
            .expect_err("62 is outside jane's scope");
        assert_eq!(err, AgentError::ScopeViolation { subject_id: 62 });
        assert!(invoices.invoice_header(9).await.expect("header").is_some());
    }

    #[tokio::test]
    async fn approved_deletion_removes_the_invoice() {
        let invoices = Arc::new(InMemoryInvoiceRepository::new());
        invoices.insert(header(5, 61, "9.90"), Vec::new());
        let handler = handler_with(
            r#"{"operation": "delete_invoice", "args": {"invoice_id": 5}}"#,
            invoices.clone(),
        );

        let turn = handler.run(&conversation("delete invoice 5"), &jane()).await.expect("run");
        let suspension = turn.suspension.expect("parked");

        let outcome = handler.resolve(&suspension, true, &jane()).await.expect("resolve");
        assert!(outcome.messages[0].content.contains("deleted"));
        assert!(invoices.invoice_header(5).await.expect("header").is_none());
    }

    #[tokio::test]
    async fn rejected_update_leaves_the_total_untouched() {
        let invoices = Arc::new(InMemoryInvoiceRepository::new());
        invoices.insert(header(5, 61, "9.90"), Vec::new());
        let handler = handler_with(
            r#"{"operation": "update_invoice_total", "args": {"invoice_id": 5, "new_total": "12.00"}}"#,
            invoices.clone(),
        );

        let turn = handler.run(&conversation("fix invoice 5"), &jane()).await.expect("run");
        let suspension = turn.suspension.expect("parked");

        let outcome = handler.resolve(&suspension, false, &jane()).await.expect("resolve");
        assert!(outcome.messages[0].content.contains("not approved"));

        let stored = invoices.invoice_header(5).await.expect("header").expect("exists");
        assert_eq!(stored.total, "9.90".parse::<Decimal>().expect("total"));
    }

    #[tokio::test]
    async fn commit_is_refused_when_the_customer_leaves_the_employees_book() {
        let invoices = Arc::new(InMemoryInvoiceRepository::new());
        invoices.insert(header(5, 61, "9.90"), Vec::new());
        let handler = handler_with(
            r#"{"operation": "delete_invoice", "args": {"invoice_id": 5}}"#,
            invoices.clone(),
        );

        let turn = handler.run(&conversation("delete invoice 5"), &jane()).await.expect("run");
        let suspension = turn.suspension.expect("parked");

        // Customer 61 is reassigned away from Jane while the approval is
        // parked.
        let narrowed = Identity::employee(3, "Jane Peacock", [60]);
        let err = handler.resolve(&suspension, true, &narrowed).await.expect_err("out of scope");
        assert_eq!(err, AgentError::ScopeViolation { subject_id: 61 });
        assert!(invoices.invoice_header(5).await.expect("header").is_some());
    }

    #[tokio::test]
    async fn commit_against_a_vanished_invoice_is_a_mutation_failure() {
        let invoices = Arc::new(InMemoryInvoiceRepository::new());
        invoices.insert(header(5, 61, "9.90"), Vec::new());
        let handler = handler_with(
            r#"{"operation": "delete_invoice", "args": {"invoice_id": 5}}"#,
            invoices.clone(),
        );

        let turn = handler.run(&conversation("delete invoice 5"), &jane()).await.expect("run");
        let suspension = turn.suspension.expect("parked");

        // The invoice disappears while the approval is parked.
        invoices.delete_invoice(5).await.expect("delete");

        let err = handler.resolve(&suspension, true, &jane()).await.expect_err("gone");
        assert!(matches!(err, AgentError::MutationFailure(_)));
    }
}
