use std::sync::Arc;

use async_trait::async_trait;

use tunesmith_core::{AgentError, Conversation, HandlerName, Identity};
use tunesmith_db::repositories::InvoiceRepository;

use super::{operation_instructions, parse_proposal, Handler, HandlerTurn, Proposal};
use crate::llm::LlmClient;

const OPERATIONS: &[(&str, &str)] = &[
    ("list_invoices", "args: {}; the caller's invoices, newest first"),
    ("invoice_detail", "args: {invoice_id}; line items of one of the caller's invoices"),
    ("purchase_history", "args: {}; every track the caller has bought"),
];

/// Read-only access to the caller's own billing records. Every operation is
/// implicitly scoped to the caller's subject id; asking about someone else's
/// invoice is a scope violation, not a lookup miss.
pub struct AccountHandler {
    llm: Arc<dyn LlmClient>,
    invoices: Arc<dyn InvoiceRepository>,
}

impl AccountHandler {
    pub fn new(llm: Arc<dyn LlmClient>, invoices: Arc<dyn InvoiceRepository>) -> Self {
        Self { llm, invoices }
    }

    async fn execute(
        &self,
        proposal: Proposal,
        identity: &Identity,
    ) -> Result<HandlerTurn, AgentError> {
        match proposal.operation.as_str() {
            "list_invoices" => {
                let invoices = self.invoices.invoices_for_customer(identity.subject_id).await?;
                if invoices.is_empty() {
                    return Ok(HandlerTurn::reply("You have no invoices yet."));
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
                Ok(HandlerTurn::reply(format!("Your invoices:\n{lines}")))
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
                    "Invoice {} ({}): total ${}\n{lines}",
                    header.invoice_id,
                    header.invoice_date.format("%Y-%m-%d"),
                    header.total
                )))
            }
            "purchase_history" => {
                let purchases = self.invoices.purchases_for_customer(identity.subject_id).await?;
                if purchases.is_empty() {
                    return Ok(HandlerTurn::reply("You haven't bought anything yet."));
                }
                let lines = purchases
                    .iter()
                    .map(|line| {
                        format!(
                            "- \"{}\" by {} (${}, {})",
                            line.track,
                            line.artist,
                            line.price,
                            line.purchased_at.format("%Y-%m-%d")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                Ok(HandlerTurn::reply(format!("Your purchases:\n{lines}")))
            }
            _ => Ok(HandlerTurn::reply(capability_summary())),
        }
    }
}

fn capability_summary() -> &'static str {
    "I can show your invoices, the line items of a specific invoice, or your \
     full purchase history. Which would you like?"
}

#[async_trait]
impl Handler for AccountHandler {
    fn name(&self) -> HandlerName {
        HandlerName::Account
    }

    async fn run(
        &self,
        conversation: &Conversation,
        identity: &Identity,
    ) -> Result<HandlerTurn, AgentError> {
        let system = operation_instructions(identity, "account handler", OPERATIONS);
        let reply = match self.llm.complete(&system, &conversation.context_window()).await {
            Ok(reply) => reply,
            Err(_) => return Ok(HandlerTurn::reply(capability_summary())),
        };

        match parse_proposal(&reply) {
            Some(proposal) => self.execute(proposal, identity).await,
            None => Ok(HandlerTurn::reply(reply.trim().to_string())),
        }
    }
}
