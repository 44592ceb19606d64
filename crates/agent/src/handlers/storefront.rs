use std::sync::Arc;

use rust_decimal::Decimal;
use serde_json::{json, Map, Value};

use async_trait::async_trait;

use tunesmith_core::{
    AgentError, Conversation, HandlerName, Identity, Suspension, SuspensionKind,
};
use tunesmith_db::repositories::{
    BillingInfo, CatalogRepository, InvoiceRepository, NewInvoice, NewInvoiceLine,
    SubjectRepository,
};

use super::{operation_instructions, parse_proposal, Handler, HandlerTurn, Proposal};
use crate::llm::LlmClient;

const OPERATIONS: &[(&str, &str)] = &[
    ("search_tracks", "args: {query}; find tracks by name, artist, or album"),
    ("search_albums", "args: {query}; find albums by title or artist"),
    ("album_tracks", "args: {album_id}; list the tracks on an album"),
    ("purchase_track", "args: {track_id}; buy one track (asks the caller to confirm)"),
    ("purchase_album", "args: {album_id}; buy a whole album (asks the caller to confirm)"),
];

/// Catalog browsing and purchases. The two purchase operations are gated: the
/// handler validates and prices the purchase read-only, then parks a
/// confirmation suspension carrying the captured price.
pub struct StorefrontHandler {
    llm: Arc<dyn LlmClient>,
    catalog: Arc<dyn CatalogRepository>,
    invoices: Arc<dyn InvoiceRepository>,
    subjects: Arc<dyn SubjectRepository>,
}

impl StorefrontHandler {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        catalog: Arc<dyn CatalogRepository>,
        invoices: Arc<dyn InvoiceRepository>,
        subjects: Arc<dyn SubjectRepository>,
    ) -> Self {
        Self { llm, catalog, invoices, subjects }
    }

    async fn execute(
        &self,
        proposal: Proposal,
        identity: &Identity,
    ) -> Result<HandlerTurn, AgentError> {
        match proposal.operation.as_str() {
            "search_tracks" => {
                let query = proposal.arg_str("query").unwrap_or_default();
                let tracks = self.catalog.search_tracks(query).await?;
                if tracks.is_empty() {
                    return Ok(HandlerTurn::reply(format!(
                        "I couldn't find any tracks matching \"{query}\"."
                    )));
                }
                let lines = tracks
                    .iter()
                    .map(|track| {
                        format!(
                            "- [{}] \"{}\" by {} ({}) — ${}",
                            track.track_id,
                            track.name,
                            track.artist,
                            track.album,
                            track.unit_price
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                Ok(HandlerTurn::reply(format!("Here's what I found:\n{lines}")))
            }
            "search_albums" => {
                let query = proposal.arg_str("query").unwrap_or_default();
                let albums = self.catalog.search_albums(query).await?;
                if albums.is_empty() {
                    return Ok(HandlerTurn::reply(format!(
                        "I couldn't find any albums matching \"{query}\"."
                    )));
                }
                let lines = albums
                    .iter()
                    .map(|album| {
                        format!(
                            "- [{}] \"{}\" by {} — {} tracks, ${}",
                            album.album_id,
                            album.title,
                            album.artist,
                            album.track_count,
                            album.total_price
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                Ok(HandlerTurn::reply(format!("Albums matching your search:\n{lines}")))
            }
            "album_tracks" => {
                let Some(album_id) = proposal.arg_i64("album_id") else {
                    return Ok(HandlerTurn::reply("Which album? I need its id."));
                };
                let Some(album) = self.catalog.find_album(album_id).await? else {
                    return Ok(HandlerTurn::reply(format!("Album {album_id} doesn't exist.")));
                };
                let tracks = self.catalog.album_tracks(album_id).await?;
                let lines = tracks
                    .iter()
                    .map(|track| {
                        format!("- [{}] \"{}\" — ${}", track.track_id, track.name, track.unit_price)
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                Ok(HandlerTurn::reply(format!(
                    "\"{}\" by {}:\n{lines}",
                    album.title, album.artist
                )))
            }
            "purchase_track" => {
                let Some(track_id) = proposal.arg_i64("track_id") else {
                    return Ok(HandlerTurn::reply("Which track? I need its id."));
                };
                self.prepare_track_purchase(track_id, identity).await
            }
            "purchase_album" => {
                let Some(album_id) = proposal.arg_i64("album_id") else {
                    return Ok(HandlerTurn::reply("Which album? I need its id."));
                };
                self.prepare_album_purchase(album_id, identity).await
            }
            _ => Ok(HandlerTurn::reply(capability_summary())),
        }
    }

    /// Read-only preparation for a single-track purchase: validate the target
    /// and capture the price the confirmation will charge.
    async fn prepare_track_purchase(
        &self,
        track_id: i64,
        identity: &Identity,
    ) -> Result<HandlerTurn, AgentError> {
        identity.check_scope(identity.subject_id)?;

        let Some(track) = self.catalog.find_track(track_id).await? else {
            return Ok(HandlerTurn::reply(format!(
                "I couldn't find track {track_id} in the catalog."
            )));
        };

        let mut args = Map::new();
        args.insert("track_id".to_string(), json!(track.track_id));
        args.insert("track".to_string(), json!(track.name));
        args.insert("artist".to_string(), json!(track.artist));
        args.insert("price".to_string(), json!(track.unit_price.to_string()));
        args.insert("customer_id".to_string(), json!(identity.subject_id));

        Ok(HandlerTurn::suspend(Suspension {
            kind: SuspensionKind::Confirmation,
            handler: HandlerName::Storefront,
            action: "purchase_track".to_string(),
            prompt: format!(
                "Confirm purchase of \"{}\" by {} for ${}?",
                track.name, track.artist, track.unit_price
            ),
            args,
        }))
    }

    async fn prepare_album_purchase(
        &self,
        album_id: i64,
        identity: &Identity,
    ) -> Result<HandlerTurn, AgentError> {
        identity.check_scope(identity.subject_id)?;

        let Some(album) = self.catalog.find_album(album_id).await? else {
            return Ok(HandlerTurn::reply(format!(
                "I couldn't find album {album_id} in the catalog."
            )));
        };
        let tracks = self.catalog.album_tracks(album_id).await?;
        if tracks.is_empty() {
            return Ok(HandlerTurn::reply(format!(
                "\"{}\" has no purchasable tracks.",
                album.title
            )));
        }

        let total: Decimal = tracks.iter().map(|track| track.unit_price).sum();
        let lines: Vec<Value> = tracks
            .iter()
            .map(|track| {
                json!({"track_id": track.track_id, "price": track.unit_price.to_string()})
            })
            .collect();

        let mut args = Map::new();
        args.insert("album_id".to_string(), json!(album.album_id));
        args.insert("album".to_string(), json!(album.title));
        args.insert("artist".to_string(), json!(album.artist));
        args.insert("total".to_string(), json!(total.to_string()));
        args.insert("lines".to_string(), Value::Array(lines));
        args.insert("customer_id".to_string(), json!(identity.subject_id));

        Ok(HandlerTurn::suspend(Suspension {
            kind: SuspensionKind::Confirmation,
            handler: HandlerName::Storefront,
            action: "purchase_album".to_string(),
            prompt: format!(
                "Confirm purchase of \"{}\" by {} ({} tracks) for ${total}?",
                album.title,
                album.artist,
                tracks.len()
            ),
            args,
        }))
    }

    /// Commit step: charges the price captured at suspension time, not the
    /// current catalog price, so the receipt matches what was confirmed.
    async fn commit_purchase(
        &self,
        suspension: &Suspension,
        identity: &Identity,
    ) -> Result<HandlerTurn, AgentError> {
        let customer_id = suspension
            .arg_i64("customer_id")
            .ok_or_else(|| AgentError::MutationFailure("missing customer id".to_string()))?;
        identity.check_scope(customer_id)?;

        let (description, total, lines) = match suspension.action.as_str() {
            "purchase_track" => {
                let track_id = suspension
                    .arg_i64("track_id")
                    .ok_or_else(|| AgentError::MutationFailure("missing track id".to_string()))?;
                let price = captured_amount(suspension, "price")?;
                if self
                    .catalog
                    .find_track(track_id)
                    .await
                    .map_err(|error| AgentError::MutationFailure(error.to_string()))?
                    .is_none()
                {
                    return Err(AgentError::MutationFailure(format!(
                        "track {track_id} no longer exists"
                    )));
                }
                let description = format!(
                    "\"{}\" by {}",
                    suspension.arg_str("track").unwrap_or("the track"),
                    suspension.arg_str("artist").unwrap_or("the artist"),
                );
                (description, price, vec![NewInvoiceLine { track_id, unit_price: price, quantity: 1 }])
            }
            "purchase_album" => {
                let total = captured_amount(suspension, "total")?;
                let lines = captured_lines(suspension)?;
                let description = format!(
                    "\"{}\" by {}",
                    suspension.arg_str("album").unwrap_or("the album"),
                    suspension.arg_str("artist").unwrap_or("the artist"),
                );
                (description, total, lines)
            }
            other => {
                return Err(AgentError::MutationFailure(format!("unknown action `{other}`")));
            }
        };

        let billing = self
            .subjects
            .customer_billing(customer_id)
            .await
            .map_err(|error| AgentError::MutationFailure(error.to_string()))?
            .unwrap_or_else(BillingInfo::default);

        let invoice_id = self
            .invoices
            .create_invoice(NewInvoice { customer_id, billing, total, lines })
            .await
            .map_err(|error| AgentError::MutationFailure(error.to_string()))?;

        Ok(HandlerTurn::reply(format!(
            "Purchased {description} for ${total}. Your invoice number is {invoice_id}."
        )))
    }
}

fn captured_amount(suspension: &Suspension, key: &str) -> Result<Decimal, AgentError> {
    suspension
        .arg_str(key)
        .and_then(|raw| raw.parse().ok())
        .ok_or_else(|| AgentError::MutationFailure(format!("captured {key} is unreadable")))
}

fn captured_lines(suspension: &Suspension) -> Result<Vec<NewInvoiceLine>, AgentError> {
    let raw = suspension
        .args
        .get("lines")
        .and_then(Value::as_array)
        .ok_or_else(|| AgentError::MutationFailure("captured lines are unreadable".to_string()))?;

    raw.iter()
        .map(|line| {
            let track_id = line.get("track_id").and_then(Value::as_i64);
            let price =
                line.get("price").and_then(Value::as_str).and_then(|raw| raw.parse().ok());
            match (track_id, price) {
                (Some(track_id), Some(unit_price)) => {
                    Ok(NewInvoiceLine { track_id, unit_price, quantity: 1 })
                }
                _ => Err(AgentError::MutationFailure("captured lines are unreadable".to_string())),
            }
        })
        .collect()
}

fn capability_summary() -> &'static str {
    "I can search for tracks and albums, list an album's tracks, or buy a \
     track or album for you. What would you like to do?"
}

#[async_trait]
impl Handler for StorefrontHandler {
    fn name(&self) -> HandlerName {
        HandlerName::Storefront
    }

    async fn run(
        &self,
        conversation: &Conversation,
        identity: &Identity,
    ) -> Result<HandlerTurn, AgentError> {
        let system = operation_instructions(identity, "storefront handler", OPERATIONS);
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
            let what = suspension
                .arg_str("track")
                .or_else(|| suspension.arg_str("album"))
                .unwrap_or("the item");
            return Ok(HandlerTurn::reply(format!(
                "Purchase of \"{what}\" was cancelled. No charge was made."
            )));
        }
        self.commit_purchase(suspension, identity).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rust_decimal::Decimal;

    use tunesmith_core::{Conversation, ConversationId, Identity, Message, SuspensionKind};
    use tunesmith_db::repositories::{
        InMemoryCatalogRepository, InMemoryInvoiceRepository, InMemorySubjectRepository,
        InvoiceRepository, TrackDetail,
    };

    use super::StorefrontHandler;
    use crate::handlers::Handler;
    use crate::testing::ScriptedLlm;

    fn track(track_id: i64, name: &str, price: &str) -> TrackDetail {
        TrackDetail {
            track_id,
            name: name.to_string(),
            artist: "Midnight Parade".to_string(),
            album: "Neon Rooftops".to_string(),
            genre: Some("Rock".to_string()),
            unit_price: price.parse().expect("price"),
        }
    }

    fn handler_with(
        llm: ScriptedLlm,
    ) -> (StorefrontHandler, Arc<InMemoryInvoiceRepository>, Arc<InMemoryCatalogRepository>) {
        let catalog = Arc::new(InMemoryCatalogRepository::new());
        catalog.insert_track(track(7, "Glass Avenue", "0.99"));
        let invoices = Arc::new(InMemoryInvoiceRepository::new());
        let subjects = Arc::new(InMemorySubjectRepository::new());
        let handler = StorefrontHandler::new(
            Arc::new(llm),
            catalog.clone(),
            invoices.clone(),
            subjects,
        );
        (handler, invoices, catalog)
    }

    fn conversation(text: &str) -> Conversation {
        Conversation::with_messages(
            ConversationId("c-1".to_string()),
            vec![Message::user(text)],
        )
    }

    #[tokio::test]
    async fn purchase_proposal_parks_a_confirmation_with_the_captured_price() {
        let llm =
            ScriptedLlm::repeating(r#"{"operation": "purchase_track", "args": {"track_id": 7}}"#);
        let (handler, invoices, _) = handler_with(llm);

        let turn = handler
            .run(&conversation("buy track 7"), &Identity::customer(61, "Astrid"))
            .await
            .expect("run");

        let suspension = turn.suspension.expect("parked");
        assert_eq!(suspension.kind, SuspensionKind::Confirmation);
        assert_eq!(suspension.action, "purchase_track");
        assert_eq!(suspension.arg_i64("track_id"), Some(7));
        assert_eq!(suspension.arg_str("price"), Some("0.99"));
        assert!(suspension.prompt.contains("$0.99"));
        // Preparation is read-only.
        assert_eq!(invoices.invoice_count(), 0);
    }

    #[tokio::test]
    async fn rejection_makes_no_charge() {
        let llm =
            ScriptedLlm::repeating(r#"{"operation": "purchase_track", "args": {"track_id": 7}}"#);
        let (handler, invoices, _) = handler_with(llm);
        let astrid = Identity::customer(61, "Astrid");

        let turn = handler.run(&conversation("buy track 7"), &astrid).await.expect("run");
        let suspension = turn.suspension.expect("parked");

        let outcome = handler.resolve(&suspension, false, &astrid).await.expect("resolve");
        assert!(outcome.messages[0].content.contains("cancelled"));
        assert!(outcome.messages[0].content.contains("No charge"));
        assert_eq!(invoices.invoice_count(), 0);
    }

    #[tokio::test]
    async fn acceptance_writes_exactly_one_invoice_at_the_captured_price() {
        let llm =
            ScriptedLlm::repeating(r#"{"operation": "purchase_track", "args": {"track_id": 7}}"#);
        let (handler, invoices, _) = handler_with(llm);
        let astrid = Identity::customer(61, "Astrid");

        let turn = handler.run(&conversation("buy track 7"), &astrid).await.expect("run");
        let suspension = turn.suspension.expect("parked");

        let outcome = handler.resolve(&suspension, true, &astrid).await.expect("resolve");
        assert!(outcome.messages[0].content.contains("$0.99"));
        assert_eq!(invoices.invoice_count(), 1);

        let summaries = invoices.invoices_for_customer(61).await.expect("invoices");
        assert_eq!(summaries[0].total, "0.99".parse::<Decimal>().expect("price"));
    }

    #[tokio::test]
    async fn missing_track_is_a_reply_not_a_suspension() {
        let llm =
            ScriptedLlm::repeating(r#"{"operation": "purchase_track", "args": {"track_id": 404}}"#);
        let (handler, invoices, _) = handler_with(llm);

        let turn = handler
            .run(&conversation("buy track 404"), &Identity::customer(61, "Astrid"))
            .await
            .expect("run");
        assert!(turn.suspension.is_none());
        assert!(turn.messages[0].content.contains("couldn't find"));
        assert_eq!(invoices.invoice_count(), 0);
    }

    #[tokio::test]
    async fn classifier_outage_degrades_to_a_capability_summary() {
        let (handler, _, _) = handler_with(ScriptedLlm::failing());
        let turn = handler
            .run(&conversation("buy something"), &Identity::customer(61, "Astrid"))
            .await
            .expect("run");
        assert!(turn.messages[0].content.contains("search for tracks"));
    }
}
