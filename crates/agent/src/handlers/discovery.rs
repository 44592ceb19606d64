use std::sync::Arc;

use async_trait::async_trait;

use tunesmith_core::{AgentError, Conversation, HandlerName, Identity, Role};
use tunesmith_db::repositories::RecommendationRepository;

use super::{operation_instructions, parse_proposal, Handler, HandlerTurn, Proposal};
use crate::llm::LlmClient;

const OPERATIONS: &[(&str, &str)] = &[
    ("recommend_tracks", "args: {}; tracks from the caller's favorite genres they don't own"),
    ("recommend_artists", "args: {}; artists in the caller's genres they've never bought"),
    ("popular_in_genre", "args: {genre}; best sellers in a genre, any caller"),
];

const SUGGESTION_LIMIT: i64 = 5;

/// Recommendations, available to both roles. History-based suggestions only
/// make sense for customers; employees (and customers with no purchases) get
/// genre popularity instead.
pub struct DiscoveryHandler {
    llm: Arc<dyn LlmClient>,
    recommendations: Arc<dyn RecommendationRepository>,
}

impl DiscoveryHandler {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        recommendations: Arc<dyn RecommendationRepository>,
    ) -> Self {
        Self { llm, recommendations }
    }

    async fn execute(
        &self,
        proposal: Proposal,
        identity: &Identity,
    ) -> Result<HandlerTurn, AgentError> {
        match proposal.operation.as_str() {
            "recommend_tracks" => {
                if identity.role != Role::Customer {
                    return Ok(HandlerTurn::reply(no_history_reply()));
                }
                let genres = self.recommendations.top_genres(identity.subject_id).await?;
                if genres.is_empty() {
                    return Ok(HandlerTurn::reply(no_history_reply()));
                }
                let genre_ids: Vec<i64> = genres.iter().map(|genre| genre.genre_id).collect();
                let tracks = self
                    .recommendations
                    .unowned_tracks_in_genres(&genre_ids, identity.subject_id, SUGGESTION_LIMIT)
                    .await?;
                if tracks.is_empty() {
                    return Ok(HandlerTurn::reply(
                        "You already own everything in your favorite genres. Impressive.",
                    ));
                }
                let favorite_genres = genres
                    .iter()
                    .map(|genre| genre.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ");
                let lines = tracks
                    .iter()
                    .map(|track| {
                        format!(
                            "- \"{}\" by {} ({}) — ${}",
                            track.name,
                            track.artist,
                            track.genre.as_deref().unwrap_or("unknown genre"),
                            track.unit_price
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                Ok(HandlerTurn::reply(format!(
                    "Based on your listening in {favorite_genres}:\n{lines}"
                )))
            }
            "recommend_artists" => {
                if identity.role != Role::Customer {
                    return Ok(HandlerTurn::reply(no_history_reply()));
                }
                let artists = self
                    .recommendations
                    .unheard_artists(identity.subject_id, SUGGESTION_LIMIT)
                    .await?;
                if artists.is_empty() {
                    return Ok(HandlerTurn::reply(no_history_reply()));
                }
                let lines = artists
                    .iter()
                    .map(|artist| {
                        format!(
                            "- {} ({} tracks in {})",
                            artist.artist, artist.track_count, artist.genres
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                Ok(HandlerTurn::reply(format!("Artists you haven't tried yet:\n{lines}")))
            }
            "popular_in_genre" => {
                let Some(genre) = proposal.arg_str("genre") else {
                    return Ok(HandlerTurn::reply("Which genre are you curious about?"));
                };
                let exclude = (identity.role == Role::Customer).then_some(identity.subject_id);
                let tracks = self
                    .recommendations
                    .popular_in_genre(genre, exclude, SUGGESTION_LIMIT)
                    .await?;
                if tracks.is_empty() {
                    return Ok(HandlerTurn::reply(format!(
                        "I don't have anything to suggest in \"{genre}\"."
                    )));
                }
                let lines = tracks
                    .iter()
                    .map(|track| {
                        format!(
                            "- \"{}\" by {} — ${} ({} sold)",
                            track.track, track.artist, track.unit_price, track.times_sold
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                Ok(HandlerTurn::reply(format!("Big in {genre}:\n{lines}")))
            }
            _ => Ok(HandlerTurn::reply(capability_summary())),
        }
    }
}

fn no_history_reply() -> &'static str {
    "I don't have purchase history to work from. Tell me a genre and I'll \
     show you what's popular there."
}

fn capability_summary() -> &'static str {
    "I can recommend tracks or artists based on your purchases, or show \
     what's popular in any genre."
}

#[async_trait]
impl Handler for DiscoveryHandler {
    fn name(&self) -> HandlerName {
        HandlerName::Discovery
    }

    async fn run(
        &self,
        conversation: &Conversation,
        identity: &Identity,
    ) -> Result<HandlerTurn, AgentError> {
        let system = operation_instructions(identity, "discovery handler", OPERATIONS);
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
