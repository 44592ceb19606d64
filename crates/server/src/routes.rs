//! JSON API for the conversational assistant.
//!
//! - `POST /api/v1/conversations/{id}/messages`   — submit a user turn
//! - `POST /api/v1/conversations/{id}/resolution` — resolve a pending suspension
//! - `GET  /api/v1/conversations/{id}`            — fetch the transcript

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use tunesmith_agent::{ConversationEngine, EngineReply};
use tunesmith_core::{AgentError, ConversationId, Resolution, SuspensionKind};
use tunesmith_db::repositories::{ConversationRepository, SqlConversationRepository};
use tunesmith_db::DbPool;

#[derive(Clone)]
pub struct ApiState {
    engine: Arc<ConversationEngine>,
    db_pool: DbPool,
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub credential: String,
    pub text: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnResponse {
    Completed { message: String },
    Suspended { kind: SuspensionKind, prompt: String },
}

#[derive(Debug, Serialize)]
pub struct TranscriptMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct PendingSuspension {
    pub kind: SuspensionKind,
    pub prompt: String,
}

#[derive(Debug, Serialize)]
pub struct TranscriptResponse {
    pub conversation_id: String,
    pub messages: Vec<TranscriptMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingSuspension>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
}

pub fn router(engine: Arc<ConversationEngine>, db_pool: DbPool) -> Router {
    Router::new()
        .route("/api/v1/conversations/{id}/messages", post(post_message))
        .route("/api/v1/conversations/{id}/resolution", post(post_resolution))
        .route("/api/v1/conversations/{id}", get(get_conversation))
        .with_state(ApiState { engine, db_pool })
}

pub async fn post_message(
    Path(id): Path<String>,
    State(state): State<ApiState>,
    Json(body): Json<MessageRequest>,
) -> Result<Json<TurnResponse>, (StatusCode, Json<ApiError>)> {
    if body.text.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ApiError { error: "message text is required".to_string() }),
        ));
    }

    let conversation_id = ConversationId(id);
    let reply = state
        .engine
        .handle_message(&conversation_id, &body.credential, body.text.trim())
        .await
        .map_err(agent_error)?;

    info!(
        event_name = "api.message.handled",
        conversation_id = %conversation_id,
        suspended = matches!(reply, EngineReply::Suspended { .. }),
    );

    Ok(Json(turn_response(reply)))
}

pub async fn post_resolution(
    Path(id): Path<String>,
    State(state): State<ApiState>,
    Json(resolution): Json<Resolution>,
) -> Result<Json<TurnResponse>, (StatusCode, Json<ApiError>)> {
    let conversation_id = ConversationId(id);
    let reply = state
        .engine
        .handle_resolution(&conversation_id, resolution)
        .await
        .map_err(agent_error)?;

    info!(event_name = "api.resolution.handled", conversation_id = %conversation_id);

    Ok(Json(turn_response(reply)))
}

pub async fn get_conversation(
    Path(id): Path<String>,
    State(state): State<ApiState>,
) -> Result<Json<TranscriptResponse>, (StatusCode, Json<ApiError>)> {
    let conversation_id = ConversationId(id);
    let record = SqlConversationRepository::new(state.db_pool.clone())
        .load(&conversation_id)
        .await
        .map_err(|error| agent_error(error.into()))?;

    let Some(record) = record else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(ApiError { error: format!("conversation `{conversation_id}` not found") }),
        ));
    };

    let messages = record
        .conversation
        .messages()
        .iter()
        .map(|message| TranscriptMessage {
            role: message.role.as_str(),
            content: message.content.clone(),
        })
        .collect();
    let pending = record
        .routing
        .pending_suspension
        .map(|suspension| PendingSuspension { kind: suspension.kind, prompt: suspension.prompt });

    Ok(Json(TranscriptResponse { conversation_id: conversation_id.0, messages, pending }))
}

fn turn_response(reply: EngineReply) -> TurnResponse {
    match reply {
        EngineReply::Completed { message } => TurnResponse::Completed { message },
        EngineReply::Suspended { kind, prompt } => TurnResponse::Suspended { kind, prompt },
    }
}

/// HTTP rendering of the error taxonomy. Bodies carry the user-safe message
/// only; the raw detail goes to the log.
fn agent_error(error: AgentError) -> (StatusCode, Json<ApiError>) {
    let status = match &error {
        AgentError::Unauthorized => StatusCode::UNAUTHORIZED,
        AgentError::ScopeViolation { .. } => StatusCode::FORBIDDEN,
        AgentError::NoPendingSuspension { .. } | AgentError::SuspensionAlreadyPending { .. } => {
            StatusCode::CONFLICT
        }
        AgentError::SuspensionKindMismatch => StatusCode::UNPROCESSABLE_ENTITY,
        AgentError::ClassifierFailure(_)
        | AgentError::MutationFailure(_)
        | AgentError::Storage(_) => StatusCode::SERVICE_UNAVAILABLE,
    };

    warn!(event_name = "api.request_failed", status = %status, error = %error);

    (status, Json(ApiError { error: error.user_message().to_string() }))
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use axum::{extract::Path, extract::State, http::StatusCode, Json};

    use tunesmith_agent::LlmClient;
    use tunesmith_core::{Resolution, SuspensionKind};
    use tunesmith_db::{connect_url, fixtures, migrations, DbPool};

    use super::{post_message, post_resolution, ApiState, MessageRequest, TurnResponse};
    use crate::bootstrap::build_engine;

    struct ScriptedClient {
        replies: Mutex<VecDeque<&'static str>>,
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn complete(&self, _system: &str, _user: &str) -> anyhow::Result<String> {
            let mut replies = self.replies.lock().unwrap_or_else(|p| p.into_inner());
            replies
                .pop_front()
                .map(str::to_string)
                .ok_or_else(|| anyhow::anyhow!("script exhausted"))
        }
    }

    async fn state(script: &[&'static str]) -> (ApiState, DbPool) {
        let pool = connect_url("sqlite::memory:").await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        fixtures::seed(&pool).await.expect("seed");

        let llm = Arc::new(ScriptedClient {
            replies: Mutex::new(script.iter().copied().collect()),
        });
        let engine = Arc::new(build_engine(pool.clone(), llm));
        (ApiState { engine, db_pool: pool.clone() }, pool)
    }

    fn message(credential: &str, text: &str) -> Json<MessageRequest> {
        Json(MessageRequest { credential: credential.to_string(), text: text.to_string() })
    }

    #[tokio::test]
    async fn message_turn_completes_with_the_assistant_reply() {
        // Supervisor picks discovery, the handler replies in prose, then the
        // supervisor finishes.
        let (state, _pool) =
            state(&["discovery", "Try the Rock section, it's excellent.", "finish"]).await;

        let Json(response) = post_message(
            Path("c-1".to_string()),
            State(state),
            message("astrid", "what should I listen to?"),
        )
        .await
        .expect("turn should complete");

        match response {
            TurnResponse::Completed { message } => assert!(message.contains("Rock section")),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn purchase_flow_suspends_then_resolves() {
        let (state, _pool) = state(&[
            "storefront",
            r#"{"operation": "purchase_track", "args": {"track_id": 1}}"#,
            "finish",
        ])
        .await;

        let Json(response) = post_message(
            Path("c-2".to_string()),
            State(state.clone()),
            message("astrid", "buy track 1"),
        )
        .await
        .expect("turn should suspend");
        match response {
            TurnResponse::Suspended { kind, .. } => {
                assert_eq!(kind, SuspensionKind::Confirmation)
            }
            other => panic!("expected suspension, got {other:?}"),
        }

        let Json(response) = post_resolution(
            Path("c-2".to_string()),
            State(state),
            Json(Resolution::Confirmation { confirmed: false }),
        )
        .await
        .expect("resolution should complete");
        match response {
            TurnResponse::Completed { message } => assert!(message.contains("cancelled")),
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolution_without_a_pending_suspension_is_a_conflict() {
        let (state, _pool) = state(&[]).await;

        let (status, _) = post_resolution(
            Path("c-3".to_string()),
            State(state),
            Json(Resolution::Confirmation { confirmed: true }),
        )
        .await
        .expect_err("nothing is pending");
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_credential_is_unauthorized() {
        let (state, _pool) = state(&[]).await;

        let (status, body) =
            post_message(Path("c-4".to_string()), State(state), message("intruder", "hello"))
                .await
                .expect_err("credential is unknown");
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body.0.error, "Authentication failed.");
    }

    #[tokio::test]
    async fn blank_message_text_is_rejected() {
        let (state, _pool) = state(&[]).await;

        let (status, _) =
            post_message(Path("c-5".to_string()), State(state), message("astrid", "   "))
                .await
                .expect_err("text is blank");
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn transcript_reports_the_pending_suspension() {
        let (state, _pool) = state(&[
            "storefront",
            r#"{"operation": "purchase_track", "args": {"track_id": 2}}"#,
        ])
        .await;

        post_message(
            Path("c-6".to_string()),
            State(state.clone()),
            message("astrid", "buy track 2"),
        )
        .await
        .expect("turn should suspend");

        let Json(transcript) =
            super::get_conversation(Path("c-6".to_string()), State(state))
                .await
                .expect("transcript should load");
        assert_eq!(transcript.conversation_id, "c-6");
        assert_eq!(transcript.messages[0].role, "user");
        let pending = transcript.pending.expect("suspension should be pending");
        assert_eq!(pending.kind, SuspensionKind::Confirmation);
    }
}
