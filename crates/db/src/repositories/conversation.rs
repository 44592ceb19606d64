use chrono::Utc;
use serde_json::Value;
use sqlx::Row;

use tunesmith_core::{
    Conversation, ConversationId, Message, MessageRole, Role, RoutingState, Suspension,
    SuspensionKind,
};

use super::{ConversationRecord, ConversationRepository, RepositoryError};
use crate::DbPool;

pub struct SqlConversationRepository {
    pool: DbPool,
}

impl SqlConversationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn pending_suspension(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Suspension>, RepositoryError> {
        let row = sqlx::query(
            "SELECT kind, handler, action, args, prompt FROM suspension WHERE conversation_id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(suspension_from_row).transpose()
    }
}

fn decode(error: sqlx::Error) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}

fn invalid(what: &str, value: &str) -> RepositoryError {
    RepositoryError::Decode(format!("{what} `{value}` is not recognized"))
}

fn suspension_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Suspension, RepositoryError> {
    let kind: String = row.try_get("kind").map_err(decode)?;
    let handler: String = row.try_get("handler").map_err(decode)?;
    let action: String = row.try_get("action").map_err(decode)?;
    let args: String = row.try_get("args").map_err(decode)?;
    let prompt: String = row.try_get("prompt").map_err(decode)?;

    let kind = SuspensionKind::parse(&kind).ok_or_else(|| invalid("suspension kind", &kind))?;
    let handler = tunesmith_core::HandlerName::parse(&handler)
        .ok_or_else(|| invalid("handler", &handler))?;
    let args: Value = serde_json::from_str(&args)
        .map_err(|error| RepositoryError::Decode(format!("suspension args: {error}")))?;
    let Value::Object(args) = args else {
        return Err(RepositoryError::Decode("suspension args is not an object".to_string()));
    };

    Ok(Suspension { kind, handler, action, args, prompt })
}

fn message_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Message, RepositoryError> {
    let role: String = row.try_get("role").map_err(decode)?;
    let content: String = row.try_get("content").map_err(decode)?;
    let tool_call: Option<String> = row.try_get("tool_call").map_err(decode)?;

    let role = MessageRole::parse(&role).ok_or_else(|| invalid("message role", &role))?;
    let tool_call = tool_call
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|error| RepositoryError::Decode(format!("tool_call: {error}")))?;

    Ok(Message { role, content, tool_call })
}

#[async_trait::async_trait]
impl ConversationRepository for SqlConversationRepository {
    async fn load(
        &self,
        id: &ConversationId,
    ) -> Result<Option<ConversationRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT subject_role, subject_id, turn_count FROM conversation WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let subject_role: String = row.try_get("subject_role").map_err(decode)?;
        let subject_role =
            Role::parse(&subject_role).ok_or_else(|| invalid("subject role", &subject_role))?;
        let subject_id: i64 = row.try_get("subject_id").map_err(decode)?;
        let turn_count: i64 = row.try_get("turn_count").map_err(decode)?;

        let message_rows = sqlx::query(
            "SELECT role, content, tool_call FROM message
             WHERE conversation_id = ? ORDER BY seq",
        )
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await?;
        let messages = message_rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>, RepositoryError>>()?;

        let pending_suspension = self.pending_suspension(id).await?;

        Ok(Some(ConversationRecord {
            conversation: Conversation::with_messages(id.clone(), messages),
            routing: RoutingState { turn_count, pending_suspension },
            subject_role,
            subject_id,
        }))
    }

    async fn create(
        &self,
        id: &ConversationId,
        role: Role,
        subject_id: i64,
    ) -> Result<(), RepositoryError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO conversation (id, subject_role, subject_id, turn_count, created_at, updated_at)
             VALUES (?, ?, ?, 0, ?, ?)",
        )
        .bind(&id.0)
        .bind(role.as_str())
        .bind(subject_id)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_messages(
        &self,
        id: &ConversationId,
        from_seq: i64,
        messages: &[Message],
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().to_rfc3339();

        for (offset, message) in messages.iter().enumerate() {
            let tool_call = message
                .tool_call
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|error| RepositoryError::Decode(format!("tool_call: {error}")))?;

            sqlx::query(
                "INSERT INTO message (conversation_id, seq, role, content, tool_call, created_at)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&id.0)
            .bind(from_seq + offset as i64)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(tool_call)
            .bind(&now)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE conversation SET updated_at = ? WHERE id = ?")
            .bind(&now)
            .bind(&id.0)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn set_turn_count(
        &self,
        id: &ConversationId,
        turn_count: i64,
    ) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE conversation SET turn_count = ?, updated_at = ? WHERE id = ?")
            .bind(turn_count)
            .bind(Utc::now().to_rfc3339())
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn install_suspension(
        &self,
        id: &ConversationId,
        suspension: &Suspension,
    ) -> Result<(), RepositoryError> {
        let args = serde_json::to_string(&suspension.args)
            .map_err(|error| RepositoryError::Decode(format!("suspension args: {error}")))?;

        let result = sqlx::query(
            "INSERT INTO suspension (conversation_id, kind, handler, action, args, prompt, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&id.0)
        .bind(suspension.kind.as_str())
        .bind(suspension.handler.as_str())
        .bind(&suspension.action)
        .bind(args)
        .bind(&suspension.prompt)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            // Primary-key collision means one is already pending.
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(RepositoryError::SuspensionOccupied(id.0.clone()))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn clear_suspension(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Suspension>, RepositoryError> {
        let row = sqlx::query(
            "DELETE FROM suspension WHERE conversation_id = ?
             RETURNING kind, handler, action, args, prompt",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(suspension_from_row).transpose()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map};

    use tunesmith_core::{
        ConversationId, HandlerName, Message, Role, Suspension, SuspensionKind,
    };

    use super::SqlConversationRepository;
    use crate::repositories::{ConversationRepository, RepositoryError};
    use crate::{connect_url, migrations};

    async fn repo() -> SqlConversationRepository {
        let pool = connect_url("sqlite::memory:").await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlConversationRepository::new(pool)
    }

    fn purchase_suspension() -> Suspension {
        let mut args = Map::new();
        args.insert("track_id".to_string(), json!(7));
        args.insert("price".to_string(), json!("0.99"));
        Suspension {
            kind: SuspensionKind::Confirmation,
            handler: HandlerName::Storefront,
            action: "purchase_track".to_string(),
            args,
            prompt: "Confirm purchase for $0.99?".to_string(),
        }
    }

    #[tokio::test]
    async fn transcript_round_trips_in_order() {
        let repo = repo().await;
        let id = ConversationId("c-1".to_string());
        repo.create(&id, Role::Customer, 61).await.expect("create");

        repo.append_messages(&id, 0, &[Message::user("find me some jazz")])
            .await
            .expect("append");
        repo.append_messages(
            &id,
            1,
            &[
                Message::tool("searched", json!({"operation": "search_tracks"})),
                Message::assistant("here are five tracks"),
            ],
        )
        .await
        .expect("append more");

        let record = repo.load(&id).await.expect("load").expect("exists");
        let messages = record.conversation.messages();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, "find me some jazz");
        assert_eq!(messages[2].content, "here are five tracks");
        assert_eq!(record.subject_role, Role::Customer);
        assert_eq!(record.subject_id, 61);
    }

    #[tokio::test]
    async fn turn_count_persists_across_loads() {
        let repo = repo().await;
        let id = ConversationId("c-2".to_string());
        repo.create(&id, Role::Employee, 3).await.expect("create");

        repo.set_turn_count(&id, 2).await.expect("set");
        let record = repo.load(&id).await.expect("load").expect("exists");
        assert_eq!(record.routing.turn_count, 2);
    }

    #[tokio::test]
    async fn second_install_is_rejected() {
        let repo = repo().await;
        let id = ConversationId("c-3".to_string());
        repo.create(&id, Role::Customer, 61).await.expect("create");

        repo.install_suspension(&id, &purchase_suspension()).await.expect("first install");
        let err = repo
            .install_suspension(&id, &purchase_suspension())
            .await
            .expect_err("second install must fail");
        assert!(matches!(err, RepositoryError::SuspensionOccupied(_)));
    }

    #[tokio::test]
    async fn clear_returns_the_suspension_exactly_once() {
        let repo = repo().await;
        let id = ConversationId("c-4".to_string());
        repo.create(&id, Role::Customer, 61).await.expect("create");

        let installed = purchase_suspension();
        repo.install_suspension(&id, &installed).await.expect("install");

        let first = repo.clear_suspension(&id).await.expect("clear");
        assert_eq!(first, Some(installed));

        // A redelivered resolution observes nothing pending.
        let second = repo.clear_suspension(&id).await.expect("clear again");
        assert_eq!(second, None);
    }

    #[tokio::test]
    async fn pending_suspension_rehydrates_with_the_record() {
        let repo = repo().await;
        let id = ConversationId("c-5".to_string());
        repo.create(&id, Role::Customer, 61).await.expect("create");
        repo.install_suspension(&id, &purchase_suspension()).await.expect("install");

        let record = repo.load(&id).await.expect("load").expect("exists");
        let pending = record.routing.pending_suspension.expect("pending");
        assert_eq!(pending.action, "purchase_track");
        assert_eq!(pending.arg_i64("track_id"), Some(7));
    }
}
