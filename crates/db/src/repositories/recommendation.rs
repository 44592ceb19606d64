use rust_decimal::Decimal;
use sqlx::Row;

use super::{
    ArtistRecommendation, GenreCount, PopularTrack, RecommendationRepository, RepositoryError,
    TrackDetail,
};
use crate::DbPool;

const TOP_GENRE_LIMIT: i64 = 3;

pub struct SqlRecommendationRepository {
    pool: DbPool,
}

impl SqlRecommendationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn decode(error: sqlx::Error) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}

fn parse_price(value: &str) -> Result<Decimal, RepositoryError> {
    value
        .parse::<Decimal>()
        .map_err(|error| RepositoryError::Decode(format!("price `{value}`: {error}")))
}

#[async_trait::async_trait]
impl RecommendationRepository for SqlRecommendationRepository {
    async fn top_genres(&self, customer_id: i64) -> Result<Vec<GenreCount>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT g.id AS genre_id, g.name, COUNT(*) AS purchase_count
             FROM invoice_line il
             JOIN invoice i ON il.invoice_id = i.id
             JOIN track t ON il.track_id = t.id
             JOIN genre g ON t.genre_id = g.id
             WHERE i.customer_id = ?
             GROUP BY g.id
             ORDER BY purchase_count DESC, g.name
             LIMIT ?",
        )
        .bind(customer_id)
        .bind(TOP_GENRE_LIMIT)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(GenreCount {
                    genre_id: row.try_get("genre_id").map_err(decode)?,
                    name: row.try_get("name").map_err(decode)?,
                    purchase_count: row.try_get("purchase_count").map_err(decode)?,
                })
            })
            .collect()
    }

    async fn unowned_tracks_in_genres(
        &self,
        genre_ids: &[i64],
        customer_id: i64,
        limit: i64,
    ) -> Result<Vec<TrackDetail>, RepositoryError> {
        if genre_ids.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; genre_ids.len()].join(", ");
        let sql = format!(
            "SELECT t.id AS track_id, t.name, ar.name AS artist, al.title AS album,
                    g.name AS genre, t.unit_price
             FROM track t
             JOIN album al ON t.album_id = al.id
             JOIN artist ar ON al.artist_id = ar.id
             JOIN genre g ON t.genre_id = g.id
             WHERE t.genre_id IN ({placeholders})
               AND t.id NOT IN (
                   SELECT il.track_id FROM invoice_line il
                   JOIN invoice i ON il.invoice_id = i.id
                   WHERE i.customer_id = ?)
             ORDER BY ar.name, t.name
             LIMIT ?"
        );

        let mut query = sqlx::query(&sql);
        for genre_id in genre_ids {
            query = query.bind(genre_id);
        }
        let rows = query.bind(customer_id).bind(limit).fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| {
                let unit_price: String = row.try_get("unit_price").map_err(decode)?;
                Ok(TrackDetail {
                    track_id: row.try_get("track_id").map_err(decode)?,
                    name: row.try_get("name").map_err(decode)?,
                    artist: row.try_get("artist").map_err(decode)?,
                    album: row.try_get("album").map_err(decode)?,
                    genre: row.try_get("genre").map_err(decode)?,
                    unit_price: parse_price(&unit_price)?,
                })
            })
            .collect()
    }

    async fn unheard_artists(
        &self,
        customer_id: i64,
        limit: i64,
    ) -> Result<Vec<ArtistRecommendation>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT ar.name AS artist, COUNT(t.id) AS track_count,
                    GROUP_CONCAT(DISTINCT g.name) AS genres
             FROM artist ar
             JOIN album al ON al.artist_id = ar.id
             JOIN track t ON t.album_id = al.id
             JOIN genre g ON t.genre_id = g.id
             WHERE t.genre_id IN (
                   SELECT DISTINCT t2.genre_id FROM invoice_line il
                   JOIN invoice i ON il.invoice_id = i.id
                   JOIN track t2 ON il.track_id = t2.id
                   WHERE i.customer_id = ? AND t2.genre_id IS NOT NULL)
               AND ar.id NOT IN (
                   SELECT DISTINCT al2.artist_id FROM invoice_line il
                   JOIN invoice i ON il.invoice_id = i.id
                   JOIN track t3 ON il.track_id = t3.id
                   JOIN album al2 ON t3.album_id = al2.id
                   WHERE i.customer_id = ?)
             GROUP BY ar.id
             ORDER BY track_count DESC, ar.name
             LIMIT ?",
        )
        .bind(customer_id)
        .bind(customer_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(ArtistRecommendation {
                    artist: row.try_get("artist").map_err(decode)?,
                    track_count: row.try_get("track_count").map_err(decode)?,
                    genres: row.try_get("genres").map_err(decode)?,
                })
            })
            .collect()
    }

    async fn popular_in_genre(
        &self,
        genre_name: &str,
        exclude_customer: Option<i64>,
        limit: i64,
    ) -> Result<Vec<PopularTrack>, RepositoryError> {
        // Bind -1 when no customer is excluded; no invoice belongs to it.
        let excluded = exclude_customer.unwrap_or(-1);

        let rows = sqlx::query(
            "SELECT t.name AS track, ar.name AS artist, t.unit_price,
                    COUNT(il.id) AS times_sold
             FROM track t
             JOIN album al ON t.album_id = al.id
             JOIN artist ar ON al.artist_id = ar.id
             JOIN genre g ON t.genre_id = g.id
             LEFT JOIN invoice_line il ON il.track_id = t.id
             WHERE LOWER(g.name) = LOWER(?)
               AND t.id NOT IN (
                   SELECT il2.track_id FROM invoice_line il2
                   JOIN invoice i ON il2.invoice_id = i.id
                   WHERE i.customer_id = ?)
             GROUP BY t.id
             ORDER BY times_sold DESC, t.name
             LIMIT ?",
        )
        .bind(genre_name.trim())
        .bind(excluded)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let unit_price: String = row.try_get("unit_price").map_err(decode)?;
                Ok(PopularTrack {
                    track: row.try_get("track").map_err(decode)?,
                    artist: row.try_get("artist").map_err(decode)?,
                    unit_price: parse_price(&unit_price)?,
                    times_sold: row.try_get("times_sold").map_err(decode)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::SqlRecommendationRepository;
    use crate::fixtures;
    use crate::repositories::{
        InvoiceRepository, RecommendationRepository, SqlSubjectRepository, SubjectRepository,
    };
    use crate::{connect_url, migrations};

    async fn seeded_pool() -> sqlx::SqlitePool {
        let pool = connect_url("sqlite::memory:").await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        fixtures::seed(&pool).await.expect("seed");
        pool
    }

    async fn customer_id(pool: &sqlx::SqlitePool, first_name: &str) -> i64 {
        SqlSubjectRepository::new(pool.clone())
            .find_identity_by_credential(first_name)
            .await
            .expect("lookup")
            .expect("seeded customer")
            .subject_id
    }

    #[tokio::test]
    async fn top_genres_reflect_purchase_history() {
        let pool = seeded_pool().await;
        let repo = SqlRecommendationRepository::new(pool.clone());
        let astrid = customer_id(&pool, "astrid").await;

        let genres = repo.top_genres(astrid).await.expect("genres");
        assert!(!genres.is_empty());
        assert!(genres.len() <= 3);
        assert!(genres.windows(2).all(|pair| pair[0].purchase_count >= pair[1].purchase_count));
    }

    #[tokio::test]
    async fn genre_suggestions_exclude_owned_tracks() {
        let pool = seeded_pool().await;
        let repo = SqlRecommendationRepository::new(pool.clone());
        let astrid = customer_id(&pool, "astrid").await;

        let genres = repo.top_genres(astrid).await.expect("genres");
        let genre_ids: Vec<i64> = genres.iter().map(|genre| genre.genre_id).collect();
        let suggestions =
            repo.unowned_tracks_in_genres(&genre_ids, astrid, 10).await.expect("suggestions");

        let invoices = crate::repositories::SqlInvoiceRepository::new(pool.clone());
        let owned = invoices.purchases_for_customer(astrid).await.expect("purchases");
        for suggestion in &suggestions {
            assert!(owned.iter().all(|line| line.track != suggestion.name));
        }
    }

    #[tokio::test]
    async fn customer_with_no_history_gets_no_genres() {
        let pool = seeded_pool().await;
        let repo = SqlRecommendationRepository::new(pool.clone());
        let genres = repo.top_genres(999_999).await.expect("genres");
        assert!(genres.is_empty());
    }

    #[tokio::test]
    async fn popular_in_genre_matches_case_insensitively() {
        let pool = seeded_pool().await;
        let repo = SqlRecommendationRepository::new(pool);

        let lower = repo.popular_in_genre("rock", None, 5).await.expect("lower");
        let upper = repo.popular_in_genre("ROCK", None, 5).await.expect("upper");
        assert_eq!(lower, upper);
        assert!(!lower.is_empty());
    }
}
