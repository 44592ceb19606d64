use rust_decimal::Decimal;
use sqlx::Row;

use super::{AlbumSummary, AlbumTrack, CatalogRepository, RepositoryError, TrackDetail};
use crate::DbPool;

const TRACK_SEARCH_LIMIT: i64 = 20;
const ALBUM_SEARCH_LIMIT: i64 = 15;

pub struct SqlCatalogRepository {
    pool: DbPool,
}

impl SqlCatalogRepository {
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

fn like_pattern(query: &str) -> String {
    format!("%{}%", query.trim())
}

fn track_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<TrackDetail, RepositoryError> {
    let unit_price: String = row.try_get("unit_price").map_err(decode)?;
    Ok(TrackDetail {
        track_id: row.try_get("track_id").map_err(decode)?,
        name: row.try_get("name").map_err(decode)?,
        artist: row.try_get("artist").map_err(decode)?,
        album: row.try_get("album").map_err(decode)?,
        genre: row.try_get("genre").map_err(decode)?,
        unit_price: parse_price(&unit_price)?,
    })
}

// Prices are stored as TEXT; summing them in SQL would go through SQLite's
// float coercion, so the rows are concatenated and summed as `Decimal` here.
fn sum_joined_prices(joined: &str) -> Result<Decimal, RepositoryError> {
    joined.split('|').filter(|price| !price.is_empty()).map(parse_price).sum()
}

fn album_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<AlbumSummary, RepositoryError> {
    let track_prices: String = row.try_get("track_prices").map_err(decode)?;
    Ok(AlbumSummary {
        album_id: row.try_get("album_id").map_err(decode)?,
        title: row.try_get("title").map_err(decode)?,
        artist: row.try_get("artist").map_err(decode)?,
        track_count: row.try_get("track_count").map_err(decode)?,
        total_price: sum_joined_prices(&track_prices)?,
    })
}

const TRACK_SELECT: &str = "SELECT t.id AS track_id, t.name, ar.name AS artist,
        al.title AS album, g.name AS genre, t.unit_price
 FROM track t
 JOIN album al ON t.album_id = al.id
 JOIN artist ar ON al.artist_id = ar.id
 LEFT JOIN genre g ON t.genre_id = g.id";

#[async_trait::async_trait]
impl CatalogRepository for SqlCatalogRepository {
    async fn find_track(&self, track_id: i64) -> Result<Option<TrackDetail>, RepositoryError> {
        let row = sqlx::query(&format!("{TRACK_SELECT} WHERE t.id = ?"))
            .bind(track_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(track_from_row).transpose()
    }

    async fn search_tracks(&self, query: &str) -> Result<Vec<TrackDetail>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "{TRACK_SELECT}
             WHERE t.name LIKE ? OR ar.name LIKE ? OR al.title LIKE ?
             ORDER BY ar.name, al.title, t.name
             LIMIT ?"
        ))
        .bind(like_pattern(query))
        .bind(like_pattern(query))
        .bind(like_pattern(query))
        .bind(TRACK_SEARCH_LIMIT)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(track_from_row).collect()
    }

    async fn search_albums(&self, query: &str) -> Result<Vec<AlbumSummary>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT al.id AS album_id, al.title, ar.name AS artist,
                    COUNT(t.id) AS track_count,
                    COALESCE(GROUP_CONCAT(t.unit_price, '|'), '') AS track_prices
             FROM album al
             JOIN artist ar ON al.artist_id = ar.id
             LEFT JOIN track t ON t.album_id = al.id
             WHERE al.title LIKE ? OR ar.name LIKE ?
             GROUP BY al.id
             ORDER BY ar.name, al.title
             LIMIT ?",
        )
        .bind(like_pattern(query))
        .bind(like_pattern(query))
        .bind(ALBUM_SEARCH_LIMIT)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(album_from_row).collect()
    }

    async fn find_album(&self, album_id: i64) -> Result<Option<AlbumSummary>, RepositoryError> {
        let row = sqlx::query(
            "SELECT al.id AS album_id, al.title, ar.name AS artist,
                    COUNT(t.id) AS track_count,
                    COALESCE(GROUP_CONCAT(t.unit_price, '|'), '') AS track_prices
             FROM album al
             JOIN artist ar ON al.artist_id = ar.id
             LEFT JOIN track t ON t.album_id = al.id
             WHERE al.id = ?
             GROUP BY al.id",
        )
        .bind(album_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(album_from_row).transpose()
    }

    async fn album_tracks(&self, album_id: i64) -> Result<Vec<AlbumTrack>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id AS track_id, name, unit_price FROM track WHERE album_id = ? ORDER BY id",
        )
        .bind(album_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let unit_price: String = row.try_get("unit_price").map_err(decode)?;
                Ok(AlbumTrack {
                    track_id: row.try_get("track_id").map_err(decode)?,
                    name: row.try_get("name").map_err(decode)?,
                    unit_price: parse_price(&unit_price)?,
                })
            })
            .collect()
    }
}
