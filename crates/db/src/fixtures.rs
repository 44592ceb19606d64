//! Deterministic development and test data.
//!
//! The seed is intentionally small but exercises every query shape: two
//! support reps with disjoint customer books, purchase history concentrated
//! in a couple of genres, and one customer with no history at all.

use sqlx::Row;

use crate::DbPool;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub artists: i64,
    pub tracks: i64,
    pub employees: i64,
    pub customers: i64,
    pub invoices: i64,
}

const ARTISTS: &[(i64, &str)] = &[
    (1, "Midnight Parade"),
    (2, "The Quiet Engines"),
    (3, "Vela Crossing"),
    (4, "Sable & Pine"),
];

const GENRES: &[(i64, &str)] = &[(1, "Rock"), (2, "Jazz"), (3, "Electronic")];

const ALBUMS: &[(i64, &str, i64)] = &[
    (1, "Neon Rooftops", 1),
    (2, "Harbor Lights", 2),
    (3, "Signal Fires", 3),
    (4, "Evergreen Sessions", 4),
];

// (id, name, album_id, genre_id, unit_price)
const TRACKS: &[(i64, &str, i64, i64, &str)] = &[
    (1, "Glass Avenue", 1, 1, "0.99"),
    (2, "Rooftop Run", 1, 1, "0.99"),
    (3, "Last Transfer", 1, 1, "1.29"),
    (4, "Slow Harbor", 2, 2, "0.99"),
    (5, "Night Ferry", 2, 2, "1.29"),
    (6, "Tidal Patterns", 2, 2, "0.99"),
    (7, "Beacon Pulse", 3, 3, "0.99"),
    (8, "Drift Sequence", 3, 3, "0.99"),
    (9, "Pine Hollow", 4, 1, "1.29"),
    (10, "Old Growth", 4, 2, "0.99"),
];

// (id, first, last, title, reports_to)
const EMPLOYEES: &[(i64, &str, &str, &str, Option<i64>)] = &[
    (1, "Nancy", "Edwards", "Sales Manager", None),
    (3, "Jane", "Peacock", "Sales Support Agent", Some(1)),
    (4, "Margaret", "Park", "Sales Support Agent", Some(1)),
];

// (id, first, last, email, city, country, support_rep_id)
const CUSTOMERS: &[(i64, &str, &str, &str, &str, &str, i64)] = &[
    (60, "Luis", "Rojas", "luis.rojas@example.com", "Santiago", "Chile", 3),
    (61, "Astrid", "Gruber", "astrid.gruber@example.com", "Oslo", "Norway", 3),
    (62, "Kara", "Nimmo", "kara.nimmo@example.com", "Dublin", "Ireland", 4),
];

// (id, customer_id, date, total, line track ids)
const INVOICES: &[(i64, i64, &str, &str, &[i64])] = &[
    (1, 61, "2026-05-02T10:15:00+00:00", "2.97", &[1, 2, 3]),
    (2, 61, "2026-06-11T18:40:00+00:00", "1.98", &[4, 6]),
    (3, 60, "2026-07-01T09:05:00+00:00", "0.99", &[7]),
];

pub async fn seed(pool: &DbPool) -> Result<SeedSummary, sqlx::Error> {
    let already_seeded = sqlx::query("SELECT COUNT(*) AS count FROM artist")
        .fetch_one(pool)
        .await?
        .get::<i64, _>("count")
        > 0;
    if already_seeded {
        return Ok(SeedSummary::default());
    }

    let mut tx = pool.begin().await?;

    for (id, name) in ARTISTS {
        sqlx::query("INSERT INTO artist (id, name) VALUES (?, ?)")
            .bind(id)
            .bind(name)
            .execute(&mut *tx)
            .await?;
    }

    for (id, name) in GENRES {
        sqlx::query("INSERT INTO genre (id, name) VALUES (?, ?)")
            .bind(id)
            .bind(name)
            .execute(&mut *tx)
            .await?;
    }

    for (id, title, artist_id) in ALBUMS {
        sqlx::query("INSERT INTO album (id, title, artist_id) VALUES (?, ?, ?)")
            .bind(id)
            .bind(title)
            .bind(artist_id)
            .execute(&mut *tx)
            .await?;
    }

    for (id, name, album_id, genre_id, unit_price) in TRACKS {
        sqlx::query(
            "INSERT INTO track (id, name, album_id, genre_id, unit_price) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(id)
        .bind(name)
        .bind(album_id)
        .bind(genre_id)
        .bind(unit_price)
        .execute(&mut *tx)
        .await?;
    }

    for (id, first, last, title, reports_to) in EMPLOYEES {
        sqlx::query(
            "INSERT INTO employee (id, first_name, last_name, title, hire_date, reports_to)
             VALUES (?, ?, ?, ?, '2023-01-09', ?)",
        )
        .bind(id)
        .bind(first)
        .bind(last)
        .bind(title)
        .bind(reports_to)
        .execute(&mut *tx)
        .await?;
    }

    for (id, first, last, email, city, country, support_rep_id) in CUSTOMERS {
        sqlx::query(
            "INSERT INTO customer (id, first_name, last_name, email, address, city, state,
                                   country, postal_code, support_rep_id)
             VALUES (?, ?, ?, ?, '1 Example Street', ?, NULL, ?, NULL, ?)",
        )
        .bind(id)
        .bind(first)
        .bind(last)
        .bind(email)
        .bind(city)
        .bind(country)
        .bind(support_rep_id)
        .execute(&mut *tx)
        .await?;
    }

    for (id, customer_id, date, total, track_ids) in INVOICES {
        sqlx::query(
            "INSERT INTO invoice (id, customer_id, invoice_date, billing_address, billing_city,
                                  billing_state, billing_country, billing_postal_code, total)
             SELECT ?, id, ?, address, city, state, country, postal_code, ?
             FROM customer WHERE id = ?",
        )
        .bind(id)
        .bind(date)
        .bind(total)
        .bind(customer_id)
        .execute(&mut *tx)
        .await?;

        for track_id in *track_ids {
            sqlx::query(
                "INSERT INTO invoice_line (invoice_id, track_id, unit_price, quantity)
                 SELECT ?, id, unit_price, 1 FROM track WHERE id = ?",
            )
            .bind(id)
            .bind(track_id)
            .execute(&mut *tx)
            .await?;
        }
    }

    tx.commit().await?;

    Ok(SeedSummary {
        artists: ARTISTS.len() as i64,
        tracks: TRACKS.len() as i64,
        employees: EMPLOYEES.len() as i64,
        customers: CUSTOMERS.len() as i64,
        invoices: INVOICES.len() as i64,
    })
}

#[cfg(test)]
mod tests {
    use super::seed;
    use crate::{connect_url, migrations};

    #[tokio::test]
    async fn seed_is_idempotent() {
        let pool = connect_url("sqlite::memory:").await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");

        let first = seed(&pool).await.expect("first seed");
        assert!(first.customers > 0);

        let second = seed(&pool).await.expect("second seed");
        assert_eq!(second.customers, 0, "reseeding an occupied database is a no-op");
    }
}
