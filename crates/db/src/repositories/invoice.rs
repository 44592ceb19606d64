use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::Row;

use super::{
    InvoiceHeader, InvoiceItem, InvoiceRepository, InvoiceSummary, NewInvoice, PurchaseLine,
    RepositoryError,
};
use crate::DbPool;

pub struct SqlInvoiceRepository {
    pool: DbPool,
}

impl SqlInvoiceRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn decode(error: sqlx::Error) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}

fn parse_amount(value: &str) -> Result<Decimal, RepositoryError> {
    value
        .parse::<Decimal>()
        .map_err(|error| RepositoryError::Decode(format!("amount `{value}`: {error}")))
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, RepositoryError> {
    value
        .parse::<DateTime<Utc>>()
        .map_err(|error| RepositoryError::Decode(format!("timestamp `{value}`: {error}")))
}

#[async_trait::async_trait]
impl InvoiceRepository for SqlInvoiceRepository {
    async fn invoices_for_customer(
        &self,
        customer_id: i64,
    ) -> Result<Vec<InvoiceSummary>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, invoice_date, billing_city, billing_country, total
             FROM invoice
             WHERE customer_id = ?
             ORDER BY invoice_date DESC, id DESC",
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let invoice_date: String = row.try_get("invoice_date").map_err(decode)?;
                let total: String = row.try_get("total").map_err(decode)?;
                Ok(InvoiceSummary {
                    invoice_id: row.try_get("id").map_err(decode)?,
                    invoice_date: parse_timestamp(&invoice_date)?,
                    billing_city: row.try_get("billing_city").map_err(decode)?,
                    billing_country: row.try_get("billing_country").map_err(decode)?,
                    total: parse_amount(&total)?,
                })
            })
            .collect()
    }

    async fn purchases_for_customer(
        &self,
        customer_id: i64,
    ) -> Result<Vec<PurchaseLine>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT t.name AS track, ar.name AS artist, al.title AS album,
                    g.name AS genre, il.unit_price, i.invoice_date
             FROM invoice_line il
             JOIN invoice i ON il.invoice_id = i.id
             JOIN track t ON il.track_id = t.id
             JOIN album al ON t.album_id = al.id
             JOIN artist ar ON al.artist_id = ar.id
             LEFT JOIN genre g ON t.genre_id = g.id
             WHERE i.customer_id = ?
             ORDER BY i.invoice_date DESC, il.id",
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let price: String = row.try_get("unit_price").map_err(decode)?;
                let purchased_at: String = row.try_get("invoice_date").map_err(decode)?;
                Ok(PurchaseLine {
                    track: row.try_get("track").map_err(decode)?,
                    artist: row.try_get("artist").map_err(decode)?,
                    album: row.try_get("album").map_err(decode)?,
                    genre: row.try_get("genre").map_err(decode)?,
                    price: parse_amount(&price)?,
                    purchased_at: parse_timestamp(&purchased_at)?,
                })
            })
            .collect()
    }

    async fn invoice_header(
        &self,
        invoice_id: i64,
    ) -> Result<Option<InvoiceHeader>, RepositoryError> {
        let row = sqlx::query(
            "SELECT i.id, i.customer_id, c.first_name || ' ' || c.last_name AS customer_name,
                    i.invoice_date, i.billing_address, i.billing_city, i.billing_country, i.total
             FROM invoice i
             JOIN customer c ON i.customer_id = c.id
             WHERE i.id = ?",
        )
        .bind(invoice_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let invoice_date: String = row.try_get("invoice_date").map_err(decode)?;
        let total: String = row.try_get("total").map_err(decode)?;
        Ok(Some(InvoiceHeader {
            invoice_id: row.try_get("id").map_err(decode)?,
            customer_id: row.try_get("customer_id").map_err(decode)?,
            customer_name: row.try_get("customer_name").map_err(decode)?,
            invoice_date: parse_timestamp(&invoice_date)?,
            billing_address: row.try_get("billing_address").map_err(decode)?,
            billing_city: row.try_get("billing_city").map_err(decode)?,
            billing_country: row.try_get("billing_country").map_err(decode)?,
            total: parse_amount(&total)?,
        }))
    }

    async fn invoice_items(&self, invoice_id: i64) -> Result<Vec<InvoiceItem>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT t.name AS track, ar.name AS artist, il.unit_price, il.quantity
             FROM invoice_line il
             JOIN track t ON il.track_id = t.id
             JOIN album al ON t.album_id = al.id
             JOIN artist ar ON al.artist_id = ar.id
             WHERE il.invoice_id = ?
             ORDER BY il.id",
        )
        .bind(invoice_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let unit_price: String = row.try_get("unit_price").map_err(decode)?;
                Ok(InvoiceItem {
                    track: row.try_get("track").map_err(decode)?,
                    artist: row.try_get("artist").map_err(decode)?,
                    unit_price: parse_amount(&unit_price)?,
                    quantity: row.try_get("quantity").map_err(decode)?,
                })
            })
            .collect()
    }

    async fn create_invoice(&self, invoice: NewInvoice) -> Result<i64, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let invoice_id = sqlx::query(
            "INSERT INTO invoice (customer_id, invoice_date, billing_address, billing_city,
                                  billing_state, billing_country, billing_postal_code, total)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(invoice.customer_id)
        .bind(Utc::now().to_rfc3339())
        .bind(&invoice.billing.address)
        .bind(&invoice.billing.city)
        .bind(&invoice.billing.state)
        .bind(&invoice.billing.country)
        .bind(&invoice.billing.postal_code)
        .bind(invoice.total.to_string())
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        for line in &invoice.lines {
            sqlx::query(
                "INSERT INTO invoice_line (invoice_id, track_id, unit_price, quantity)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(invoice_id)
            .bind(line.track_id)
            .bind(line.unit_price.to_string())
            .bind(line.quantity)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(invoice_id)
    }

    async fn update_total(
        &self,
        invoice_id: i64,
        new_total: Decimal,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query("UPDATE invoice SET total = ? WHERE id = ?")
            .bind(new_total.to_string())
            .bind(invoice_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_invoice(&self, invoice_id: i64) -> Result<bool, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM invoice_line WHERE invoice_id = ?")
            .bind(invoice_id)
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("DELETE FROM invoice WHERE id = ?")
            .bind(invoice_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use sqlx::Row;

    use super::SqlInvoiceRepository;
    use crate::fixtures;
    use crate::repositories::{
        BillingInfo, InvoiceRepository, NewInvoice, NewInvoiceLine, SubjectRepository,
    };
    use crate::{connect_url, migrations};

    async fn seeded_pool() -> sqlx::SqlitePool {
        let pool = connect_url("sqlite::memory:").await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        fixtures::seed(&pool).await.expect("seed");
        pool
    }

    async fn customer_id(pool: &sqlx::SqlitePool, first_name: &str) -> i64 {
        let repo = crate::repositories::SqlSubjectRepository::new(pool.clone());
        repo.find_identity_by_credential(first_name)
            .await
            .expect("lookup")
            .expect("seeded customer")
            .subject_id
    }

    #[tokio::test]
    async fn purchase_writes_invoice_and_lines_atomically() {
        let pool = seeded_pool().await;
        let repo = SqlInvoiceRepository::new(pool.clone());
        let astrid = customer_id(&pool, "astrid").await;

        let price: Decimal = "0.99".parse().expect("price");
        let invoice_id = repo
            .create_invoice(NewInvoice {
                customer_id: astrid,
                billing: BillingInfo {
                    city: Some("Oslo".into()),
                    country: Some("Norway".into()),
                    ..BillingInfo::default()
                },
                total: price,
                lines: vec![NewInvoiceLine { track_id: 1, unit_price: price, quantity: 1 }],
            })
            .await
            .expect("create");

        let header = repo.invoice_header(invoice_id).await.expect("header").expect("exists");
        assert_eq!(header.customer_id, astrid);
        assert_eq!(header.total, price);

        let items = repo.invoice_items(invoice_id).await.expect("items");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].unit_price, price);
    }

    #[tokio::test]
    async fn delete_removes_invoice_and_its_lines() {
        let pool = seeded_pool().await;
        let repo = SqlInvoiceRepository::new(pool.clone());
        let astrid = customer_id(&pool, "astrid").await;

        let invoices = repo.invoices_for_customer(astrid).await.expect("invoices");
        let target = invoices.first().expect("seeded invoice").invoice_id;

        assert!(repo.delete_invoice(target).await.expect("delete"));
        assert!(repo.invoice_header(target).await.expect("header").is_none());

        let orphans = sqlx::query("SELECT COUNT(*) AS count FROM invoice_line WHERE invoice_id = ?")
            .bind(target)
            .fetch_one(&pool)
            .await
            .expect("count")
            .get::<i64, _>("count");
        assert_eq!(orphans, 0);
    }

    #[tokio::test]
    async fn delete_of_missing_invoice_reports_false() {
        let pool = seeded_pool().await;
        let repo = SqlInvoiceRepository::new(pool);
        assert!(!repo.delete_invoice(999_999).await.expect("delete"));
    }

    #[tokio::test]
    async fn update_total_rewrites_the_stored_amount() {
        let pool = seeded_pool().await;
        let repo = SqlInvoiceRepository::new(pool.clone());
        let astrid = customer_id(&pool, "astrid").await;

        let invoices = repo.invoices_for_customer(astrid).await.expect("invoices");
        let target = invoices.first().expect("seeded invoice").invoice_id;

        let new_total: Decimal = "12.34".parse().expect("total");
        assert!(repo.update_total(target, new_total).await.expect("update"));

        let header = repo.invoice_header(target).await.expect("header").expect("exists");
        assert_eq!(header.total, new_total);
    }

    #[tokio::test]
    async fn purchase_history_joins_catalog_metadata() {
        let pool = seeded_pool().await;
        let repo = SqlInvoiceRepository::new(pool.clone());
        let astrid = customer_id(&pool, "astrid").await;

        let purchases = repo.purchases_for_customer(astrid).await.expect("purchases");
        assert!(!purchases.is_empty());
        assert!(purchases.iter().all(|line| !line.track.is_empty() && !line.artist.is_empty()));
    }
}
