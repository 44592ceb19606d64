use rust_decimal::Decimal;
use sqlx::Row;

use tunesmith_core::{Identity, Role};

use super::{BillingInfo, EmployeeProfile, RepositoryError, SubjectRepository, SupportedCustomer};
use crate::DbPool;

pub struct SqlSubjectRepository {
    pool: DbPool,
}

impl SqlSubjectRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn employee_identity(
        &self,
        credential: &str,
    ) -> Result<Option<Identity>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, first_name, last_name FROM employee WHERE LOWER(first_name) = ?",
        )
        .bind(credential)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let employee_id: i64 = row.try_get("id").map_err(decode)?;
        let first_name: String = row.try_get("first_name").map_err(decode)?;
        let last_name: String = row.try_get("last_name").map_err(decode)?;

        let scope = self.scope_for_employee(employee_id).await?;
        Ok(Some(Identity::employee(employee_id, format!("{first_name} {last_name}"), scope)))
    }

    async fn customer_identity(
        &self,
        credential: &str,
    ) -> Result<Option<Identity>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, first_name, last_name FROM customer WHERE LOWER(first_name) = ?",
        )
        .bind(credential)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let customer_id: i64 = row.try_get("id").map_err(decode)?;
        let first_name: String = row.try_get("first_name").map_err(decode)?;
        let last_name: String = row.try_get("last_name").map_err(decode)?;

        Ok(Some(Identity::customer(customer_id, format!("{first_name} {last_name}"))))
    }

    async fn scope_for_employee(&self, employee_id: i64) -> Result<Vec<i64>, RepositoryError> {
        let rows = sqlx::query("SELECT id FROM customer WHERE support_rep_id = ? ORDER BY id")
            .bind(employee_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(|row| row.try_get::<i64, _>("id").map_err(decode)).collect()
    }
}

fn decode(error: sqlx::Error) -> RepositoryError {
    RepositoryError::Decode(error.to_string())
}

fn parse_total(value: &str) -> Result<Decimal, RepositoryError> {
    value
        .parse::<Decimal>()
        .map_err(|error| RepositoryError::Decode(format!("total `{value}`: {error}")))
}

// Totals are TEXT columns; summing in SQL would coerce through floats, so
// the rows are concatenated and summed as `Decimal` here.
fn sum_joined_totals(joined: &str) -> Result<Decimal, RepositoryError> {
    joined.split('|').filter(|total| !total.is_empty()).map(parse_total).sum()
}

#[async_trait::async_trait]
impl SubjectRepository for SqlSubjectRepository {
    async fn find_identity_by_credential(
        &self,
        credential: &str,
    ) -> Result<Option<Identity>, RepositoryError> {
        let normalized = credential.trim().to_ascii_lowercase();

        // Run both lookups unconditionally so a miss takes the same path
        // whether or not the credential resembles an employee name.
        let employee = self.employee_identity(&normalized).await?;
        let customer = self.customer_identity(&normalized).await?;

        Ok(employee.or(customer))
    }

    async fn find_identity_by_subject(
        &self,
        role: Role,
        subject_id: i64,
    ) -> Result<Option<Identity>, RepositoryError> {
        match role {
            Role::Employee => {
                let row = sqlx::query("SELECT first_name, last_name FROM employee WHERE id = ?")
                    .bind(subject_id)
                    .fetch_optional(&self.pool)
                    .await?;
                let Some(row) = row else {
                    return Ok(None);
                };
                let first_name: String = row.try_get("first_name").map_err(decode)?;
                let last_name: String = row.try_get("last_name").map_err(decode)?;
                let scope = self.scope_for_employee(subject_id).await?;
                Ok(Some(Identity::employee(
                    subject_id,
                    format!("{first_name} {last_name}"),
                    scope,
                )))
            }
            Role::Customer => {
                let row = sqlx::query("SELECT first_name, last_name FROM customer WHERE id = ?")
                    .bind(subject_id)
                    .fetch_optional(&self.pool)
                    .await?;
                let Some(row) = row else {
                    return Ok(None);
                };
                let first_name: String = row.try_get("first_name").map_err(decode)?;
                let last_name: String = row.try_get("last_name").map_err(decode)?;
                Ok(Some(Identity::customer(subject_id, format!("{first_name} {last_name}"))))
            }
        }
    }

    async fn employee_profile(
        &self,
        employee_id: i64,
    ) -> Result<Option<EmployeeProfile>, RepositoryError> {
        let row = sqlx::query(
            "SELECT e.id, e.first_name, e.last_name, e.title, e.email, e.phone, e.hire_date,
                    e.address, e.city, e.state, e.country,
                    m.first_name || ' ' || m.last_name AS manager_name
             FROM employee e
             LEFT JOIN employee m ON e.reports_to = m.id
             WHERE e.id = ?",
        )
        .bind(employee_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(EmployeeProfile {
            employee_id: row.try_get("id").map_err(decode)?,
            first_name: row.try_get("first_name").map_err(decode)?,
            last_name: row.try_get("last_name").map_err(decode)?,
            title: row.try_get("title").map_err(decode)?,
            email: row.try_get("email").map_err(decode)?,
            phone: row.try_get("phone").map_err(decode)?,
            hire_date: row.try_get("hire_date").map_err(decode)?,
            address: row.try_get("address").map_err(decode)?,
            city: row.try_get("city").map_err(decode)?,
            state: row.try_get("state").map_err(decode)?,
            country: row.try_get("country").map_err(decode)?,
            manager_name: row.try_get("manager_name").map_err(decode)?,
        }))
    }

    async fn supported_customers(
        &self,
        employee_id: i64,
    ) -> Result<Vec<SupportedCustomer>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT c.id, c.first_name, c.last_name, c.email, c.city, c.country,
                    COUNT(i.id) AS invoice_count,
                    COALESCE(GROUP_CONCAT(i.total, '|'), '') AS invoice_totals
             FROM customer c
             LEFT JOIN invoice i ON c.id = i.customer_id
             WHERE c.support_rep_id = ?
             GROUP BY c.id
             ORDER BY c.last_name, c.first_name",
        )
        .bind(employee_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let invoice_totals: String = row.try_get("invoice_totals").map_err(decode)?;
                Ok(SupportedCustomer {
                    customer_id: row.try_get("id").map_err(decode)?,
                    first_name: row.try_get("first_name").map_err(decode)?,
                    last_name: row.try_get("last_name").map_err(decode)?,
                    email: row.try_get("email").map_err(decode)?,
                    city: row.try_get("city").map_err(decode)?,
                    country: row.try_get("country").map_err(decode)?,
                    invoice_count: row.try_get("invoice_count").map_err(decode)?,
                    total_spent: sum_joined_totals(&invoice_totals)?,
                })
            })
            .collect()
    }

    async fn customer_billing(
        &self,
        customer_id: i64,
    ) -> Result<Option<BillingInfo>, RepositoryError> {
        let row = sqlx::query(
            "SELECT address, city, state, country, postal_code FROM customer WHERE id = ?",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(BillingInfo {
            address: row.try_get("address").map_err(decode)?,
            city: row.try_get("city").map_err(decode)?,
            state: row.try_get("state").map_err(decode)?,
            country: row.try_get("country").map_err(decode)?,
            postal_code: row.try_get("postal_code").map_err(decode)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use tunesmith_core::Role;

    use super::SqlSubjectRepository;
    use crate::fixtures;
    use crate::repositories::{InvoiceRepository, SqlInvoiceRepository, SubjectRepository};
    use crate::{connect_url, migrations};

    async fn seeded_pool() -> sqlx::SqlitePool {
        let pool = connect_url("sqlite::memory:").await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        fixtures::seed(&pool).await.expect("seed");
        pool
    }

    #[tokio::test]
    async fn employee_credential_resolves_with_scope() {
        let repo = SqlSubjectRepository::new(seeded_pool().await);

        let identity = repo
            .find_identity_by_credential("Jane")
            .await
            .expect("lookup")
            .expect("jane is seeded");

        assert_eq!(identity.role, Role::Employee);
        assert_eq!(identity.name, "Jane Peacock");
        assert!(identity.scope.len() >= 2, "jane supports the seeded customers");
    }

    #[tokio::test]
    async fn customer_credential_resolves_without_scope() {
        let repo = SqlSubjectRepository::new(seeded_pool().await);

        let identity = repo
            .find_identity_by_credential("astrid")
            .await
            .expect("lookup")
            .expect("astrid is seeded");

        assert_eq!(identity.role, Role::Customer);
        assert!(identity.scope.is_empty());
    }

    #[tokio::test]
    async fn unknown_credential_is_a_plain_miss() {
        let repo = SqlSubjectRepository::new(seeded_pool().await);
        let missing = repo.find_identity_by_credential("nobody").await.expect("lookup");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn subject_rehydration_matches_credential_resolution() {
        let repo = SqlSubjectRepository::new(seeded_pool().await);

        let by_credential =
            repo.find_identity_by_credential("jane").await.expect("lookup").expect("jane");
        let by_subject = repo
            .find_identity_by_subject(Role::Employee, by_credential.subject_id)
            .await
            .expect("lookup")
            .expect("jane by id");

        assert_eq!(by_credential, by_subject);
    }

    #[tokio::test]
    async fn employee_profile_includes_manager_name() {
        let repo = SqlSubjectRepository::new(seeded_pool().await);
        let jane = repo.find_identity_by_credential("jane").await.expect("lookup").expect("jane");

        let profile =
            repo.employee_profile(jane.subject_id).await.expect("profile").expect("exists");
        assert_eq!(profile.first_name, "Jane");
        assert!(profile.manager_name.is_some());
    }

    #[tokio::test]
    async fn supported_customers_report_lifetime_spend() {
        let repo = SqlSubjectRepository::new(seeded_pool().await);
        let jane = repo.find_identity_by_credential("jane").await.expect("lookup").expect("jane");

        let customers = repo.supported_customers(jane.subject_id).await.expect("supported");
        assert!(!customers.is_empty());
        assert!(customers.iter().any(|customer| customer.invoice_count > 0));
    }

    #[tokio::test]
    async fn lifetime_spend_is_the_exact_sum_of_invoice_totals() {
        let pool = seeded_pool().await;
        let repo = SqlSubjectRepository::new(pool.clone());
        let invoices = SqlInvoiceRepository::new(pool);
        let jane = repo.find_identity_by_credential("jane").await.expect("lookup").expect("jane");

        let customers = repo.supported_customers(jane.subject_id).await.expect("supported");
        for customer in customers {
            let expected: Decimal = invoices
                .invoices_for_customer(customer.customer_id)
                .await
                .expect("invoices")
                .iter()
                .map(|invoice| invoice.total)
                .sum();
            assert_eq!(customer.total_spent, expected);
        }
    }
}
