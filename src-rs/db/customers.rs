use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::{begin_write, DbPool};
use crate::error::{Error, Result};

/// Maps payment gateway customer ids to local users.
#[derive(Clone)]
pub struct CustomerRepo {
    pool: DbPool,
}

impl CustomerRepo {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Idempotent for the same pair. A user already linked to a different
    /// customer of the same provider is re-pointed to the new one.
    pub fn link(&self, provider: &str, customer_id: &str, user_id: &str) -> Result<()> {
        let mut conn = self.pool.get()?;
        let tx = begin_write(&mut conn)?;

        let owner: Option<String> = tx
            .query_row(
                "SELECT user_id FROM payment_customers WHERE provider = ?1 AND customer_id = ?2",
                params![provider, customer_id],
                |row| row.get(0),
            )
            .optional()?;

        match owner {
            Some(owner) if owner == user_id => return Ok(()),
            Some(owner) => {
                return Err(Error::Conflict(format!(
                    "{provider} customer {customer_id} already belongs to user {owner}"
                )))
            }
            None => {}
        }

        tx.execute(
            "DELETE FROM payment_customers WHERE provider = ?1 AND user_id = ?2",
            params![provider, user_id],
        )?;
        tx.execute(
            "INSERT INTO payment_customers (provider, customer_id, user_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![provider, customer_id, user_id, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;

        tracing::info!(provider, customer_id, user_id, "payment customer linked");
        Ok(())
    }

    pub fn user_for_customer(&self, provider: &str, customer_id: &str) -> Result<Option<String>> {
        let conn = self.pool.get()?;
        let user_id = conn
            .query_row(
                "SELECT user_id FROM payment_customers WHERE provider = ?1 AND customer_id = ?2",
                params![provider, customer_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(user_id)
    }

    pub fn customer_for_user(&self, provider: &str, user_id: &str) -> Result<Option<String>> {
        let conn = self.pool.get()?;
        let customer_id = conn
            .query_row(
                "SELECT customer_id FROM payment_customers WHERE provider = ?1 AND user_id = ?2",
                params![provider, user_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(customer_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{init_memory, UserRepo};

    #[test]
    fn link_round_trips_and_rejects_foreign_customer() {
        let pool = init_memory().unwrap();
        let users = UserRepo::new(pool.clone());
        users.upsert("user_1", "a@example.com", None).unwrap();
        users.upsert("user_2", "b@example.com", None).unwrap();
        let customers = CustomerRepo::new(pool);

        customers.link("stripe", "cus_1", "user_1").unwrap();
        customers.link("stripe", "cus_1", "user_1").unwrap();
        assert_eq!(
            customers.user_for_customer("stripe", "cus_1").unwrap().as_deref(),
            Some("user_1")
        );
        assert!(matches!(
            customers.link("stripe", "cus_1", "user_2"),
            Err(Error::Conflict(_))
        ));

        customers.link("stripe", "cus_2", "user_1").unwrap();
        assert_eq!(
            customers.customer_for_user("stripe", "user_1").unwrap().as_deref(),
            Some("cus_2")
        );
        assert_eq!(customers.user_for_customer("square", "cus_2").unwrap(), None);
    }
}
