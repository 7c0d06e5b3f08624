//! tokio-postgres backend for the site store seam.
//!
//! One client per site, shared behind a mutex: Postgres multiplexes nothing
//! on a single session, so a local transaction holds the client for its
//! whole lifetime and concurrent operations against the same site queue on
//! the lock. Local transactions run at serializable isolation; the driver
//! maps unique-key and serialization errors onto the store error taxonomy
//! so the coordination layer reacts the same way it does with the
//! in-memory backend.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, NoTls, Row};
use tracing::warn;

use kestrel_common::config::SiteConfig;
use kestrel_common::error::{ConnectionError, StoreError};
use kestrel_common::model::{BookCopy, CopyStatus, Loan, Reader, ReplicatedKey, ReplicatedPayload};
use kestrel_common::types::SiteId;

use crate::store::{SiteConnection, SiteConnector, SiteTransaction};

/// Dials Postgres sites from their [`SiteConfig`] addresses.
#[derive(Default)]
pub struct PgConnector;

#[async_trait]
impl SiteConnector for PgConnector {
    type Conn = PgConnection;

    async fn connect(&self, cfg: &SiteConfig) -> Result<PgConnection, ConnectionError> {
        let site = cfg.site_id();
        let (client, connection) = tokio_postgres::connect(&cfg.conn_string(), NoTls)
            .await
            .map_err(|e| ConnectionError::Driver {
                site: site.clone(),
                reason: e.to_string(),
            })?;

        // The connection future drives protocol traffic until the client
        // side is dropped.
        let driver_site = site.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(site = %driver_site, error = %e, "postgres connection driver exited");
            }
        });

        Ok(PgConnection {
            site,
            client: Arc::new(Mutex::new(client)),
        })
    }
}

pub struct PgConnection {
    site: SiteId,
    client: Arc<Mutex<Client>>,
}

#[async_trait]
impl SiteConnection for PgConnection {
    type Txn = PgTransaction;

    async fn ping(&self) -> Result<(), ConnectionError> {
        let client = self.client.lock().await;
        client
            .simple_query("SELECT 1")
            .await
            .map(|_| ())
            .map_err(|e| ConnectionError::Driver {
                site: self.site.clone(),
                reason: e.to_string(),
            })
    }

    async fn begin(&self) -> Result<PgTransaction, StoreError> {
        let guard = self.client.clone().lock_owned().await;
        guard
            .batch_execute("BEGIN ISOLATION LEVEL SERIALIZABLE")
            .await
            .map_err(stmt_err)?;
        Ok(PgTransaction {
            site: self.site.clone(),
            client: Some(guard),
            open: true,
        })
    }
}

/// One serializable transaction holding the site's client for its lifetime.
pub struct PgTransaction {
    site: SiteId,
    client: Option<OwnedMutexGuard<Client>>,
    open: bool,
}

impl PgTransaction {
    fn client(&self) -> Result<&Client, StoreError> {
        self.client.as_deref().ok_or(StoreError::TxnClosed)
    }
}

fn stmt_err(e: tokio_postgres::Error) -> StoreError {
    StoreError::Statement(e.to_string())
}

/// Maps driver errors on write statements onto the taxonomy the
/// coordination layer branches on.
fn write_err(key: &str, e: tokio_postgres::Error) -> StoreError {
    match e.code() {
        Some(&SqlState::UNIQUE_VIOLATION) => StoreError::DuplicateKey {
            key: key.to_string(),
        },
        Some(&SqlState::T_R_SERIALIZATION_FAILURE)
        | Some(&SqlState::T_R_DEADLOCK_DETECTED)
        | Some(&SqlState::LOCK_NOT_AVAILABLE) => StoreError::RowBusy {
            key: key.to_string(),
        },
        _ => StoreError::Statement(e.to_string()),
    }
}

fn copy_from_row(row: &Row) -> Result<BookCopy, StoreError> {
    let status_raw: String = row.try_get("status").map_err(stmt_err)?;
    let status = CopyStatus::parse(&status_raw)
        .ok_or_else(|| StoreError::Statement(format!("unknown copy status '{status_raw}'")))?;
    Ok(BookCopy {
        copy_id: row.try_get("copy_id").map_err(stmt_err)?,
        isbn: row.try_get("isbn").map_err(stmt_err)?,
        branch_id: row.try_get("branch_id").map_err(stmt_err)?,
        status,
    })
}

fn loan_from_row(row: &Row) -> Result<Loan, StoreError> {
    Ok(Loan {
        loan_id: row.try_get("loan_id").map_err(stmt_err)?,
        reader_id: row.try_get("reader_id").map_err(stmt_err)?,
        copy_id: row.try_get("copy_id").map_err(stmt_err)?,
        branch_id: row.try_get("branch_id").map_err(stmt_err)?,
        borrowed_at: row.try_get("borrowed_at").map_err(stmt_err)?,
        returned_at: row.try_get("returned_at").map_err(stmt_err)?,
    })
}

fn reader_from_row(row: &Row) -> Result<Reader, StoreError> {
    Ok(Reader {
        reader_id: row.try_get("reader_id").map_err(stmt_err)?,
        full_name: row.try_get("full_name").map_err(stmt_err)?,
        home_branch_id: row.try_get("home_branch_id").map_err(stmt_err)?,
    })
}

#[async_trait]
impl SiteTransaction for PgTransaction {
    async fn replicated_exists(&mut self, key: &ReplicatedKey) -> Result<bool, StoreError> {
        let client = self.client()?;
        let row = match key {
            ReplicatedKey::Title { isbn } => {
                client
                    .query_opt("SELECT 1 FROM titles WHERE isbn = $1", &[isbn])
                    .await
            }
            ReplicatedKey::Branch { branch_id } => {
                client
                    .query_opt("SELECT 1 FROM branches WHERE branch_id = $1", &[branch_id])
                    .await
            }
        };
        Ok(row.map_err(stmt_err)?.is_some())
    }

    async fn insert_replicated(&mut self, row: &ReplicatedPayload) -> Result<(), StoreError> {
        let client = self.client()?;
        let key = row.key().to_string();
        match row {
            ReplicatedPayload::Title(t) => client
                .execute(
                    "INSERT INTO titles (isbn, title, author) VALUES ($1, $2, $3)",
                    &[&t.isbn, &t.title, &t.author],
                )
                .await,
            ReplicatedPayload::Branch(b) => client
                .execute(
                    "INSERT INTO branches (branch_id, name, address) VALUES ($1, $2, $3)",
                    &[&b.branch_id, &b.name, &b.address],
                )
                .await,
        }
        .map_err(|e| write_err(&key, e))?;
        Ok(())
    }

    async fn update_replicated(&mut self, row: &ReplicatedPayload) -> Result<u64, StoreError> {
        let client = self.client()?;
        let key = row.key().to_string();
        match row {
            ReplicatedPayload::Title(t) => client
                .execute(
                    "UPDATE titles SET title = $2, author = $3 WHERE isbn = $1",
                    &[&t.isbn, &t.title, &t.author],
                )
                .await,
            ReplicatedPayload::Branch(b) => client
                .execute(
                    "UPDATE branches SET name = $2, address = $3 WHERE branch_id = $1",
                    &[&b.branch_id, &b.name, &b.address],
                )
                .await,
        }
        .map_err(|e| write_err(&key, e))
    }

    async fn delete_replicated(&mut self, key: &ReplicatedKey) -> Result<u64, StoreError> {
        let client = self.client()?;
        let tag = key.to_string();
        match key {
            ReplicatedKey::Title { isbn } => {
                client
                    .execute("DELETE FROM titles WHERE isbn = $1", &[isbn])
                    .await
            }
            ReplicatedKey::Branch { branch_id } => {
                client
                    .execute("DELETE FROM branches WHERE branch_id = $1", &[branch_id])
                    .await
            }
        }
        .map_err(|e| write_err(&tag, e))
    }

    async fn book_copy(&mut self, copy_id: &str) -> Result<Option<BookCopy>, StoreError> {
        let row = self
            .client()?
            .query_opt(
                "SELECT copy_id, isbn, branch_id, status FROM copies WHERE copy_id = $1",
                &[&copy_id],
            )
            .await
            .map_err(stmt_err)?;
        row.as_ref().map(copy_from_row).transpose()
    }

    async fn list_copies(&mut self) -> Result<Vec<BookCopy>, StoreError> {
        let rows = self
            .client()?
            .query(
                "SELECT copy_id, isbn, branch_id, status FROM copies ORDER BY copy_id",
                &[],
            )
            .await
            .map_err(stmt_err)?;
        rows.iter().map(copy_from_row).collect()
    }

    async fn count_copies_of_title(&mut self, isbn: &str) -> Result<u64, StoreError> {
        let row = self
            .client()?
            .query_one("SELECT COUNT(*) FROM copies WHERE isbn = $1", &[&isbn])
            .await
            .map_err(stmt_err)?;
        let n: i64 = row.try_get(0).map_err(stmt_err)?;
        Ok(n as u64)
    }

    async fn insert_copy(&mut self, copy: &BookCopy) -> Result<(), StoreError> {
        let status = copy.status.as_str();
        self.client()?
            .execute(
                "INSERT INTO copies (copy_id, isbn, branch_id, status) VALUES ($1, $2, $3, $4)",
                &[&copy.copy_id, &copy.isbn, &copy.branch_id, &status],
            )
            .await
            .map_err(|e| write_err(&format!("copies/{}", copy.copy_id), e))?;
        Ok(())
    }

    async fn update_copy_status(
        &mut self,
        copy_id: &str,
        from: CopyStatus,
        to: CopyStatus,
    ) -> Result<u64, StoreError> {
        let from = from.as_str();
        let to = to.as_str();
        self.client()?
            .execute(
                "UPDATE copies SET status = $3 WHERE copy_id = $1 AND status = $2",
                &[&copy_id, &from, &to],
            )
            .await
            .map_err(|e| write_err(&format!("copies/{copy_id}"), e))
    }

    async fn delete_copy(&mut self, copy_id: &str) -> Result<u64, StoreError> {
        self.client()?
            .execute("DELETE FROM copies WHERE copy_id = $1", &[&copy_id])
            .await
            .map_err(|e| write_err(&format!("copies/{copy_id}"), e))
    }

    async fn insert_loan(&mut self, loan: &Loan) -> Result<(), StoreError> {
        self.client()?
            .execute(
                "INSERT INTO loans (loan_id, reader_id, copy_id, branch_id, borrowed_at, returned_at) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
                &[
                    &loan.loan_id,
                    &loan.reader_id,
                    &loan.copy_id,
                    &loan.branch_id,
                    &loan.borrowed_at,
                    &loan.returned_at,
                ],
            )
            .await
            .map_err(|e| write_err(&format!("loans/{}", loan.loan_id), e))?;
        Ok(())
    }

    async fn open_loan(&mut self, copy_id: &str) -> Result<Option<Loan>, StoreError> {
        let row = self
            .client()?
            .query_opt(
                "SELECT loan_id, reader_id, copy_id, branch_id, borrowed_at, returned_at \
                 FROM loans WHERE copy_id = $1 AND returned_at IS NULL LIMIT 1",
                &[&copy_id],
            )
            .await
            .map_err(stmt_err)?;
        row.as_ref().map(loan_from_row).transpose()
    }

    async fn close_loan(
        &mut self,
        loan_id: &str,
        returned_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.client()?
            .execute(
                "UPDATE loans SET returned_at = $2 WHERE loan_id = $1 AND returned_at IS NULL",
                &[&loan_id, &returned_at],
            )
            .await
            .map_err(|e| write_err(&format!("loans/{loan_id}"), e))
    }

    async fn reader(&mut self, reader_id: &str) -> Result<Option<Reader>, StoreError> {
        let row = self
            .client()?
            .query_opt(
                "SELECT reader_id, full_name, home_branch_id FROM readers WHERE reader_id = $1",
                &[&reader_id],
            )
            .await
            .map_err(stmt_err)?;
        row.as_ref().map(reader_from_row).transpose()
    }

    async fn insert_reader(&mut self, reader: &Reader) -> Result<(), StoreError> {
        self.client()?
            .execute(
                "INSERT INTO readers (reader_id, full_name, home_branch_id) VALUES ($1, $2, $3)",
                &[&reader.reader_id, &reader.full_name, &reader.home_branch_id],
            )
            .await
            .map_err(|e| write_err(&format!("readers/{}", reader.reader_id), e))?;
        Ok(())
    }

    async fn update_reader(&mut self, reader: &Reader) -> Result<u64, StoreError> {
        self.client()?
            .execute(
                "UPDATE readers SET full_name = $2 WHERE reader_id = $1 AND home_branch_id = $3",
                &[&reader.reader_id, &reader.full_name, &reader.home_branch_id],
            )
            .await
            .map_err(|e| write_err(&format!("readers/{}", reader.reader_id), e))
    }

    async fn delete_reader(&mut self, reader_id: &str) -> Result<u64, StoreError> {
        self.client()?
            .execute("DELETE FROM readers WHERE reader_id = $1", &[&reader_id])
            .await
            .map_err(|e| write_err(&format!("readers/{reader_id}"), e))
    }

    async fn count_open_loans_of_reader(&mut self, reader_id: &str) -> Result<u64, StoreError> {
        let row = self
            .client()?
            .query_one(
                "SELECT COUNT(*) FROM loans WHERE reader_id = $1 AND returned_at IS NULL",
                &[&reader_id],
            )
            .await
            .map_err(stmt_err)?;
        let n: i64 = row.try_get(0).map_err(stmt_err)?;
        Ok(n as u64)
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        let guard = self.client.take().ok_or(StoreError::TxnClosed)?;
        self.open = false;
        guard.batch_execute("COMMIT").await.map_err(stmt_err)
    }

    async fn rollback(mut self) -> Result<(), StoreError> {
        let guard = self.client.take().ok_or(StoreError::TxnClosed)?;
        self.open = false;
        guard.batch_execute("ROLLBACK").await.map_err(stmt_err)
    }
}

impl Drop for PgTransaction {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        // Dropped mid-flight. The session must not return to the shared
        // client with a transaction still open, so roll it back before the
        // guard is released.
        if let Some(guard) = self.client.take() {
            let site = self.site.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = guard.batch_execute("ROLLBACK").await {
                        warn!(site = %site, error = %e, "rollback of abandoned transaction failed");
                    }
                });
            } else {
                warn!(site = %site, "abandoned transaction dropped outside a runtime");
            }
        }
    }
}
