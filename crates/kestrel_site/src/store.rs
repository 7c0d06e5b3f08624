//! The site store seam.
//!
//! Three traits cover everything the coordination layer needs from a site:
//! dialing ([`SiteConnector`]), liveness and transaction handout
//! ([`SiteConnection`]) and the serializable local transaction itself
//! ([`SiteTransaction`]). The coordinator is generic over the connector, so
//! the Postgres backend and the in-memory backend are interchangeable.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use kestrel_common::config::SiteConfig;
use kestrel_common::error::{ConnectionError, StoreError};
use kestrel_common::model::{BookCopy, CopyStatus, Loan, Reader, ReplicatedKey, ReplicatedPayload};

/// The local-transaction type a connector family produces.
pub type TxnOf<C> = <<C as SiteConnector>::Conn as SiteConnection>::Txn;

/// Dials site connections. One connector serves the whole process; the
/// resolver caches the connections it hands out.
#[async_trait]
pub trait SiteConnector: Send + Sync + 'static {
    type Conn: SiteConnection;

    async fn connect(&self, site: &SiteConfig) -> Result<Self::Conn, ConnectionError>;
}

/// A live connection to one site.
#[async_trait]
pub trait SiteConnection: Send + Sync + 'static {
    type Txn: SiteTransaction;

    /// Cheap liveness check; `SELECT 1` on the Postgres backend.
    async fn ping(&self) -> Result<(), ConnectionError>;

    /// Open a site-local transaction at serializable isolation.
    async fn begin(&self) -> Result<Self::Txn, StoreError>;
}

/// One serializable site-local transaction over the library schema.
///
/// Reads observe the transaction's own uncommitted writes. Conditional
/// updates report the number of rows they changed so callers can detect a
/// lost race instead of overwriting someone else's state. `commit` and
/// `rollback` consume the transaction; a transaction dropped without either
/// is rolled back by the backend.
#[async_trait]
pub trait SiteTransaction: Send {
    // replicated rows: titles, branches

    async fn replicated_exists(&mut self, key: &ReplicatedKey) -> Result<bool, StoreError>;
    async fn insert_replicated(&mut self, row: &ReplicatedPayload) -> Result<(), StoreError>;
    async fn update_replicated(&mut self, row: &ReplicatedPayload) -> Result<u64, StoreError>;
    async fn delete_replicated(&mut self, key: &ReplicatedKey) -> Result<u64, StoreError>;

    // fragmented copy rows

    async fn book_copy(&mut self, copy_id: &str) -> Result<Option<BookCopy>, StoreError>;
    async fn list_copies(&mut self) -> Result<Vec<BookCopy>, StoreError>;
    async fn count_copies_of_title(&mut self, isbn: &str) -> Result<u64, StoreError>;
    async fn insert_copy(&mut self, copy: &BookCopy) -> Result<(), StoreError>;
    /// Flips the copy's status only if it currently equals `from`; returns
    /// the number of rows changed (0 or 1).
    async fn update_copy_status(
        &mut self,
        copy_id: &str,
        from: CopyStatus,
        to: CopyStatus,
    ) -> Result<u64, StoreError>;
    async fn delete_copy(&mut self, copy_id: &str) -> Result<u64, StoreError>;

    // fragmented loan rows

    async fn insert_loan(&mut self, loan: &Loan) -> Result<(), StoreError>;
    /// The open (unreturned) loan for a copy, if any.
    async fn open_loan(&mut self, copy_id: &str) -> Result<Option<Loan>, StoreError>;
    async fn close_loan(
        &mut self,
        loan_id: &str,
        returned_at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    // fragmented reader rows

    async fn reader(&mut self, reader_id: &str) -> Result<Option<Reader>, StoreError>;
    async fn insert_reader(&mut self, reader: &Reader) -> Result<(), StoreError>;
    /// Rewrites `full_name` only, and only when the row's `home_branch_id`
    /// matches the payload's; returns the number of rows changed (0 or 1).
    async fn update_reader(&mut self, reader: &Reader) -> Result<u64, StoreError>;
    async fn delete_reader(&mut self, reader_id: &str) -> Result<u64, StoreError>;
    async fn count_open_loans_of_reader(&mut self, reader_id: &str) -> Result<u64, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;
    async fn rollback(self) -> Result<(), StoreError>;
}
