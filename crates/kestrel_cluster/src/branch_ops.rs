//! Branch-local writes: adding copies, borrowing, returning, and keeping
//! the reader roster.
//!
//! None of these are distributed; each runs in one serializable local
//! transaction at the owning site. They still validate fragment ownership
//! before opening anything, and they contend with in-flight transfers for
//! the same copy rows through the same availability checks, which is what
//! makes a simultaneous transfer and borrow of one copy resolve to exactly
//! one winner.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use kestrel_common::error::{KestrelError, KestrelResult};
use kestrel_common::model::{BookCopy, CopyStatus, Loan, Reader, ReplicatedKey};
use kestrel_common::types::SiteId;
use kestrel_site::resolver::ConnectionResolver;
use kestrel_site::store::{SiteConnection, SiteConnector, SiteTransaction, TxnOf};

use crate::fragmentation::{self, FragmentedTable};

/// Single-site operations against one branch's fragment.
pub struct BranchOps<C: SiteConnector> {
    resolver: Arc<ConnectionResolver<C>>,
}

impl<C: SiteConnector> BranchOps<C> {
    pub fn new(resolver: Arc<ConnectionResolver<C>>) -> Self {
        Self { resolver }
    }

    /// Register a new physical copy at its owning branch. The title must
    /// already be in the replicated catalog.
    pub async fn add_copy(&self, site: &SiteId, copy: BookCopy) -> KestrelResult<()> {
        if copy.copy_id.trim().is_empty() || copy.isbn.trim().is_empty() {
            return Err(KestrelError::InvalidPayload(
                "copy needs a copy_id and an isbn".to_string(),
            ));
        }
        fragmentation::validate(FragmentedTable::Copies, &copy.branch_id, site)?;

        let conn = self.resolver.resolve(site).await?;
        let mut txn = conn.begin().await?;
        match self.add_copy_in(&mut txn, site, &copy).await {
            Ok(()) => {
                txn.commit().await?;
                info!(site = %site, copy = %copy.copy_id, isbn = %copy.isbn, "copy added");
                Ok(())
            }
            Err(e) => {
                if let Err(rb) = txn.rollback().await {
                    warn!(site = %site, error = %rb, "rollback failed; the site will expire the transaction itself");
                }
                Err(e)
            }
        }
    }

    async fn add_copy_in(
        &self,
        txn: &mut TxnOf<C>,
        site: &SiteId,
        copy: &BookCopy,
    ) -> KestrelResult<()> {
        let title_key = ReplicatedKey::Title {
            isbn: copy.isbn.clone(),
        };
        if !txn.replicated_exists(&title_key).await? {
            return Err(KestrelError::PrepareFailed {
                site: site.clone(),
                reason: format!("title {} not in the catalog", copy.isbn),
            });
        }
        if txn.book_copy(&copy.copy_id).await?.is_some() {
            return Err(KestrelError::PrepareFailed {
                site: site.clone(),
                reason: format!("copy {} already exists", copy.copy_id),
            });
        }
        txn.insert_copy(copy).await?;
        Ok(())
    }

    /// Borrow a copy at its owning branch: flips it to `borrowed` and opens
    /// a loan row.
    pub async fn borrow(&self, site: &SiteId, loan: Loan) -> KestrelResult<()> {
        if loan.loan_id.trim().is_empty()
            || loan.reader_id.trim().is_empty()
            || loan.copy_id.trim().is_empty()
        {
            return Err(KestrelError::InvalidPayload(
                "loan needs a loan_id, a reader_id and a copy_id".to_string(),
            ));
        }
        fragmentation::validate(FragmentedTable::Loans, &loan.branch_id, site)?;

        let conn = self.resolver.resolve(site).await?;
        let mut txn = conn.begin().await?;
        match self.borrow_in(&mut txn, site, &loan).await {
            Ok(()) => {
                txn.commit().await?;
                info!(site = %site, copy = %loan.copy_id, loan = %loan.loan_id, "copy borrowed");
                Ok(())
            }
            Err(e) => {
                if let Err(rb) = txn.rollback().await {
                    warn!(site = %site, error = %rb, "rollback failed; the site will expire the transaction itself");
                }
                Err(e)
            }
        }
    }

    async fn borrow_in(
        &self,
        txn: &mut TxnOf<C>,
        site: &SiteId,
        loan: &Loan,
    ) -> KestrelResult<()> {
        let copy = txn.book_copy(&loan.copy_id).await?.ok_or_else(|| {
            KestrelError::PrepareFailed {
                site: site.clone(),
                reason: format!("copy {} not found", loan.copy_id),
            }
        })?;
        fragmentation::validate(FragmentedTable::Copies, &copy.branch_id, site)?;
        if copy.status != CopyStatus::Available {
            return Err(KestrelError::PrepareFailed {
                site: site.clone(),
                reason: format!(
                    "copy {} not available for borrowing (status {})",
                    loan.copy_id, copy.status
                ),
            });
        }
        if txn.open_loan(&loan.copy_id).await?.is_some() {
            return Err(KestrelError::PrepareFailed {
                site: site.clone(),
                reason: format!("copy {} already on loan", loan.copy_id),
            });
        }
        let changed = txn
            .update_copy_status(&loan.copy_id, CopyStatus::Available, CopyStatus::Borrowed)
            .await?;
        if changed == 0 {
            return Err(KestrelError::PrepareFailed {
                site: site.clone(),
                reason: format!(
                    "copy {} not available for borrowing (lost a concurrent race)",
                    loan.copy_id
                ),
            });
        }
        txn.insert_loan(loan).await?;
        Ok(())
    }

    /// Return a borrowed copy: closes its open loan and restores
    /// `available`.
    pub async fn return_copy(&self, site: &SiteId, copy_id: &str) -> KestrelResult<()> {
        if copy_id.trim().is_empty() {
            return Err(KestrelError::InvalidPayload(
                "return names no copy id".to_string(),
            ));
        }
        let conn = self.resolver.resolve(site).await?;
        let mut txn = conn.begin().await?;
        match self.return_in(&mut txn, site, copy_id).await {
            Ok(loan_id) => {
                txn.commit().await?;
                info!(site = %site, copy = %copy_id, loan = %loan_id, "copy returned");
                Ok(())
            }
            Err(e) => {
                if let Err(rb) = txn.rollback().await {
                    warn!(site = %site, error = %rb, "rollback failed; the site will expire the transaction itself");
                }
                Err(e)
            }
        }
    }

    async fn return_in(
        &self,
        txn: &mut TxnOf<C>,
        site: &SiteId,
        copy_id: &str,
    ) -> KestrelResult<String> {
        let loan = txn.open_loan(copy_id).await?.ok_or_else(|| {
            KestrelError::PrepareFailed {
                site: site.clone(),
                reason: format!("copy {copy_id} has no open loan"),
            }
        })?;
        fragmentation::validate(FragmentedTable::Loans, &loan.branch_id, site)?;
        let closed = txn.close_loan(&loan.loan_id, Utc::now()).await?;
        if closed == 0 {
            return Err(KestrelError::PrepareFailed {
                site: site.clone(),
                reason: format!("loan {} already closed", loan.loan_id),
            });
        }
        let restored = txn
            .update_copy_status(copy_id, CopyStatus::Borrowed, CopyStatus::Available)
            .await?;
        if restored == 0 {
            // An open loan with a non-borrowed copy is corrupt state, not
            // a lost race.
            return Err(KestrelError::Internal(format!(
                "copy {copy_id} has an open loan but is not marked borrowed"
            )));
        }
        Ok(loan.loan_id)
    }

    /// Register a reader at their home branch. The branch must already be
    /// in the replicated directory.
    pub async fn register_reader(&self, site: &SiteId, reader: Reader) -> KestrelResult<()> {
        if reader.reader_id.trim().is_empty() || reader.full_name.trim().is_empty() {
            return Err(KestrelError::InvalidPayload(
                "reader needs a reader_id and a full_name".to_string(),
            ));
        }
        fragmentation::validate(FragmentedTable::Readers, &reader.home_branch_id, site)?;

        let conn = self.resolver.resolve(site).await?;
        let mut txn = conn.begin().await?;
        match self.register_reader_in(&mut txn, site, &reader).await {
            Ok(()) => {
                txn.commit().await?;
                info!(site = %site, reader = %reader.reader_id, "reader registered");
                Ok(())
            }
            Err(e) => {
                if let Err(rb) = txn.rollback().await {
                    warn!(site = %site, error = %rb, "rollback failed; the site will expire the transaction itself");
                }
                Err(e)
            }
        }
    }

    async fn register_reader_in(
        &self,
        txn: &mut TxnOf<C>,
        site: &SiteId,
        reader: &Reader,
    ) -> KestrelResult<()> {
        let branch_key = ReplicatedKey::Branch {
            branch_id: reader.home_branch_id.clone(),
        };
        if !txn.replicated_exists(&branch_key).await? {
            return Err(KestrelError::PrepareFailed {
                site: site.clone(),
                reason: format!("branch {} not in the directory", reader.home_branch_id),
            });
        }
        if txn.reader(&reader.reader_id).await?.is_some() {
            return Err(KestrelError::PrepareFailed {
                site: site.clone(),
                reason: format!("reader {} already registered", reader.reader_id),
            });
        }
        txn.insert_reader(reader).await?;
        Ok(())
    }

    /// Rename a registered reader. The home branch is part of the row's
    /// identity here; moving a reader is not an update.
    pub async fn update_reader(&self, site: &SiteId, reader: Reader) -> KestrelResult<()> {
        if reader.reader_id.trim().is_empty() || reader.full_name.trim().is_empty() {
            return Err(KestrelError::InvalidPayload(
                "reader needs a reader_id and a full_name".to_string(),
            ));
        }
        fragmentation::validate(FragmentedTable::Readers, &reader.home_branch_id, site)?;

        let conn = self.resolver.resolve(site).await?;
        let mut txn = conn.begin().await?;
        match self.update_reader_in(&mut txn, site, &reader).await {
            Ok(()) => {
                txn.commit().await?;
                info!(site = %site, reader = %reader.reader_id, "reader updated");
                Ok(())
            }
            Err(e) => {
                if let Err(rb) = txn.rollback().await {
                    warn!(site = %site, error = %rb, "rollback failed; the site will expire the transaction itself");
                }
                Err(e)
            }
        }
    }

    async fn update_reader_in(
        &self,
        txn: &mut TxnOf<C>,
        site: &SiteId,
        reader: &Reader,
    ) -> KestrelResult<()> {
        let changed = txn.update_reader(reader).await?;
        if changed == 0 {
            return Err(KestrelError::PrepareFailed {
                site: site.clone(),
                reason: format!("reader {} not registered at this branch", reader.reader_id),
            });
        }
        Ok(())
    }

    /// Remove a reader from their home branch. Refused while the reader
    /// still has open loans.
    pub async fn remove_reader(&self, site: &SiteId, reader_id: &str) -> KestrelResult<()> {
        if reader_id.trim().is_empty() {
            return Err(KestrelError::InvalidPayload(
                "removal names no reader id".to_string(),
            ));
        }
        let conn = self.resolver.resolve(site).await?;
        let mut txn = conn.begin().await?;
        match self.remove_reader_in(&mut txn, site, reader_id).await {
            Ok(()) => {
                txn.commit().await?;
                info!(site = %site, reader = %reader_id, "reader removed");
                Ok(())
            }
            Err(e) => {
                if let Err(rb) = txn.rollback().await {
                    warn!(site = %site, error = %rb, "rollback failed; the site will expire the transaction itself");
                }
                Err(e)
            }
        }
    }

    async fn remove_reader_in(
        &self,
        txn: &mut TxnOf<C>,
        site: &SiteId,
        reader_id: &str,
    ) -> KestrelResult<()> {
        let reader = txn.reader(reader_id).await?.ok_or_else(|| {
            KestrelError::PrepareFailed {
                site: site.clone(),
                reason: format!("reader {reader_id} not registered"),
            }
        })?;
        fragmentation::validate(FragmentedTable::Readers, &reader.home_branch_id, site)?;
        let open = txn.count_open_loans_of_reader(reader_id).await?;
        if open > 0 {
            return Err(KestrelError::PrepareFailed {
                site: site.clone(),
                reason: format!("reader {reader_id} still has {open} open loans"),
            });
        }
        txn.delete_reader(reader_id).await?;
        Ok(())
    }
}
