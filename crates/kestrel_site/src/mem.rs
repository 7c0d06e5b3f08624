//! In-memory site backend.
//!
//! Each [`MemSite`] keeps the library tables in process, guarded by a
//! table mutex plus per-row write locks held for the life of a local
//! transaction. Writes stage into the transaction and apply on commit, so
//! uncommitted state is invisible to other transactions, a second writer
//! of the same row fails with [`StoreError::RowBusy`] instead of blocking,
//! and conditional updates observe only committed state plus the
//! transaction's own writes. [`FaultPlan`] switches inject connect, begin,
//! write, commit and rollback failures plus begin latency for driving
//! error paths in tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use kestrel_common::config::SiteConfig;
use kestrel_common::error::{ConnectionError, StoreError};
use kestrel_common::model::{
    BookCopy, Branch, CopyStatus, Loan, Reader, ReplicatedKey, ReplicatedPayload, Title,
};
use kestrel_common::types::SiteId;

use crate::store::{SiteConnection, SiteConnector, SiteTransaction};

type RowKey = (&'static str, String);

/// Failure switches, consumed as they fire.
#[derive(Debug, Default)]
pub struct FaultPlan {
    refuse_connects: AtomicU32,
    delay_begin_ms: AtomicU64,
    fail_next_begin: AtomicBool,
    fail_next_write: AtomicBool,
    fail_next_commit: AtomicBool,
    fail_next_rollback: AtomicBool,
}

impl FaultPlan {
    /// Refuse the next `n` connect attempts.
    pub fn refuse_connects(&self, n: u32) {
        self.refuse_connects.store(n, Ordering::SeqCst);
    }

    /// Stall the next `begin` for `ms` milliseconds before it proceeds,
    /// simulating a site that is alive but too slow for a phase budget.
    pub fn delay_next_begin(&self, ms: u64) {
        self.delay_begin_ms.store(ms, Ordering::SeqCst);
    }

    pub fn fail_next_begin(&self) {
        self.fail_next_begin.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_write(&self) {
        self.fail_next_write.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub fn fail_next_rollback(&self) {
        self.fail_next_rollback.store(true, Ordering::SeqCst);
    }

    fn take_refused_connect(&self) -> bool {
        self.refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn take_begin_delay(&self) -> u64 {
        self.delay_begin_ms.swap(0, Ordering::SeqCst)
    }

    fn take_fail_begin(&self) -> bool {
        self.fail_next_begin.swap(false, Ordering::SeqCst)
    }

    fn take_fail_write(&self) -> bool {
        self.fail_next_write.swap(false, Ordering::SeqCst)
    }

    fn take_fail_commit(&self) -> bool {
        self.fail_next_commit.swap(false, Ordering::SeqCst)
    }

    fn take_fail_rollback(&self) -> bool {
        self.fail_next_rollback.swap(false, Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct MemTables {
    titles: HashMap<String, Title>,
    branches: HashMap<String, Branch>,
    copies: HashMap<String, BookCopy>,
    loans: HashMap<String, Loan>,
    readers: HashMap<String, Reader>,
}

/// One in-process site: tables, row locks and fault switches.
#[derive(Debug)]
pub struct MemSite {
    id: SiteId,
    tables: Mutex<MemTables>,
    locks: Mutex<HashMap<RowKey, u64>>,
    next_token: AtomicU64,
    pub faults: FaultPlan,
    connects: AtomicU32,
    begins: AtomicU32,
}

impl MemSite {
    fn new(id: SiteId) -> Self {
        Self {
            id,
            tables: Mutex::new(MemTables::default()),
            locks: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            faults: FaultPlan::default(),
            connects: AtomicU32::new(0),
            begins: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> &SiteId {
        &self.id
    }

    // seeding, bypassing transactions

    pub fn seed_title(&self, title: Title) {
        self.tables.lock().titles.insert(title.isbn.clone(), title);
    }

    pub fn seed_branch(&self, branch: Branch) {
        self.tables.lock().branches.insert(branch.branch_id.clone(), branch);
    }

    pub fn seed_copy(&self, copy: BookCopy) {
        self.tables.lock().copies.insert(copy.copy_id.clone(), copy);
    }

    pub fn seed_loan(&self, loan: Loan) {
        self.tables.lock().loans.insert(loan.loan_id.clone(), loan);
    }

    pub fn seed_reader(&self, reader: Reader) {
        self.tables
            .lock()
            .readers
            .insert(reader.reader_id.clone(), reader);
    }

    // committed-state observers for assertions

    pub fn get_copy(&self, copy_id: &str) -> Option<BookCopy> {
        self.tables.lock().copies.get(copy_id).cloned()
    }

    pub fn copy_count(&self) -> usize {
        self.tables.lock().copies.len()
    }

    pub fn get_title(&self, isbn: &str) -> Option<Title> {
        self.tables.lock().titles.get(isbn).cloned()
    }

    pub fn has_title(&self, isbn: &str) -> bool {
        self.tables.lock().titles.contains_key(isbn)
    }

    pub fn get_branch(&self, branch_id: &str) -> Option<Branch> {
        self.tables.lock().branches.get(branch_id).cloned()
    }

    pub fn has_branch(&self, branch_id: &str) -> bool {
        self.tables.lock().branches.contains_key(branch_id)
    }

    pub fn open_loan_of(&self, copy_id: &str) -> Option<Loan> {
        self.tables
            .lock()
            .loans
            .values()
            .find(|l| l.copy_id == copy_id && l.returned_at.is_none())
            .cloned()
    }

    pub fn get_loan(&self, loan_id: &str) -> Option<Loan> {
        self.tables.lock().loans.get(loan_id).cloned()
    }

    pub fn get_reader(&self, reader_id: &str) -> Option<Reader> {
        self.tables.lock().readers.get(reader_id).cloned()
    }

    pub fn has_reader(&self, reader_id: &str) -> bool {
        self.tables.lock().readers.contains_key(reader_id)
    }

    /// Connect attempts seen, refused ones included.
    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Local transactions opened (attempted) against this site.
    pub fn begins(&self) -> u32 {
        self.begins.load(Ordering::SeqCst)
    }

    fn release_locks(&self, token: u64, keys: &HashSet<RowKey>) {
        let mut locks = self.locks.lock();
        for key in keys {
            if locks.get(key) == Some(&token) {
                locks.remove(key);
            }
        }
    }
}

struct MemNetwork {
    sites: Mutex<HashMap<SiteId, Arc<MemSite>>>,
}

/// Connector over a shared in-process network of sites. Cloning shares the
/// network, so tests can keep one handle for seeding and assertions while
/// the resolver owns another.
#[derive(Clone)]
pub struct MemConnector {
    network: Arc<MemNetwork>,
}

impl MemConnector {
    pub fn new() -> Self {
        Self {
            network: Arc::new(MemNetwork {
                sites: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Direct handle to a site's state, creating an empty site on first use.
    pub fn site(&self, id: &SiteId) -> Arc<MemSite> {
        self.network
            .sites
            .lock()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(MemSite::new(id.clone())))
            .clone()
    }
}

impl Default for MemConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SiteConnector for MemConnector {
    type Conn = MemConnection;

    async fn connect(&self, cfg: &SiteConfig) -> Result<MemConnection, ConnectionError> {
        let site = self.site(&cfg.site_id());
        site.connects.fetch_add(1, Ordering::SeqCst);
        if site.faults.take_refused_connect() {
            return Err(ConnectionError::Driver {
                site: site.id.clone(),
                reason: "connection refused (injected)".to_string(),
            });
        }
        Ok(MemConnection { site })
    }
}

#[derive(Debug)]
pub struct MemConnection {
    site: Arc<MemSite>,
}

#[async_trait]
impl SiteConnection for MemConnection {
    type Txn = MemTransaction;

    async fn ping(&self) -> Result<(), ConnectionError> {
        Ok(())
    }

    async fn begin(&self) -> Result<MemTransaction, StoreError> {
        self.site.begins.fetch_add(1, Ordering::SeqCst);
        let stall = self.site.faults.take_begin_delay();
        if stall > 0 {
            tokio::time::sleep(Duration::from_millis(stall)).await;
        }
        if self.site.faults.take_fail_begin() {
            return Err(StoreError::Statement("injected begin failure".to_string()));
        }
        let token = self.site.next_token.fetch_add(1, Ordering::SeqCst);
        Ok(MemTransaction {
            site: self.site.clone(),
            token,
            staged: Vec::new(),
            locked: HashSet::new(),
            open: true,
        })
    }
}

enum StagedWrite {
    PutTitle(Title),
    DelTitle(String),
    PutBranch(Branch),
    DelBranch(String),
    PutCopy(BookCopy),
    DelCopy(String),
    PutLoan(Loan),
    PutReader(Reader),
    DelReader(String),
}

pub struct MemTransaction {
    site: Arc<MemSite>,
    token: u64,
    staged: Vec<StagedWrite>,
    locked: HashSet<RowKey>,
    open: bool,
}

impl MemTransaction {
    fn write_gate(&self) -> Result<(), StoreError> {
        if self.site.faults.take_fail_write() {
            return Err(StoreError::Statement("injected write failure".to_string()));
        }
        Ok(())
    }

    fn lock_row(&mut self, table: &'static str, key: &str) -> Result<(), StoreError> {
        let row: RowKey = (table, key.to_string());
        let mut locks = self.site.locks.lock();
        match locks.get(&row) {
            Some(owner) if *owner != self.token => Err(StoreError::RowBusy {
                key: format!("{table}/{key}"),
            }),
            _ => {
                locks.insert(row.clone(), self.token);
                self.locked.insert(row);
                Ok(())
            }
        }
    }

    // Overlay reads: the transaction's own staged writes shadow committed
    // state, newest stage first. `Some(None)` means staged-deleted.

    fn staged_copy(&self, copy_id: &str) -> Option<Option<BookCopy>> {
        for write in self.staged.iter().rev() {
            match write {
                StagedWrite::PutCopy(c) if c.copy_id == copy_id => return Some(Some(c.clone())),
                StagedWrite::DelCopy(id) if id == copy_id => return Some(None),
                _ => {}
            }
        }
        None
    }

    fn staged_title(&self, isbn: &str) -> Option<Option<Title>> {
        for write in self.staged.iter().rev() {
            match write {
                StagedWrite::PutTitle(t) if t.isbn == isbn => return Some(Some(t.clone())),
                StagedWrite::DelTitle(key) if key == isbn => return Some(None),
                _ => {}
            }
        }
        None
    }

    fn staged_branch(&self, branch_id: &str) -> Option<Option<Branch>> {
        for write in self.staged.iter().rev() {
            match write {
                StagedWrite::PutBranch(b) if b.branch_id == branch_id => {
                    return Some(Some(b.clone()))
                }
                StagedWrite::DelBranch(key) if key == branch_id => return Some(None),
                _ => {}
            }
        }
        None
    }

    fn staged_loan(&self, loan_id: &str) -> Option<Loan> {
        for write in self.staged.iter().rev() {
            if let StagedWrite::PutLoan(l) = write {
                if l.loan_id == loan_id {
                    return Some(l.clone());
                }
            }
        }
        None
    }

    fn staged_reader(&self, reader_id: &str) -> Option<Option<Reader>> {
        for write in self.staged.iter().rev() {
            match write {
                StagedWrite::PutReader(r) if r.reader_id == reader_id => {
                    return Some(Some(r.clone()))
                }
                StagedWrite::DelReader(id) if id == reader_id => return Some(None),
                _ => {}
            }
        }
        None
    }

    fn read_copy(&self, copy_id: &str) -> Option<BookCopy> {
        match self.staged_copy(copy_id) {
            Some(overlay) => overlay,
            None => self.site.tables.lock().copies.get(copy_id).cloned(),
        }
    }

    fn read_reader(&self, reader_id: &str) -> Option<Reader> {
        match self.staged_reader(reader_id) {
            Some(overlay) => overlay,
            None => self.site.tables.lock().readers.get(reader_id).cloned(),
        }
    }

    fn merged_copies(&self) -> Vec<BookCopy> {
        let mut copies = self.site.tables.lock().copies.clone();
        for write in &self.staged {
            match write {
                StagedWrite::PutCopy(c) => {
                    copies.insert(c.copy_id.clone(), c.clone());
                }
                StagedWrite::DelCopy(id) => {
                    copies.remove(id);
                }
                _ => {}
            }
        }
        let mut rows: Vec<BookCopy> = copies.into_values().collect();
        rows.sort_by(|a, b| a.copy_id.cmp(&b.copy_id));
        rows
    }

    fn merged_loans(&self) -> Vec<Loan> {
        let mut loans = self.site.tables.lock().loans.clone();
        for write in &self.staged {
            if let StagedWrite::PutLoan(l) = write {
                loans.insert(l.loan_id.clone(), l.clone());
            }
        }
        loans.into_values().collect()
    }

    fn finish(&mut self) {
        self.site.release_locks(self.token, &self.locked);
        self.locked.clear();
        self.open = false;
    }
}

#[async_trait]
impl SiteTransaction for MemTransaction {
    async fn replicated_exists(&mut self, key: &ReplicatedKey) -> Result<bool, StoreError> {
        let found = match key {
            ReplicatedKey::Title { isbn } => match self.staged_title(isbn) {
                Some(overlay) => overlay.is_some(),
                None => self.site.tables.lock().titles.contains_key(isbn),
            },
            ReplicatedKey::Branch { branch_id } => match self.staged_branch(branch_id) {
                Some(overlay) => overlay.is_some(),
                None => self.site.tables.lock().branches.contains_key(branch_id),
            },
        };
        Ok(found)
    }

    async fn insert_replicated(&mut self, row: &ReplicatedPayload) -> Result<(), StoreError> {
        self.write_gate()?;
        let key = row.key();
        if self.replicated_exists(&key).await? {
            return Err(StoreError::DuplicateKey {
                key: key.to_string(),
            });
        }
        self.lock_row(key.table(), key.value())?;
        match row {
            ReplicatedPayload::Title(t) => self.staged.push(StagedWrite::PutTitle(t.clone())),
            ReplicatedPayload::Branch(b) => self.staged.push(StagedWrite::PutBranch(b.clone())),
        }
        Ok(())
    }

    async fn update_replicated(&mut self, row: &ReplicatedPayload) -> Result<u64, StoreError> {
        self.write_gate()?;
        let key = row.key();
        if !self.replicated_exists(&key).await? {
            return Ok(0);
        }
        self.lock_row(key.table(), key.value())?;
        match row {
            ReplicatedPayload::Title(t) => self.staged.push(StagedWrite::PutTitle(t.clone())),
            ReplicatedPayload::Branch(b) => self.staged.push(StagedWrite::PutBranch(b.clone())),
        }
        Ok(1)
    }

    async fn delete_replicated(&mut self, key: &ReplicatedKey) -> Result<u64, StoreError> {
        self.write_gate()?;
        if !self.replicated_exists(key).await? {
            return Ok(0);
        }
        self.lock_row(key.table(), key.value())?;
        match key {
            ReplicatedKey::Title { isbn } => {
                self.staged.push(StagedWrite::DelTitle(isbn.clone()))
            }
            ReplicatedKey::Branch { branch_id } => {
                self.staged.push(StagedWrite::DelBranch(branch_id.clone()))
            }
        }
        Ok(1)
    }

    async fn book_copy(&mut self, copy_id: &str) -> Result<Option<BookCopy>, StoreError> {
        Ok(self.read_copy(copy_id))
    }

    async fn list_copies(&mut self) -> Result<Vec<BookCopy>, StoreError> {
        Ok(self.merged_copies())
    }

    async fn count_copies_of_title(&mut self, isbn: &str) -> Result<u64, StoreError> {
        Ok(self.merged_copies().iter().filter(|c| c.isbn == isbn).count() as u64)
    }

    async fn insert_copy(&mut self, copy: &BookCopy) -> Result<(), StoreError> {
        self.write_gate()?;
        if self.read_copy(&copy.copy_id).is_some() {
            return Err(StoreError::DuplicateKey {
                key: format!("copies/{}", copy.copy_id),
            });
        }
        self.lock_row("copies", &copy.copy_id)?;
        self.staged.push(StagedWrite::PutCopy(copy.clone()));
        Ok(())
    }

    async fn update_copy_status(
        &mut self,
        copy_id: &str,
        from: CopyStatus,
        to: CopyStatus,
    ) -> Result<u64, StoreError> {
        self.write_gate()?;
        let Some(current) = self.read_copy(copy_id) else {
            return Ok(0);
        };
        if current.status != from {
            return Ok(0);
        }
        self.lock_row("copies", copy_id)?;
        self.staged.push(StagedWrite::PutCopy(BookCopy {
            status: to,
            ..current
        }));
        Ok(1)
    }

    async fn delete_copy(&mut self, copy_id: &str) -> Result<u64, StoreError> {
        self.write_gate()?;
        if self.read_copy(copy_id).is_none() {
            return Ok(0);
        }
        self.lock_row("copies", copy_id)?;
        self.staged.push(StagedWrite::DelCopy(copy_id.to_string()));
        Ok(1)
    }

    async fn insert_loan(&mut self, loan: &Loan) -> Result<(), StoreError> {
        self.write_gate()?;
        let exists = self.staged_loan(&loan.loan_id).is_some()
            || self.site.tables.lock().loans.contains_key(&loan.loan_id);
        if exists {
            return Err(StoreError::DuplicateKey {
                key: format!("loans/{}", loan.loan_id),
            });
        }
        self.lock_row("loans", &loan.loan_id)?;
        self.staged.push(StagedWrite::PutLoan(loan.clone()));
        Ok(())
    }

    async fn open_loan(&mut self, copy_id: &str) -> Result<Option<Loan>, StoreError> {
        Ok(self
            .merged_loans()
            .into_iter()
            .find(|l| l.copy_id == copy_id && l.returned_at.is_none()))
    }

    async fn close_loan(
        &mut self,
        loan_id: &str,
        returned_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        self.write_gate()?;
        let current = match self.staged_loan(loan_id) {
            Some(l) => Some(l),
            None => self.site.tables.lock().loans.get(loan_id).cloned(),
        };
        let Some(loan) = current else {
            return Ok(0);
        };
        if loan.returned_at.is_some() {
            return Ok(0);
        }
        self.lock_row("loans", loan_id)?;
        self.staged.push(StagedWrite::PutLoan(Loan {
            returned_at: Some(returned_at),
            ..loan
        }));
        Ok(1)
    }

    async fn reader(&mut self, reader_id: &str) -> Result<Option<Reader>, StoreError> {
        Ok(self.read_reader(reader_id))
    }

    async fn insert_reader(&mut self, reader: &Reader) -> Result<(), StoreError> {
        self.write_gate()?;
        if self.read_reader(&reader.reader_id).is_some() {
            return Err(StoreError::DuplicateKey {
                key: format!("readers/{}", reader.reader_id),
            });
        }
        self.lock_row("readers", &reader.reader_id)?;
        self.staged.push(StagedWrite::PutReader(reader.clone()));
        Ok(())
    }

    async fn update_reader(&mut self, reader: &Reader) -> Result<u64, StoreError> {
        self.write_gate()?;
        let Some(current) = self.read_reader(&reader.reader_id) else {
            return Ok(0);
        };
        if current.home_branch_id != reader.home_branch_id {
            return Ok(0);
        }
        self.lock_row("readers", &reader.reader_id)?;
        self.staged.push(StagedWrite::PutReader(Reader {
            full_name: reader.full_name.clone(),
            ..current
        }));
        Ok(1)
    }

    async fn delete_reader(&mut self, reader_id: &str) -> Result<u64, StoreError> {
        self.write_gate()?;
        if self.read_reader(reader_id).is_none() {
            return Ok(0);
        }
        self.lock_row("readers", reader_id)?;
        self.staged.push(StagedWrite::DelReader(reader_id.to_string()));
        Ok(1)
    }

    async fn count_open_loans_of_reader(&mut self, reader_id: &str) -> Result<u64, StoreError> {
        Ok(self
            .merged_loans()
            .iter()
            .filter(|l| l.reader_id == reader_id && l.returned_at.is_none())
            .count() as u64)
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        if self.site.faults.take_fail_commit() {
            // A failed commit rolls back, like a database would.
            self.staged.clear();
            self.finish();
            return Err(StoreError::Statement("injected commit failure".to_string()));
        }
        {
            let mut tables = self.site.tables.lock();
            for write in self.staged.drain(..) {
                match write {
                    StagedWrite::PutTitle(t) => {
                        tables.titles.insert(t.isbn.clone(), t);
                    }
                    StagedWrite::DelTitle(isbn) => {
                        tables.titles.remove(&isbn);
                    }
                    StagedWrite::PutBranch(b) => {
                        tables.branches.insert(b.branch_id.clone(), b);
                    }
                    StagedWrite::DelBranch(id) => {
                        tables.branches.remove(&id);
                    }
                    StagedWrite::PutCopy(c) => {
                        tables.copies.insert(c.copy_id.clone(), c);
                    }
                    StagedWrite::DelCopy(id) => {
                        tables.copies.remove(&id);
                    }
                    StagedWrite::PutLoan(l) => {
                        tables.loans.insert(l.loan_id.clone(), l);
                    }
                    StagedWrite::PutReader(r) => {
                        tables.readers.insert(r.reader_id.clone(), r);
                    }
                    StagedWrite::DelReader(id) => {
                        tables.readers.remove(&id);
                    }
                }
            }
        }
        self.finish();
        Ok(())
    }

    async fn rollback(mut self) -> Result<(), StoreError> {
        // An injected rollback failure still discards the staged writes and
        // frees the row locks; only the acknowledgement is lost.
        self.staged.clear();
        self.finish();
        if self.site.faults.take_fail_rollback() {
            return Err(StoreError::Statement(
                "injected rollback failure".to_string(),
            ));
        }
        Ok(())
    }
}

impl Drop for MemTransaction {
    fn drop(&mut self) {
        // Dropped mid-flight (a cancelled prepare, a timed-out phase):
        // discard staged writes and free the row locks.
        if self.open {
            self.finish();
        }
    }
}
