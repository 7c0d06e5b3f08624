//! Shared foundation for the kestrel coordination layer.
//!
//! This crate carries everything the site and cluster crates agree on:
//! site and transaction identifiers, the error taxonomy with its
//! classification rules, runtime configuration, and the row types of the
//! external library schema the coordinator operates on.

pub mod config;
pub mod error;
pub mod model;
pub mod types;

pub use config::{CoordinatorConfig, KestrelConfig, ResolverConfig, SiteConfig};
pub use error::{
    ConnectionError, ErrorContext, ErrorKind, FragmentationViolation, KestrelError,
    KestrelResult, StoreError,
};
pub use model::{
    BookCopy, Branch, CopyStatus, Loan, Reader, ReplicatedKey, ReplicatedOp, ReplicatedPayload,
    Title,
};
pub use types::{SiteId, TxnId};
