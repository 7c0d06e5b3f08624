//! Row types of the external library schema.
//!
//! The schema is owned by the site databases, not by this workspace; these
//! types mirror it. `titles` and `branches` are replicated to every site,
//! `copies` and `loans` are fragmented by branch with `branch_id` as the
//! fragment key, `readers` is fragmented by `home_branch_id`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a physical copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyStatus {
    Available,
    Borrowed,
    /// Tentative transfer mark. Written uncommitted during the prepare
    /// phase of a transfer; a committed row in this state is a stray the
    /// recovery sweep repairs.
    InTransit,
}

impl CopyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CopyStatus::Available => "available",
            CopyStatus::Borrowed => "borrowed",
            CopyStatus::InTransit => "in_transit",
        }
    }

    pub fn parse(s: &str) -> Option<CopyStatus> {
        match s {
            "available" => Some(CopyStatus::Available),
            "borrowed" => Some(CopyStatus::Borrowed),
            "in_transit" => Some(CopyStatus::InTransit),
            _ => None,
        }
    }
}

impl fmt::Display for CopyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replicated catalog row (`titles`), keyed by ISBN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Title {
    pub isbn: String,
    pub title: String,
    pub author: String,
}

/// Replicated branch-directory row (`branches`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub branch_id: String,
    pub name: String,
    pub address: String,
}

/// Fragmented physical-copy row (`copies`). `branch_id` is the fragment key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookCopy {
    pub copy_id: String,
    pub isbn: String,
    pub branch_id: String,
    pub status: CopyStatus,
}

/// Fragmented loan row (`loans`). `branch_id` is the fragment key; a loan
/// with `returned_at = None` is open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loan {
    pub loan_id: String,
    pub reader_id: String,
    pub copy_id: String,
    pub branch_id: String,
    pub borrowed_at: DateTime<Utc>,
    pub returned_at: Option<DateTime<Utc>>,
}

/// Fragmented reader row (`readers`). `home_branch_id` is the fragment key:
/// a reader lives where they registered, loans elsewhere reference them by
/// id only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reader {
    pub reader_id: String,
    pub full_name: String,
    pub home_branch_id: String,
}

/// Which mutation a replicated write applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicatedOp {
    Create,
    Update,
    Delete,
}

impl fmt::Display for ReplicatedOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReplicatedOp::Create => "create",
            ReplicatedOp::Update => "update",
            ReplicatedOp::Delete => "delete",
        })
    }
}

/// Write payload for one replicated row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicatedPayload {
    Title(Title),
    Branch(Branch),
}

impl ReplicatedPayload {
    /// Natural key of the payload row.
    pub fn key(&self) -> ReplicatedKey {
        match self {
            ReplicatedPayload::Title(t) => ReplicatedKey::Title {
                isbn: t.isbn.clone(),
            },
            ReplicatedPayload::Branch(b) => ReplicatedKey::Branch {
                branch_id: b.branch_id.clone(),
            },
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            ReplicatedPayload::Title(_) => "titles",
            ReplicatedPayload::Branch(_) => "branches",
        }
    }

    /// Well-formedness check, run before any remote transaction is opened.
    ///
    /// `Create` and `Update` need every required field; `Delete` only needs
    /// the key. Returns the reason for rejection.
    pub fn validate_for(&self, op: ReplicatedOp) -> Result<(), String> {
        let key_field = match self {
            ReplicatedPayload::Title(t) => ("titles.isbn", t.isbn.trim()),
            ReplicatedPayload::Branch(b) => ("branches.branch_id", b.branch_id.trim()),
        };
        if key_field.1.is_empty() {
            return Err(format!("{} must not be empty", key_field.0));
        }
        if op == ReplicatedOp::Delete {
            return Ok(());
        }
        match self {
            ReplicatedPayload::Title(t) => {
                if t.title.trim().is_empty() {
                    return Err("titles.title must not be empty".to_string());
                }
            }
            ReplicatedPayload::Branch(b) => {
                if b.name.trim().is_empty() {
                    return Err("branches.name must not be empty".to_string());
                }
            }
        }
        Ok(())
    }
}

/// Natural key naming one replicated row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicatedKey {
    Title { isbn: String },
    Branch { branch_id: String },
}

impl ReplicatedKey {
    pub fn table(&self) -> &'static str {
        match self {
            ReplicatedKey::Title { .. } => "titles",
            ReplicatedKey::Branch { .. } => "branches",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            ReplicatedKey::Title { isbn } => isbn,
            ReplicatedKey::Branch { branch_id } => branch_id,
        }
    }
}

impl fmt::Display for ReplicatedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.table(), self.value())
    }
}

#[cfg(test)]
mod payload_validation {
    use super::*;

    fn title(isbn: &str, title: &str) -> ReplicatedPayload {
        ReplicatedPayload::Title(Title {
            isbn: isbn.to_string(),
            title: title.to_string(),
            author: "Unknown".to_string(),
        })
    }

    #[test]
    fn test_create_requires_all_fields() {
        assert!(title("978-0-000001", "Distributed Databases")
            .validate_for(ReplicatedOp::Create)
            .is_ok());
        assert!(title("", "Distributed Databases")
            .validate_for(ReplicatedOp::Create)
            .is_err());
        assert!(title("978-0-000001", "  ")
            .validate_for(ReplicatedOp::Create)
            .is_err());
    }

    #[test]
    fn test_delete_requires_only_the_key() {
        assert!(title("978-0-000001", "").validate_for(ReplicatedOp::Delete).is_ok());
        assert!(title("", "").validate_for(ReplicatedOp::Delete).is_err());
    }

    #[test]
    fn test_branch_payload_key() {
        let payload = ReplicatedPayload::Branch(Branch {
            branch_id: "Q1".to_string(),
            name: "Central".to_string(),
            address: String::new(),
        });
        let key = payload.key();
        assert_eq!(key.table(), "branches");
        assert_eq!(key.value(), "Q1");
        assert_eq!(key.to_string(), "branches:Q1");
    }

    #[test]
    fn test_copy_status_round_trip() {
        for status in [CopyStatus::Available, CopyStatus::Borrowed, CopyStatus::InTransit] {
            assert_eq!(CopyStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(CopyStatus::parse("mislaid"), None);
    }
}
