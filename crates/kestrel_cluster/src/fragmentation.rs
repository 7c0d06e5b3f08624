//! Fragmentation rules for the horizontally partitioned tables.
//!
//! Every fragmented row carries its owning site in a fragment-key column.
//! A write whose fragment key names a different site than the one being
//! written to is rejected here, before any transaction is opened. Both
//! halves of a transfer pass through this check: the delete side against
//! the source site, the insert side against the destination.

use kestrel_common::error::FragmentationViolation;
use kestrel_common::types::SiteId;

/// Fragmented tables of the library schema and their fragment-key columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentedTable {
    Copies,
    Loans,
    Readers,
}

impl FragmentedTable {
    pub fn table_name(&self) -> &'static str {
        match self {
            FragmentedTable::Copies => "copies",
            FragmentedTable::Loans => "loans",
            FragmentedTable::Readers => "readers",
        }
    }

    pub fn fragment_column(&self) -> &'static str {
        match self {
            FragmentedTable::Copies | FragmentedTable::Loans => "branch_id",
            FragmentedTable::Readers => "home_branch_id",
        }
    }
}

/// Pure ownership check: a fragmented write must target the row's owning
/// site, no more and no less.
pub fn validate(
    table: FragmentedTable,
    fragment_key: &str,
    expected: &SiteId,
) -> Result<(), FragmentationViolation> {
    if fragment_key == expected.as_str() {
        Ok(())
    } else {
        Err(FragmentationViolation {
            table: table.table_name(),
            column: table.fragment_column(),
            value: fragment_key.to_string(),
            expected: expected.clone(),
        })
    }
}

#[cfg(test)]
mod fragment_rules {
    use super::*;

    #[test]
    fn test_matching_key_passes() {
        assert!(validate(FragmentedTable::Copies, "Q1", &SiteId::new("Q1")).is_ok());
        assert!(validate(FragmentedTable::Loans, "Q3", &SiteId::new("Q3")).is_ok());
    }

    #[test]
    fn test_mismatched_key_is_rejected_with_table_and_column() {
        let err = validate(FragmentedTable::Copies, "Q3", &SiteId::new("Q1")).unwrap_err();
        assert_eq!(err.table, "copies");
        assert_eq!(err.column, "branch_id");
        assert_eq!(err.value, "Q3");
        assert_eq!(err.expected, SiteId::new("Q1"));
    }

    #[test]
    fn test_readers_fragment_on_home_branch() {
        let err = validate(FragmentedTable::Readers, "Q2", &SiteId::new("Q1")).unwrap_err();
        assert_eq!(err.column, "home_branch_id");
    }
}
