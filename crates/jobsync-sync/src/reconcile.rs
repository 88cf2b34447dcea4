//! New-record selection against the existing-id snapshot.

use std::collections::{BTreeSet, HashSet};

use jobsync_core::{ExistingIdSet, JobPosting, RecordId};
use tracing::info;

/// Keeps the postings whose id is not in `existing`, in input order.
///
/// Repeated ids inside `batch` are not collapsed: if the API returns the same
/// new id twice, both rows are kept. Use [`repeated_ids`] to report them.
pub fn reconcile(batch: Option<&[JobPosting]>, existing: &ExistingIdSet) -> Vec<JobPosting> {
    let Some(batch) = batch.filter(|b| !b.is_empty()) else {
        info!("no data to reconcile");
        return Vec::new();
    };
    batch
        .iter()
        .filter(|posting| !existing.contains(&posting.id))
        .cloned()
        .collect()
}

/// Ids that occur more than once in `batch`, sorted.
pub fn repeated_ids(batch: &[JobPosting]) -> Vec<RecordId> {
    let mut seen = HashSet::with_capacity(batch.len());
    let mut repeated = BTreeSet::new();
    for posting in batch {
        if !seen.insert(&posting.id) {
            repeated.insert(posting.id.clone());
        }
    }
    repeated.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map, Value as JsonValue};

    fn posting(id: &str, title: &str) -> JobPosting {
        let mut fields = Map::new();
        fields.insert("id".to_string(), JsonValue::String(id.to_string()));
        fields.insert("title".to_string(), json!(title));
        JobPosting::from_flat(fields, "id").expect("posting")
    }

    fn ids(items: &[JobPosting]) -> Vec<&str> {
        items.iter().map(|p| p.id.as_str()).collect()
    }

    fn existing(ids: &[&str]) -> ExistingIdSet {
        ids.iter().map(|id| RecordId::new(*id)).collect()
    }

    #[test]
    fn keeps_only_unknown_ids() {
        let batch = vec![posting("1", "a"), posting("2", "b")];
        let out = reconcile(Some(batch.as_slice()), &existing(&["2"]));
        assert_eq!(ids(&out), vec!["1"]);
        assert_eq!(out[0].get("title"), Some(&json!("a")));
    }

    #[test]
    fn result_is_the_ordered_set_difference() {
        let batch: Vec<_> = ["9", "3", "7", "1", "5", "2"]
            .iter()
            .map(|id| posting(id, "t"))
            .collect();
        let known = existing(&["3", "1", "100"]);
        let out = reconcile(Some(batch.as_slice()), &known);

        assert_eq!(ids(&out), vec!["9", "7", "5", "2"]);
        assert!(out.iter().all(|p| !known.contains(&p.id)));
        let expected: Vec<_> = batch.iter().filter(|p| !known.contains(&p.id)).collect();
        assert_eq!(out.iter().collect::<Vec<_>>(), expected);
    }

    #[test]
    fn empty_or_absent_batches_short_circuit() {
        let known = existing(&["1"]);
        let empty: Vec<JobPosting> = Vec::new();
        assert!(reconcile(None, &known).is_empty());
        assert!(reconcile(Some(empty.as_slice()), &known).is_empty());
        assert!(reconcile(Some(empty.as_slice()), &ExistingIdSet::new()).is_empty());
    }

    #[test]
    fn reconcile_is_idempotent() {
        let batch = vec![posting("1", "a"), posting("2", "b"), posting("3", "c")];
        let known = existing(&["2"]);
        let first = reconcile(Some(batch.as_slice()), &known);
        let second = reconcile(Some(batch.as_slice()), &known);
        assert_eq!(first, second);
        assert_eq!(reconcile(Some(first.as_slice()), &known), first);
    }

    #[test]
    fn repeated_new_ids_are_both_kept() {
        let batch = vec![posting("5", "first"), posting("5", "second"), posting("6", "x")];
        let out = reconcile(Some(batch.as_slice()), &existing(&[]));
        assert_eq!(ids(&out), vec!["5", "5", "6"]);
        assert_eq!(repeated_ids(&batch), vec![RecordId::new("5")]);
    }

    #[test]
    fn everything_known_yields_empty() {
        let batch = vec![posting("1", "a"), posting("2", "b")];
        assert!(reconcile(Some(batch.as_slice()), &existing(&["1", "2"])).is_empty());
        assert!(repeated_ids(&batch).is_empty());
    }
}
