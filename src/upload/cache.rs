// 🗃️ Match cache - batch-scoped memo of predicate → candidate ids
//
// Keyed by (table, predicate signature). Creating a record invalidates the
// entries it could change: its own table and every table that matches on it
// through a to-many relationship. Rows that roll back restore a snapshot.

use crate::schema::Datamodel;
use std::collections::HashMap;
use tracing::trace;

#[derive(Debug, Clone, Default)]
pub struct MatchCache {
    entries: HashMap<(String, String), Vec<i64>>,
    hits: usize,
    misses: usize,
}

impl MatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&mut self, table: &str, signature: &str) -> Option<Vec<i64>> {
        match self.entries.get(&(table.to_string(), signature.to_string())) {
            Some(ids) => {
                self.hits += 1;
                Some(ids.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, table: &str, signature: &str, ids: Vec<i64>) {
        self.entries.insert((table.to_string(), signature.to_string()), ids);
    }

    pub fn invalidate_table(&mut self, table: &str) {
        self.entries.retain(|(t, _), _| t != table);
    }

    /// A record was inserted into `table`; `signature` is the predicate it
    /// was created for, which now matches exactly that record.
    pub fn record_created(&mut self, datamodel: &Datamodel, table: &str, signature: Option<&str>, id: i64) {
        self.invalidate_table(table);
        for parent in datamodel.to_many_parents(table) {
            self.invalidate_table(parent);
        }
        if let Some(signature) = signature {
            self.insert(table, signature, vec![id]);
        }
        trace!(table, id, entries = self.entries.len(), "match cache updated");
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// (hits, misses) since the batch started
    pub fn stats(&self) -> (usize, usize) {
        (self.hits, self.misses)
    }
}
