// 🧭 Disambiguation - user choices for ambiguous matches
//
// Wire form: {"<dotted.path>": id}. The empty path addresses the row's base
// record; "#n" selects the n-th entry of a to-many list and "$Rank" a rank
// of a tree record, e.g. "collectingevent.collectors.#1.agent" or
// "determinations.#0.taxon.$Species".

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, i64>", into = "BTreeMap<String, i64>")]
pub struct Disambiguation {
    paths: BTreeMap<Vec<String>, i64>,
}

impl From<BTreeMap<String, i64>> for Disambiguation {
    fn from(map: BTreeMap<String, i64>) -> Self {
        let paths = map
            .into_iter()
            .map(|(path, id)| (split_path(&path), id))
            .collect();
        Disambiguation { paths }
    }
}

impl From<Disambiguation> for BTreeMap<String, i64> {
    fn from(d: Disambiguation) -> Self {
        d.paths.into_iter().map(|(path, id)| (path.join("."), id)).collect()
    }
}

fn split_path(path: &str) -> Vec<String> {
    path.split('.')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
        .collect()
}

impl Disambiguation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: choose `id` for the record at `path`
    pub fn with(mut self, path: &str, id: i64) -> Self {
        self.paths.insert(split_path(path), id);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Chosen id for the record this map is rooted at
    pub fn disambiguate(&self) -> Option<i64> {
        self.paths.get(&Vec::new()).copied()
    }

    fn descend(&self, segment: &str) -> Self {
        let segment = segment.to_lowercase();
        let paths = self
            .paths
            .iter()
            .filter(|(path, _)| path.first() == Some(&segment))
            .map(|(path, id)| (path[1..].to_vec(), *id))
            .collect();
        Disambiguation { paths }
    }

    pub fn to_one(&self, field: &str) -> Self {
        self.descend(field)
    }

    pub fn to_many(&self, field: &str, index: usize) -> Self {
        self.descend(field).descend(&format!("#{}", index))
    }

    pub fn tree_rank(&self, rank: &str) -> Self {
        self.descend(&format!("${}", rank))
    }
}
