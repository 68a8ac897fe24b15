// 🗺️ Upload Plan - declarative mapping from spreadsheet columns to records
//
// Wire format:
//   {"baseTableName": "collectionobject",
//    "uploadable": {"uploadTable": {"wbcols": {...}, "static": {...},
//                                   "toOne": {...}, "toMany": {...}}}}
// Plans are immutable once parsed; the scoper turns them into a tree bound
// to one collection.

use crate::error::{Error, Result};
use crate::schema::Record;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadPlan {
    pub base_table_name: String,
    pub uploadable: Uploadable,
}

impl UploadPlan {
    pub fn from_json(json: &str) -> Result<Self> {
        let plan: UploadPlan = serde_json::from_str(json)?;
        Ok(plan)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Plan(format!("failed to read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_json(&content)
    }

    /// Every spreadsheet column the plan reads
    pub fn columns(&self) -> BTreeSet<String> {
        let mut columns = BTreeSet::new();
        self.uploadable.collect_columns(&mut columns);
        columns
    }
}

/// One node of the plan tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Uploadable {
    UploadTable(UploadTable),
    /// Never shared: created along with its parent, never matched
    OneToOneTable(UploadTable),
    /// Must already exist; absence is a NoMatch failure
    MustMatchTable(UploadTable),
    TreeRecord(TreeRecord),
    MustMatchTreeRecord(TreeRecord),
}

impl Uploadable {
    fn collect_columns(&self, out: &mut BTreeSet<String>) {
        match self {
            Uploadable::UploadTable(t) | Uploadable::OneToOneTable(t) | Uploadable::MustMatchTable(t) => {
                t.collect_columns(out)
            }
            Uploadable::TreeRecord(t) | Uploadable::MustMatchTreeRecord(t) => {
                for rank in t.ranks.values() {
                    match rank {
                        RankSpec::Fields { tree_node_cols } => {
                            out.extend(tree_node_cols.values().map(|c| c.column().to_string()))
                        }
                        RankSpec::Column(spec) => {
                            out.insert(spec.column().to_string());
                        }
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadTable {
    /// Target field → source column
    #[serde(default)]
    pub wbcols: BTreeMap<String, ColumnSpec>,

    /// Constant field values written to every created record
    #[serde(default, rename = "static")]
    pub static_values: Record,

    #[serde(default)]
    pub to_one: BTreeMap<String, Uploadable>,

    #[serde(default)]
    pub to_many: BTreeMap<String, Vec<Uploadable>>,
}

impl UploadTable {
    fn collect_columns(&self, out: &mut BTreeSet<String>) {
        out.extend(self.wbcols.values().map(|c| c.column().to_string()));
        for child in self.to_one.values() {
            child.collect_columns(out);
        }
        for child in self.to_many.values().flatten() {
            child.collect_columns(out);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeRecord {
    /// Rank name → column for the node name, or columns for several node fields
    pub ranks: BTreeMap<String, RankSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RankSpec {
    Fields {
        #[serde(rename = "treeNodeCols")]
        tree_node_cols: BTreeMap<String, ColumnSpec>,
    },
    Column(ColumnSpec),
}

// ============================================================================
// COLUMN SPECS
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MatchBehavior {
    /// Blank cells do not constrain the match
    IgnoreWhenBlank,
    /// The column never constrains the match
    IgnoreAlways,
    #[default]
    IgnoreNever,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnOptions {
    pub column: String,

    #[serde(default)]
    pub match_behavior: MatchBehavior,

    #[serde(default = "default_true")]
    pub null_allowed: bool,

    /// Used in place of a blank cell
    #[serde(default)]
    pub default: Option<String>,
}

/// A bare column name or a full options object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnSpec {
    Column(String),
    Options(ColumnOptions),
}

impl ColumnSpec {
    pub fn column(&self) -> &str {
        match self {
            ColumnSpec::Column(c) => c,
            ColumnSpec::Options(o) => &o.column,
        }
    }

    pub fn options(&self) -> ColumnOptions {
        match self {
            ColumnSpec::Column(c) => ColumnOptions {
                column: c.clone(),
                match_behavior: MatchBehavior::default(),
                null_allowed: true,
                default: None,
            },
            ColumnSpec::Options(o) => o.clone(),
        }
    }
}
