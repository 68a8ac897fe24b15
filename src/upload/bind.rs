// 🔗 Binding - a scoped plan evaluated against one row
//
// Every cell the plan maps is parsed up front. A row with any parse
// failure never reaches matching: all of its failures are returned together.

use super::disambiguation::Disambiguation;
use super::predicate::Predicate;
use super::scoping::{ScopedColumn, ScopedRank, ScopedTreeRecord, ScopedUploadTable, ScopedUploadable};
use crate::config::UploadConfig;
use crate::parser::{parse_column, ParseFailure, ParseResult};
use crate::schema::Table;
use std::collections::BTreeMap;

/// Column name → raw cell. Missing columns read as blank.
pub type Row = BTreeMap<String, String>;

pub struct BoundUploadTable<'p> {
    pub scoped: &'p ScopedUploadTable,
    pub parsed: Vec<ParseResult>,
    pub to_one: BTreeMap<String, BoundUploadable<'p>>,
    pub to_many: BTreeMap<String, Vec<BoundUploadTable<'p>>>,
    pub disambiguation: Disambiguation,
}

pub struct BoundRank<'p> {
    pub scoped: &'p ScopedRank,
    pub name: String,
    pub parsed: Vec<ParseResult>,
}

pub struct BoundTreeRecord<'p> {
    pub scoped: &'p ScopedTreeRecord,
    /// Ranks with a non-blank name, root first
    pub ranks: Vec<BoundRank<'p>>,
    pub disambiguation: Disambiguation,
}

pub enum BoundUploadable<'p> {
    Table(BoundUploadTable<'p>),
    Tree(BoundTreeRecord<'p>),
}

impl BoundUploadable<'_> {
    /// Nothing in this subtree came from the row
    pub fn is_blank(&self, config: &UploadConfig) -> bool {
        match self {
            BoundUploadable::Table(t) => t.is_blank(config),
            BoundUploadable::Tree(t) => t.ranks.is_empty(),
        }
    }

    pub fn is_one_to_one(&self) -> bool {
        matches!(self, BoundUploadable::Table(t) if t.scoped.is_one_to_one())
    }
}

impl BoundUploadTable<'_> {
    pub fn table(&self) -> &'static Table {
        self.scoped.table
    }

    /// No cell (or default) of this subtree gives a value
    pub fn is_blank(&self, config: &UploadConfig) -> bool {
        self.row_values(config).is_reducible_to_nothing()
            && self.to_one.values().all(|c| c.is_blank(config))
            && self.to_many.values().flatten().all(|c| c.is_blank(config))
    }

    /// What this node's own cells would write, as a predicate
    fn row_values(&self, config: &UploadConfig) -> Predicate {
        let table = self.scoped.table;
        let mut predicate = Predicate::new(table);
        for parsed in self.parsed.iter().filter(|p| config.counts_for_null_check(table.name, p.field)) {
            predicate.filters.extend(parsed.upload.clone());
        }
        predicate
    }
}

// ============================================================================
// BINDER
// ============================================================================

struct Binder<'r> {
    row: &'r Row,
    config: &'r UploadConfig,
    failures: Vec<ParseFailure>,
}

/// Parse every mapped cell of `row`
pub fn bind_row<'p>(
    scoped: &'p ScopedUploadable,
    row: &Row,
    disambiguation: Option<&Disambiguation>,
    config: &UploadConfig,
) -> Result<BoundUploadable<'p>, Vec<ParseFailure>> {
    let mut binder = Binder {
        row,
        config,
        failures: Vec::new(),
    };
    let root = disambiguation.cloned().unwrap_or_default();
    let bound = binder.bind(scoped, root);
    if binder.failures.is_empty() {
        Ok(bound)
    } else {
        Err(binder.failures)
    }
}

impl Binder<'_> {
    fn parse_all(&mut self, table: &Table, columns: &[ScopedColumn]) -> Vec<ParseResult> {
        let mut parsed = Vec::with_capacity(columns.len());
        for column in columns {
            let raw = self.row.get(column.column()).map(String::as_str).unwrap_or("");
            match parse_column(table, column, raw, self.config) {
                Ok(result) => parsed.push(result),
                Err(failure) => self.failures.push(failure),
            }
        }
        parsed
    }

    fn bind<'p>(&mut self, scoped: &'p ScopedUploadable, disambiguation: Disambiguation) -> BoundUploadable<'p> {
        match scoped {
            ScopedUploadable::Table(t) => BoundUploadable::Table(self.bind_table(t, disambiguation)),
            ScopedUploadable::Tree(t) => BoundUploadable::Tree(self.bind_tree(t, disambiguation)),
        }
    }

    fn bind_table<'p>(&mut self, scoped: &'p ScopedUploadTable, disambiguation: Disambiguation) -> BoundUploadTable<'p> {
        let parsed = self.parse_all(scoped.table, &scoped.columns);

        let to_one = scoped
            .to_one
            .iter()
            .map(|(field, child)| (field.clone(), self.bind(child, disambiguation.to_one(field))))
            .collect();

        let to_many = scoped
            .to_many
            .iter()
            .map(|(field, children)| {
                let bound = children
                    .iter()
                    .enumerate()
                    .map(|(i, child)| self.bind_table(child, disambiguation.to_many(field, i)))
                    .collect();
                (field.clone(), bound)
            })
            .collect();

        BoundUploadTable {
            scoped,
            parsed,
            to_one,
            to_many,
            disambiguation,
        }
    }

    fn bind_tree<'p>(&mut self, scoped: &'p ScopedTreeRecord, disambiguation: Disambiguation) -> BoundTreeRecord<'p> {
        let mut ranks = Vec::new();
        for rank in &scoped.ranks {
            let parsed = self.parse_all(scoped.table, &rank.columns);
            let name = parsed
                .iter()
                .find(|p| p.field == "name")
                .and_then(|p| p.upload.get("name"))
                .and_then(|v| v.as_str())
                .map(str::to_string);
            if let Some(name) = name {
                ranks.push(BoundRank { scoped: rank, name, parsed });
            }
        }
        BoundTreeRecord {
            scoped,
            ranks,
            disambiguation,
        }
    }
}
