// 🎯 Scoper - binds a plan to one collection
//
// Resolves every table/field/relationship the plan names against the
// datamodel, injects the collection-hierarchy foreign keys records must
// carry, attaches picklists, and decides which to-one children are
// one-to-one for this collection.

use super::plan::{ColumnOptions, ColumnSpec, RankSpec, TreeRecord, UploadPlan, UploadTable, Uploadable};
use crate::error::{Error, Result};
use crate::picklist::{load_picklists, Picklist};
use crate::schema::{Datamodel, Field, FieldValue, Record, RelationshipKind, Table};
use crate::tree::{load_tree_def_items, TreeDefItem};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// COLLECTION CONTEXT
// ============================================================================

/// Where in the institution → division → discipline → collection hierarchy
/// an upload lands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionContext {
    pub collection_id: i64,
    pub discipline_id: i64,
    pub division_id: i64,
    pub institution_id: i64,
    pub geography_treedef_id: i64,
    pub taxon_treedef_id: i64,
    /// Collecting events belong to one specimen and are never shared
    pub embedded_collecting_event: bool,
}

impl CollectionContext {
    pub fn load(conn: &Connection, collection_id: i64) -> Result<Self> {
        conn.query_row(
            "SELECT c.collectionid, c.disciplineid, d.divisionid, dv.institutionid,
                    d.geographytreedefid, d.taxontreedefid, c.isembeddedcollectingevent
             FROM collection c
             JOIN discipline d ON d.disciplineid = c.disciplineid
             JOIN division dv ON dv.divisionid = d.divisionid
             WHERE c.collectionid = ?1",
            params![collection_id],
            |row| {
                Ok(CollectionContext {
                    collection_id: row.get(0)?,
                    discipline_id: row.get(1)?,
                    division_id: row.get(2)?,
                    institution_id: row.get(3)?,
                    geography_treedef_id: row.get(4)?,
                    taxon_treedef_id: row.get(5)?,
                    embedded_collecting_event: row.get(6)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| Error::NotFound(format!("collection {}", collection_id)))
    }

    pub fn treedef_for(&self, tree_table: &str) -> Option<i64> {
        match tree_table {
            "geography" => Some(self.geography_treedef_id),
            "taxon" => Some(self.taxon_treedef_id),
            _ => None,
        }
    }

    /// Foreign keys every new record of `table` gets from the hierarchy
    pub fn scoping_values(&self, table: &Table) -> Record {
        let mut values = Record::new();
        let mut set = |column: &str, id: i64| {
            values.insert(column.to_string(), FieldValue::Integer(id));
        };
        match table.name {
            "collectionobject" => {
                set("collectionid", self.collection_id);
                set("collectionmemberid", self.collection_id);
            }
            "collectingevent" | "locality" => set("disciplineid", self.discipline_id),
            "agent" | "collector" => set("divisionid", self.division_id),
            "determination" | "preparation" | "collectionobjectattribute" => {
                set("collectionmemberid", self.collection_id)
            }
            "preptype" => set("collectionid", self.collection_id),
            name => {
                if let Some(treedef) = self.treedef_for(name) {
                    set("treedefid", treedef);
                }
            }
        }
        values
    }
}

// ============================================================================
// SCOPED PLAN
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableKind {
    Upload,
    OneToOne,
    MustMatch,
}

#[derive(Debug, Clone)]
pub struct ScopedColumn {
    pub field: &'static Field,
    pub options: ColumnOptions,
    pub picklist: Option<Picklist>,
}

impl ScopedColumn {
    pub fn column(&self) -> &str {
        &self.options.column
    }
}

#[derive(Debug, Clone)]
pub struct ScopedUploadTable {
    pub table: &'static Table,
    pub kind: TableKind,
    pub columns: Vec<ScopedColumn>,
    pub static_values: Record,
    pub scoping_values: Record,
    pub to_one: BTreeMap<String, ScopedUploadable>,
    pub to_many: BTreeMap<String, Vec<ScopedUploadTable>>,
}

impl ScopedUploadTable {
    pub fn is_one_to_one(&self) -> bool {
        self.kind == TableKind::OneToOne
    }
}

#[derive(Debug, Clone)]
pub struct ScopedRank {
    pub item: TreeDefItem,
    pub columns: Vec<ScopedColumn>,
}

#[derive(Debug, Clone)]
pub struct ScopedTreeRecord {
    pub table: &'static Table,
    pub treedef_id: i64,
    /// Every rank of the tree definition, root first
    pub items: Vec<TreeDefItem>,
    /// Ranks the plan maps, root first
    pub ranks: Vec<ScopedRank>,
    pub must_match: bool,
}

#[derive(Debug, Clone)]
pub enum ScopedUploadable {
    Table(ScopedUploadTable),
    Tree(ScopedTreeRecord),
}

impl ScopedUploadable {
    pub fn table(&self) -> &'static Table {
        match self {
            ScopedUploadable::Table(t) => t.table,
            ScopedUploadable::Tree(t) => t.table,
        }
    }

    pub fn is_one_to_one(&self) -> bool {
        matches!(self, ScopedUploadable::Table(t) if t.is_one_to_one())
    }
}

// ============================================================================
// SCOPER
// ============================================================================

pub struct Scoper<'a> {
    conn: &'a Connection,
    datamodel: &'a Datamodel,
    collection: &'a CollectionContext,
    picklists: Vec<Picklist>,
}

/// Resolve a plan against the datamodel for one collection
pub fn scope_plan(
    conn: &Connection,
    datamodel: &Datamodel,
    collection: &CollectionContext,
    plan: &UploadPlan,
) -> Result<ScopedUploadable> {
    let scoper = Scoper {
        conn,
        datamodel,
        collection,
        picklists: load_picklists(conn, collection.collection_id)?,
    };
    let base = datamodel
        .table(&plan.base_table_name)
        .ok_or_else(|| Error::Plan(format!("unknown base table {}", plan.base_table_name)))?;
    scoper.scope(base, &plan.uploadable, None)
}

impl Scoper<'_> {
    fn scope(
        &self,
        table: &'static Table,
        uploadable: &Uploadable,
        parent: Option<(&Table, RelationshipKind, &str)>,
    ) -> Result<ScopedUploadable> {
        match uploadable {
            Uploadable::UploadTable(t) => {
                let kind = match parent {
                    Some((_, RelationshipKind::OneToOne, _)) => TableKind::OneToOne,
                    Some((p, _, "collectingevent"))
                        if p.name == "collectionobject" && self.collection.embedded_collecting_event =>
                    {
                        TableKind::OneToOne
                    }
                    _ => TableKind::Upload,
                };
                Ok(ScopedUploadable::Table(self.scope_table(table, t, kind)?))
            }
            Uploadable::OneToOneTable(t) => Ok(ScopedUploadable::Table(self.scope_table(table, t, TableKind::OneToOne)?)),
            Uploadable::MustMatchTable(t) => Ok(ScopedUploadable::Table(self.scope_table(table, t, TableKind::MustMatch)?)),
            Uploadable::TreeRecord(t) => Ok(ScopedUploadable::Tree(self.scope_tree(table, t, false)?)),
            Uploadable::MustMatchTreeRecord(t) => Ok(ScopedUploadable::Tree(self.scope_tree(table, t, true)?)),
        }
    }

    fn scope_column(&self, table: &Table, field_name: &str, spec: &ColumnSpec) -> Result<ScopedColumn> {
        let field = table
            .field(field_name)
            .ok_or_else(|| Error::Plan(format!("{} has no field {}", table.name, field_name)))?;
        let picklist = self
            .picklists
            .iter()
            .find(|p| p.table_name == table.name && p.field_name == field.name)
            .cloned();
        Ok(ScopedColumn {
            field,
            options: spec.options(),
            picklist,
        })
    }

    fn scope_table(&self, table: &'static Table, plan: &UploadTable, kind: TableKind) -> Result<ScopedUploadTable> {
        if table.is_tree {
            return Err(Error::Plan(format!("{} is a tree; use a treeRecord", table.name)));
        }

        let columns = plan
            .wbcols
            .iter()
            .map(|(field, spec)| self.scope_column(table, field, spec))
            .collect::<Result<Vec<_>>>()?;

        let mut static_values = Record::new();
        for (column, value) in &plan.static_values {
            let column = column.to_lowercase();
            if !table.has_column(&column) {
                return Err(Error::Plan(format!("{} has no column {}", table.name, column)));
            }
            static_values.insert(column, value.clone());
        }

        let mut to_one = BTreeMap::new();
        for (name, child) in &plan.to_one {
            let rel = table
                .relationship(name)
                .filter(|r| r.is_to_one())
                .ok_or_else(|| Error::Plan(format!("{} has no to-one relationship {}", table.name, name)))?;
            let related = self.related(rel.related)?;
            let scoped = self.scope(related, child, Some((table, rel.kind, rel.name)))?;
            if related.is_tree != matches!(scoped, ScopedUploadable::Tree(_)) {
                return Err(Error::Plan(format!("{}.{} must map a {}", table.name, name,
                    if related.is_tree { "treeRecord" } else { "table" })));
            }
            to_one.insert(rel.name.to_string(), scoped);
        }

        let mut to_many = BTreeMap::new();
        for (name, children) in &plan.to_many {
            let rel = table
                .relationship(name)
                .filter(|r| r.kind == RelationshipKind::OneToMany)
                .ok_or_else(|| Error::Plan(format!("{} has no to-many relationship {}", table.name, name)))?;
            let related = self.related(rel.related)?;
            let mut scoped_children = Vec::with_capacity(children.len());
            for child in children {
                match self.scope(related, child, Some((table, rel.kind, rel.name)))? {
                    ScopedUploadable::Table(t) if t.kind != TableKind::OneToOne => scoped_children.push(t),
                    _ => {
                        return Err(Error::Plan(format!(
                            "{}.{} entries must be uploadTable or mustMatchTable",
                            table.name, name
                        )))
                    }
                }
            }
            to_many.insert(rel.name.to_string(), scoped_children);
        }

        Ok(ScopedUploadTable {
            table,
            kind,
            columns,
            static_values,
            scoping_values: self.collection.scoping_values(table),
            to_one,
            to_many,
        })
    }

    fn scope_tree(&self, table: &'static Table, plan: &TreeRecord, must_match: bool) -> Result<ScopedTreeRecord> {
        let treedef_id = self
            .collection
            .treedef_for(table.name)
            .ok_or_else(|| Error::Plan(format!("{} is not a tree", table.name)))?;
        let items = load_tree_def_items(self.conn, treedef_id)?;

        let mut ranks = Vec::with_capacity(plan.ranks.len());
        for (rank_name, spec) in &plan.ranks {
            let item = items
                .iter()
                .find(|i| i.name.eq_ignore_ascii_case(rank_name))
                .ok_or_else(|| Error::Plan(format!("{} has no rank {}", table.name, rank_name)))?;
            let columns = match spec {
                RankSpec::Column(column) => vec![self.scope_column(table, "name", column)?],
                RankSpec::Fields { tree_node_cols } => {
                    if !tree_node_cols.keys().any(|f| f.eq_ignore_ascii_case("name")) {
                        return Err(Error::Plan(format!("rank {} does not map the node name", rank_name)));
                    }
                    tree_node_cols
                        .iter()
                        .map(|(field, column)| self.scope_column(table, field, column))
                        .collect::<Result<Vec<_>>>()?
                }
            };
            ranks.push(ScopedRank { item: item.clone(), columns });
        }
        if ranks.is_empty() {
            return Err(Error::Plan(format!("{} tree record maps no ranks", table.name)));
        }
        ranks.sort_by_key(|r| r.item.rank_id);

        Ok(ScopedTreeRecord {
            table,
            treedef_id,
            items,
            ranks,
            must_match,
        })
    }

    fn related(&self, name: &str) -> Result<&'static Table> {
        self.datamodel
            .table(name)
            .ok_or_else(|| Error::Plan(format!("unknown table {}", name)))
    }
}
