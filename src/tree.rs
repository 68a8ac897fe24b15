// 🌳 Tree definitions and tree maintenance
//
// Tree tables (geography, taxon) hold one row per node with a parent
// pointer, a rank and nested-interval node numbers. The upload engine only
// inserts nodes; numbering and full names are fixed up here once a batch
// is done.

use crate::error::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

// ============================================================================
// TREE DEFINITION
// ============================================================================

/// One rank of a tree definition ("State", "County", "Species", ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeDefItem {
    pub id: i64,
    pub treedef_id: i64,
    pub name: String,
    pub rank_id: i64,
    /// A node of this rank may not be skipped between parent and child
    pub is_enforced: bool,
    pub is_in_full_name: bool,
}

/// Ranks of a tree definition, ordered root → leaf
pub fn load_tree_def_items(conn: &Connection, treedef_id: i64) -> Result<Vec<TreeDefItem>> {
    let mut stmt = conn.prepare(
        "SELECT treedefitemid, treedefid, name, rankid, isenforced, isinfullname
         FROM treedefitem WHERE treedefid = ?1 ORDER BY rankid",
    )?;
    let items = stmt
        .query_map(params![treedef_id], |row| {
            Ok(TreeDefItem {
                id: row.get(0)?,
                treedef_id: row.get(1)?,
                name: row.get(2)?,
                rank_id: row.get(3)?,
                is_enforced: row.get(4)?,
                is_in_full_name: row.get(5)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    if items.is_empty() {
        return Err(Error::NotFound(format!("tree definition {}", treedef_id)));
    }
    Ok(items)
}

/// Name of the tree table a definition describes
pub fn tree_table_for_def(conn: &Connection, treedef_id: i64) -> Result<String> {
    conn.query_row(
        "SELECT treetable FROM treedef WHERE treedefid = ?1",
        params![treedef_id],
        |row| row.get(0),
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("tree definition {}", treedef_id)))
}

// ============================================================================
// TREE MAINTENANCE COLLABORATOR
// ============================================================================

pub trait TreeMaintenance {
    /// Recompute nested-interval node numbers for a whole tree table
    fn renumber(&self, conn: &Connection, tree_table: &str) -> Result<()>;

    /// Recompute cached full names; `null_only` limits it to nodes without one
    fn reset_full_names(&self, conn: &Connection, treedef_id: i64, null_only: bool) -> Result<()>;
}

/// Default implementation over the SQLite store.
/// Runs inside the caller's transaction, which already holds the write lock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteTreeMaintenance;

struct Node {
    id: i64,
    parent_id: Option<i64>,
    name: String,
    rank_id: i64,
    full_name: Option<String>,
}

fn load_nodes(conn: &Connection, tree_table: &str, treedef_id: Option<i64>) -> Result<Vec<Node>> {
    let sql = format!(
        "SELECT {0}id, parentid, name, rankid, fullname FROM {0} {1} ORDER BY name, {0}id",
        tree_table,
        if treedef_id.is_some() { "WHERE treedefid = ?1" } else { "" }
    );
    let mut stmt = conn.prepare(&sql)?;
    let map_row = |row: &rusqlite::Row<'_>| {
        Ok(Node {
            id: row.get(0)?,
            parent_id: row.get(1)?,
            name: row.get(2)?,
            rank_id: row.get(3)?,
            full_name: row.get(4)?,
        })
    };
    let nodes = match treedef_id {
        Some(id) => stmt.query_map(params![id], map_row)?.collect::<std::result::Result<Vec<_>, _>>()?,
        None => stmt.query_map([], map_row)?.collect::<std::result::Result<Vec<_>, _>>()?,
    };
    Ok(nodes)
}

impl TreeMaintenance for SqliteTreeMaintenance {
    fn renumber(&self, conn: &Connection, tree_table: &str) -> Result<()> {
        let nodes = load_nodes(conn, tree_table, None)?;

        let mut children: HashMap<Option<i64>, Vec<i64>> = HashMap::new();
        for node in &nodes {
            children.entry(node.parent_id).or_default().push(node.id);
        }

        // Iterative pre-order walk: (id, visited children yet?)
        let mut numbers: HashMap<i64, (i64, i64)> = HashMap::new();
        let mut next = 1;
        let mut stack: Vec<(i64, bool)> = children
            .get(&None)
            .map(|roots| roots.iter().rev().map(|id| (*id, false)).collect())
            .unwrap_or_default();

        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                let highest = children
                    .get(&Some(id))
                    .and_then(|kids| kids.iter().filter_map(|k| numbers.get(k)).map(|n| n.1).max())
                    .unwrap_or(numbers[&id].0);
                numbers.entry(id).and_modify(|n| n.1 = highest);
                continue;
            }
            numbers.insert(id, (next, next));
            next += 1;
            stack.push((id, true));
            if let Some(kids) = children.get(&Some(id)) {
                stack.extend(kids.iter().rev().map(|k| (*k, false)));
            }
        }

        let mut update = conn.prepare(&format!(
            "UPDATE {0} SET nodenumber = ?1, highestchildnodenumber = ?2 WHERE {0}id = ?3",
            tree_table
        ))?;
        for (id, (number, highest)) in &numbers {
            update.execute(params![number, highest, id])?;
        }

        debug!(tree_table, nodes = numbers.len(), "renumbered tree");
        Ok(())
    }

    fn reset_full_names(&self, conn: &Connection, treedef_id: i64, null_only: bool) -> Result<()> {
        let tree_table = tree_table_for_def(conn, treedef_id)?;
        let (separator, direction): (String, i64) = conn.query_row(
            "SELECT fullnameseparator, fullnamedirection FROM treedef WHERE treedefid = ?1",
            params![treedef_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let in_full_name: Vec<i64> = load_tree_def_items(conn, treedef_id)?
            .into_iter()
            .filter(|item| item.is_in_full_name)
            .map(|item| item.rank_id)
            .collect();

        let nodes = load_nodes(conn, &tree_table, Some(treedef_id))?;
        let by_id: HashMap<i64, &Node> = nodes.iter().map(|n| (n.id, n)).collect();

        let mut update = conn.prepare(&format!(
            "UPDATE {0} SET fullname = ?1 WHERE {0}id = ?2",
            tree_table
        ))?;
        let mut updated = 0;
        for node in nodes.iter().filter(|n| !null_only || n.full_name.is_none()) {
            // Walk up to the root, keeping names of ranks that belong in the full name
            let mut parts = Vec::new();
            let mut current = Some(node);
            while let Some(n) = current {
                if in_full_name.contains(&n.rank_id) {
                    parts.push(n.name.as_str());
                }
                current = n.parent_id.and_then(|p| by_id.get(&p).copied());
            }
            if direction >= 0 {
                parts.reverse();
            }
            let full_name = if parts.is_empty() {
                node.name.clone()
            } else {
                parts.join(&separator)
            };
            update.execute(params![full_name, node.id])?;
            updated += 1;
        }

        debug!(treedef_id, updated, "reset full names");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;

    #[test]
    fn test_load_tree_def_items_ordered() {
        let fx = Fixture::new();
        let items = load_tree_def_items(&fx.conn, fx.collection.geography_treedef_id).unwrap();

        let names: Vec<&str> = items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["Earth", "Country", "State", "County", "City"]);
        assert!(load_tree_def_items(&fx.conn, 999).is_err());
    }

    #[test]
    fn test_renumber_nests_intervals() {
        let fx = Fixture::new();
        SqliteTreeMaintenance.renumber(&fx.conn, "geography").unwrap();

        let interval = |name: &str| -> (i64, i64) {
            fx.conn
                .query_row(
                    "SELECT nodenumber, highestchildnodenumber FROM geography WHERE name = ?1 ORDER BY geographyid LIMIT 1",
                    params![name],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .unwrap()
        };

        let earth = interval("Earth");
        let missouri = interval("Missouri");
        let greene = interval("Greene");

        assert_eq!(earth.0, 1);
        assert!(missouri.0 > earth.0 && missouri.1 <= earth.1);
        assert!(greene.0 > missouri.0 && greene.1 <= missouri.1);
        // Every node numbered
        let unnumbered: i64 = fx
            .conn
            .query_row("SELECT COUNT(*) FROM geography WHERE nodenumber IS NULL", [], |r| r.get(0))
            .unwrap();
        assert_eq!(unnumbered, 0);
    }

    #[test]
    fn test_reset_full_names() {
        let fx = Fixture::new();
        SqliteTreeMaintenance
            .reset_full_names(&fx.conn, fx.collection.geography_treedef_id, false)
            .unwrap();

        let full_name: String = fx
            .conn
            .query_row(
                "SELECT fullname FROM geography WHERE geographyid = ?1",
                params![fx.geo["Springfield, MO"]],
                |row| row.get(0),
            )
            .unwrap();
        // State and City are flagged "in full name" in the fixture
        assert_eq!(full_name, "Missouri, Springfield");
    }
}
