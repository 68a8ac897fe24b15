// 📋 Picklists - controlled vocabularies attached to fields
// Read-only lists reject unknown values; writable lists grow as new values
// are uploaded, and those additions are remembered so they can be undone.

use crate::error::Result;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PicklistItem {
    pub id: i64,
    pub title: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Picklist {
    pub id: i64,
    pub name: String,
    pub table_name: String,
    pub field_name: String,
    pub read_only: bool,
    pub items: Vec<PicklistItem>,
}

impl Picklist {
    /// Case-insensitive lookup by title or value
    pub fn find(&self, raw: &str) -> Option<&PicklistItem> {
        let needle = raw.trim().to_lowercase();
        self.items
            .iter()
            .find(|item| item.value.to_lowercase() == needle || item.title.to_lowercase() == needle)
    }
}

/// All picklists of a collection, with their items
pub fn load_picklists(conn: &Connection, collection_id: i64) -> Result<Vec<Picklist>> {
    let mut stmt = conn.prepare(
        "SELECT picklistid, name, tablename, fieldname, readonly
         FROM picklist WHERE collectionid = ?1 ORDER BY picklistid",
    )?;
    let mut picklists = stmt
        .query_map(params![collection_id], |row| {
            Ok(Picklist {
                id: row.get(0)?,
                name: row.get(1)?,
                table_name: row.get::<_, String>(2)?.to_lowercase(),
                field_name: row.get::<_, String>(3)?.to_lowercase(),
                read_only: row.get(4)?,
                items: Vec::new(),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut item_stmt = conn.prepare(
        "SELECT picklistitemid, title, value FROM picklistitem
         WHERE picklistid = ?1 ORDER BY ordinal, picklistitemid",
    )?;
    for picklist in &mut picklists {
        picklist.items = item_stmt
            .query_map(params![picklist.id], |row| {
                Ok(PicklistItem {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    value: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
    }

    Ok(picklists)
}

// ============================================================================
// PICKLIST SERVICE COLLABORATOR
// ============================================================================

pub trait PicklistService {
    /// Existing item with this value, ignoring case
    fn find_item(&self, conn: &Connection, picklist_id: i64, value: &str) -> Result<Option<PicklistItem>>;

    fn add_item(&self, conn: &Connection, picklist_id: i64, value: &str) -> Result<i64>;

    fn remove_item(&self, conn: &Connection, item_id: i64) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SqlitePicklistService;

impl PicklistService for SqlitePicklistService {
    fn find_item(&self, conn: &Connection, picklist_id: i64, value: &str) -> Result<Option<PicklistItem>> {
        let item = conn
            .query_row(
                "SELECT picklistitemid, title, value FROM picklistitem
                 WHERE picklistid = ?1 AND value = ?2 COLLATE NOCASE
                 ORDER BY picklistitemid LIMIT 1",
                params![picklist_id, value],
                |row| {
                    Ok(PicklistItem {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        value: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(item)
    }

    fn add_item(&self, conn: &Connection, picklist_id: i64, value: &str) -> Result<i64> {
        conn.execute(
            "INSERT INTO picklistitem (picklistid, title, value, ordinal)
             VALUES (?1, ?2, ?2,
                (SELECT COALESCE(MAX(ordinal), 0) + 1 FROM picklistitem WHERE picklistid = ?1))",
            params![picklist_id, value],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn remove_item(&self, conn: &Connection, item_id: i64) -> Result<()> {
        conn.execute(
            "DELETE FROM picklistitem WHERE picklistitemid = ?1",
            params![item_id],
        )?;
        Ok(())
    }
}
