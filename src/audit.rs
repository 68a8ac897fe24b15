// 🧾 Audit collaborator - "Every change is an event"
// Uploads and unuploads record one event per touched record. A remove
// event points back at the insert event it undoes.

use crate::db::{find_insert_event, insert_event, Event};
use crate::error::Result;
use crate::schema::Record;
use rusqlite::Connection;

pub trait Auditor {
    fn insert(&self, conn: &Connection, table: &str, id: i64, actor_id: i64, fields: &Record) -> Result<()>;

    fn update(&self, conn: &Connection, table: &str, id: i64, actor_id: i64, changed: &Record) -> Result<()>;

    fn remove(&self, conn: &Connection, table: &str, id: i64, actor_id: i64) -> Result<()>;
}

/// Writes events to the `spauditlog` table of the same store
#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteAuditor;

impl Auditor for SqliteAuditor {
    fn insert(&self, conn: &Connection, table: &str, id: i64, actor_id: i64, fields: &Record) -> Result<()> {
        let event = Event::new("insert", table, id, serde_json::to_value(fields)?, actor_id);
        insert_event(conn, &event)
    }

    fn update(&self, conn: &Connection, table: &str, id: i64, actor_id: i64, changed: &Record) -> Result<()> {
        let event = Event::new("update", table, id, serde_json::to_value(changed)?, actor_id);
        insert_event(conn, &event)
    }

    fn remove(&self, conn: &Connection, table: &str, id: i64, actor_id: i64) -> Result<()> {
        let parent = find_insert_event(conn, table, id)?;
        let event = Event::new("remove", table, id, serde_json::json!({}), actor_id).with_parent(parent);
        insert_event(conn, &event)
    }
}
