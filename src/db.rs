use crate::error::{Error, Result};
use crate::schema::{Datamodel, FieldValue, Record, Table};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Audit event (every insert/update/remove made by an upload is an event)
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Event {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    /// "insert", "update" or "remove"
    pub action: String,
    pub table_name: String,
    pub record_id: i64,
    pub data: serde_json::Value,
    /// Agent id of the user responsible
    pub actor_id: i64,
    /// For a remove: the insert event it undoes
    pub parent_event_id: Option<String>,
}

impl Event {
    pub fn new(
        action: &str,
        table_name: &str,
        record_id: i64,
        data: serde_json::Value,
        actor_id: i64,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            action: action.to_string(),
            table_name: table_name.to_string(),
            record_id,
            data,
            actor_id,
            parent_event_id: None,
        }
    }

    pub fn with_parent(mut self, parent_event_id: Option<String>) -> Self {
        self.parent_event_id = parent_event_id;
        self
    }
}

/// Open a database file with WAL and foreign keys enabled
pub fn open_database(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    // Enable WAL mode for crash recovery
    conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    setup_database(&conn, &Datamodel::collection_domain())?;
    Ok(conn)
}

pub fn setup_database(conn: &Connection, datamodel: &Datamodel) -> Result<()> {
    conn.pragma_update(None, "foreign_keys", true)?;

    // ==========================================================================
    // Collection hierarchy (scoping context)
    // ==========================================================================
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS institution (
            institutionid INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS division (
            divisionid INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            institutionid INTEGER NOT NULL REFERENCES institution(institutionid)
        );
        CREATE TABLE IF NOT EXISTS treedef (
            treedefid INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            treetable TEXT NOT NULL,
            fullnameseparator TEXT NOT NULL DEFAULT ' ',
            fullnamedirection INTEGER NOT NULL DEFAULT 1
        );
        CREATE TABLE IF NOT EXISTS treedefitem (
            treedefitemid INTEGER PRIMARY KEY AUTOINCREMENT,
            treedefid INTEGER NOT NULL REFERENCES treedef(treedefid),
            name TEXT NOT NULL,
            rankid INTEGER NOT NULL,
            isenforced INTEGER NOT NULL DEFAULT 0,
            isinfullname INTEGER NOT NULL DEFAULT 0,
            UNIQUE (treedefid, rankid)
        );
        CREATE TABLE IF NOT EXISTS discipline (
            disciplineid INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            divisionid INTEGER NOT NULL REFERENCES division(divisionid),
            geographytreedefid INTEGER NOT NULL REFERENCES treedef(treedefid),
            taxontreedefid INTEGER NOT NULL REFERENCES treedef(treedefid)
        );
        CREATE TABLE IF NOT EXISTS collection (
            collectionid INTEGER PRIMARY KEY AUTOINCREMENT,
            collectionname TEXT NOT NULL,
            disciplineid INTEGER NOT NULL REFERENCES discipline(disciplineid),
            isembeddedcollectingevent INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS picklist (
            picklistid INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            tablename TEXT NOT NULL,
            fieldname TEXT NOT NULL,
            readonly INTEGER NOT NULL DEFAULT 0,
            collectionid INTEGER NOT NULL REFERENCES collection(collectionid)
        );
        CREATE TABLE IF NOT EXISTS picklistitem (
            picklistitemid INTEGER PRIMARY KEY AUTOINCREMENT,
            picklistid INTEGER NOT NULL REFERENCES picklist(picklistid),
            title TEXT NOT NULL,
            value TEXT NOT NULL,
            ordinal INTEGER
        );",
    )?;

    // ==========================================================================
    // Uploadable tables, generated from the datamodel
    // ==========================================================================
    for table in datamodel.tables() {
        conn.execute(&create_table_sql(table), [])?;
    }

    // ==========================================================================
    // Audit log (event sourcing) and workbench datasets
    // ==========================================================================
    conn.execute(
        "CREATE TABLE IF NOT EXISTS spauditlog (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            action TEXT NOT NULL,
            tablename TEXT NOT NULL,
            recordid INTEGER NOT NULL,
            data TEXT NOT NULL,
            actorid INTEGER NOT NULL,
            parenteventid TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS spdataset (
            spdatasetid INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            collectionid INTEGER NOT NULL REFERENCES collection(collectionid),
            columns TEXT NOT NULL,
            data TEXT NOT NULL,
            uploadplan TEXT,
            rowdisambiguation TEXT,
            rowresults TEXT,
            uploadresult TEXT,
            created_at DATETIME DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    // ==========================================================================
    // Indexes
    // ==========================================================================
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_auditlog_record ON spauditlog(tablename, recordid)",
        [],
    )?;
    for table in datamodel.tables().iter().filter(|t| t.is_tree) {
        conn.execute(
            &format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_rank_name ON {0}(treedefid, rankid, name)",
                table.name
            ),
            [],
        )?;
    }

    Ok(())
}

fn create_table_sql(table: &Table) -> String {
    let mut columns = vec![format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", table.id_field)];
    for field in table.fields {
        columns.push(format!("{} {}", field.name, field.field_type.sql_type()));
    }
    for rel in table.relationships.iter().filter(|r| r.is_to_one()) {
        columns.push(format!(
            "{} INTEGER REFERENCES {}({}id)",
            rel.column, rel.related, rel.related
        ));
    }
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
        table.name,
        columns.join(",\n    ")
    )
}

// ==========================================================================
// Record helpers
// ==========================================================================

/// Insert a typed record and return its new id
pub fn insert_record(conn: &Connection, table: &Table, record: &Record) -> Result<i64> {
    if let Some(bad) = record.keys().find(|c| !table.has_column(c)) {
        return Err(Error::Plan(format!("{} has no column {}", table.name, bad)));
    }

    let sql = if record.is_empty() {
        format!("INSERT INTO {} DEFAULT VALUES", table.name)
    } else {
        let columns: Vec<&str> = record.keys().map(|c| c.as_str()).collect();
        let placeholders = vec!["?"; columns.len()].join(", ");
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table.name,
            columns.join(", "),
            placeholders
        )
    };
    conn.execute(&sql, params_from_iter(record.values()))?;
    Ok(conn.last_insert_rowid())
}

/// Delete a record by id, returning the number of rows removed
pub fn delete_record(conn: &Connection, table: &Table, id: i64) -> Result<usize> {
    let deleted = conn.execute(
        &format!("DELETE FROM {} WHERE {} = ?1", table.name, table.id_field),
        params![id],
    )?;
    Ok(deleted)
}

pub fn record_exists(conn: &Connection, table: &Table, id: i64) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            &format!("SELECT 1 FROM {} WHERE {} = ?1", table.name, table.id_field),
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Read a single column of one record
pub fn read_column(conn: &Connection, table: &Table, id: i64, column: &str) -> Result<FieldValue> {
    if !table.has_column(column) {
        return Err(Error::Plan(format!("{} has no column {}", table.name, column)));
    }
    let value = conn
        .query_row(
            &format!(
                "SELECT {} FROM {} WHERE {} = ?1",
                column, table.name, table.id_field
            ),
            params![id],
            |row| row.get::<_, FieldValue>(0),
        )
        .optional()?;
    value.ok_or_else(|| Error::NotFound(format!("{} {}", table.name, id)))
}

pub fn count_records(conn: &Connection, table: &Table) -> Result<i64> {
    let count: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", table.name),
        [],
        |row| row.get(0),
    )?;

    Ok(count)
}

// ==========================================================================
// Audit log
// ==========================================================================

/// Insert event into audit trail
pub fn insert_event(conn: &Connection, event: &Event) -> Result<()> {
    let data_json = serde_json::to_string(&event.data)?;

    conn.execute(
        "INSERT INTO spauditlog (
            event_id, timestamp, action, tablename, recordid, data, actorid, parenteventid
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            event.event_id,
            event.timestamp.to_rfc3339(),
            event.action,
            event.table_name,
            event.record_id,
            data_json,
            event.actor_id,
            event.parent_event_id,
        ],
    )?;

    Ok(())
}

/// Get events for a specific record, oldest first
pub fn get_events_for_record(
    conn: &Connection,
    table_name: &str,
    record_id: i64,
) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(
        "SELECT event_id, timestamp, action, tablename, recordid, data, actorid, parenteventid
         FROM spauditlog
         WHERE tablename = ?1 AND recordid = ?2
         ORDER BY id ASC",
    )?;

    let events = stmt
        .query_map(params![table_name, record_id], |row| {
            let timestamp_str: String = row.get(1)?;
            let data_json: String = row.get(5)?;

            Ok(Event {
                event_id: row.get(0)?,
                timestamp: DateTime::parse_from_rfc3339(&timestamp_str)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?
                    .with_timezone(&Utc),
                action: row.get(2)?,
                table_name: row.get(3)?,
                record_id: row.get(4)?,
                data: serde_json::from_str(&data_json)
                    .map_err(|_| rusqlite::Error::InvalidQuery)?,
                actor_id: row.get(6)?,
                parent_event_id: row.get(7)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(events)
}

/// Latest insert event for a record, if the record was created by an upload
pub fn find_insert_event(conn: &Connection, table_name: &str, record_id: i64) -> Result<Option<String>> {
    let event_id = conn
        .query_row(
            "SELECT event_id FROM spauditlog
             WHERE tablename = ?1 AND recordid = ?2 AND action = 'insert'
             ORDER BY id DESC LIMIT 1",
            params![table_name, record_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(event_id)
}
