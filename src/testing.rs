// 🧪 Shared test fixture
//
// One in-memory store seeded with a small institution: a collection with
// geography and taxon trees, two picklists, two prep types and the agent
// that runs the uploads.
//
// Geography:
//   Earth → United States → Missouri → Greene → Springfield
//                         → Illinois → Sangamon → Springfield

use crate::audit::SqliteAuditor;
use crate::config::UploadConfig;
use crate::db::setup_database;
use crate::picklist::SqlitePicklistService;
use crate::rules::RuleEngine;
use crate::schema::Datamodel;
use crate::tree::SqliteTreeMaintenance;
use crate::upload::batch::{BatchOutcome, UploadOptions, Uploader};
use crate::upload::bind::Row;
use crate::upload::context::Collaborators;
use crate::upload::disambiguation::Disambiguation;
use crate::upload::plan::UploadPlan;
use crate::upload::results::UploadResult;
use crate::upload::scoping::CollectionContext;
use crate::upload::unupload::{UnuploadSummary, Unuploader};
use rusqlite::{params, Connection};
use std::collections::HashMap;

pub const COLLECTION_ID: i64 = 4;

pub struct Fixture {
    pub conn: Connection,
    pub datamodel: Datamodel,
    pub collection: CollectionContext,
    pub rules: RuleEngine,
    pub auditor: SqliteAuditor,
    pub picklists: SqlitePicklistService,
    pub trees: SqliteTreeMaintenance,
    pub config: UploadConfig,
    /// The agent credited with uploads
    pub agent_id: i64,
    /// Geography node ids; the two Springfields are "Springfield, MO" / "Springfield, IL"
    pub geo: HashMap<&'static str, i64>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_connection(Connection::open_in_memory().unwrap())
    }

    /// Seed `conn`, e.g. a file database shared with a second connection
    pub fn with_connection(conn: Connection) -> Self {
        let datamodel = Datamodel::collection_domain();
        setup_database(&conn, &datamodel).unwrap();

        conn.execute_batch(
            "INSERT INTO institution (institutionid, name) VALUES (1, 'Natural History Museum');
             INSERT INTO division (divisionid, name, institutionid) VALUES (2, 'Zoology', 1);
             INSERT INTO treedef (treedefid, name, treetable, fullnameseparator)
                VALUES (1, 'Geography', 'geography', ', '), (2, 'Taxonomy', 'taxon', ' ');
             INSERT INTO treedefitem (treedefid, name, rankid, isinfullname) VALUES
                (1, 'Earth', 0, 0), (1, 'Country', 200, 0), (1, 'State', 300, 1),
                (1, 'County', 400, 0), (1, 'City', 500, 1),
                (2, 'Life', 0, 0), (2, 'Kingdom', 10, 0), (2, 'Phylum', 30, 0), (2, 'Class', 60, 0),
                (2, 'Order', 100, 0), (2, 'Family', 140, 0), (2, 'Genus', 180, 1), (2, 'Species', 220, 1);
             INSERT INTO discipline (disciplineid, name, divisionid, geographytreedefid, taxontreedefid)
                VALUES (3, 'Entomology', 2, 1, 2);
             INSERT INTO collection (collectionid, collectionname, disciplineid) VALUES (4, 'Insects', 3);
             INSERT INTO picklist (picklistid, name, tablename, fieldname, readonly, collectionid) VALUES
                (1, 'TypeStatus', 'determination', 'typestatusname', 1, 4),
                (2, 'CollectingMethod', 'collectingevent', 'method', 0, 4);
             INSERT INTO picklistitem (picklistid, title, value, ordinal) VALUES
                (1, 'Holotype', 'Holotype', 1), (1, 'Paratype', 'Paratype', 2), (2, 'Net', 'Net', 1);
             INSERT INTO preptype (name, isloanable, collectionid) VALUES ('Skin', 1, 4), ('Skeleton', 1, 4);
             INSERT INTO agent (agenttype, firstname, lastname, divisionid) VALUES (1, 'Upload', 'Tester', 2);",
        )
        .unwrap();
        let agent_id = conn.last_insert_rowid();

        let mut geo = HashMap::new();
        for (key, name, rank, parent) in [
            ("Earth", "Earth", 0, None),
            ("United States", "United States", 200, Some("Earth")),
            ("Missouri", "Missouri", 300, Some("United States")),
            ("Greene", "Greene", 400, Some("Missouri")),
            ("Springfield, MO", "Springfield", 500, Some("Greene")),
            ("Illinois", "Illinois", 300, Some("United States")),
            ("Sangamon", "Sangamon", 400, Some("Illinois")),
            ("Springfield, IL", "Springfield", 500, Some("Sangamon")),
        ] {
            let parent_id: Option<i64> = parent.map(|p| geo[p]);
            conn.execute(
                "INSERT INTO geography (name, rankid, treedefid, treedefitemid, parentid, isaccepted)
                 VALUES (?1, ?2, 1, (SELECT treedefitemid FROM treedefitem WHERE treedefid = 1 AND rankid = ?2), ?3, 1)",
                params![name, rank, parent_id],
            )
            .unwrap();
            geo.insert(key, conn.last_insert_rowid());
        }

        let collection = CollectionContext::load(&conn, COLLECTION_ID).unwrap();
        Fixture {
            conn,
            datamodel,
            collection,
            rules: RuleEngine::with_defaults(),
            auditor: SqliteAuditor,
            picklists: SqlitePicklistService,
            trees: SqliteTreeMaintenance,
            config: UploadConfig::default(),
            agent_id,
            geo,
        }
    }

    pub fn upload(&mut self, plan: &str, rows: &[Row], options: UploadOptions) -> BatchOutcome {
        self.upload_with(plan, rows, &[], options)
    }

    pub fn upload_with(
        &mut self,
        plan: &str,
        rows: &[Row],
        disambiguations: &[Option<Disambiguation>],
        options: UploadOptions,
    ) -> BatchOutcome {
        let plan = UploadPlan::from_json(plan).unwrap();
        let uploader = Uploader {
            datamodel: &self.datamodel,
            collection: &self.collection,
            collaborators: Collaborators {
                rules: &self.rules,
                auditor: &self.auditor,
                picklists: &self.picklists,
                trees: &self.trees,
            },
            config: &self.config,
            agent_id: self.agent_id,
        };
        uploader
            .run(&mut self.conn, &plan, rows, disambiguations, options)
            .unwrap()
    }

    pub fn unupload(&mut self, results: &[UploadResult]) -> UnuploadSummary {
        let unuploader = Unuploader {
            datamodel: &self.datamodel,
            collaborators: Collaborators {
                rules: &self.rules,
                auditor: &self.auditor,
                picklists: &self.picklists,
                trees: &self.trees,
            },
            agent_id: self.agent_id,
        };
        unuploader.unupload(&mut self.conn, results).unwrap()
    }

    pub fn count(&self, table: &str) -> i64 {
        self.conn
            .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))
            .unwrap()
    }
}

/// A spreadsheet row from (column, cell) pairs
pub fn row(cells: &[(&str, &str)]) -> Row {
    cells
        .iter()
        .map(|(column, value)| (column.to_string(), value.to_string()))
        .collect()
}
