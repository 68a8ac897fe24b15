// ↩️ Unuploader - deletes what an upload created
//
// Works from the stored result trees only. Rows are undone last-first.
// Inside a row a record is deleted once nothing created by that row still
// refers to it; among the records that are free, the structural order
// (to-many children, the record, then its to-one parents) decides. Picklist
// items added by the upload go last.

use super::context::Collaborators;
use super::results::{PicklistAddition, RecordResult, UploadResult};
use crate::db::delete_record;
use crate::error::{Error, Result};
use crate::rules::RuleAction;
use crate::schema::{Datamodel, Record};
use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

/// (table, id) of a record
type Key = (String, i64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnuploadSummary {
    pub deleted: usize,
    pub picklist_items_removed: usize,
}

pub struct Unuploader<'a> {
    pub datamodel: &'a Datamodel,
    pub collaborators: Collaborators<'a>,
    /// Agent credited with the removals
    pub agent_id: i64,
}

impl Unuploader<'_> {
    /// Undo `results` (one per row, as the upload returned them) in one transaction
    pub fn unupload(&self, conn: &mut Connection, results: &[UploadResult]) -> Result<UnuploadSummary> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut summary = UnuploadSummary::default();
        let mut trees = BTreeSet::new();
        let mut additions: Vec<PicklistAddition> = Vec::new();

        for (index, result) in results.iter().enumerate().rev() {
            // Failed rows were rolled back when they were uploaded
            if result.contains_failure() {
                debug!(row = index, "skipping failed row");
                continue;
            }
            for (table, id) in deletion_order(result) {
                self.delete(&tx, &table, id)?;
                summary.deleted += 1;
                if self.datamodel.table(&table).map_or(false, |t| t.is_tree) {
                    trees.insert(table);
                }
            }
            for uploaded in result.uploaded() {
                additions.extend(uploaded.picklist_additions.iter().cloned());
            }
        }

        for addition in additions.iter().rev() {
            self.collaborators.picklists.remove_item(&tx, addition.id)?;
            self.collaborators
                .auditor
                .remove(&tx, "picklistitem", addition.id, self.agent_id)?;
            debug!(picklist = %addition.name, value = %addition.value, "removed picklist item");
            summary.picklist_items_removed += 1;
        }

        for tree in &trees {
            self.collaborators.trees.renumber(&tx, tree)?;
        }

        tx.commit()?;
        info!(
            rows = results.len(),
            deleted = summary.deleted,
            picklist_items = summary.picklist_items_removed,
            "unupload finished"
        );
        Ok(summary)
    }

    fn delete(&self, conn: &Connection, table_name: &str, id: i64) -> Result<()> {
        let table = self
            .datamodel
            .table(table_name)
            .ok_or_else(|| Error::NotFound(format!("table {}", table_name)))?;
        self.collaborators
            .rules
            .check(conn, table, RuleAction::Delete, Some(id), &Record::new())?;
        self.collaborators.auditor.remove(conn, table.name, id, self.agent_id)?;
        if delete_record(conn, table, id)? == 0 {
            warn!(table = table.name, id, "record already gone");
        } else {
            debug!(table = table.name, id, "deleted record");
        }
        Ok(())
    }
}

// ============================================================================
// DELETION ORDER
// ============================================================================

fn key_of(result: &UploadResult) -> Option<Key> {
    let id = result.get_id()?;
    let info = result.record_result.info()?;
    Some((info.table_name.clone(), id))
}

/// Created records of one row in structural deletion order
fn structural_order(result: &UploadResult, out: &mut Vec<Key>) {
    for children in result.to_many.values() {
        for child in children.iter().rev() {
            structural_order(child, out);
        }
    }
    if let RecordResult::Uploaded(u) = &result.record_result {
        let key = (u.info.table_name.clone(), u.id);
        if !out.contains(&key) {
            out.push(key);
        }
    }
    for child in result.to_one.values() {
        structural_order(child, out);
    }
}

/// Who holds a foreign key to whom: a record refers to its to-one targets,
/// and to-many entries refer to their parent
fn collect_references(result: &UploadResult, refs: &mut BTreeSet<(Key, Key)>) {
    let me = key_of(result);
    for child in result.to_one.values() {
        if let (Some(from), Some(to)) = (me.clone(), key_of(child)) {
            refs.insert((from, to));
        }
        collect_references(child, refs);
    }
    for child in result.to_many.values().flatten() {
        if let (Some(from), Some(to)) = (key_of(child), me.clone()) {
            refs.insert((from, to));
        }
        collect_references(child, refs);
    }
}

/// Topological order over the records a row created: a record comes after
/// every created record referring to it. Ties go to structural order.
fn deletion_order(result: &UploadResult) -> Vec<Key> {
    let mut structural = Vec::new();
    structural_order(result, &mut structural);
    let created: HashSet<&Key> = structural.iter().collect();

    let mut refs = BTreeSet::new();
    collect_references(result, &mut refs);
    let refs: Vec<(Key, Key)> = refs
        .into_iter()
        .filter(|(from, to)| from != to && created.contains(from) && created.contains(to))
        .collect();

    let mut referrers: HashMap<&Key, usize> = structural.iter().map(|k| (k, 0)).collect();
    let mut targets: BTreeMap<&Key, Vec<&Key>> = BTreeMap::new();
    for (from, to) in &refs {
        if let Some(count) = referrers.get_mut(to) {
            *count += 1;
        }
        targets.entry(from).or_default().push(to);
    }

    let mut order = Vec::with_capacity(structural.len());
    let mut done: HashSet<&Key> = HashSet::new();
    while order.len() < structural.len() {
        let next = structural
            .iter()
            .find(|k| !done.contains(k) && referrers.get(k).copied().unwrap_or(0) == 0)
            // A reference cycle cannot come out of an upload; fall back to structure
            .or_else(|| structural.iter().find(|k| !done.contains(k)));
        let Some(next) = next else { break };
        done.insert(next);
        for to in targets.get(next).into_iter().flatten() {
            if let Some(count) = referrers.get_mut(to) {
                *count = count.saturating_sub(1);
            }
        }
        order.push(next.clone());
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::count_records;
    use crate::testing::{row, Fixture};
    use crate::upload::batch::UploadOptions;
    use crate::upload::results::{Matched, ReportInfo, Uploaded};

    const FULL_PLAN: &str = r#"{"baseTableName": "collectionobject", "uploadable": {"uploadTable": {
        "wbcols": {"catalognumber": "Catalog #"},
        "toOne": {
            "cataloger": {"uploadTable": {"wbcols": {"lastname": "Cataloger"}, "static": {"agenttype": 1}}},
            "collectionobjectattribute": {"uploadTable": {"wbcols": {"text1": "Habitat"}}},
            "collectingevent": {"uploadTable": {
                "wbcols": {"startdate": "Date", "method": "Method"},
                "toOne": {"locality": {"uploadTable": {
                    "wbcols": {"localityname": "Locality"},
                    "toOne": {"geography": {"treeRecord": {"ranks": {"State": "State", "City": "City"}}}}
                }}},
                "toMany": {"collectors": [{"uploadTable": {
                    "toOne": {"agent": {"uploadTable": {"wbcols": {"lastname": "Collector"}, "static": {"agenttype": 1}}}}
                }}]}
            }}
        },
        "toMany": {"determinations": [{"uploadTable": {
            "wbcols": {"remarks": "Det Remarks"},
            "toOne": {"taxon": {"treeRecord": {"ranks": {"Genus": "Genus", "Species": "Species"}}}}
        }}]}
    }}}"#;

    fn counts(fx: &Fixture) -> Vec<(&'static str, i64)> {
        let mut counts: Vec<(&'static str, i64)> = fx
            .datamodel
            .tables()
            .iter()
            .map(|t| (t.name, count_records(&fx.conn, t).unwrap()))
            .collect();
        counts.push(("picklistitem", fx.count("picklistitem")));
        counts
    }

    fn uploaded(table: &str, id: i64) -> UploadResult {
        UploadResult::new(RecordResult::Uploaded(Uploaded {
            id,
            info: ReportInfo {
                table_name: table.to_string(),
                columns: vec![],
                tree_info: None,
            },
            picklist_additions: vec![],
        }))
    }

    #[test]
    fn test_round_trip_restores_store() {
        let mut fx = Fixture::new();
        let before = counts(&fx);

        let outcome = fx.upload(
            FULL_PLAN,
            &[row(&[
                ("Catalog #", "2024-001"),
                ("Cataloger", "Bates"),
                ("Collector", "Bates"),
                ("Habitat", "Cloud forest"),
                ("Date", "03/14/1859"),
                ("Method", "Sweep"),
                ("Locality", "Table Rock Lake"),
                ("State", "Missouri"),
                ("City", "Branson"),
                ("Genus", "Quercus"),
                ("Species", "alba"),
                ("Det Remarks", "keyed out"),
            ])],
            UploadOptions::default(),
        );
        assert!(outcome.success(), "{:?}", outcome.results);
        assert!(outcome.committed);
        assert_ne!(counts(&fx), before);

        // The collector's agent is the cataloger, created once
        let result = &outcome.results[0];
        let cataloger = result.to_one["cataloger"].get_id();
        let collector = &result.to_one["collectingevent"].to_many["collectors"][0];
        assert_eq!(collector.to_one["agent"].get_id(), cataloger);
        assert!(matches!(collector.to_one["agent"].record_result, RecordResult::Matched(_)));

        let summary = fx.unupload(&outcome.results);
        assert_eq!(summary.picklist_items_removed, 1);
        assert_eq!(counts(&fx), before);

        // Every insert made by the upload is paired with a remove by the same agent
        let unpaired: i64 = fx
            .conn
            .query_row(
                "SELECT COUNT(*) FROM spauditlog i
                 WHERE i.action = 'insert' AND NOT EXISTS (
                    SELECT 1 FROM spauditlog r
                    WHERE r.action = 'remove' AND r.parenteventid = i.event_id AND r.actorid = i.actorid)",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(unpaired, 0);
    }

    #[test]
    fn test_rows_undone_in_reverse() {
        let mut fx = Fixture::new();
        let plan = r#"{"baseTableName": "collectionobject", "uploadable": {"uploadTable": {
            "wbcols": {"catalognumber": "Catalog #"},
            "toOne": {"cataloger": {"uploadTable": {"wbcols": {"lastname": "Cataloger"}, "static": {"agenttype": 1}}}}
        }}}"#;
        let before = counts(&fx);
        let outcome = fx.upload(
            plan,
            &[
                row(&[("Catalog #", "1"), ("Cataloger", "Bates")]),
                row(&[("Catalog #", "2"), ("Cataloger", "Bates")]),
            ],
            UploadOptions::default(),
        );
        assert!(outcome.success());

        let summary = fx.unupload(&outcome.results);
        assert_eq!(summary.deleted, 3);
        assert_eq!(counts(&fx), before);
    }

    #[test]
    fn test_shared_record_deleted_after_all_referrers() {
        // collectionobject 1 → cataloger agent 5, collectingevent 2 → collector 3 → agent 5
        let mut collector = uploaded("collector", 3);
        collector.to_one.insert(
            "agent".to_string(),
            UploadResult::new(RecordResult::Matched(Matched {
                id: 5,
                info: ReportInfo {
                    table_name: "agent".to_string(),
                    columns: vec![],
                    tree_info: None,
                },
            })),
        );
        let event = uploaded("collectingevent", 2).with_to_many(BTreeMap::from([("collectors".to_string(), vec![collector])]));
        let root = uploaded("collectionobject", 1).with_to_one(BTreeMap::from([
            ("cataloger".to_string(), uploaded("agent", 5)),
            ("collectingevent".to_string(), event),
        ]));

        let order = deletion_order(&root);
        let position = |table: &str| order.iter().position(|(t, _)| t == table).unwrap();
        assert_eq!(order.len(), 4);
        assert!(position("collectionobject") < position("collectingevent"));
        assert!(position("collector") < position("collectingevent"));
        assert!(position("collector") < position("agent"));
        assert!(position("collectionobject") < position("agent"));
    }

    #[test]
    fn test_failed_rows_skipped() {
        let mut fx = Fixture::new();
        let plan = r#"{"baseTableName": "collectionobject", "uploadable": {"uploadTable": {
            "wbcols": {"catalognumber": "Catalog #"}
        }}}"#;
        let outcome = fx.upload(
            plan,
            &[row(&[("Catalog #", "1")]), row(&[("Catalog #", "1")])],
            UploadOptions {
                no_commit: false,
                allow_partial: true,
            },
        );
        assert!(outcome.results[1].contains_failure());

        let summary = fx.unupload(&outcome.results);
        assert_eq!(summary.deleted, 1);
        assert_eq!(fx.count("collectionobject"), 0);
    }

    #[test]
    fn test_refuses_to_orphan_tree_nodes() {
        let mut fx = Fixture::new();
        let plan = r#"{"baseTableName": "geography", "uploadable": {"treeRecord": {"ranks": {"State": "State", "City": "City"}}}}"#;
        let outcome = fx.upload(plan, &[row(&[("State", "Kansas"), ("City", "Wichita")])], UploadOptions::default());
        let wichita = outcome.results[0].get_id().unwrap();
        let kansas = outcome.results[0].to_one["parent"].get_id().unwrap();

        // Someone else hangs a node under Kansas afterwards
        fx.conn
            .execute(
                "INSERT INTO geography (name, rankid, treedefid, parentid, isaccepted) VALUES ('Topeka', 500, ?1, ?2, 1)",
                rusqlite::params![fx.collection.geography_treedef_id, kansas],
            )
            .unwrap();

        let geography = fx.datamodel.table("geography").unwrap();
        let unuploader = Unuploader {
            datamodel: &fx.datamodel,
            collaborators: Collaborators {
                rules: &fx.rules,
                auditor: &fx.auditor,
                picklists: &fx.picklists,
                trees: &fx.trees,
            },
            agent_id: fx.agent_id,
        };
        let err = unuploader.unupload(&mut fx.conn, &outcome.results).unwrap_err();
        assert!(matches!(err, Error::BusinessRule(_)));
        // Nothing was deleted
        assert!(crate::db::record_exists(&fx.conn, geography, wichita).unwrap());
    }
}
