// 🌲 Tree Matcher - rank-ordered matching and creation for tree tables
//
// Ranks are tried deepest first. A rank matches when a node with that
// name/rank exists whose ancestors also match every shallower supplied
// rank. The first hit becomes the parent of the ranks below it, which are
// created top-down. Nothing matched: the new chain hangs off the tree's
// root (a placeholder root "Uploaded" is made if the tree has none).

use super::bind::{BoundRank, BoundTreeRecord};
use super::context::{Mode, UploadContext};
use super::results::{
    FailedBusinessRule, Matched, MatchedMultiple, NoMatch, NullRecord, RecordResult, ReportInfo, TreeInfo,
    UploadResult, Uploaded,
};
use crate::db::{read_column, record_exists};
use crate::error::{Error, Result};
use crate::parser::ParseResult;
use crate::rules::RuleAction;
use crate::schema::{FieldValue, Record, Table};
use crate::tree::TreeDefItem;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

/// Name given to a synthesized root node
pub const PLACEHOLDER_NAME: &str = "Uploaded";

impl BoundRank<'_> {
    fn item(&self) -> &TreeDefItem {
        &self.scoped.item
    }

    /// Name is always matched on, whatever its match behavior says
    fn filters(&self) -> Record {
        let mut filters = Record::new();
        for parsed in &self.parsed {
            filters.extend(parsed.filter_on.clone());
        }
        filters.insert("name".to_string(), FieldValue::Text(self.name.clone()));
        filters
    }

    fn info(&self, table: &Table) -> ReportInfo {
        ReportInfo {
            table_name: table.name.to_string(),
            columns: self.scoped.columns.iter().map(|c| c.column().to_string()).collect(),
            tree_info: Some(TreeInfo {
                rank: self.item().name.clone(),
                name: self.name.clone(),
            }),
        }
    }
}

impl BoundTreeRecord<'_> {
    fn table(&self) -> &'static Table {
        self.scoped.table
    }

    pub fn info(&self) -> ReportInfo {
        match self.ranks.last() {
            Some(rank) => rank.info(self.table()),
            None => ReportInfo {
                table_name: self.table().name.to_string(),
                columns: self
                    .scoped
                    .ranks
                    .iter()
                    .flat_map(|r| r.columns.iter().map(|c| c.column().to_string()))
                    .collect(),
                tree_info: None,
            },
        }
    }

    pub fn process_row(&self, ctx: &mut UploadContext, mode: Mode) -> Result<UploadResult> {
        let table = self.table();
        let info = self.info();
        if self.ranks.is_empty() {
            return Ok(UploadResult::new(RecordResult::NullRecord(NullRecord { info })));
        }

        if let Some(id) = self.disambiguation.disambiguate() {
            if record_exists(ctx.conn, table, id)? {
                return Ok(UploadResult::new(RecordResult::Matched(Matched { id, info })));
            }
        }

        let mut matched: Option<(usize, i64)> = None;
        for k in (0..self.ranks.len()).rev() {
            let rank = &self.ranks[k];
            if let Some(id) = self.disambiguation.tree_rank(&rank.item().name).disambiguate() {
                if record_exists(ctx.conn, table, id)? {
                    matched = Some((k, id));
                    break;
                }
            }
            let (key, ids) = self.match_prefix(ctx, k)?;
            match ids.as_slice() {
                [] => continue,
                [id] => {
                    matched = Some((k, *id));
                    break;
                }
                _ => {
                    debug!(tree = table.name, rank = %rank.item().name, candidates = ids.len(), "ambiguous tree match");
                    return Ok(UploadResult::new(RecordResult::MatchedMultiple(MatchedMultiple {
                        ids,
                        key,
                        info: rank.info(table),
                    })));
                }
            }
        }

        let (start, parent) = match matched {
            Some((k, id)) if k + 1 == self.ranks.len() => {
                debug!(tree = table.name, id, "matched tree node");
                return Ok(UploadResult::new(RecordResult::Matched(Matched { id, info })));
            }
            Some((k, id)) => (k + 1, Some(id)),
            None => (0, None),
        };

        if mode == Mode::MatchOnly || self.scoped.must_match {
            return Ok(UploadResult::new(RecordResult::NoMatch(NoMatch { info })));
        }
        self.upload_ranks(ctx, start, parent, info)
    }

    // ========================================================================
    // MATCHING
    // ========================================================================

    /// Nodes matching rank `k` whose lineage matches ranks `0..k`
    fn match_prefix(&self, ctx: &mut UploadContext, k: usize) -> Result<(String, Vec<i64>)> {
        let prefix = &self.ranks[..=k];
        let key = serde_json::to_string(&serde_json::json!({
            "tree": self.table().name,
            "treedef": self.scoped.treedef_id,
            "ranks": prefix
                .iter()
                .map(|r| serde_json::json!({"rankId": r.item().rank_id, "filters": r.filters()}))
                .collect::<Vec<_>>(),
        }))?;
        let table = self.table();
        let treedef_id = self.scoped.treedef_id;
        let window = ctx.config.match_window;
        let ids = ctx.cached_query(table.name, &key, |conn| {
            lineage_matches(conn, table, treedef_id, prefix, window)
        })?;
        Ok((key, ids))
    }

    // ========================================================================
    // CREATION
    // ========================================================================

    fn upload_ranks(
        &self,
        ctx: &mut UploadContext,
        start: usize,
        matched_parent: Option<i64>,
        info: ReportInfo,
    ) -> Result<UploadResult> {
        let table = self.table();
        let items = &self.scoped.items;
        let to_upload = &self.ranks[start..];
        let root_item = items
            .first()
            .ok_or_else(|| Error::NotFound(format!("ranks of tree {}", self.scoped.treedef_id)))?;
        let uploads_root = to_upload
            .first()
            .map_or(false, |r| r.item().rank_id == root_item.rank_id);

        // Where the new chain attaches, and whether a placeholder root is needed
        let (parent, needs_placeholder) = match matched_parent {
            Some(id) => (Some(id), false),
            None if uploads_root => (None, false),
            None => match root_node(ctx.conn, table, self.scoped.treedef_id)? {
                Some(id) => (Some(id), false),
                None => (None, true),
            },
        };

        let parent_rank = match parent {
            Some(id) => read_column(ctx.conn, table, id, "rankid")?.as_i64(),
            None if needs_placeholder => Some(root_item.rank_id),
            None => None,
        };
        let missing = skipped_enforced_ranks(items, parent_rank, to_upload);
        if !missing.is_empty() {
            debug!(tree = table.name, ?missing, "enforced rank skipped");
            return Ok(UploadResult::new(RecordResult::FailedBusinessRule(FailedBusinessRule {
                message: "missingRequiredTreeParent".to_string(),
                payload: serde_json::json!({ "names": missing }),
                info,
            })));
        }

        let mut chain: Option<UploadResult> = None;
        let mut parent_id = parent;
        if needs_placeholder {
            let placeholder = self.create_node(ctx, root_item, PLACEHOLDER_NAME, &[], Vec::new(), None)?;
            match placeholder.get_id() {
                Some(id) => parent_id = Some(id),
                None => return Ok(placeholder),
            }
            chain = Some(placeholder);
        }

        for rank in to_upload {
            let columns = rank.scoped.columns.iter().map(|c| c.column().to_string()).collect();
            let mut result = self.create_node(ctx, rank.item(), &rank.name, &rank.parsed, columns, parent_id)?;
            if let Some(above) = chain.take() {
                result.to_one = BTreeMap::from([("parent".to_string(), above)]);
            }
            match result.get_id() {
                Some(id) => parent_id = Some(id),
                None => return Ok(result),
            }
            chain = Some(result);
        }

        chain.ok_or_else(|| Error::InvalidInput(format!("no {} ranks to upload", table.name)))
    }

    fn create_node(
        &self,
        ctx: &mut UploadContext,
        item: &TreeDefItem,
        name: &str,
        parsed: &[ParseResult],
        columns: Vec<String>,
        parent: Option<i64>,
    ) -> Result<UploadResult> {
        let table = self.table();
        let mut record = Record::new();
        for p in parsed {
            record.extend(p.upload.clone());
        }
        record.insert("name".to_string(), FieldValue::Text(name.to_string()));
        record.insert("rankid".to_string(), FieldValue::Integer(item.rank_id));
        record.insert("treedefid".to_string(), FieldValue::Integer(item.treedef_id));
        record.insert("treedefitemid".to_string(), FieldValue::Integer(item.id));
        record.insert("parentid".to_string(), FieldValue::from(parent));
        record.insert("isaccepted".to_string(), FieldValue::Boolean(true));

        let info = ReportInfo {
            table_name: table.name.to_string(),
            columns,
            tree_info: Some(TreeInfo {
                rank: item.name.clone(),
                name: name.to_string(),
            }),
        };

        if let Some(e) = ctx.check_rules(table, RuleAction::Insert, None, &record)? {
            return Ok(UploadResult::new(RecordResult::FailedBusinessRule(FailedBusinessRule {
                message: e.message,
                payload: e.payload,
                info,
            })));
        }

        let id = ctx.create_record(table, &record, None)?;
        Ok(UploadResult::new(RecordResult::Uploaded(Uploaded {
            id,
            info,
            picklist_additions: Vec::new(),
        })))
    }
}

/// Names of enforced ranks strictly between consecutive links of the chain
fn skipped_enforced_ranks(items: &[TreeDefItem], parent_rank: Option<i64>, to_upload: &[BoundRank]) -> Vec<String> {
    let mut missing = Vec::new();
    let mut previous = parent_rank;
    for rank in to_upload {
        let current = rank.item().rank_id;
        missing.extend(
            items
                .iter()
                .filter(|i| i.is_enforced && i.rank_id < current && previous.map_or(false, |p| i.rank_id > p))
                .map(|i| i.name.clone()),
        );
        previous = Some(current);
    }
    missing
}

fn root_node(conn: &Connection, table: &Table, treedef_id: i64) -> Result<Option<i64>> {
    let id = conn
        .query_row(
            &format!(
                "SELECT {0} FROM {1} WHERE treedefid = ?1 AND parentid IS NULL ORDER BY {0} LIMIT 1",
                table.id_field, table.name
            ),
            params![treedef_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

/// Every node of one rank with the given field values, lowest id first
fn nodes_at(conn: &Connection, table: &Table, treedef_id: i64, rank: &BoundRank) -> Result<Vec<i64>> {
    let filters = rank.filters();
    let mut sql = format!(
        "SELECT {} FROM {} WHERE treedefid = ? AND rankid = ?",
        table.id_field, table.name
    );
    let mut values = vec![FieldValue::Integer(treedef_id), FieldValue::Integer(rank.item().rank_id)];
    for (column, value) in filters {
        sql.push_str(&format!(" AND {} IS ?", column));
        values.push(value);
    }
    sql.push_str(&format!(" ORDER BY {}", table.id_field));

    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map(params_from_iter(values.iter()), |row| row.get(0))?
        .collect::<std::result::Result<Vec<i64>, _>>()?;
    Ok(ids)
}

/// (id, rankid) of every ancestor of a node
fn ancestors_of(conn: &Connection, table: &Table, id: i64) -> Result<Vec<(i64, i64)>> {
    let sql = format!(
        "WITH RECURSIVE lineage(id, depth) AS (
            SELECT parentid, 1 FROM {t} WHERE {pk} = ?1
            UNION ALL
            SELECT n.parentid, l.depth + 1 FROM {t} n JOIN lineage l ON n.{pk} = l.id
            WHERE l.depth < 64
         )
         SELECT n.{pk}, n.rankid FROM lineage l JOIN {t} n ON n.{pk} = l.id",
        t = table.name,
        pk = table.id_field
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map(params![id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn lineage_matches(
    conn: &Connection,
    table: &Table,
    treedef_id: i64,
    prefix: &[BoundRank],
    window: usize,
) -> Result<Vec<i64>> {
    let Some((target, ancestors)) = prefix.split_last() else {
        return Ok(Vec::new());
    };
    let candidates = nodes_at(conn, table, treedef_id, target)?;
    if ancestors.is_empty() {
        return Ok(candidates.into_iter().take(window).collect());
    }

    let mut required: Vec<(i64, HashSet<i64>)> = Vec::with_capacity(ancestors.len());
    for rank in ancestors {
        let ids: HashSet<i64> = nodes_at(conn, table, treedef_id, rank)?.into_iter().collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        required.push((rank.item().rank_id, ids));
    }

    let mut matches = Vec::new();
    for id in candidates {
        let lineage = ancestors_of(conn, table, id)?;
        let fits = required.iter().all(|(rank_id, ids)| {
            lineage
                .iter()
                .any(|(ancestor, ancestor_rank)| ancestor_rank == rank_id && ids.contains(ancestor))
        });
        if fits {
            matches.push(id);
            if matches.len() >= window {
                break;
            }
        }
    }
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{row, Fixture};
    use crate::upload::batch::UploadOptions;
    use crate::upload::disambiguation::Disambiguation;

    const GEO_PLAN: &str = r#"{"baseTableName": "geography", "uploadable": {"treeRecord": {"ranks": {
        "State": "State", "County": "County", "City": "City"
    }}}}"#;

    fn upload_one(fx: &mut Fixture, plan: &str, cells: &[(&str, &str)]) -> UploadResult {
        fx.upload(plan, &[row(cells)], UploadOptions::default()).results.remove(0)
    }

    #[test]
    fn test_deepest_unique_match_skips_levels() {
        let mut fx = Fixture::new();
        let result = upload_one(&mut fx, GEO_PLAN, &[("State", "Missouri"), ("City", "Springfield")]);

        let RecordResult::Matched(matched) = &result.record_result else {
            panic!("expected Matched, got {:?}", result.record_result)
        };
        assert_eq!(matched.id, fx.geo["Springfield, MO"]);
        assert_eq!(matched.info.tree_info.as_ref().unwrap().rank, "City");
    }

    #[test]
    fn test_ambiguous_leaf_reported() {
        let mut fx = Fixture::new();
        let result = upload_one(&mut fx, GEO_PLAN, &[("City", "Springfield")]);

        let RecordResult::MatchedMultiple(multiple) = &result.record_result else {
            panic!("expected MatchedMultiple, got {:?}", result.record_result)
        };
        assert_eq!(multiple.ids, vec![fx.geo["Springfield, MO"], fx.geo["Springfield, IL"]]);
        assert_eq!(fx.count("geography"), 8);

        // Picking one by rank resolves it
        let choice = Disambiguation::new().with("$City", fx.geo["Springfield, IL"]);
        let outcome = fx.upload_with(
            GEO_PLAN,
            &[row(&[("City", "Springfield")])],
            &[Some(choice)],
            UploadOptions::default(),
        );
        assert_eq!(outcome.results[0].get_id(), Some(fx.geo["Springfield, IL"]));
    }

    #[test]
    fn test_skipped_enforced_rank_fails() {
        let mut fx = Fixture::new();
        fx.conn
            .execute("UPDATE treedefitem SET isenforced = 1 WHERE treedefid = 1 AND name = 'County'", [])
            .unwrap();

        let result = upload_one(&mut fx, GEO_PLAN, &[("State", "Missouri"), ("City", "Branson")]);
        let RecordResult::FailedBusinessRule(failed) = &result.record_result else {
            panic!("expected FailedBusinessRule, got {:?}", result.record_result)
        };
        assert_eq!(failed.message, "missingRequiredTreeParent");
        assert_eq!(failed.payload, serde_json::json!({"names": ["County"]}));
        assert_eq!(fx.count("geography"), 8);

        // Supplying the county is fine
        let result = upload_one(
            &mut fx,
            GEO_PLAN,
            &[("State", "Missouri"), ("County", "Taney"), ("City", "Branson")],
        );
        assert!(matches!(result.record_result, RecordResult::Uploaded(_)));
    }

    #[test]
    fn test_new_chain_created_top_down() {
        let mut fx = Fixture::new();
        let result = upload_one(
            &mut fx,
            GEO_PLAN,
            &[("State", "Kansas"), ("County", "Sedgwick"), ("City", "Wichita")],
        );

        let city = result.get_id().unwrap();
        let county = &result.to_one["parent"];
        let state = &county.to_one["parent"];
        assert!(matches!(county.record_result, RecordResult::Uploaded(_)));
        assert!(matches!(state.record_result, RecordResult::Uploaded(_)));
        assert!(state.to_one.is_empty());

        let geography = fx.datamodel.table("geography").unwrap();
        let parent_of = |id: i64| read_column(&fx.conn, geography, id, "parentid").unwrap().as_i64();
        assert_eq!(parent_of(city), county.get_id());
        assert_eq!(parent_of(county.get_id().unwrap()), state.get_id());
        // Nothing matched, so the chain hangs off the existing root
        assert_eq!(parent_of(state.get_id().unwrap()), Some(fx.geo["Earth"]));

        // Full names and node numbers were fixed up after the batch
        assert_eq!(
            read_column(&fx.conn, geography, city, "fullname").unwrap(),
            FieldValue::Text("Kansas, Wichita".to_string())
        );
        assert!(!read_column(&fx.conn, geography, city, "nodenumber").unwrap().is_null());

        // Second time round everything matches
        let again = upload_one(
            &mut fx,
            GEO_PLAN,
            &[("State", "Kansas"), ("County", "Sedgwick"), ("City", "Wichita")],
        );
        assert!(matches!(again.record_result, RecordResult::Matched(ref m) if m.id == city));
    }

    #[test]
    fn test_placeholder_root_for_empty_tree() {
        let mut fx = Fixture::new();
        let plan = r#"{"baseTableName": "taxon", "uploadable": {"treeRecord": {"ranks": {"Genus": "Genus", "Species": "Species"}}}}"#;
        let result = upload_one(&mut fx, plan, &[("Genus", "Quercus"), ("Species", "alba")]);

        let genus = &result.to_one["parent"];
        let root = &genus.to_one["parent"];
        let RecordResult::Uploaded(placeholder) = &root.record_result else {
            panic!("expected placeholder root, got {:?}", root.record_result)
        };
        let tree_info = placeholder.info.tree_info.as_ref().unwrap();
        assert_eq!(tree_info.name, PLACEHOLDER_NAME);
        assert_eq!(tree_info.rank, "Life");
        assert_eq!(fx.count("taxon"), 3);

        // The placeholder is reused as the root next time
        upload_one(&mut fx, plan, &[("Genus", "Acer"), ("Species", "rubrum")]);
        assert_eq!(fx.count("taxon"), 5);
    }

    #[test]
    fn test_must_match_tree_never_creates() {
        let mut fx = Fixture::new();
        let plan = r#"{"baseTableName": "geography", "uploadable": {"mustMatchTreeRecord": {"ranks": {"State": "State", "City": "City"}}}}"#;

        let result = upload_one(&mut fx, plan, &[("State", "Missouri"), ("City", "Branson")]);
        assert!(matches!(result.record_result, RecordResult::NoMatch(_)));
        assert_eq!(fx.count("geography"), 8);

        let result = upload_one(&mut fx, plan, &[("State", "Illinois"), ("City", "Springfield")]);
        assert_eq!(result.get_id(), Some(fx.geo["Springfield, IL"]));
    }
}
