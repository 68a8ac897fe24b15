// ⬆️ Bind/upload protocol for ordinary tables
//
// Per node: disambiguation shortcut → null check → to-one children →
// predicate → match (one / many / none) → create. A failed child stops the
// parent with PropagatedFailure before it matches or writes anything.

use super::bind::{BoundUploadTable, BoundUploadable};
use super::context::{Mode, UploadContext};
use super::predicate::{Predicate, ToManyClause};
use super::results::{
    FailedBusinessRule, Matched, MatchedMultiple, NoMatch, NullRecord, ParseFailures, PicklistAddition,
    RecordResult, ReportInfo, UploadResult, Uploaded,
};
use super::scoping::TableKind;
use crate::db::{read_column, record_exists};
use crate::error::{Error, Result};
use crate::parser::ParseFailure;
use crate::rules::RuleAction;
use crate::schema::{FieldValue, Record, Relationship};
use std::collections::BTreeMap;
use tracing::debug;

impl BoundUploadable<'_> {
    pub fn process_row(&self, ctx: &mut UploadContext, mode: Mode) -> Result<UploadResult> {
        match self {
            BoundUploadable::Table(t) => t.process_row(ctx, mode),
            BoundUploadable::Tree(t) => t.process_row(ctx, mode),
        }
    }

    /// Look for existing records only; nothing is written
    pub fn match_row(&self, ctx: &mut UploadContext) -> Result<UploadResult> {
        self.process_row(ctx, Mode::MatchOnly)
    }

    pub fn info(&self) -> ReportInfo {
        match self {
            BoundUploadable::Table(t) => t.info(),
            BoundUploadable::Tree(t) => t.info(),
        }
    }
}

impl BoundUploadTable<'_> {
    pub fn info(&self) -> ReportInfo {
        ReportInfo {
            table_name: self.table().name.to_string(),
            columns: self.scoped.columns.iter().map(|c| c.column().to_string()).collect(),
            tree_info: None,
        }
    }

    fn relationship(&self, field: &str) -> Result<&'static Relationship> {
        self.table()
            .relationship(field)
            .ok_or_else(|| Error::Plan(format!("{} has no relationship {}", self.table().name, field)))
    }

    pub fn process_row(&self, ctx: &mut UploadContext, mode: Mode) -> Result<UploadResult> {
        let table = self.table();
        let info = self.info();

        if let Some(id) = self.disambiguation.disambiguate() {
            if record_exists(ctx.conn, table, id)? {
                debug!(table = table.name, id, "disambiguated");
                return Ok(UploadResult::new(RecordResult::Matched(Matched { id, info })));
            }
        }

        if self.is_blank(ctx.config) {
            return Ok(UploadResult::new(RecordResult::NullRecord(NullRecord { info })));
        }

        let to_one = self.process_to_ones(ctx, mode)?;
        if to_one.values().any(|r| r.contains_failure()) {
            return Ok(UploadResult::propagated(to_one));
        }

        let Some(predicate) = self.predicate(ctx, &to_one)? else {
            return self.create(ctx, mode, info, to_one, None, &Record::new());
        };

        let key = predicate.key()?;
        let window = ctx.config.match_window;
        let ids = ctx.cached_query(table.name, &key, |conn| predicate.query(conn, window))?;
        match ids.as_slice() {
            [] => self.create(ctx, mode, info, to_one, Some(&key), &Record::new()),
            [id] => {
                debug!(table = table.name, id, "matched");
                self.matched(ctx, *id, info, to_one)
            }
            _ => {
                debug!(table = table.name, candidates = ids.len(), "ambiguous match");
                Ok(UploadResult::new(RecordResult::MatchedMultiple(MatchedMultiple { ids, key, info }))
                    .with_to_one(to_one))
            }
        }
    }

    /// Create without matching: one-to-one children and to-many entries of a
    /// freshly created parent
    fn force_upload_row(&self, ctx: &mut UploadContext, extra: &Record, create_if_blank: bool) -> Result<UploadResult> {
        let info = self.info();
        if !create_if_blank && self.is_blank(ctx.config) {
            return Ok(UploadResult::new(RecordResult::NullRecord(NullRecord { info })));
        }
        let to_one = self.process_to_ones(ctx, Mode::Upload)?;
        if to_one.values().any(|r| r.contains_failure()) {
            return Ok(UploadResult::propagated(to_one));
        }
        self.create(ctx, Mode::Upload, info, to_one, None, extra)
    }

    /// Shared to-one children; one-to-one children wait for the parent
    fn process_to_ones(&self, ctx: &mut UploadContext, mode: Mode) -> Result<BTreeMap<String, UploadResult>> {
        let mut results = BTreeMap::new();
        for (field, child) in self.to_one.iter().filter(|(_, c)| !c.is_one_to_one()) {
            results.insert(field.clone(), child.process_row(ctx, mode)?);
        }
        Ok(results)
    }

    // ========================================================================
    // MATCHING
    // ========================================================================

    /// Values of this node alone: parsed cells, static and scoping values
    fn own_predicate(&self, ctx: &UploadContext) -> Result<Predicate> {
        let mut predicate = Predicate::new(self.table());
        for parsed in &self.parsed {
            predicate.filters.extend(parsed.filter_on.clone());
        }
        for (field, value) in self.stored_picklist_values(ctx)? {
            if let Some(filter) = predicate.filters.get_mut(&field) {
                *filter = value;
            }
        }
        predicate.filters.extend(self.scoped.static_values.clone());
        predicate.filters.extend(self.scoped.scoping_values.clone());
        Ok(predicate)
    }

    /// Picklist values parsed as new that the list now holds, possibly in
    /// another case. The stored spelling wins.
    fn stored_picklist_values(&self, ctx: &UploadContext) -> Result<Record> {
        let mut values = Record::new();
        for parsed in &self.parsed {
            let Some(pending) = &parsed.picklist_addition else { continue };
            if let Some(item) = ctx
                .collaborators
                .picklists
                .find_item(ctx.conn, pending.picklist_id, &pending.value)?
            {
                values.insert(parsed.field.to_string(), FieldValue::Text(item.value));
            }
        }
        Ok(values)
    }

    /// None when no existing record can match, e.g. a to-one was just created
    fn predicate(&self, ctx: &mut UploadContext, to_one: &BTreeMap<String, UploadResult>) -> Result<Option<Predicate>> {
        let mut predicate = self.own_predicate(ctx)?;
        for (field, result) in to_one {
            let rel = self.relationship(field)?;
            let value = match &result.record_result {
                RecordResult::Matched(m) => FieldValue::Integer(m.id),
                RecordResult::NullRecord(_) => FieldValue::Null,
                _ => return Ok(None),
            };
            predicate.filters.insert(rel.column.to_string(), value);
        }
        if !self.add_to_many_clauses(ctx, &mut predicate)? {
            return Ok(None);
        }
        Ok(Some(predicate))
    }

    /// Predicate for this node as a to-many entry of a parent being matched.
    /// To-ones are matched, never created.
    fn to_many_predicate(&self, ctx: &mut UploadContext) -> Result<Option<Predicate>> {
        let mut predicate = self.own_predicate(ctx)?;
        for (field, child) in self.to_one.iter().filter(|(_, c)| !c.is_one_to_one()) {
            let column = self.relationship(field)?.column.to_string();
            match child.match_row(ctx)?.record_result {
                RecordResult::Matched(m) => {
                    predicate.filters.insert(column, FieldValue::Integer(m.id));
                }
                RecordResult::NullRecord(_) => {
                    predicate.filters.insert(column, FieldValue::Null);
                }
                RecordResult::MatchedMultiple(m) => {
                    predicate.fk_in.insert(column, m.ids);
                }
                _ => return Ok(None),
            }
        }
        if !self.add_to_many_clauses(ctx, &mut predicate)? {
            return Ok(None);
        }
        Ok(Some(predicate))
    }

    /// False when some mapped to-many entry cannot exist yet
    fn add_to_many_clauses(&self, ctx: &mut UploadContext, predicate: &mut Predicate) -> Result<bool> {
        for (field, children) in &self.to_many {
            let rel = self.relationship(field)?;
            let mut clause = ToManyClause {
                relationship: field.clone(),
                child_table: rel.related,
                fk_column: rel.column,
                records: Vec::new(),
                scope: common_static_values(children),
            };
            for child in children {
                if child.is_blank(ctx.config) {
                    continue;
                }
                match child.to_many_predicate(ctx)? {
                    Some(p) => clause.records.push(p),
                    None => return Ok(false),
                }
            }
            predicate.to_many.push(clause);
        }
        Ok(true)
    }

    fn matched(
        &self,
        ctx: &mut UploadContext,
        id: i64,
        info: ReportInfo,
        mut to_one: BTreeMap<String, UploadResult>,
    ) -> Result<UploadResult> {
        // One-to-one children were not matched on; report what the record links to
        for (field, child) in self.to_one.iter().filter(|(_, c)| c.is_one_to_one()) {
            let rel = self.relationship(field)?;
            let child_info = child.info();
            let result = match read_column(ctx.conn, self.table(), id, rel.column)?.as_i64() {
                Some(child_id) => RecordResult::Matched(Matched { id: child_id, info: child_info }),
                None => RecordResult::NullRecord(NullRecord { info: child_info }),
            };
            to_one.insert(field.clone(), UploadResult::new(result));
        }
        Ok(UploadResult::new(RecordResult::Matched(Matched { id, info })).with_to_one(to_one))
    }

    // ========================================================================
    // CREATION
    // ========================================================================

    fn create(
        &self,
        ctx: &mut UploadContext,
        mode: Mode,
        info: ReportInfo,
        mut to_one: BTreeMap<String, UploadResult>,
        match_key: Option<&str>,
        extra: &Record,
    ) -> Result<UploadResult> {
        let table = self.table();
        if mode == Mode::MatchOnly || self.scoped.kind == TableKind::MustMatch {
            return Ok(UploadResult::new(RecordResult::NoMatch(NoMatch { info })).with_to_one(to_one));
        }

        let missing: Vec<ParseFailure> = self
            .parsed
            .iter()
            .filter_map(|p| p.missing_required.as_ref().map(|field| (p, field)))
            .filter(|(_, field)| self.scoped.static_values.get(*field).map_or(true, |v| v.is_null()))
            .map(|(p, field)| ParseFailure::new("fieldRequiredBySchema", serde_json::json!({"field": field}), &p.column))
            .collect();
        if !missing.is_empty() {
            return Ok(UploadResult::new(RecordResult::ParseFailures(ParseFailures { failures: missing }))
                .with_to_one(to_one));
        }

        for (field, child) in self.to_one.iter().filter(|(_, c)| c.is_one_to_one()) {
            if let BoundUploadable::Table(t) = child {
                to_one.insert(field.clone(), t.force_upload_row(ctx, &Record::new(), true)?);
            }
        }
        if to_one.values().any(|r| r.contains_failure()) {
            return Ok(UploadResult::propagated(to_one));
        }

        let mut record = self.scoped.static_values.clone();
        for parsed in &self.parsed {
            record.extend(parsed.upload.clone());
        }
        record.extend(self.stored_picklist_values(ctx)?);
        record.extend(self.scoped.scoping_values.clone());
        for (field, result) in &to_one {
            let rel = self.relationship(field)?;
            record.insert(rel.column.to_string(), FieldValue::from(result.get_id()));
        }
        record.extend(extra.clone());

        let required = table
            .fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name)
            .chain(table.relationships.iter().filter(|r| r.required && r.is_to_one()).map(|r| r.column));
        for column in required {
            if record.get(column).map_or(true, |v| v.is_null()) {
                return Ok(UploadResult::new(RecordResult::FailedBusinessRule(FailedBusinessRule {
                    message: "fieldRequired".to_string(),
                    payload: serde_json::json!({"field": column}),
                    info,
                }))
                .with_to_one(to_one));
            }
        }

        if let Some(e) = ctx.check_rules(table, RuleAction::Insert, None, &record)? {
            return Ok(UploadResult::new(RecordResult::FailedBusinessRule(FailedBusinessRule {
                message: e.message,
                payload: e.payload,
                info,
            }))
            .with_to_one(to_one));
        }

        let id = ctx.create_record(table, &record, match_key)?;
        let picklist_additions = self.add_picklist_items(ctx)?;

        let mut to_many = BTreeMap::new();
        for (field, children) in &self.to_many {
            let rel = self.relationship(field)?;
            let mut results = Vec::with_capacity(children.len());
            for (index, child) in children.iter().enumerate() {
                let mut extra = Record::new();
                extra.insert(rel.column.to_string(), FieldValue::Integer(id));
                if child.table().field("ordernumber").is_some() && !child.maps_field("ordernumber") {
                    extra.insert("ordernumber".to_string(), FieldValue::Integer(index as i64));
                }
                results.push(child.force_upload_row(ctx, &extra, false)?);
            }
            to_many.insert(field.clone(), results);
        }

        Ok(UploadResult::new(RecordResult::Uploaded(Uploaded {
            id,
            info,
            picklist_additions,
        }))
        .with_to_one(to_one)
        .with_to_many(to_many))
    }

    fn maps_field(&self, field: &str) -> bool {
        self.scoped.columns.iter().any(|c| c.field.name == field) || self.scoped.static_values.contains_key(field)
    }

    fn add_picklist_items(&self, ctx: &mut UploadContext) -> Result<Vec<PicklistAddition>> {
        let mut additions = Vec::new();
        for pending in self.parsed.iter().filter_map(|p| p.picklist_addition.as_ref()) {
            let service = ctx.collaborators.picklists;
            // An earlier row may have added it already, in any case
            if service.find_item(ctx.conn, pending.picklist_id, &pending.value)?.is_some() {
                continue;
            }
            let id = service.add_item(ctx.conn, pending.picklist_id, &pending.value)?;
            let mut fields = Record::new();
            fields.insert("picklistid".to_string(), FieldValue::Integer(pending.picklist_id));
            fields.insert("value".to_string(), FieldValue::Text(pending.value.clone()));
            ctx.collaborators
                .auditor
                .insert(ctx.conn, "picklistitem", id, ctx.agent_id, &fields)?;
            debug!(picklist = %pending.picklist_name, value = %pending.value, "added picklist item");
            additions.push(PicklistAddition {
                id,
                name: pending.picklist_name.clone(),
                value: pending.value.clone(),
                caption: pending.column.clone(),
            });
        }
        Ok(additions)
    }
}

/// Static values every mapped entry of a to-many list shares
fn common_static_values(children: &[BoundUploadTable]) -> Record {
    let Some((first, rest)) = children.split_first() else {
        return Record::new();
    };
    first
        .scoped
        .static_values
        .iter()
        .filter(|(k, v)| rest.iter().all(|c| c.scoped.static_values.get(*k) == Some(*v)))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{row, Fixture};
    use crate::upload::batch::UploadOptions;

    const EVENT_PLAN: &str = r#"{"baseTableName": "collectingevent", "uploadable": {"uploadTable": {
        "wbcols": {"stationfieldnumber": "Station", "method": "Method"},
        "toMany": {"collectors": [
            {"uploadTable": {"toOne": {"agent": {"uploadTable": {"wbcols": {"lastname": "Collector 1"}, "static": {"agenttype": 1}}}}}},
            {"uploadTable": {"toOne": {"agent": {"uploadTable": {"wbcols": {"lastname": "Collector 2"}, "static": {"agenttype": 1}}}}}}
        ]}
    }}}"#;

    fn upload_one(fx: &mut Fixture, plan: &str, cells: &[(&str, &str)]) -> UploadResult {
        fx.upload(plan, &[row(cells)], UploadOptions::default()).results.remove(0)
    }

    #[test]
    fn test_to_many_requires_set_equality() {
        let mut fx = Fixture::new();
        let both = [("Station", "S1"), ("Collector 1", "Bates"), ("Collector 2", "Wallace")];
        let first = upload_one(&mut fx, EVENT_PLAN, &both);
        assert!(matches!(first.record_result, RecordResult::Uploaded(_)));
        assert_eq!(fx.count("collector"), 2);

        let again = upload_one(&mut fx, EVENT_PLAN, &both);
        assert!(matches!(again.record_result, RecordResult::Matched(_)));
        assert_eq!(again.get_id(), first.get_id());

        // Bates alone is a different set: the existing event also has Wallace
        let bates_only = [("Station", "S1"), ("Collector 1", "Bates")];
        let subset = upload_one(&mut fx, EVENT_PLAN, &bates_only);
        assert!(matches!(subset.record_result, RecordResult::Uploaded(_)));
        assert_ne!(subset.get_id(), first.get_id());
        assert!(matches!(
            subset.to_many["collectors"][1].record_result,
            RecordResult::NullRecord(_)
        ));

        let repeat = upload_one(&mut fx, EVENT_PLAN, &bates_only);
        assert_eq!(repeat.get_id(), subset.get_id());
        assert_eq!(fx.count("collectingevent"), 2);
        assert_eq!(fx.count("collector"), 3);
    }

    #[test]
    fn test_to_many_entries_numbered() {
        let mut fx = Fixture::new();
        let result = upload_one(
            &mut fx,
            EVENT_PLAN,
            &[("Station", "S9"), ("Collector 1", "Bates"), ("Collector 2", "Wallace")],
        );
        let collector = fx.datamodel.table("collector").unwrap();
        let second = result.to_many["collectors"][1].get_id().unwrap();
        assert_eq!(read_column(&fx.conn, collector, second, "ordernumber").unwrap(), FieldValue::Integer(1));
    }

    #[test]
    fn test_one_to_one_never_shared() {
        let mut fx = Fixture::new();
        let plan = r#"{"baseTableName": "collectionobject", "uploadable": {"uploadTable": {
            "wbcols": {"catalognumber": "Catalog #"},
            "toOne": {"collectionobjectattribute": {"uploadTable": {"wbcols": {"text1": "Habitat"}}}}
        }}}"#;

        let first = upload_one(&mut fx, plan, &[("Catalog #", "5"), ("Habitat", "Cloud forest")]);
        let attribute = first.to_one["collectionobjectattribute"].get_id();
        assert!(attribute.is_some());

        // Matching the specimen reports the attribute it already has
        let again = upload_one(&mut fx, plan, &[("Catalog #", "5"), ("Habitat", "Cloud forest")]);
        assert!(matches!(again.record_result, RecordResult::Matched(_)));
        assert_eq!(again.to_one["collectionobjectattribute"].get_id(), attribute);

        let other = upload_one(&mut fx, plan, &[("Catalog #", "6"), ("Habitat", "Cloud forest")]);
        assert_ne!(other.to_one["collectionobjectattribute"].get_id(), attribute);
        assert_eq!(fx.count("collectionobjectattribute"), 2);
    }

    #[test]
    fn test_writable_picklist_grows_once() {
        let mut fx = Fixture::new();
        let before = fx.count("picklistitem");
        let outcome = fx.upload(
            EVENT_PLAN,
            &[
                row(&[("Station", "A"), ("Method", "Trap")]),
                row(&[("Station", "B"), ("Method", "Trap")]),
            ],
            UploadOptions::default(),
        );

        let RecordResult::Uploaded(first) = &outcome.results[0].record_result else { panic!() };
        assert_eq!(first.picklist_additions.len(), 1);
        assert_eq!(first.picklist_additions[0].name, "CollectingMethod");
        assert_eq!(first.picklist_additions[0].value, "Trap");
        assert_eq!(first.picklist_additions[0].caption, "Method");
        let RecordResult::Uploaded(second) = &outcome.results[1].record_result else { panic!() };
        assert!(second.picklist_additions.is_empty());
        assert_eq!(fx.count("picklistitem"), before + 1);
    }

    #[test]
    fn test_picklist_values_differing_in_case_added_once() {
        let mut fx = Fixture::new();
        let before = fx.count("picklistitem");
        let outcome = fx.upload(
            EVENT_PLAN,
            &[
                row(&[("Station", "A"), ("Method", "Trap")]),
                row(&[("Station", "A"), ("Method", "trap")]),
                row(&[("Station", "B"), ("Method", "TRAP")]),
            ],
            UploadOptions::default(),
        );

        assert!(outcome.success());
        assert_eq!(fx.count("picklistitem"), before + 1);
        assert!(matches!(outcome.results[1].record_result, RecordResult::Matched(_)));
        assert_eq!(outcome.results[1].get_id(), outcome.results[0].get_id());

        let RecordResult::Uploaded(third) = &outcome.results[2].record_result else {
            panic!("expected Uploaded, got {:?}", outcome.results[2].record_result)
        };
        assert!(third.picklist_additions.is_empty());
        let event = fx.datamodel.table("collectingevent").unwrap();
        assert_eq!(
            read_column(&fx.conn, event, third.id, "method").unwrap(),
            FieldValue::Text("Trap".to_string())
        );
    }

    #[test]
    fn test_must_match_table() {
        let mut fx = Fixture::new();
        let plan = r#"{"baseTableName": "collectionobject", "uploadable": {"uploadTable": {
            "wbcols": {"catalognumber": "Catalog #"},
            "toOne": {"cataloger": {"mustMatchTable": {"wbcols": {"lastname": "Cataloger"}}}}
        }}}"#;

        let found = upload_one(&mut fx, plan, &[("Catalog #", "1"), ("Cataloger", "Tester")]);
        assert_eq!(found.to_one["cataloger"].get_id(), Some(fx.agent_id));

        let missing = upload_one(&mut fx, plan, &[("Catalog #", "2"), ("Cataloger", "Nobody")]);
        assert!(matches!(missing.record_result, RecordResult::PropagatedFailure(_)));
        assert!(matches!(missing.to_one["cataloger"].record_result, RecordResult::NoMatch(_)));
        assert_eq!(fx.count("agent"), 1);
    }

    #[test]
    fn test_failing_to_many_entry_fails_row() {
        let mut fx = Fixture::new();
        let plan = r#"{"baseTableName": "collectionobject", "uploadable": {"uploadTable": {
            "wbcols": {"catalognumber": "Catalog #"},
            "toMany": {"preparations": [{"uploadTable": {
                "wbcols": {"countamt": "Count"},
                "toOne": {"preptype": {"mustMatchTable": {"wbcols": {"name": "Prep Type"}}}}
            }}]}
        }}}"#;

        let ok = upload_one(&mut fx, plan, &[("Catalog #", "1"), ("Count", "2"), ("Prep Type", "Skin")]);
        assert!(!ok.contains_failure());
        assert!(matches!(
            ok.to_many["preparations"][0].to_one["preptype"].record_result,
            RecordResult::Matched(_)
        ));

        let bad = upload_one(&mut fx, plan, &[("Catalog #", "2"), ("Count", "1"), ("Prep Type", "Slide")]);
        assert!(bad.contains_failure());
        assert_eq!(fx.count("preparation"), 1);
        assert_eq!(fx.count("collectionobject"), 1);
    }

    #[test]
    fn test_required_fields() {
        let mut fx = Fixture::new();
        let locality = r#"{"baseTableName": "locality", "uploadable": {"uploadTable": {
            "wbcols": {"localityname": "Locality", "remarks": "Remarks"}
        }}}"#;
        let result = upload_one(&mut fx, locality, &[("Remarks", "near the river")]);
        let RecordResult::ParseFailures(parse) = &result.record_result else {
            panic!("expected ParseFailures, got {:?}", result.record_result)
        };
        assert_eq!(parse.failures[0].message, "fieldRequiredBySchema");
        assert_eq!(parse.failures[0].column, "Locality");

        // agenttype is neither mapped nor static
        let agent = r#"{"baseTableName": "agent", "uploadable": {"uploadTable": {"wbcols": {"lastname": "Last"}}}}"#;
        let result = upload_one(&mut fx, agent, &[("Last", "Humboldt")]);
        let RecordResult::FailedBusinessRule(failed) = &result.record_result else {
            panic!("expected FailedBusinessRule, got {:?}", result.record_result)
        };
        assert_eq!(failed.message, "fieldRequired");
        assert_eq!(failed.payload, serde_json::json!({"field": "agenttype"}));
    }
}
