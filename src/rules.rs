// 🏷️ Business Rules - Rules as Data
// Uniqueness rules are loaded from JSON; tree structure rules are built in.
// A violated rule raises a BusinessRuleException which the upload records
// as FailedBusinessRule for the row.

use crate::error::{Error, Result};
use crate::schema::{FieldValue, Record, Table};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

// ============================================================================
// RULE EXCEPTION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleAction {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct BusinessRuleException {
    pub message: String,
    pub payload: serde_json::Value,
}

impl BusinessRuleException {
    pub fn new(message: impl Into<String>, payload: serde_json::Value) -> Self {
        BusinessRuleException {
            message: message.into(),
            payload,
        }
    }
}

/// Validates a record around every create/delete made by the upload engine.
/// Violations are returned as `Error::BusinessRule`; any other error is a
/// store failure.
pub trait RuleChecker {
    fn check(
        &self,
        conn: &Connection,
        table: &Table,
        action: RuleAction,
        id: Option<i64>,
        record: &Record,
    ) -> Result<()>;
}

// ============================================================================
// UNIQUENESS RULE DEFINITION
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniquenessRule {
    /// Rule ID for tracking
    pub id: String,

    pub table: String,

    /// Fields whose combined value must be unique
    pub fields: Vec<String>,

    /// Uniqueness only applies among records sharing this field's value
    #[serde(default)]
    pub scope: Option<String>,

    /// Description/notes about this rule
    #[serde(default)]
    pub description: Option<String>,
}

impl UniquenessRule {
    pub fn new(id: &str, table: &str, fields: &[&str], scope: Option<&str>) -> Self {
        UniquenessRule {
            id: id.to_string(),
            table: table.to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            scope: scope.map(|s| s.to_string()),
            description: None,
        }
    }

    fn applies_to(&self, table: &Table) -> bool {
        self.table.eq_ignore_ascii_case(table.name)
    }

    fn message(&self) -> String {
        match &self.scope {
            Some(scope) => format!(
                "{} must have unique {} in {}",
                self.table,
                self.fields.join(", "),
                scope.trim_end_matches("id")
            ),
            None => format!("{} must have unique {}", self.table, self.fields.join(", ")),
        }
    }

    /// Ids of other records that already hold the same values
    fn conflicts(&self, conn: &Connection, table: &Table, id: Option<i64>, record: &Record) -> Result<Vec<i64>> {
        let values: Vec<FieldValue> = self
            .fields
            .iter()
            .map(|f| record.get(f).cloned().unwrap_or(FieldValue::Null))
            .collect();
        // Unset values never collide
        if values.iter().all(|v| v.is_null()) {
            return Ok(Vec::new());
        }

        let mut clauses: Vec<String> = self.fields.iter().map(|f| format!("{} IS ?", f)).collect();
        let mut params = values;
        if let Some(scope) = &self.scope {
            clauses.push(format!("{} IS ?", scope));
            params.push(record.get(scope).cloned().unwrap_or(FieldValue::Null));
        }
        if let Some(id) = id {
            clauses.push(format!("{} != ?", table.id_field));
            params.push(FieldValue::Integer(id));
        }

        let sql = format!(
            "SELECT {} FROM {} WHERE {} LIMIT 10",
            table.id_field,
            table.name,
            clauses.join(" AND ")
        );
        let mut stmt = conn.prepare(&sql)?;
        let ids = stmt
            .query_map(params_from_iter(params.iter()), |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(ids)
    }
}

// ============================================================================
// RULE ENGINE
// ============================================================================

pub struct RuleEngine {
    rules: Vec<UniquenessRule>,
    allow_add_child_to_synonymized_parent: bool,
}

impl RuleEngine {
    /// Create a new empty rule engine
    pub fn new() -> Self {
        RuleEngine {
            rules: Vec::new(),
            allow_add_child_to_synonymized_parent: false,
        }
    }

    /// Catalog numbers and prep type names are unique per collection
    pub fn with_defaults() -> Self {
        RuleEngine::from_rules(vec![
            UniquenessRule::new(
                "unique_catalognumber",
                "collectionobject",
                &["catalognumber"],
                Some("collectionid"),
            ),
            UniquenessRule::new("unique_preptype_name", "preptype", &["name"], Some("collectionid")),
        ])
    }

    /// Load rules from JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("failed to read rules file {:?}: {}", path.as_ref(), e))
        })?;

        let rules: Vec<UniquenessRule> = serde_json::from_str(&content)?;

        Ok(RuleEngine::from_rules(rules))
    }

    pub fn from_rules(rules: Vec<UniquenessRule>) -> Self {
        RuleEngine {
            rules,
            allow_add_child_to_synonymized_parent: false,
        }
    }

    /// Builder: permit new tree nodes under synonymized parents
    pub fn allow_synonymized_parents(mut self, allow: bool) -> Self {
        self.allow_add_child_to_synonymized_parent = allow;
        self
    }

    pub fn add_rule(&mut self, rule: UniquenessRule) {
        self.rules.push(rule);
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    fn check_tree_insert(&self, conn: &Connection, table: &Table, record: &Record) -> Result<()> {
        let Some(parent_id) = record.get("parentid").and_then(|v| v.as_i64()) else {
            return Ok(());
        };
        let parent: Option<(i64, Option<bool>, String)> = conn
            .query_row(
                &format!(
                    "SELECT rankid, isaccepted, name FROM {} WHERE {} = ?1",
                    table.name, table.id_field
                ),
                params![parent_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let Some((parent_rank, parent_accepted, parent_name)) = parent else {
            return Err(BusinessRuleException::new(
                "Tree node parent does not exist",
                serde_json::json!({"tree": table.name, "parentid": parent_id}),
            )
            .into());
        };

        if parent_accepted == Some(false) && !self.allow_add_child_to_synonymized_parent {
            return Err(BusinessRuleException::new(
                "Adding node to synonymized parent",
                serde_json::json!({
                    "tree": table.name,
                    "parentid": parent_id,
                    "parentName": parent_name,
                    "name": record.get("name"),
                }),
            )
            .into());
        }

        if let Some(rank) = record.get("rankid").and_then(|v| v.as_i64()) {
            if rank <= parent_rank {
                return Err(BusinessRuleException::new(
                    "Tree node must be of lower rank than its parent",
                    serde_json::json!({
                        "tree": table.name,
                        "rankid": rank,
                        "parentRankid": parent_rank,
                    }),
                )
                .into());
            }
        }
        Ok(())
    }

    fn check_tree_delete(&self, conn: &Connection, table: &Table, id: i64) -> Result<()> {
        let children: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE parentid = ?1", table.name),
            params![id],
            |row| row.get(0),
        )?;
        if children > 0 {
            return Err(BusinessRuleException::new(
                "Tree node has children",
                serde_json::json!({"tree": table.name, "id": id, "children": children}),
            )
            .into());
        }
        Ok(())
    }
}

impl RuleChecker for RuleEngine {
    fn check(
        &self,
        conn: &Connection,
        table: &Table,
        action: RuleAction,
        id: Option<i64>,
        record: &Record,
    ) -> Result<()> {
        match action {
            RuleAction::Insert | RuleAction::Update => {
                for rule in self.rules.iter().filter(|r| r.applies_to(table)) {
                    let conflicting = rule.conflicts(conn, table, id, record)?;
                    if !conflicting.is_empty() {
                        return Err(BusinessRuleException::new(
                            rule.message(),
                            serde_json::json!({
                                "rule": rule.id,
                                "table": table.name,
                                "fieldNames": rule.fields,
                                "fieldData": rule.fields.iter()
                                    .map(|f| (f.clone(), record.get(f).cloned().unwrap_or(FieldValue::Null)))
                                    .collect::<Record>(),
                                "conflicting": conflicting,
                            }),
                        )
                        .into());
                    }
                }
                if table.is_tree && action == RuleAction::Insert {
                    self.check_tree_insert(conn, table, record)?;
                }
                Ok(())
            }
            RuleAction::Delete => match (table.is_tree, id) {
                (true, Some(id)) => self.check_tree_delete(conn, table, id),
                _ => Ok(()),
            },
        }
    }
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::with_defaults()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::insert_record;
    use crate::testing::Fixture;

    fn catalog_record(number: &str, collection_id: i64) -> Record {
        let mut record = Record::new();
        record.insert("catalognumber".to_string(), FieldValue::Text(number.to_string()));
        record.insert("collectionid".to_string(), FieldValue::Integer(collection_id));
        record
    }

    #[test]
    fn test_uniqueness_rule_in_scope() {
        let fx = Fixture::new();
        let engine = RuleEngine::with_defaults();
        let co = fx.datamodel.table("collectionobject").unwrap();

        let record = catalog_record("000000001", fx.collection.collection_id);
        engine
            .check(&fx.conn, co, RuleAction::Insert, None, &record)
            .unwrap();
        let id = insert_record(&fx.conn, co, &record).unwrap();

        let err = engine
            .check(&fx.conn, co, RuleAction::Insert, None, &record)
            .unwrap_err();
        match err {
            Error::BusinessRule(e) => {
                assert_eq!(e.message, "collectionobject must have unique catalognumber in collection");
                assert_eq!(e.payload["conflicting"], serde_json::json!([id]));
            }
            other => panic!("expected business rule error, got {:?}", other),
        }

        // Same number in another collection is fine
        let other = catalog_record("000000001", fx.collection.collection_id + 100);
        assert!(engine.check(&fx.conn, co, RuleAction::Insert, None, &other).is_ok());
    }

    #[test]
    fn test_blank_values_never_conflict() {
        let fx = Fixture::new();
        let engine = RuleEngine::with_defaults();
        let co = fx.datamodel.table("collectionobject").unwrap();

        let mut record = Record::new();
        record.insert("collectionid".to_string(), FieldValue::Integer(fx.collection.collection_id));
        insert_record(&fx.conn, co, &record).unwrap();

        assert!(engine.check(&fx.conn, co, RuleAction::Insert, None, &record).is_ok());
    }

    #[test]
    fn test_synonymized_parent_rejected_unless_allowed() {
        let fx = Fixture::new();
        let geography = fx.datamodel.table("geography").unwrap();
        let missouri = fx.geo["Missouri"];
        fx.conn
            .execute("UPDATE geography SET isaccepted = 0 WHERE geographyid = ?1", params![missouri])
            .unwrap();

        let mut record = Record::new();
        record.insert("name".to_string(), FieldValue::Text("Polk".to_string()));
        record.insert("rankid".to_string(), FieldValue::Integer(400));
        record.insert("parentid".to_string(), FieldValue::Integer(missouri));

        let strict = RuleEngine::with_defaults();
        assert!(matches!(
            strict.check(&fx.conn, geography, RuleAction::Insert, None, &record),
            Err(Error::BusinessRule(_))
        ));

        let lenient = RuleEngine::with_defaults().allow_synonymized_parents(true);
        assert!(lenient
            .check(&fx.conn, geography, RuleAction::Insert, None, &record)
            .is_ok());
    }

    #[test]
    fn test_child_rank_must_be_below_parent() {
        let fx = Fixture::new();
        let geography = fx.datamodel.table("geography").unwrap();

        let mut record = Record::new();
        record.insert("name".to_string(), FieldValue::Text("Ozarks".to_string()));
        record.insert("rankid".to_string(), FieldValue::Integer(200));
        record.insert("parentid".to_string(), FieldValue::Integer(fx.geo["Missouri"]));

        let err = RuleEngine::new()
            .check(&fx.conn, geography, RuleAction::Insert, None, &record)
            .unwrap_err();
        assert!(err.to_string().contains("lower rank"));
    }

    #[test]
    fn test_cannot_delete_tree_node_with_children() {
        let fx = Fixture::new();
        let geography = fx.datamodel.table("geography").unwrap();
        let engine = RuleEngine::new();

        assert!(engine
            .check(&fx.conn, geography, RuleAction::Delete, Some(fx.geo["Missouri"]), &Record::new())
            .is_err());
        assert!(engine
            .check(&fx.conn, geography, RuleAction::Delete, Some(fx.geo["Springfield, MO"]), &Record::new())
            .is_ok());
    }

    #[test]
    fn test_rules_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        fs::write(
            &path,
            r#"[{"id": "agent_email", "table": "agent", "fields": ["email"], "scope": "divisionid"}]"#,
        )
        .unwrap();

        let engine = RuleEngine::from_file(&path).unwrap();
        assert_eq!(engine.rule_count(), 1);
        assert!(RuleEngine::from_file(dir.path().join("missing.json")).is_err());
    }
}
