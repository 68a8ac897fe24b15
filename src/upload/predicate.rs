// 🔍 Match predicates
//
// A Predicate is a plain value: field equalities, foreign keys restricted
// to candidate id sets, and to-many membership clauses. It renders once
// into parameterized SQL. Equality is null-safe (`IS ?`), so a blank cell
// matches only records where the field is also empty.

use crate::error::Result;
use crate::schema::{FieldValue, Record, Table};
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Predicate {
    pub table: &'static str,
    #[serde(skip)]
    pub id_field: &'static str,
    pub filters: Record,
    /// Foreign key must be one of these ids (ambiguous to-one inside a to-many child)
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fk_in: BTreeMap<String, Vec<i64>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub to_many: Vec<ToManyClause>,
}

/// Membership with exclusion: every `records` predicate is met by some
/// child, and no child inside `scope` is left unaccounted for.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToManyClause {
    pub relationship: String,
    pub child_table: &'static str,
    /// Column on the child table pointing at the parent
    pub fk_column: &'static str,
    pub records: Vec<Predicate>,
    pub scope: Record,
}

impl Predicate {
    pub fn new(table: &Table) -> Self {
        Predicate {
            table: table.name,
            id_field: table.id_field,
            filters: Record::new(),
            fk_in: BTreeMap::new(),
            to_many: Vec::new(),
        }
    }

    /// Nothing here constrains a match: no non-null value anywhere
    pub fn is_reducible_to_nothing(&self) -> bool {
        self.filters.values().all(|v| v.is_null())
            && self.fk_in.is_empty()
            && self.to_many.iter().all(|c| c.records.is_empty())
    }

    /// Stable serialization, reported as the MatchedMultiple key
    pub fn key(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Short digest of the key, used to address the match cache
    pub fn signature(&self) -> Result<String> {
        Ok(signature_of(&self.key()?))
    }

    /// Candidate ids, lowest first, at most `limit` of them
    pub fn query(&self, conn: &Connection, limit: usize) -> Result<Vec<i64>> {
        let (sql, params) = self.to_sql(limit);
        let mut stmt = conn.prepare_cached(&sql)?;
        let ids = stmt
            .query_map(params_from_iter(params.iter()), |row| row.get(0))?
            .collect::<std::result::Result<Vec<i64>, _>>()?;
        Ok(ids)
    }

    pub fn to_sql(&self, limit: usize) -> (String, Vec<FieldValue>) {
        let mut params = Vec::new();
        let mut aliases = 0;
        let conditions = self.render("t0", &mut aliases, &mut params);
        let sql = format!(
            "SELECT t0.{id} FROM {table} t0 WHERE {conditions} ORDER BY t0.{id} LIMIT {limit}",
            id = self.id_field,
            table = self.table,
        );
        (sql, params)
    }

    fn render(&self, alias: &str, aliases: &mut usize, params: &mut Vec<FieldValue>) -> String {
        let mut clauses = Vec::new();

        for (column, value) in &self.filters {
            clauses.push(format!("{}.{} IS ?", alias, column));
            params.push(value.clone());
        }

        for (column, ids) in &self.fk_in {
            let list: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
            clauses.push(format!("{}.{} IN ({})", alias, column, list.join(", ")));
        }

        for clause in &self.to_many {
            let child_id = |a: &str| format!("{}.{}", a, clause.fk_column);

            let mut record_conditions = Vec::new();
            for record in &clause.records {
                *aliases += 1;
                let a = format!("t{}", aliases);
                let inner = record.render(&a, aliases, params);
                clauses.push(format!(
                    "EXISTS (SELECT 1 FROM {child} {a} WHERE {fk} = {alias}.{id} AND {inner})",
                    child = clause.child_table,
                    fk = child_id(&a),
                    id = self.id_field,
                ));
                record_conditions.push(record);
            }

            // No child in scope may fall outside the mapped records
            *aliases += 1;
            let a = format!("t{}", aliases);
            let mut exclusion = vec![format!("{} = {}.{}", child_id(&a), alias, self.id_field)];
            for (column, value) in &clause.scope {
                exclusion.push(format!("{}.{} IS ?", a, column));
                params.push(value.clone());
            }
            if !record_conditions.is_empty() {
                let alternatives: Vec<String> = record_conditions
                    .iter()
                    .map(|record| format!("({})", record.render(&a, aliases, params)))
                    .collect();
                exclusion.push(format!("NOT ({})", alternatives.join(" OR ")));
            }
            clauses.push(format!(
                "NOT EXISTS (SELECT 1 FROM {} {} WHERE {})",
                clause.child_table,
                a,
                exclusion.join(" AND ")
            ));
        }

        if clauses.is_empty() {
            "1 = 1".to_string()
        } else {
            clauses.join(" AND ")
        }
    }
}

pub fn signature_of(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{insert_record, setup_database};
    use crate::schema::Datamodel;

    fn text(s: &str) -> FieldValue {
        FieldValue::Text(s.to_string())
    }

    fn setup() -> (Connection, Datamodel) {
        let conn = Connection::open_in_memory().unwrap();
        let dm = Datamodel::collection_domain();
        setup_database(&conn, &dm).unwrap();
        (conn, dm)
    }

    fn agent(conn: &Connection, dm: &Datamodel, last: &str) -> i64 {
        let mut r = Record::new();
        r.insert("agenttype".to_string(), FieldValue::Integer(1));
        r.insert("lastname".to_string(), text(last));
        insert_record(conn, dm.table("agent").unwrap(), &r).unwrap()
    }

    fn event_with_collectors(conn: &Connection, dm: &Datamodel, agents: &[i64]) -> i64 {
        let mut ce = Record::new();
        ce.insert("stationfieldnumber".to_string(), text("S1"));
        let ce_id = insert_record(conn, dm.table("collectingevent").unwrap(), &ce).unwrap();
        for (i, agent_id) in agents.iter().enumerate() {
            let mut c = Record::new();
            c.insert("collectingeventid".to_string(), FieldValue::Integer(ce_id));
            c.insert("agentid".to_string(), FieldValue::Integer(*agent_id));
            c.insert("ordernumber".to_string(), FieldValue::Integer(i as i64));
            insert_record(conn, dm.table("collector").unwrap(), &c).unwrap();
        }
        ce_id
    }

    fn collector_predicate(dm: &Datamodel, agent_id: i64) -> Predicate {
        let mut p = Predicate::new(dm.table("collector").unwrap());
        p.filters.insert("agentid".to_string(), FieldValue::Integer(agent_id));
        p
    }

    fn event_predicate(dm: &Datamodel, agents: &[i64]) -> Predicate {
        let mut p = Predicate::new(dm.table("collectingevent").unwrap());
        p.filters.insert("stationfieldnumber".to_string(), text("S1"));
        p.to_many.push(ToManyClause {
            relationship: "collectors".to_string(),
            child_table: "collector",
            fk_column: "collectingeventid",
            records: agents.iter().map(|a| collector_predicate(dm, *a)).collect(),
            scope: Record::new(),
        });
        p
    }

    #[test]
    fn test_null_safe_equality() {
        let (conn, dm) = setup();
        let agent_table = dm.table("agent").unwrap();
        let id = agent(&conn, &dm, "Darwin");

        let mut p = Predicate::new(agent_table);
        p.filters.insert("lastname".to_string(), text("Darwin"));
        p.filters.insert("firstname".to_string(), FieldValue::Null);
        assert_eq!(p.query(&conn, 10).unwrap(), vec![id]);

        p.filters.insert("firstname".to_string(), text("Charles"));
        assert!(p.query(&conn, 10).unwrap().is_empty());
    }

    #[test]
    fn test_to_many_requires_set_equality() {
        let (conn, dm) = setup();
        let a = agent(&conn, &dm, "Bates");
        let b = agent(&conn, &dm, "Wallace");
        let only_a = event_with_collectors(&conn, &dm, &[a]);
        let both = event_with_collectors(&conn, &dm, &[a, b]);

        assert_eq!(event_predicate(&dm, &[a]).query(&conn, 10).unwrap(), vec![only_a]);
        assert_eq!(event_predicate(&dm, &[a, b]).query(&conn, 10).unwrap(), vec![both]);
        assert!(event_predicate(&dm, &[b]).query(&conn, 10).unwrap().is_empty());
        // No collectors mapped: only events without collectors match
        assert!(event_predicate(&dm, &[]).query(&conn, 10).unwrap().is_empty());
    }

    #[test]
    fn test_window_limits_candidates() {
        let (conn, dm) = setup();
        for _ in 0..5 {
            agent(&conn, &dm, "Smith");
        }
        let mut p = Predicate::new(dm.table("agent").unwrap());
        p.filters.insert("lastname".to_string(), text("Smith"));
        assert_eq!(p.query(&conn, 3).unwrap().len(), 3);
    }

    #[test]
    fn test_fk_in() {
        let (conn, dm) = setup();
        let a = agent(&conn, &dm, "Bates");
        let b = agent(&conn, &dm, "Wallace");
        let c = agent(&conn, &dm, "Hooker");
        event_with_collectors(&conn, &dm, &[c]);

        let mut p = Predicate::new(dm.table("collector").unwrap());
        p.fk_in.insert("agentid".to_string(), vec![a, b]);
        assert!(p.query(&conn, 10).unwrap().is_empty());
        p.fk_in.insert("agentid".to_string(), vec![a, c]);
        assert_eq!(p.query(&conn, 10).unwrap().len(), 1);
    }

    #[test]
    fn test_reducible_to_nothing() {
        let dm = Datamodel::collection_domain();
        let mut p = Predicate::new(dm.table("agent").unwrap());
        p.filters.insert("lastname".to_string(), FieldValue::Null);
        assert!(p.is_reducible_to_nothing());
        p.filters.insert("firstname".to_string(), text("Ada"));
        assert!(!p.is_reducible_to_nothing());
    }

    #[test]
    fn test_key_and_signature_stable() {
        let dm = Datamodel::collection_domain();
        let p = event_predicate(&dm, &[1, 2]);
        assert_eq!(p.key().unwrap(), p.clone().key().unwrap());
        assert_eq!(p.signature().unwrap().len(), 64);
        assert_ne!(p.signature().unwrap(), event_predicate(&dm, &[1]).signature().unwrap());
    }
}
