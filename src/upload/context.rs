// 🧰 Upload context - what every bound node needs while processing a row
//
// Collaborators are passed in explicitly and threaded through the
// recursion; nothing is looked up from global state.

use super::cache::MatchCache;
use super::predicate::signature_of;
use crate::audit::Auditor;
use crate::config::UploadConfig;
use crate::db::insert_record;
use crate::error::{Error, Result};
use crate::picklist::PicklistService;
use crate::rules::{BusinessRuleException, RuleAction, RuleChecker};
use crate::schema::{Datamodel, Record, Table};
use crate::tree::TreeMaintenance;
use rusqlite::Connection;
use tracing::debug;

#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub rules: &'a dyn RuleChecker,
    pub auditor: &'a dyn Auditor,
    pub picklists: &'a dyn PicklistService,
    pub trees: &'a dyn TreeMaintenance,
}

/// How far a node may go when nothing matches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Create what is missing
    Upload,
    /// Never write; absence is reported as NoMatch
    MatchOnly,
}

pub struct UploadContext<'a> {
    pub conn: &'a Connection,
    pub datamodel: &'a Datamodel,
    pub collaborators: Collaborators<'a>,
    pub config: &'a UploadConfig,
    /// Agent credited in the audit log
    pub agent_id: i64,
    pub cache: &'a mut MatchCache,
}

impl UploadContext<'_> {
    /// Run `query` unless the cache already knows the answer for `key`
    pub fn cached_query<F>(&mut self, table: &str, key: &str, query: F) -> Result<Vec<i64>>
    where
        F: FnOnce(&Connection) -> Result<Vec<i64>>,
    {
        let signature = signature_of(key);
        if let Some(ids) = self.cache.get(table, &signature) {
            return Ok(ids);
        }
        let ids = query(self.conn)?;
        self.cache.insert(table, &signature, ids.clone());
        Ok(ids)
    }

    /// Business rule verdict; store errors still propagate
    pub fn check_rules(
        &self,
        table: &Table,
        action: RuleAction,
        id: Option<i64>,
        record: &Record,
    ) -> Result<Option<BusinessRuleException>> {
        match self.collaborators.rules.check(self.conn, table, action, id, record) {
            Ok(()) => Ok(None),
            Err(Error::BusinessRule(e)) => {
                debug!(table = table.name, message = %e.message, "business rule failed");
                Ok(Some(e))
            }
            Err(e) => Err(e),
        }
    }

    /// Insert, audit, and refresh the match cache
    pub fn create_record(&mut self, table: &Table, record: &Record, match_key: Option<&str>) -> Result<i64> {
        let id = insert_record(self.conn, table, record)?;
        self.collaborators
            .auditor
            .insert(self.conn, table.name, id, self.agent_id, record)?;
        let signature = match_key.map(signature_of);
        self.cache
            .record_created(self.datamodel, table.name, signature.as_deref(), id);
        debug!(table = table.name, id, "created record");
        Ok(id)
    }
}
