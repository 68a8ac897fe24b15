// 🚚 Transaction controller - runs a whole batch of rows
//
// One IMMEDIATE transaction wraps the batch. With partial failure allowed,
// each row gets its own savepoint and a match-cache snapshot; a failing row
// is rolled back alone. Otherwise the first failing row aborts everything.
// Tree numbering and full names are fixed once, after the last row.

use super::bind::{bind_row, Row};
use super::cache::MatchCache;
use super::context::{Collaborators, Mode, UploadContext};
use super::disambiguation::Disambiguation;
use super::plan::UploadPlan;
use super::results::{ParseFailures, RecordResult, UploadResult};
use super::scoping::{scope_plan, CollectionContext, ScopedUploadable};
use crate::config::UploadConfig;
use crate::error::{Error, Result};
use crate::schema::Datamodel;
use rusqlite::{Connection, DropBehavior, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Linear backoff step between retries of a transient failure
const RETRY_BACKOFF_MS: u64 = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadOptions {
    /// Roll back at the end no matter what (validation)
    pub no_commit: bool,
    /// Isolate failing rows instead of aborting the batch
    pub allow_partial: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    /// One result per processed row, in input order
    pub results: Vec<UploadResult>,
    pub committed: bool,
    /// A failing row stopped the batch early
    pub aborted: bool,
}

impl BatchOutcome {
    pub fn success(&self) -> bool {
        !self.results.iter().any(|r| r.contains_failure())
    }
}

pub struct Uploader<'a> {
    pub datamodel: &'a Datamodel,
    pub collection: &'a CollectionContext,
    pub collaborators: Collaborators<'a>,
    pub config: &'a UploadConfig,
    /// Agent credited with every created record
    pub agent_id: i64,
}

impl Uploader<'_> {
    /// Upload `rows` through `plan`. `disambiguations[i]` applies to `rows[i]`.
    pub fn run(
        &self,
        conn: &mut Connection,
        plan: &UploadPlan,
        rows: &[Row],
        disambiguations: &[Option<Disambiguation>],
        options: UploadOptions,
    ) -> Result<BatchOutcome> {
        let scoped = scope_plan(conn, self.datamodel, self.collection, plan)?;
        info!(
            table = %plan.base_table_name,
            rows = rows.len(),
            no_commit = options.no_commit,
            allow_partial = options.allow_partial,
            "starting upload"
        );

        let mut cache = MatchCache::new();
        let mut results = Vec::with_capacity(rows.len());
        let mut aborted = false;

        let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        for (index, row) in rows.iter().enumerate() {
            let disambiguation = disambiguations.get(index).and_then(Option::as_ref);

            let result = if options.allow_partial {
                let snapshot = cache.clone();
                let mut savepoint = tx.savepoint()?;
                let result = self.process_row(&savepoint, &mut cache, &scoped, row, disambiguation)?;
                if result.contains_failure() {
                    savepoint.set_drop_behavior(DropBehavior::Rollback);
                    savepoint.finish()?;
                    cache = snapshot;
                    warn!(row = index, "row failed, rolled back to savepoint");
                } else {
                    savepoint.commit()?;
                }
                result
            } else {
                self.process_row(&tx, &mut cache, &scoped, row, disambiguation)?
            };

            let failed = result.contains_failure();
            results.push(result);
            if failed && !options.allow_partial {
                warn!(row = index, "row failed, aborting batch");
                aborted = true;
                break;
            }
        }

        if !aborted {
            self.fix_up_trees(&tx, &results)?;
        }

        let committed = !aborted && !options.no_commit;
        if committed {
            tx.commit()?;
        } else {
            tx.rollback()?;
        }

        let (hits, misses) = cache.stats();
        info!(
            rows = results.len(),
            failed = results.iter().filter(|r| r.contains_failure()).count(),
            committed,
            cache_hits = hits,
            cache_misses = misses,
            cache_entries = cache.len(),
            "upload finished"
        );
        Ok(BatchOutcome {
            results,
            committed,
            aborted,
        })
    }

    /// Dry-run one row, retrying when the store is busy
    pub fn validate_row(
        &self,
        conn: &mut Connection,
        plan: &UploadPlan,
        row: &Row,
        disambiguation: Option<&Disambiguation>,
    ) -> Result<UploadResult> {
        let options = UploadOptions {
            no_commit: true,
            allow_partial: false,
        };
        let rows = std::slice::from_ref(row);
        let disambiguations = [disambiguation.cloned()];

        let mut attempt: u32 = 0;
        loop {
            match self.run(conn, plan, rows, &disambiguations, options) {
                Ok(mut outcome) => {
                    return outcome
                        .results
                        .pop()
                        .ok_or_else(|| Error::InvalidInput("no row to validate".to_string()));
                }
                Err(e) if e.is_transient() && attempt < self.config.max_retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "store busy, retrying validation");
                    thread::sleep(Duration::from_millis(RETRY_BACKOFF_MS * u64::from(attempt)));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn process_row(
        &self,
        conn: &Connection,
        cache: &mut MatchCache,
        scoped: &ScopedUploadable,
        row: &Row,
        disambiguation: Option<&Disambiguation>,
    ) -> Result<UploadResult> {
        let bound = match bind_row(scoped, row, disambiguation, self.config) {
            Ok(bound) => bound,
            Err(failures) => {
                debug!(failures = failures.len(), "row failed to parse");
                return Ok(UploadResult::new(RecordResult::ParseFailures(ParseFailures { failures })));
            }
        };

        let mut ctx = UploadContext {
            conn,
            datamodel: self.datamodel,
            collaborators: self.collaborators,
            config: self.config,
            agent_id: self.agent_id,
            cache,
        };
        bound.process_row(&mut ctx, Mode::Upload)
    }

    /// Renumber and rename every tree that received new nodes
    fn fix_up_trees(&self, conn: &Connection, results: &[UploadResult]) -> Result<()> {
        let touched: BTreeSet<&str> = results
            .iter()
            .filter(|r| !r.contains_failure())
            .flat_map(|r| r.uploaded())
            .filter(|u| u.info.tree_info.is_some())
            .map(|u| u.info.table_name.as_str())
            .collect();

        for table in touched {
            let Some(treedef_id) = self.collection.treedef_for(table) else {
                continue;
            };
            self.collaborators.trees.renumber(conn, table)?;
            self.collaborators.trees.reset_full_names(conn, treedef_id, true)?;
            debug!(tree = table, "tree fixed up");
        }
        Ok(())
    }
}
