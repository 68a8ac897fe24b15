// 📊 Upload results - one tree per row, shaped like the plan
//
// Wire form: {"recordResult": {"Uploaded": {...}}, "toOne": {...},
// "toMany": {...}}, record results externally tagged. The unuploader
// reads these back, so every created id and picklist item is recorded.

use crate::parser::ParseFailure;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeInfo {
    pub rank: String,
    pub name: String,
}

/// What a result is about: table, contributing columns, tree rank
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportInfo {
    pub table_name: String,
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tree_info: Option<TreeInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PicklistAddition {
    /// Id of the new picklist item
    pub id: i64,
    pub name: String,
    pub value: String,
    /// Column the value came from
    pub caption: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Uploaded {
    pub id: i64,
    pub info: ReportInfo,
    #[serde(default)]
    pub picklist_additions: Vec<PicklistAddition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matched {
    pub id: i64,
    pub info: ReportInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedMultiple {
    pub ids: Vec<i64>,
    pub key: String,
    pub info: ReportInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NullRecord {
    pub info: ReportInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoMatch {
    pub info: ReportInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedBusinessRule {
    pub message: String,
    pub payload: serde_json::Value,
    pub info: ReportInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseFailures {
    pub failures: Vec<ParseFailure>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PropagatedFailure {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RecordResult {
    Uploaded(Uploaded),
    Matched(Matched),
    MatchedMultiple(MatchedMultiple),
    NullRecord(NullRecord),
    NoMatch(NoMatch),
    FailedBusinessRule(FailedBusinessRule),
    ParseFailures(ParseFailures),
    PropagatedFailure(PropagatedFailure),
}

impl RecordResult {
    /// Ambiguity counts: the row cannot be committed until it is resolved
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            RecordResult::MatchedMultiple(_)
                | RecordResult::NoMatch(_)
                | RecordResult::FailedBusinessRule(_)
                | RecordResult::ParseFailures(_)
                | RecordResult::PropagatedFailure(_)
        )
    }

    /// Id of the record this result stands for, if there is one
    pub fn get_id(&self) -> Option<i64> {
        match self {
            RecordResult::Uploaded(r) => Some(r.id),
            RecordResult::Matched(r) => Some(r.id),
            _ => None,
        }
    }

    pub fn info(&self) -> Option<&ReportInfo> {
        match self {
            RecordResult::Uploaded(r) => Some(&r.info),
            RecordResult::Matched(r) => Some(&r.info),
            RecordResult::MatchedMultiple(r) => Some(&r.info),
            RecordResult::NullRecord(r) => Some(&r.info),
            RecordResult::NoMatch(r) => Some(&r.info),
            RecordResult::FailedBusinessRule(r) => Some(&r.info),
            RecordResult::ParseFailures(_) | RecordResult::PropagatedFailure(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResult {
    pub record_result: RecordResult,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub to_one: BTreeMap<String, UploadResult>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub to_many: BTreeMap<String, Vec<UploadResult>>,
}

impl UploadResult {
    pub fn new(record_result: RecordResult) -> Self {
        UploadResult {
            record_result,
            to_one: BTreeMap::new(),
            to_many: BTreeMap::new(),
        }
    }

    pub fn with_to_one(mut self, to_one: BTreeMap<String, UploadResult>) -> Self {
        self.to_one = to_one;
        self
    }

    pub fn with_to_many(mut self, to_many: BTreeMap<String, Vec<UploadResult>>) -> Self {
        self.to_many = to_many;
        self
    }

    pub fn propagated(to_one: BTreeMap<String, UploadResult>) -> Self {
        UploadResult::new(RecordResult::PropagatedFailure(PropagatedFailure {})).with_to_one(to_one)
    }

    pub fn contains_failure(&self) -> bool {
        self.record_result.is_failure()
            || self.to_one.values().any(|r| r.contains_failure())
            || self.to_many.values().flatten().any(|r| r.contains_failure())
    }

    pub fn get_id(&self) -> Option<i64> {
        self.record_result.get_id()
    }

    /// Every Uploaded result in this tree, depth first
    pub fn uploaded(&self) -> Vec<&Uploaded> {
        let mut out = Vec::new();
        self.collect_uploaded(&mut out);
        out
    }

    fn collect_uploaded<'a>(&'a self, out: &mut Vec<&'a Uploaded>) {
        if let RecordResult::Uploaded(u) = &self.record_result {
            out.push(u);
        }
        for child in self.to_one.values() {
            child.collect_uploaded(out);
        }
        for child in self.to_many.values().flatten() {
            child.collect_uploaded(out);
        }
    }
}
