// Collection Upload - Core Library
// Spreadsheet rows → matched or created records in a collection database.
// Exposes all modules for use in the CLI and tests.

pub mod audit;      // Audit log collaborator
pub mod config;     // Upload configuration
pub mod db;         // Store setup and record helpers
pub mod error;
pub mod parser;     // Cell → typed value
pub mod picklist;   // Controlled vocabularies
pub mod rules;      // Business rules collaborator
pub mod schema;     // Datamodel: tables, fields, relationships
pub mod tree;       // Tree definitions and maintenance
pub mod upload;     // Plan, matching, upload, unupload
pub mod workbench;  // Stored datasets

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use audit::{Auditor, SqliteAuditor};
pub use config::UploadConfig;
pub use db::{open_database, setup_database, Event};
pub use error::{Error, Result};
pub use parser::{parse_column, ParseFailure, ParseResult};
pub use picklist::{Picklist, PicklistService, SqlitePicklistService};
pub use rules::{BusinessRuleException, RuleAction, RuleChecker, RuleEngine, UniquenessRule};
pub use schema::{Datamodel, FieldValue, Record, Table};
pub use tree::{SqliteTreeMaintenance, TreeMaintenance};
pub use upload::{
    BatchOutcome, Collaborators, CollectionContext, Disambiguation, RecordResult, Row, UnuploadSummary,
    Unuploader, UploadOptions, UploadPlan, UploadResult, Uploader,
};
pub use workbench::{
    create_dataset, import_csv, load_dataset, set_row_disambiguation, set_upload_plan, unupload_dataset,
    upload_dataset, Dataset, UploadStatus,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
