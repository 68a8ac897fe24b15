// ⬆️ Upload engine
//
// plan      → declarative mapping from spreadsheet columns to tables
// scoping   → plan resolved against the datamodel and one collection
// bind      → scoped plan + one row = parsed, bound tree
// predicate → match queries, including to-many set equality
// upload_table / tree_record → match-or-create per bound node
// batch     → transactions, savepoints, tree fix-up
// unupload  → exact inverse of a committed upload

pub mod batch;
pub mod bind;
pub mod cache;
pub mod context;
pub mod disambiguation;
pub mod plan;
pub mod predicate;
pub mod results;
pub mod scoping;
pub mod tree_record;
pub mod unupload;
pub mod upload_table;

pub use batch::{BatchOutcome, UploadOptions, Uploader};
pub use bind::Row;
pub use cache::MatchCache;
pub use context::{Collaborators, Mode};
pub use disambiguation::Disambiguation;
pub use plan::{ColumnSpec, MatchBehavior, UploadPlan, Uploadable};
pub use predicate::Predicate;
pub use results::{RecordResult, UploadResult};
pub use scoping::{scope_plan, CollectionContext};
pub use unupload::{UnuploadSummary, Unuploader};
