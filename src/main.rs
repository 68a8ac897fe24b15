// Collection Upload - CLI
// init → import a spreadsheet → upload (or validate) → unupload

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use collection_upload::{
    import_csv, load_dataset, open_database, set_upload_plan, unupload_dataset, upload_dataset, Collaborators,
    CollectionContext, Datamodel, RuleEngine, SqliteAuditor, SqlitePicklistService, SqliteTreeMaintenance,
    Unuploader, UploadConfig, UploadOptions, UploadPlan, Uploader,
};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(name = "collection-upload", about = "Upload spreadsheet rows into a collection database", version)]
struct Args {
    /// Database file
    #[clap(long, env = "COLLECTION_UPLOAD_DB", default_value = "collection.db")]
    db: PathBuf,

    /// Upload configuration (JSON)
    #[clap(long)]
    config: Option<PathBuf>,

    /// Uniqueness rules (JSON)
    #[clap(long)]
    rules: Option<PathBuf>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the schema
    Init,

    /// Import a CSV file as a new dataset
    Import {
        csv: PathBuf,
        #[clap(long)]
        name: String,
        #[clap(long)]
        collection: i64,
        /// Upload plan (JSON) to attach to the dataset
        #[clap(long)]
        plan: Option<PathBuf>,
    },

    /// Validate a dataset, or upload it with --commit
    Upload {
        collection_id: i64,
        dataset_id: i64,
        agent_id: i64,
        #[clap(long)]
        commit: bool,
        #[clap(long)]
        allow_partial: bool,
    },

    /// Delete everything a committed upload created
    Unupload { dataset_id: i64, agent_id: i64 },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("collection_upload=info")),
        )
        .init();

    let args = Args::parse();

    let mut conn = open_database(&args.db).with_context(|| format!("opening {}", args.db.display()))?;

    let config = match &args.config {
        Some(path) => UploadConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => UploadConfig::default(),
    };
    let rules = match &args.rules {
        Some(path) => RuleEngine::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => RuleEngine::with_defaults(),
    }
    .allow_synonymized_parents(config.allow_add_child_to_synonymized_parent);
    let datamodel = Datamodel::collection_domain();
    let collaborators = Collaborators {
        rules: &rules,
        auditor: &SqliteAuditor,
        picklists: &SqlitePicklistService,
        trees: &SqliteTreeMaintenance,
    };

    match args.command {
        Command::Init => {
            // open_database already created the schema
            println!("✓ Database ready at {}", args.db.display());
        }

        Command::Import { csv, name, collection, plan } => {
            let id = import_csv(&conn, &csv, &name, collection)
                .with_context(|| format!("importing {}", csv.display()))?;
            if let Some(path) = plan {
                let plan = UploadPlan::from_file(&path).with_context(|| format!("loading {}", path.display()))?;
                set_upload_plan(&conn, id, &plan)?;
            }
            let dataset = load_dataset(&conn, id)?;
            println!("✓ Dataset {} created with {} rows", id, dataset.rows.len());
        }

        Command::Upload { collection_id, dataset_id, agent_id, commit, allow_partial } => {
            let collection = CollectionContext::load(&conn, collection_id)
                .with_context(|| format!("loading collection {}", collection_id))?;
            let uploader = Uploader {
                datamodel: &datamodel,
                collection: &collection,
                collaborators,
                config: &config,
                agent_id,
            };
            let options = UploadOptions { no_commit: !commit, allow_partial };
            let outcome = upload_dataset(&mut conn, &uploader, dataset_id, options)
                .with_context(|| format!("uploading dataset {}", dataset_id))?;
            info!(committed = outcome.committed, aborted = outcome.aborted, "upload finished");
            println!("{}", serde_json::to_string_pretty(&outcome.results)?);
        }

        Command::Unupload { dataset_id, agent_id } => {
            let unuploader = Unuploader { datamodel: &datamodel, collaborators, agent_id };
            let summary = unupload_dataset(&mut conn, &unuploader, dataset_id)
                .with_context(|| format!("unuploading dataset {}", dataset_id))?;
            println!(
                "✓ Deleted {} records, removed {} picklist items",
                summary.deleted, summary.picklist_items_removed
            );
        }
    }

    Ok(())
}
