//! CLI surface for the ingestion pipeline and cleanse-analysis engine. The
//! thin HTTP controller layer this would normally sit behind is out of scope
//! (an external collaborator), so these subcommands drive the orchestrators
//! and services directly in-process.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use litp_ingestor::acquisition::{EnvPasswordSaltProvider, IdentityDecryptor};
use litp_ingestor::analysis::{AnalysisStrategy, ErasedStrategy};
use litp_ingestor::config::Config;
use litp_ingestor::docstore::mongo::MongoDocumentStore;
use litp_ingestor::docstore::{Collection, DocumentStore};
use litp_ingestor::errors::{Error, ConfigError};
use litp_ingestor::issues::IssueRepository;
use litp_ingestor::lock::LockService;
use litp_ingestor::model::dataset::{DatasetDefinition, DatasetRegistry};
use litp_ingestor::model::import::ImportSourceType;
use litp_ingestor::notify::{NotificationSink, NullNotificationSink, SmtpNotificationSink};
use litp_ingestor::objectstore::presign::S3Credentials;
use litp_ingestor::objectstore::s3::S3ObjectStore;
use litp_ingestor::orchestrator::cleanse_orchestrator::CleanseOrchestrator;
use litp_ingestor::orchestrator::import_orchestrator::ImportOrchestrator;
use litp_ingestor::query::Filter;
use litp_ingestor::reporting::ReportingService;
use litp_ingestor::rules::cts_rules::{CtsCarrier, SamLookupRule, SamSupportingDataRule, SAM_COLLECTION};
use litp_ingestor::rules::{Continuation, Pipeline};
use litp_ingestor::utils;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about = "Ingestion pipeline and cleanse-analysis engine for livestock-traceability reference data", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Acquisition and ingestion pipeline operations
    #[command(subcommand)]
    Import(ImportCommand),

    /// Cleanse-analysis engine operations
    #[command(subcommand)]
    Cleanse(CleanseCommand),
}

#[derive(Subcommand)]
enum ImportCommand {
    /// Start an import run (returns immediately; the pipeline runs in the background)
    Start {
        #[arg(long, value_enum, default_value = "external")]
        source_type: SourceTypeArg,
        /// Block and poll until the import reaches a terminal status
        #[arg(long)]
        wait: bool,
    },
    /// List recent import reports
    List {
        #[arg(long, default_value_t = 0)]
        skip: u64,
        #[arg(long, default_value_t = 20)]
        top: u64,
    },
    /// Show a single import report
    Show { import_id: String },
    /// List the per-file processing reports for an import
    Files {
        import_id: String,
        #[arg(long, default_value_t = 0)]
        skip: u64,
        #[arg(long, default_value_t = 50)]
        top: u64,
    },
    /// Administrative: wipe every dataset/report collection. Never run against
    /// production without an explicit operator decision.
    ClearDown {
        #[arg(long)]
        yes_i_am_sure: bool,
    },
}

#[derive(Subcommand)]
enum CleanseCommand {
    /// Start a cleanse-analysis run (returns immediately; runs in the background)
    StartAnalysis {
        /// Block and poll until the analysis reaches a terminal status
        #[arg(long)]
        wait: bool,
    },
    /// Re-presign the report URL for a past analysis operation
    RegenerateUrl { operation_id: String },
    /// List active data-quality issues
    Issues {
        #[arg(long)]
        cph: Option<String>,
        #[arg(long, default_value_t = 0)]
        skip: u64,
        #[arg(long, default_value_t = 50)]
        top: u64,
    },
    /// Send a test notification to confirm the SMTP gateway is reachable
    TestNotification { address: String },
}

#[derive(Clone, clap::ValueEnum)]
enum SourceTypeArg {
    Internal,
    External,
}

impl From<SourceTypeArg> for ImportSourceType {
    fn from(value: SourceTypeArg) -> Self {
        match value {
            SourceTypeArg::Internal => ImportSourceType::Internal,
            SourceTypeArg::External => ImportSourceType::External,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().map_err(Error::from)?;

    match cli.command {
        Commands::Import(cmd) => run_import_command(cmd, &config).await,
        Commands::Cleanse(cmd) => run_cleanse_command(cmd, &config).await,
    }
}

async fn run_import_command(cmd: ImportCommand, config: &Config) -> Result<(), Error> {
    let store: Arc<dyn DocumentStore> = Arc::new(MongoDocumentStore::connect(&config.mongo_uri, &config.mongo_database).await?);

    match cmd {
        ImportCommand::Start { source_type, wait } => {
            let source = Arc::new(build_object_store(&config.source_bucket, &config.source_prefix)?);
            let target = Arc::new(build_object_store(&config.target_bucket, &config.target_prefix)?);
            let registry = Arc::new(dataset_registry());
            let locks = Arc::new(LockService::new(store.as_ref(), config.tuning.lock_lease(), config.tuning.lock_heartbeat_interval()));
            let password_salt = Arc::new(EnvPasswordSaltProvider::from_env()?);

            let orchestrator = ImportOrchestrator::new(store.clone(), source, target, registry, Arc::new(IdentityDecryptor), password_salt, locks, config.tuning.clone());

            match orchestrator.start_import(source_type.into()).await? {
                Some(report) if wait => {
                    let service = ReportingService::new(store.as_ref());
                    let spinner = utils::new_spinner("waiting for import to complete");
                    loop {
                        let current = service.get_import(&report.id).await?.expect("import report vanished mid-run");
                        if current.status != litp_ingestor::model::import::ImportStatus::Started {
                            spinner.finish_with_message(format!("import {} finished: {:?}", current.id, current.status));
                            println!("{}", serde_json::to_string_pretty(&current).expect("ImportReport always serializes"));
                            break;
                        }
                        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                    }
                }
                Some(report) => println!("{}", serde_json::to_string_pretty(&report).expect("ImportReport always serializes")),
                None => println!("another import is already in flight; try again later"),
            }
            Ok(())
        }

        ImportCommand::List { skip, top } => {
            validate_page(skip, top)?;
            let service = ReportingService::new(store.as_ref());
            let page = service.list_imports(skip, top).await?;
            println!("{}", serde_json::to_string_pretty(&page.items).expect("import reports always serialize"));
            Ok(())
        }

        ImportCommand::Show { import_id } => {
            let service = ReportingService::new(store.as_ref());
            match service.get_import(&import_id).await? {
                Some(report) => println!("{}", serde_json::to_string_pretty(&report).expect("ImportReport always serializes")),
                None => return Err(Error::NotFound(format!("import {import_id} not found"))),
            }
            Ok(())
        }

        ImportCommand::Files { import_id, skip, top } => {
            validate_page(skip, top)?;
            let service = ReportingService::new(store.as_ref());
            let page = service.list_files_for_import(&import_id, skip, top).await?;
            println!("{}", serde_json::to_string_pretty(&page.items).expect("file processing reports always serialize"));
            Ok(())
        }

        ImportCommand::ClearDown { yes_i_am_sure } => {
            if !yes_i_am_sure {
                return Err(Error::InputInvalid("clear-down requires --yes-i-am-sure".to_string()));
            }
            store.clear_down().await?;
            println!("cleared down");
            Ok(())
        }
    }
}

async fn run_cleanse_command(cmd: CleanseCommand, config: &Config) -> Result<(), Error> {
    let store: Arc<dyn DocumentStore> = Arc::new(MongoDocumentStore::connect(&config.mongo_uri, &config.mongo_database).await?);

    match cmd {
        CleanseCommand::StartAnalysis { wait } => {
            let report_sink = Arc::new(build_object_store(&config.report_bucket, &config.report_prefix)?);
            let locks = Arc::new(LockService::new(store.as_ref(), config.tuning.lock_lease(), config.tuning.lock_heartbeat_interval()));
            let notifications = build_notification_sink(config)?;
            let strategies = vec![cts_vs_sam_strategy(store.as_ref())];

            let orchestrator = CleanseOrchestrator::new(store.clone(), report_sink, notifications, locks, strategies, config.tuning.clone());
            match orchestrator.start_analysis().await? {
                Some(operation) if wait => {
                    let operations = store.collection(litp_ingestor::orchestrator::cleanse_orchestrator::CLEANSE_OPERATIONS_COLLECTION);
                    let spinner = utils::new_spinner("waiting for cleanse analysis to complete");
                    loop {
                        let doc = operations.find_one(bson::doc! { "_id": &operation.id }).await?.expect("cleanse analysis operation vanished mid-run");
                        let current: litp_ingestor::model::cleanse::CleanseAnalysisOperation = bson::from_document(doc)?;
                        if current.status != litp_ingestor::model::cleanse::AnalysisOperationStatus::Running {
                            spinner.finish_with_message(format!("analysis {} finished: {:?}", current.id, current.status));
                            println!("{}", serde_json::to_string_pretty(&current).expect("CleanseAnalysisOperation always serializes"));
                            break;
                        }
                        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                    }
                }
                Some(operation) => println!("{}", serde_json::to_string_pretty(&operation).expect("CleanseAnalysisOperation always serializes")),
                None => println!("another cleanse analysis is already running; try again later"),
            }
            Ok(())
        }

        CleanseCommand::RegenerateUrl { operation_id } => {
            let report_sink = Arc::new(build_object_store(&config.report_bucket, &config.report_prefix)?);
            let locks = Arc::new(LockService::new(store.as_ref(), config.tuning.lock_lease(), config.tuning.lock_heartbeat_interval()));
            let notifications = build_notification_sink(config)?;
            let orchestrator = CleanseOrchestrator::new(store, report_sink, notifications, locks, Vec::new(), config.tuning.clone());
            let operation = orchestrator.regenerate_report_url(&operation_id).await?;
            println!("{}", serde_json::to_string_pretty(&operation).expect("CleanseAnalysisOperation always serializes"));
            Ok(())
        }

        CleanseCommand::Issues { cph, skip, top } => {
            validate_page(skip, top)?;
            let repo = IssueRepository::new(store.as_ref());
            let issues = repo.list_active(skip, top).await?;
            let issues: Vec<_> = match cph {
                Some(cph) => issues.into_iter().filter(|issue| issue.cph == cph).collect(),
                None => issues,
            };
            println!("{}", serde_json::to_string_pretty(&issues).expect("issues always serialize"));
            Ok(())
        }

        CleanseCommand::TestNotification { address } => {
            let notifications = build_notification_sink(config)?;
            notifications.send_test(&address).await?;
            println!("test notification sent to {address}");
            Ok(())
        }
    }
}

fn validate_page(skip: u64, top: u64) -> Result<(), Error> {
    let _ = skip;
    if top == 0 || top > 100 {
        return Err(Error::InputInvalid("top must be between 1 and 100".to_string()));
    }
    Ok(())
}

/// The reference datasets this deployment registers. A production rollout
/// would source this list from configuration; it is fixed here because the
/// shape of each dataset (primary key, change-type column) is a deployment
/// decision the spec leaves to the environment.
fn dataset_registry() -> DatasetRegistry {
    DatasetRegistry::new(vec![
        DatasetDefinition::new("KEEPERS", "LITP_KEEPERS_{0}", vec!["KEEPER_ID".into()]),
        DatasetDefinition::new("HOLDINGS", "LITP_HOLDINGS_{0}", vec!["CPH".into()]),
        DatasetDefinition::new("SAM_HOLDINGS", "LITP_SAM_HOLDINGS_{0}", vec!["CPH".into()]),
        DatasetDefinition::new("CTS_MOVEMENTS", "LITP_CTS_MOVEMENTS_{0}", vec!["MOVEMENT_ID".into()]),
    ])
}

/// The one cleanse-analysis strategy currently shipped: every CTS movement
/// must resolve to a SAM holding with supporting party/email data.
fn cts_vs_sam_strategy(store: &dyn DocumentStore) -> Arc<dyn ErasedStrategy> {
    let sam = store.collection(SAM_COLLECTION);
    Arc::new(AnalysisStrategy {
        outer_collection: "CTS_MOVEMENTS".to_string(),
        outer_filter: Filter::Empty,
        issue_codes: vec!["SAM_RECORD_MISSING".to_string()],
        pipeline: Pipeline::<CtsCarrier>::new()
            .add(Box::new(SamLookupRule { sam_collection: sam }), Continuation::ContinueAlways)
            .add(Box::new(SamSupportingDataRule), Continuation::ContinueAlways),
        build_carrier: Box::new(|doc| CtsCarrier::new(doc, "AH")),
        identifiers: Box::new(|carrier: &CtsCarrier| (carrier.cts_lid_full_identifier.clone(), carrier.cph.clone())),
        page_size: 500,
        progress_every: 500,
    })
}

fn build_object_store(bucket: &str, prefix: &str) -> Result<S3ObjectStore, Error> {
    use object_store::aws::AmazonS3Builder;

    let region = std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string());
    let endpoint = std::env::var("AWS_ENDPOINT").unwrap_or_else(|_| format!("s3.{region}.amazonaws.com"));
    let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").map_err(|_| Error::Config(ConfigError::MissingVar("AWS_ACCESS_KEY_ID".to_string())))?;
    let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").map_err(|_| Error::Config(ConfigError::MissingVar("AWS_SECRET_ACCESS_KEY".to_string())))?;

    let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket).with_region(&region);
    if let Ok(endpoint_url) = std::env::var("AWS_ENDPOINT_URL") {
        builder = builder.with_endpoint(endpoint_url);
    }
    let store = builder.build().map_err(|err| Error::InputInvalid(format!("could not build object store for bucket {bucket}: {err}")))?;

    let credentials = S3Credentials { access_key_id, secret_access_key, region };
    Ok(S3ObjectStore::new(Arc::new(store), bucket, prefix, endpoint, Some(credentials)))
}

fn build_notification_sink(config: &Config) -> Result<Arc<dyn NotificationSink>, Error> {
    if config.smtp_relay.is_empty() {
        return Ok(Arc::new(NullNotificationSink::default()));
    }
    Ok(Arc::new(SmtpNotificationSink::new(&config.smtp_relay, &config.smtp_username, &config.smtp_password, &config.notification_from, config.notification_to.clone())?))
}
