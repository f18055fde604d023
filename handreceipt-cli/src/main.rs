//! HandReceipt CLI
//!
//! Drives the sync core from a shell: manage the device key, create and
//! update signed property records, inspect and drain the outbox, and talk
//! to the ledger.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use handreceipt_core::audit::{self, AuditEventType, AuditLogger};
use handreceipt_core::crypto::key_manager::HYBRID_KEY_STORAGE_KEY;
use handreceipt_core::crypto::native::platform_capability;
use handreceipt_core::ledger::BATCH_STATUS_TIMEOUT;
use handreceipt_core::storage::{move_entry, platform_secret_store};
use handreceipt_core::{
    ApiClient, CreatePropertyInput, HandReceiptConfig, KeyManager, KeyValueStore, LedgerClient,
    Metadata, MetadataValue, PropertyService, PropertyStatus, PropertyUpdate, SqliteStore,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "handreceipt", about = "HandReceipt field device sync client")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "handreceipt.toml", env = "HANDRECEIPT_CONFIG")]
    config: PathBuf,

    /// API base URL override
    #[arg(long)]
    api_url: Option<String>,

    /// Database path override
    #[arg(short, long)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate (or rotate) the device signing key
    Keygen {
        /// Replace an existing key
        #[arg(long)]
        force: bool,
    },

    /// Create a signed property record
    Create {
        #[arg(long)]
        name: String,

        #[arg(long, default_value = "")]
        description: String,

        /// active, inactive or pending
        #[arg(long, default_value = "active")]
        status: String,

        /// Metadata entry as key=value (repeatable)
        #[arg(long = "meta", value_name = "KEY=VALUE")]
        metadata: Vec<String>,
    },

    /// Update a property record
    Update {
        id: String,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        description: Option<String>,

        #[arg(long)]
        status: Option<String>,

        #[arg(long = "meta", value_name = "KEY=VALUE")]
        metadata: Vec<String>,
    },

    /// Sync and print a property record
    Get { id: String },

    /// Verify the signature of a property record
    Verify { id: String },

    /// List queued sync events
    Queue,

    /// Replay queued sync events once
    Drain,

    /// Keep draining the outbox until interrupted
    Watch {
        /// Drain period in seconds (defaults to the configured interval)
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        interval: Option<u64>,
    },

    /// Submit a property record to the ledger
    LedgerSubmit {
        id: String,

        #[arg(long, default_value = "update_property")]
        action: String,
    },

    /// Show the status of a ledger batch
    LedgerStatus {
        batch_id: String,

        /// Poll until the batch is committed or invalid
        #[arg(long)]
        wait: bool,
    },

    /// Check the audit log hash chain
    AuditVerify,
}

struct Device {
    config: HandReceiptConfig,
    key_manager: Arc<KeyManager>,
    properties: PropertyService,
    audit: Option<Arc<AuditLogger>>,
}

impl Device {
    async fn open(config: HandReceiptConfig) -> Result<Self> {
        let store = Arc::new(
            SqliteStore::open(&config.storage_path)
                .with_context(|| format!("opening {}", config.storage_path.display()))?,
        );
        let api = Arc::new(ApiClient::new(&config.api_base_url, config.request_timeout())?);

        let key_store = Self::key_store(&config, store.clone()).await?;
        let mut key_manager = KeyManager::new(key_store, api.clone());
        if config.native_keys {
            if let Some(capability) = platform_capability() {
                key_manager = key_manager.with_native_capability(capability);
            }
        }
        let key_manager = Arc::new(key_manager);

        let audit = match &config.audit_log_dir {
            Some(dir) => Some(Arc::new(AuditLogger::new(dir)?)),
            None => None,
        };

        let mut properties = PropertyService::new(Arc::clone(&key_manager), api, store);
        if let Some(audit) = &audit {
            properties = properties.with_audit(Arc::clone(audit));
        }

        Ok(Self {
            config,
            key_manager,
            properties,
            audit,
        })
    }

    /// Where the signing key lives: the OS credential store when there is
    /// one, otherwise the record database.
    async fn key_store(
        config: &HandReceiptConfig,
        records: Arc<SqliteStore>,
    ) -> Result<Arc<dyn KeyValueStore>> {
        match platform_secret_store() {
            Some(secrets) if config.native_keys => {
                if move_entry(records.as_ref(), secrets.as_ref(), HYBRID_KEY_STORAGE_KEY).await? {
                    info!("Moved signing key into the OS credential store");
                }
                Ok(secrets)
            }
            _ => {
                warn!(
                    path = %config.storage_path.display(),
                    "No OS credential store in use, signing key is kept in the local database"
                );
                Ok(records)
            }
        }
    }

    fn audit(&self, event: AuditEventType, context: &str) {
        if let Some(audit) = &self.audit {
            audit.record(event, context);
        }
    }
}

fn parse_metadata(entries: &[String]) -> Result<Metadata> {
    let mut metadata = Metadata::new();
    for entry in entries {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("metadata entry '{}' is not KEY=VALUE", entry))?;
        metadata.insert(key.trim().to_string(), MetadataValue::from(value.trim()));
    }
    Ok(metadata)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(path: &Path) -> Result<HandReceiptConfig> {
    if path.exists() {
        Ok(HandReceiptConfig::load(path)?)
    } else {
        info!("No config file found, using defaults");
        Ok(HandReceiptConfig::default())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    let mut config = load_config(&cli.config)?;
    if let Some(api_url) = cli.api_url {
        config.api_base_url = api_url;
    }
    if let Some(database) = cli.database {
        config.storage_path = database;
    }

    let device = Device::open(config).await?;

    match cli.command {
        Commands::Keygen { force } => {
            let provisioned = device.key_manager.provision(force).await?;
            if provisioned.generated {
                device.audit(
                    AuditEventType::KeyGenerated {
                        native: provisioned.public.native.is_some(),
                    },
                    "",
                );
            }
            print_json(&provisioned.public)?;
        }
        Commands::Create {
            name,
            description,
            status,
            metadata,
        } => {
            device.key_manager.load_or_generate().await?;
            let record = device
                .properties
                .create_property(CreatePropertyInput {
                    name,
                    description,
                    status: PropertyStatus::parse(&status)?,
                    metadata: parse_metadata(&metadata)?,
                })
                .await?;
            print_json(&record)?;
        }
        Commands::Update {
            id,
            name,
            description,
            status,
            metadata,
        } => {
            let updates = PropertyUpdate {
                name,
                description,
                status: status.as_deref().map(PropertyStatus::parse).transpose()?,
                metadata: parse_metadata(&metadata)?,
            };
            let record = device.properties.update_property(&id, updates).await?;
            print_json(&record)?;
        }
        Commands::Get { id } => match device.properties.get_property(&id).await? {
            Some(record) => print_json(&record)?,
            None => bail!("property {} not found", id),
        },
        Commands::Verify { id } => {
            let record = device
                .properties
                .sync_service()
                .get_local_entity(&id)
                .await?
                .ok_or_else(|| anyhow!("property {} not found locally", id))?;
            let valid = device.properties.verify_property_signature(&record).await?;
            println!("{}", if valid { "valid" } else { "INVALID" });
            if !valid {
                std::process::exit(1);
            }
        }
        Commands::Queue => {
            let events = device.properties.sync_service().queue().get_events().await?;
            print_json(&events)?;
        }
        Commands::Drain => {
            if let Some(report) = device.properties.sync_service().drain().await? {
                device.audit(
                    AuditEventType::OutboxDrained {
                        completed: report.completed,
                        dropped: report.dropped,
                    },
                    "",
                );
                print_json(&report)?;
            }
        }
        Commands::Watch { interval } => {
            let period = interval
                .map(Duration::from_secs)
                .unwrap_or_else(|| device.config.sync_interval());
            let handle = device.properties.start_auto_sync(period).await?;
            info!(period_secs = period.as_secs(), "Watching outbox, Ctrl-C to stop");

            tokio::signal::ctrl_c().await?;
            if let Some(handle) = handle {
                handle.abort();
            }
            info!("Stopped");
        }
        Commands::LedgerSubmit { id, action } => {
            let record = device
                .properties
                .sync_service()
                .get_local_entity(&id)
                .await?
                .ok_or_else(|| anyhow!("property {} not found locally", id))?;
            let public = device.key_manager.load_or_generate().await?;

            let ledger =
                LedgerClient::new(&device.config.ledger_base_url, device.config.request_timeout())?;
            let batch_id = ledger
                .submit_transaction(&action, &serde_json::to_value(&record)?, &public.software)
                .await?;
            device.audit(
                AuditEventType::LedgerSubmitted {
                    batch_id: batch_id.clone(),
                },
                &id,
            );
            println!("{}", batch_id);
        }
        Commands::LedgerStatus { batch_id, wait } => {
            let ledger =
                LedgerClient::new(&device.config.ledger_base_url, device.config.request_timeout())?;
            let status = if wait {
                ledger
                    .wait_for_commit(&batch_id, Duration::from_secs(2), BATCH_STATUS_TIMEOUT)
                    .await?
            } else {
                ledger.batch_status(&batch_id).await?
            };
            print_json(&status)?;
        }
        Commands::AuditVerify => {
            let dir = device
                .config
                .audit_log_dir
                .as_ref()
                .ok_or_else(|| anyhow!("audit_log_dir is not configured"))?;
            let count = audit::verify_chain(&dir.join("audit.log"))?;
            println!("{} entries, chain intact", count);
        }
    }

    Ok(())
}
