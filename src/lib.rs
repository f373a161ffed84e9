//! The record/segment export core of a scientific data-record store.
//!
//! The store holds immutable versioned records in named series; each record
//! owns segments whose payloads are N-dimensional numeric arrays in one of
//! several on-disk container formats. This crate is the machinery that gets
//! them out: the bidirectional FITS bridge, the protocol-dispatched segment
//! I/O engine, the request scheduler that turns queue rows into a two-stage
//! script pipeline, and the streaming USTAR writer that carries the
//! exported files on a single forward pass.
//!
//! The store's record/link internals, the SQL catalog, the storage-unit
//! allocator, and the batch system are external collaborators: they appear
//! here as traits (`Catalog`, `StorageAllocator`, `LegacyReader`) and as
//! emitted shell text, never as implementations.

use std::path::PathBuf;

use anyhow::Result;

pub mod array;
pub mod bridge;
pub mod catalog;
pub mod error;
pub mod exporter;
pub mod filename;
pub mod fits;
pub mod keyword;
pub mod record;
pub mod recset;
pub mod request;
pub mod scheduler;
pub mod scripts;
pub mod segment;
pub mod tar;
pub mod tee;
pub mod timefmt;
pub mod types;
pub mod vds;

use bridge::KeyMapRegistry;
use catalog::Catalog;
use scheduler::Scheduler;
use segment::LegacyHandle;
use vds::VdsCache;

/// Connection and path configuration, captured from the environment the
/// way the emitted scripts will see it.
#[derive(Debug, Clone)]
pub struct ExportConfig {
    pub db_host: String,
    pub db_main_host: String,
    pub db_name: String,
    pub db_user: String,
    pub export_root: PathBuf,
    /// The batch system's submission command line.
    pub submit_cmd: String,
}

impl ExportConfig {
    pub fn from_env() -> ExportConfig {
        let var = |name: &str, default: &str| {
            std::env::var(name).unwrap_or_else(|_| default.to_owned())
        };

        let db_host = var("JSOC_DBHOST", "localhost");
        ExportConfig {
            db_main_host: var("JSOC_DBMAINHOST", &db_host),
            db_name: var("JSOC_DBNAME", "jsoc"),
            db_user: var("JSOC_DBUSER", "production"),
            export_root: PathBuf::from(var("JSOCROOT_EXPORT", ".")),
            submit_cmd: var("JSOC_QSUBCMD", "qsub"),
            db_host,
        }
    }
}

/// Shared context for one export process: configuration, the catalog
/// connection, the keyword-map classes, and the (process-local) container
/// handle cache.
pub struct ExportServices {
    pub config: ExportConfig,
    pub catalog: Box<dyn Catalog>,
    pub registry: KeyMapRegistry,
    pub vds: VdsCache<LegacyHandle>,
}

impl ExportServices {
    /// Create the context and set up logging.
    pub fn init(catalog: Box<dyn Catalog>) -> Result<Self> {
        // route log-emitting dependencies into tracing; ignore double init
        // so embedding programs can set their own subscriber first
        let _ = tracing_log::LogTracer::init();
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_target(false)
            .try_init();

        Ok(ExportServices {
            config: ExportConfig::from_env(),
            catalog,
            registry: KeyMapRegistry::new(),
            vds: VdsCache::default(),
        })
    }

    /// A scheduler over this context's catalog and configuration.
    pub fn scheduler(&self) -> Scheduler<'_> {
        Scheduler::new(self.catalog.as_ref(), &self.config)
    }
}
