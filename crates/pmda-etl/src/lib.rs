//! PMDA ETL Engine
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Extracts PMDA regulatory datasets, reshapes them into typed rows and
//! bulk-loads them into a relational target.
//!
//! # Components
//!
//! - **Orchestrator**: per-dataset state machine driving one run end to end
//! - **Loader adapters**: native bulk ingestion with atomic full/delta apply
//! - **Run state store**: append-only run history and delta resume points
//! - **Fetcher**: on-disk cache, conditional requests, per-origin throttling
//! - **Parsers / transformers / validation**: streaming record pipeline
//!
//! # Example
//!
//! ```no_run
//! use pmda_etl::config::AppConfig;
//! use pmda_etl::engine::Engine;
//! use pmda_etl::source::RunParams;
//! use pmda_etl::state::RunMode;
//! use pmda_etl::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load("config.yaml")?;
//!     let engine = Engine::connect(config).await?;
//!     engine.init_db().await?;
//!
//!     let params = RunParams { year: Some(2024), ..Default::default() };
//!     let outcome = engine
//!         .run_dataset("approvals", Some(RunMode::Full), params, CancellationToken::new())
//!         .await?;
//!     println!("{} rows loaded", outcome.rows_loaded);
//!     Ok(())
//! }
//! ```

pub mod alert;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod loader;
pub mod orchestrator;
pub mod parse;
pub mod schema;
pub mod source;
pub mod state;
pub mod transform;
pub mod validate;

pub use error::{EtlError, Result};
pub use tokio_util::sync::CancellationToken;
