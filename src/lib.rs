//! GTFS-realtime vehicle position ingestion library.
//!
//! This library provides functionality to:
//! - Fetch vehicle position snapshots from a transit operator's feed
//! - Decode the GTFS-realtime protobuf envelope
//! - Fingerprint entities and drop observations already emitted
//! - Index changed observations into Elasticsearch with bulk writes
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐    ┌─────────────┐    ┌─────────────┐    ┌─────────────┐
//! │   Client    │───▶│  Protocol   │───▶│   Dedup     │───▶│   Indexer   │
//! │   (HTTP)    │    │  (Decoder)  │    │ (Seen set)  │    │   (Bulk)    │
//! └─────────────┘    └─────────────┘    └─────────────┘    └─────────────┘
//!        │                                     │                  │
//!        └─────────────────────┬───────────────┴──────────────────┘
//!                              ▼
//!                      ┌─────────────┐
//!                      │  Scheduler  │
//!                      │ (Poll loop) │
//!                      └─────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use transitgaze::{
//!     client::{FeedClient, FeedClientConfig},
//!     dedup::Deduplicator,
//!     indexer::{Credentials, ElasticsearchConfig, ElasticsearchIndexer},
//!     scheduler::{Scheduler, SchedulerConfig},
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = FeedClient::new(FeedClientConfig::new(
//!         "https://api.wmata.com/gtfs/rail-gtfsrt-vehiclepositions.pb".to_string(),
//!         "api_key".to_string(),
//!     ))?;
//!
//!     let indexer = ElasticsearchIndexer::new(
//!         ElasticsearchConfig::new(
//!             "http://localhost:9200".to_string(),
//!             "vehicle-positions".to_string(),
//!         )
//!         .with_credentials(Credentials::ApiKey("key".to_string())),
//!     )?;
//!
//!     let mut scheduler = Scheduler::new(
//!         client,
//!         indexer,
//!         Deduplicator::in_memory(),
//!         SchedulerConfig::default(),
//!     );
//!
//!     // Poll until cancelled
//!     scheduler.run(CancellationToken::new()).await;
//!
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod dedup;
pub mod gtfs;
pub mod hasher;
pub mod indexer;
pub mod protocol;
pub mod scheduler;
pub mod storage;
pub mod transform;
pub mod types;

pub use client::{FeedClient, FeedClientConfig, FeedSource};
pub use config::Config;
pub use dedup::{Deduplicator, MemorySeenStore, SeenStore};
pub use hasher::{fingerprint, Fingerprint};
pub use indexer::{BatchResult, ElasticsearchIndexer, Indexer};
pub use protocol::{decode, DecodedFeed};
pub use scheduler::{CycleReport, DeliveryMode, Scheduler, SchedulerConfig, SchedulerState};
pub use storage::JournalSeenStore;
pub use transform::OutputDocument;
pub use types::VehiclePositionEntity;
