//! # Laguna Sync
//!
//! Offline-first sync runtime for the KameHouseLaguna app.
//!
//! Wraps the deterministic [`laguna_engine::Replica`] in a tokio runtime:
//! local writes apply immediately and are pushed in the background, remote
//! changes stream in per collection, and observers get a live, coalescing
//! view of everything applied. State survives restarts in a single JSON
//! snapshot file.
//!
//! ```ignore
//! let session = Session::sign_in_new_device("user-1", token);
//! let gateway = Arc::new(MemoryGateway::new(session.clone()));
//! let engine = SyncEngine::start(&config, default_schema(), session, gateway).await?;
//!
//! let mut figuras = engine.observe_collection(schema::FIGURAS);
//! engine.create(schema::FIGURAS, "goku", fields).await?;
//! let change = figuras.next().await;
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod feed;
pub mod gateway;
pub mod schema;
pub mod session;
pub mod storage;

pub use config::{ConfigError, SyncConfig};
pub use engine::{Listing, StartupReport, StoppedSubscriptions, SyncEngine};
pub use error::{Result, SyncError};
pub use feed::{ChangeFeed, Observer};
pub use gateway::{GatewayError, MemoryGateway, RemoteGateway};
pub use schema::default_schema;
pub use session::Session;
pub use storage::FileStorage;

pub use laguna_engine;
