// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Client-side feature flag synchronization SDK.
//!
//! This crate keeps a local flag store continuously synchronized with a flag
//! service for one evaluation context at a time. Evaluations never touch the
//! network; `identify` switches contexts and resolves once the store is
//! consistent with the new context.
//!
//! # Features
//!
//! - **Context Switching**: `identify` with timeout, supersede, and
//!   generation-based cancellation semantics
//! - **Real-time Updates**: SSE streaming with reconnect and jittered backoff
//! - **Polling Fallback**: Fixed-interval full-state fetches
//! - **Local Store**: Versioned, tombstone-aware snapshot per context
//! - **Change Events**: Flag-change and connection-status listeners
//! - **Persistence Seam**: Optional snapshot cache to bridge cold starts
//!
//! # Example
//!
//! ```ignore
//! use flagsync::{EvaluationContext, FlagsClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = FlagsClient::builder()
//!         .sdk_key("sdk-key-xxx")
//!         .base_url("https://flags.example.com")
//!         .build()?;
//!
//!     // Switch to a context and wait for the store to be ready.
//!     let context = EvaluationContext::user("user123")
//!         .with_attribute("plan", serde_json::json!("enterprise"));
//!     client.identify(context).await?;
//!
//!     // Evaluate locally, instantly.
//!     let enabled = client.bool_variation("feature.new_flow", false);
//!     let theme = client.string_variation("ui.theme", "light");
//!     let all = client.all_flags();
//!
//!     Ok(())
//! }
//! ```

mod analytics;
mod backoff;
mod client;
mod config;
mod datasource;
mod emitter;
mod error;
mod persist;
mod store;

pub use analytics::{AnalyticsHook, FlagExposure, NoOpAnalyticsHook, SharedAnalyticsHook};
pub use backoff::Backoff;
pub use client::{EvaluationDetail, FlagsClient, FlagsClientBuilder};
pub use config::{DataSourceKind, FlagsConfig, IdentifyOptions};
pub use datasource::polling::PollingDataSource;
pub use datasource::streaming::StreamingDataSource;
pub use datasource::{
	DataSource, DataSourceEvent, DataSourceHandle, DataSourcePayload, EventSink,
};
pub use emitter::{EventEmitter, ListenerId};
pub use error::{FlagsError, Result};
pub use persist::{MemoryPersistence, PersistenceStore};
pub use store::FlagStore;

// Re-export core types for convenience
pub use flagsync_core::{
	CanonicalContext, CanonicalKey, ConnectionStatus, ContextAttributes, DeleteData,
	EvaluationContext, EvaluationReason, FlagSnapshot, FlagState, FlagStreamEvent, HeartbeatData,
	InvalidContextError, PatchData, PutData, StoredFlag,
};
