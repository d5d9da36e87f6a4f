// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Exposure hook for flag evaluations.
//!
//! Flags delivered with `track_events` set should have their evaluations
//! reported for experiment analysis. The SDK's responsibility ends at
//! queuing: it hands a [`FlagExposure`] to the registered [`AnalyticsHook`]
//! and moves on. Transmission, batching, and retry belong to the hook
//! implementation.
//!
//! # Example
//!
//! ```ignore
//! use flagsync::{AnalyticsHook, FlagExposure, FlagsClient};
//! use async_trait::async_trait;
//!
//! struct QueueingHook { /* your event pipeline */ }
//!
//! #[async_trait]
//! impl AnalyticsHook for QueueingHook {
//! 	async fn on_flag_evaluated(&self, exposure: FlagExposure) {
//! 		// enqueue for batch transmission
//! 	}
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Data captured when a tracked flag is evaluated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagExposure {
	/// The key of the evaluated flag.
	pub flag_key: String,

	/// The value that was served.
	pub value: Value,

	/// Canonical key of the context the evaluation ran against.
	pub context_key: String,

	/// The evaluation reason, included only when the flag was delivered
	/// with `track_reason` set.
	pub reason: Option<String>,

	/// When the evaluation happened.
	pub timestamp: DateTime<Utc>,
}

impl FlagExposure {
	/// Creates an exposure record.
	pub fn new(
		flag_key: impl Into<String>,
		value: Value,
		context_key: impl Into<String>,
		reason: Option<String>,
	) -> Self {
		FlagExposure {
			flag_key: flag_key.into(),
			value,
			context_key: context_key.into(),
			reason,
			timestamp: Utc::now(),
		}
	}
}

/// Trait for receiving flag evaluation exposures.
///
/// Called after each evaluation of a tracked flag. Implementations should be
/// fast and non-blocking; queue for batch sending rather than performing
/// network I/O inline, and never let a failure propagate back into flag
/// evaluation.
#[async_trait]
pub trait AnalyticsHook: Send + Sync + 'static {
	/// Called after a tracked flag is evaluated.
	async fn on_flag_evaluated(&self, exposure: FlagExposure);
}

/// Type alias for a shared analytics hook.
pub type SharedAnalyticsHook = Arc<dyn AnalyticsHook>;

/// A no-op hook that discards all exposures. Used when no analytics
/// integration is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpAnalyticsHook;

#[async_trait]
impl AnalyticsHook for NoOpAnalyticsHook {
	async fn on_flag_evaluated(&self, _exposure: FlagExposure) {}
}
