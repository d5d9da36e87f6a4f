// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Client configuration.

use std::time::Duration;

/// Which data source variant maintains the live channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataSourceKind {
	/// Persistent SSE channel with reconnect and backoff.
	#[default]
	Streaming,
	/// Periodic full-state fetches at a fixed interval.
	Polling,
}

/// Tunables consumed by the synchronization core.
#[derive(Debug, Clone)]
pub struct FlagsConfig {
	/// Timeout applied to identify when the caller supplies none.
	pub default_identify_timeout: Duration,
	/// Timeouts above this log an advisory warning but still proceed.
	pub high_timeout_threshold: Duration,
	/// Data source variant to run.
	pub data_source: DataSourceKind,
	/// Initial reconnect delay for the streaming source.
	pub backoff_initial: Duration,
	/// Ceiling on the reconnect delay.
	pub backoff_max: Duration,
	/// A connection healthy for at least this long resets the backoff.
	pub backoff_reset: Duration,
	/// Fetch interval for the polling source.
	pub poll_interval: Duration,
}

impl Default for FlagsConfig {
	fn default() -> Self {
		FlagsConfig {
			default_identify_timeout: Duration::from_secs(5),
			high_timeout_threshold: Duration::from_secs(15),
			data_source: DataSourceKind::Streaming,
			backoff_initial: Duration::from_secs(1),
			backoff_max: Duration::from_secs(30),
			backoff_reset: Duration::from_secs(60),
			poll_interval: Duration::from_secs(30),
		}
	}
}

/// Per-call options for identify.
#[derive(Debug, Clone, Default)]
pub struct IdentifyOptions {
	/// Overrides the configured default timeout.
	pub timeout: Option<Duration>,
}

impl IdentifyOptions {
	/// Options with an explicit timeout.
	pub fn with_timeout(timeout: Duration) -> Self {
		IdentifyOptions {
			timeout: Some(timeout),
		}
	}
}
