// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for the Flagsync client.

use std::time::Duration;

use flagsync_core::InvalidContextError;
use thiserror::Error;

/// Errors surfaced by the Flagsync client.
///
/// Transient network trouble (a dropped stream, a failed poll) is recovered
/// inside the data source and never reaches the caller; only invalid input,
/// an exhausted identify timeout, a supersede, or a classified-fatal
/// connection failure does.
#[derive(Debug, Error)]
pub enum FlagsError {
	/// The supplied evaluation context failed validation.
	#[error(transparent)]
	InvalidContext(#[from] InvalidContextError),

	/// identify timed out waiting for flag data. The data source keeps
	/// running; a late response still populates the store.
	#[error("identify timed out after {0:?}")]
	IdentifyTimeout(Duration),

	/// A newer identify call superseded this one. Informational, not a fault.
	#[error("identify superseded by a newer context switch")]
	Superseded,

	/// The data source failed fatally while this identify was in flight.
	#[error("connection to flag service failed: {0}")]
	ConnectionFailed(String),

	/// HTTP transport failure.
	#[error("request failed")]
	Http(#[from] reqwest::Error),

	/// The server answered with a non-success status.
	#[error("server returned status {status}: {message}")]
	ServerError {
		/// HTTP status code.
		status: u16,
		/// Response body, when readable.
		message: String,
	},

	/// A stream or snapshot payload could not be parsed.
	#[error("failed to parse payload: {0}")]
	ParseFailed(String),

	/// The SSE stream itself reported an error.
	#[error("SSE stream error: {0}")]
	SseStream(String),

	/// The client configuration was incomplete or inconsistent.
	#[error("invalid configuration: {0}")]
	Config(String),

	/// The client has been closed.
	#[error("client is closed")]
	Closed,
}

/// Convenience alias for client results.
pub type Result<T> = std::result::Result<T, FlagsError>;
