// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Connection health reported by a data source.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Health of the live connection to the flag service.
///
/// `Off` is terminal for a data source instance; recovery requires starting
/// a new instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
	/// A connection has not yet been established.
	Initializing,
	/// The connection is healthy and delivering updates.
	Valid,
	/// The connection dropped; the data source is retrying.
	Interrupted,
	/// The data source has stopped permanently.
	Off,
}

impl ConnectionStatus {
	/// Whether this status is terminal for the data source instance.
	pub fn is_terminal(&self) -> bool {
		matches!(self, ConnectionStatus::Off)
	}
}

impl fmt::Display for ConnectionStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			ConnectionStatus::Initializing => "initializing",
			ConnectionStatus::Valid => "valid",
			ConnectionStatus::Interrupted => "interrupted",
			ConnectionStatus::Off => "off",
		};
		f.write_str(s)
	}
}
