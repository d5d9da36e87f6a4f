// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-flag state as delivered by the flag service.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The evaluated state of one flag for one context.
///
/// Versions are monotonically non-decreasing per flag per context; an update
/// carrying a version less than or equal to the stored one is ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlagState {
	/// The evaluated value.
	pub value: Value,
	/// Server-assigned version for replay protection.
	pub version: u64,
	/// Index of the variation that was served, when known.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub variation_index: Option<u32>,
	/// Why this value was served.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reason: Option<EvaluationReason>,
	/// Whether evaluations of this flag should be reported as exposures.
	#[serde(default)]
	pub track_events: bool,
	/// Whether the evaluation reason should accompany exposure reports.
	#[serde(default)]
	pub track_reason: bool,
}

impl FlagState {
	/// Creates a flag state with just a value and version.
	pub fn new(value: Value, version: u64) -> Self {
		FlagState {
			value,
			version,
			variation_index: None,
			reason: None,
			track_events: false,
			track_reason: false,
		}
	}
}

/// Why a flag evaluated to its value.
///
/// The evaluation algorithm itself runs server-side; the reason is carried
/// through for diagnostics and exposure reporting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EvaluationReason {
	/// The flag was off.
	Off,
	/// No rule matched; the fallthrough value was served.
	Fallthrough,
	/// The context key was individually targeted.
	TargetMatch,
	/// A targeting rule matched.
	RuleMatch {
		/// Index of the matching rule.
		#[serde(default, skip_serializing_if = "Option::is_none")]
		rule_index: Option<u32>,
		/// Identifier of the matching rule.
		#[serde(default, skip_serializing_if = "Option::is_none")]
		rule_id: Option<String>,
	},
	/// Evaluation failed; the default was served.
	Error {
		/// Classification of the failure.
		error_kind: String,
	},
}

impl EvaluationReason {
	/// The reason kind as it appears on the wire.
	pub fn kind(&self) -> &'static str {
		match self {
			EvaluationReason::Off => "OFF",
			EvaluationReason::Fallthrough => "FALLTHROUGH",
			EvaluationReason::TargetMatch => "TARGET_MATCH",
			EvaluationReason::RuleMatch { .. } => "RULE_MATCH",
			EvaluationReason::Error { .. } => "ERROR",
		}
	}
}

/// One slot in a flag snapshot: either live state or a tombstone left by a
/// delete so that replayed updates with stale versions stay ignored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "slot", rename_all = "lowercase")]
pub enum StoredFlag {
	/// A live flag.
	Active(FlagState),
	/// A deleted flag, remembered by version only.
	Tombstone {
		/// Version of the delete.
		version: u64,
	},
}

impl StoredFlag {
	/// The version guarding this slot.
	pub fn version(&self) -> u64 {
		match self {
			StoredFlag::Active(state) => state.version,
			StoredFlag::Tombstone { version } => *version,
		}
	}

	/// The live state, if not tombstoned.
	pub fn state(&self) -> Option<&FlagState> {
		match self {
			StoredFlag::Active(state) => Some(state),
			StoredFlag::Tombstone { .. } => None,
		}
	}
}

/// A full flag snapshot for one canonical context, keyed by flag key.
pub type FlagSnapshot = BTreeMap<String, StoredFlag>;
