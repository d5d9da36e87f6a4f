// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Wire events for live flag synchronization.
//!
//! The streaming channel delivers these over SSE; the polling channel
//! reuses [`PutData`] as the snapshot response body.
//!
//! # Events
//!
//! - `put` - Full flag state for the subscribed context
//! - `patch` - One flag changed
//! - `delete` - One flag removed
//! - `heartbeat` - Keep-alive
//!
//! # Example
//!
//! ```
//! use flagsync_core::stream::FlagStreamEvent;
//! use flagsync_core::FlagState;
//!
//! let event = FlagStreamEvent::patch(
//! 	"checkout.new_flow".to_string(),
//! 	FlagState::new(serde_json::json!(true), 12),
//! );
//! let json = serde_json::to_string(&event).unwrap();
//! assert!(json.contains(r#""event":"patch""#));
//! ```

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::flag::FlagState;

/// An event on the flag synchronization channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum FlagStreamEvent {
	/// Full state for the subscribed context, sent on connect and whenever
	/// the server decides to resynchronize.
	#[serde(rename = "put")]
	Put(PutData),

	/// Incremental update to one flag.
	#[serde(rename = "patch")]
	Patch(PatchData),

	/// Removal of one flag.
	#[serde(rename = "delete")]
	Delete(DeleteData),

	/// Connection keep-alive.
	#[serde(rename = "heartbeat")]
	Heartbeat(HeartbeatData),
}

impl FlagStreamEvent {
	/// Returns the event type name as a string.
	pub fn event_type(&self) -> &'static str {
		match self {
			FlagStreamEvent::Put(_) => "put",
			FlagStreamEvent::Patch(_) => "patch",
			FlagStreamEvent::Delete(_) => "delete",
			FlagStreamEvent::Heartbeat(_) => "heartbeat",
		}
	}

	/// Creates a put event carrying the given flags.
	pub fn put(flags: HashMap<String, FlagState>) -> Self {
		FlagStreamEvent::Put(PutData {
			flags,
			timestamp: Utc::now(),
		})
	}

	/// Creates a patch event for one flag.
	pub fn patch(flag_key: String, state: FlagState) -> Self {
		FlagStreamEvent::Patch(PatchData {
			flag_key,
			state,
			timestamp: Utc::now(),
		})
	}

	/// Creates a delete event for one flag.
	pub fn delete(flag_key: String, version: u64) -> Self {
		FlagStreamEvent::Delete(DeleteData {
			flag_key,
			version,
			timestamp: Utc::now(),
		})
	}

	/// Creates a heartbeat event.
	pub fn heartbeat() -> Self {
		FlagStreamEvent::Heartbeat(HeartbeatData {
			timestamp: Utc::now(),
		})
	}
}

/// Data for the put event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PutData {
	/// Evaluated state for every flag visible to the context.
	pub flags: HashMap<String, FlagState>,
	/// When the snapshot was generated.
	pub timestamp: DateTime<Utc>,
}

/// Data for the patch event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatchData {
	/// The flag that changed.
	pub flag_key: String,
	/// Its new state.
	pub state: FlagState,
	/// When the change occurred.
	pub timestamp: DateTime<Utc>,
}

/// Data for the delete event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeleteData {
	/// The flag that was removed.
	pub flag_key: String,
	/// Version of the delete, for replay protection.
	pub version: u64,
	/// When the removal occurred.
	pub timestamp: DateTime<Utc>,
}

/// Data for the heartbeat event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HeartbeatData {
	/// When the heartbeat was sent.
	pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_event_type() {
		assert_eq!(FlagStreamEvent::put(HashMap::new()).event_type(), "put");
		assert_eq!(
			FlagStreamEvent::patch(
				"test".to_string(),
				FlagState::new(serde_json::json!(true), 1)
			)
			.event_type(),
			"patch"
		);
		assert_eq!(
			FlagStreamEvent::delete("test".to_string(), 2).event_type(),
			"delete"
		);
		assert_eq!(FlagStreamEvent::heartbeat().event_type(), "heartbeat");
	}

	#[test]
	fn test_put_serialization() {
		let mut flags = HashMap::new();
		flags.insert(
			"checkout.new_flow".to_string(),
			FlagState::new(serde_json::json!(true), 7),
		);
		let event = FlagStreamEvent::put(flags);

		let json = serde_json::to_string(&event).unwrap();
		assert!(json.contains(r#""event":"put""#));
		assert!(json.contains(r#""checkout.new_flow""#));
		assert!(json.contains(r#""version":7"#));
	}

	#[test]
	fn test_delete_roundtrip() {
		let event = FlagStreamEvent::delete("old.flag".to_string(), 42);
		let json = serde_json::to_string(&event).unwrap();
		let parsed: FlagStreamEvent = serde_json::from_str(&json).unwrap();

		if let FlagStreamEvent::Delete(data) = parsed {
			assert_eq!(data.flag_key, "old.flag");
			assert_eq!(data.version, 42);
		} else {
			panic!("Expected Delete event");
		}
	}

	#[test]
	fn test_patch_roundtrip() {
		let state = FlagState::new(serde_json::json!("treatment"), 3);
		let event = FlagStreamEvent::patch("exp.variant".to_string(), state.clone());
		let json = serde_json::to_string(&event).unwrap();
		let parsed: FlagStreamEvent = serde_json::from_str(&json).unwrap();

		if let FlagStreamEvent::Patch(data) = parsed {
			assert_eq!(data.flag_key, "exp.variant");
			assert_eq!(data.state, state);
		} else {
			panic!("Expected Patch event");
		}
	}
}
