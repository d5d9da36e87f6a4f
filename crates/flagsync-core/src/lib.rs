// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Core types for the Flagsync client SDK.
//!
//! This crate holds the pure, I/O-free types shared across the SDK:
//! evaluation contexts and their canonicalization, per-flag state and
//! snapshots, stream wire events, and connection status. The client itself
//! (identify orchestration, data sources, flag store) lives in `flagsync`.
//!
//! # Example
//!
//! ```
//! use flagsync_core::EvaluationContext;
//!
//! // Single- and multi-kind forms of the same identity canonicalize to the
//! // same key.
//! let single = EvaluationContext::new("car", "test-car");
//! let multi = EvaluationContext::from_value(serde_json::json!({
//! 	"kind": "multi",
//! 	"car": { "key": "test-car" },
//! })).unwrap();
//!
//! let (key_a, _) = single.canonicalize().unwrap();
//! let (key_b, _) = multi.canonicalize().unwrap();
//! assert_eq!(key_a, key_b);
//! ```

pub mod context;
pub mod error;
pub mod flag;
pub mod status;
pub mod stream;

pub use context::{CanonicalContext, CanonicalKey, ContextAttributes, EvaluationContext};
pub use error::InvalidContextError;
pub use flag::{EvaluationReason, FlagSnapshot, FlagState, StoredFlag};
pub use status::ConnectionStatus;
pub use stream::{DeleteData, FlagStreamEvent, HeartbeatData, PatchData, PutData};
