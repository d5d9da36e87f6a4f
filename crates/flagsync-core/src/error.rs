// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Error types for context validation.

use thiserror::Error;

/// Errors produced while validating and canonicalizing an evaluation context.
///
/// These fail fast: no synchronization generation is consumed when a context
/// is rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidContextError {
	/// A context kind was supplied with an empty key.
	#[error("context kind \"{0}\" has an empty key")]
	EmptyKey(String),

	/// `"kind"` is reserved and cannot name a context kind.
	#[error("\"kind\" is reserved and cannot be used as a context kind")]
	ReservedKind,

	/// Context kind names are restricted to `[A-Za-z0-9._-]`.
	#[error("context kind \"{0}\" contains invalid characters")]
	InvalidKindName(String),

	/// A multi-kind context must carry at least one kind.
	#[error("multi-kind context must contain at least one kind")]
	NoKinds,

	/// The context JSON did not match either the single- or multi-kind shape.
	#[error("malformed context: {0}")]
	Malformed(String),
}
