// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Evaluation contexts and canonicalization.
//!
//! A context identifies who or what flags are evaluated against. Callers may
//! supply either a single-kind context (`{kind, key, ...attributes}`) or a
//! multi-kind context (`{kind: "multi", <kind>: {...}, ...}`). Before any
//! synchronization happens the context is canonicalized: single-kind contexts
//! are rewritten into the multi-kind representation, kinds are ordered
//! lexicographically, and a stable [`CanonicalKey`] is derived. Downstream
//! code only ever sees the canonical form.
//!
//! # Example
//!
//! ```
//! use flagsync_core::EvaluationContext;
//!
//! let ctx = EvaluationContext::new("user", "user123")
//! 	.with_attribute("plan", serde_json::json!("enterprise"));
//!
//! let (key, canonical) = ctx.canonicalize().unwrap();
//! assert_eq!(key.as_str(), "user123");
//! assert!(canonical.get("user").is_some());
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::InvalidContextError;

/// The reserved word that introduces a multi-kind context.
const MULTI_KIND: &str = "multi";

/// The reserved attribute name that carries the kind discriminator.
const KIND_ATTR: &str = "kind";

/// Attributes attached to one kind within a context.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContextAttributes {
	/// The key identifying this kind's subject. Must be non-empty.
	pub key: String,
	/// Whether the subject is anonymous.
	pub anonymous: bool,
	/// Arbitrary additional attributes, ordered by name.
	pub attributes: BTreeMap<String, Value>,
}

impl ContextAttributes {
	/// Creates attributes for the given key.
	pub fn new(key: impl Into<String>) -> Self {
		ContextAttributes {
			key: key.into(),
			anonymous: false,
			attributes: BTreeMap::new(),
		}
	}

	fn to_json(&self) -> Value {
		let mut map = serde_json::Map::new();
		map.insert("key".to_string(), Value::String(self.key.clone()));
		if self.anonymous {
			map.insert("anonymous".to_string(), Value::Bool(true));
		}
		for (name, value) in &self.attributes {
			map.insert(name.clone(), value.clone());
		}
		Value::Object(map)
	}

	fn from_json(map: &serde_json::Map<String, Value>) -> Result<Self, InvalidContextError> {
		let key = match map.get("key") {
			Some(Value::String(s)) => s.clone(),
			Some(_) => {
				return Err(InvalidContextError::Malformed(
					"\"key\" must be a string".to_string(),
				))
			}
			None => String::new(),
		};
		let anonymous = matches!(map.get("anonymous"), Some(Value::Bool(true)));
		let mut attributes = BTreeMap::new();
		for (name, value) in map {
			if name == "key" || name == "anonymous" || name == KIND_ATTR {
				continue;
			}
			attributes.insert(name.clone(), value.clone());
		}
		Ok(ContextAttributes {
			key,
			anonymous,
			attributes,
		})
	}
}

/// A caller-supplied evaluation context, before canonicalization.
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluationContext {
	/// A context with exactly one kind.
	Single {
		/// The kind name, e.g. `"user"` or `"org"`.
		kind: String,
		/// The key and attributes for that kind.
		attrs: ContextAttributes,
	},
	/// A context spanning multiple kinds, keyed by kind name.
	Multi(BTreeMap<String, ContextAttributes>),
}

impl EvaluationContext {
	/// Creates a single-kind context.
	pub fn new(kind: impl Into<String>, key: impl Into<String>) -> Self {
		EvaluationContext::Single {
			kind: kind.into(),
			attrs: ContextAttributes::new(key),
		}
	}

	/// Creates a single-kind context of the default `user` kind.
	pub fn user(key: impl Into<String>) -> Self {
		EvaluationContext::new("user", key)
	}

	/// Combines several contexts into one multi-kind context.
	///
	/// Single-kind parts contribute their kind directly; multi-kind parts are
	/// flattened. Later parts win on kind collision.
	pub fn multi<I: IntoIterator<Item = EvaluationContext>>(parts: I) -> Self {
		let mut kinds = BTreeMap::new();
		for part in parts {
			match part {
				EvaluationContext::Single { kind, attrs } => {
					kinds.insert(kind, attrs);
				}
				EvaluationContext::Multi(map) => {
					kinds.extend(map);
				}
			}
		}
		EvaluationContext::Multi(kinds)
	}

	/// Adds an attribute. No-op on a multi-kind context; attach attributes to
	/// the individual parts before combining instead.
	pub fn with_attribute(mut self, name: impl Into<String>, value: Value) -> Self {
		if let EvaluationContext::Single { ref mut attrs, .. } = self {
			attrs.attributes.insert(name.into(), value);
		}
		self
	}

	/// Marks the subject as anonymous. No-op on a multi-kind context.
	pub fn with_anonymous(mut self, anonymous: bool) -> Self {
		if let EvaluationContext::Single { ref mut attrs, .. } = self {
			attrs.anonymous = anonymous;
		}
		self
	}

	/// Parses a context from its JSON representation.
	///
	/// `{"kind": "multi", ...}` selects the multi-kind shape; any other kind
	/// value selects the single-kind shape. Structural problems surface as
	/// [`InvalidContextError::Malformed`]; semantic problems (empty keys,
	/// reserved kinds) are deferred to [`EvaluationContext::canonicalize`].
	pub fn from_value(value: Value) -> Result<Self, InvalidContextError> {
		let map = match value {
			Value::Object(map) => map,
			other => {
				return Err(InvalidContextError::Malformed(format!(
					"expected an object, got {other}"
				)))
			}
		};
		let kind = match map.get(KIND_ATTR) {
			Some(Value::String(s)) => s.clone(),
			Some(_) => {
				return Err(InvalidContextError::Malformed(
					"\"kind\" must be a string".to_string(),
				))
			}
			None => {
				return Err(InvalidContextError::Malformed(
					"context is missing \"kind\"".to_string(),
				))
			}
		};

		if kind == MULTI_KIND {
			let mut kinds = BTreeMap::new();
			for (name, value) in &map {
				if name == KIND_ATTR {
					continue;
				}
				let nested = match value {
					Value::Object(nested) => nested,
					_ => {
						return Err(InvalidContextError::Malformed(format!(
							"kind \"{name}\" must be an object"
						)))
					}
				};
				kinds.insert(name.clone(), ContextAttributes::from_json(nested)?);
			}
			Ok(EvaluationContext::Multi(kinds))
		} else {
			Ok(EvaluationContext::Single {
				kind,
				attrs: ContextAttributes::from_json(&map)?,
			})
		}
	}

	/// Validates this context and rewrites it into the canonical multi-kind
	/// form, deriving the stable [`CanonicalKey`].
	///
	/// Fails when any kind's key is empty, when a kind is named `"kind"`,
	/// when a kind name contains characters outside `[A-Za-z0-9._-]`, or when
	/// a multi-kind context has zero kinds. Pure: no side effects, no I/O.
	pub fn canonicalize(self) -> Result<(CanonicalKey, CanonicalContext), InvalidContextError> {
		let kinds = match self {
			EvaluationContext::Single { kind, attrs } => {
				if kind == MULTI_KIND {
					return Err(InvalidContextError::Malformed(
						"single-kind context cannot use the kind \"multi\"".to_string(),
					));
				}
				let mut map = BTreeMap::new();
				map.insert(kind, attrs);
				map
			}
			EvaluationContext::Multi(map) => map,
		};

		if kinds.is_empty() {
			return Err(InvalidContextError::NoKinds);
		}
		for (kind, attrs) in &kinds {
			validate_kind(kind)?;
			if attrs.key.is_empty() {
				return Err(InvalidContextError::EmptyKey(kind.clone()));
			}
		}

		let canonical = CanonicalContext { kinds };
		let key = canonical.derive_key();
		Ok((key, canonical))
	}
}

fn validate_kind(kind: &str) -> Result<(), InvalidContextError> {
	if kind == KIND_ATTR {
		return Err(InvalidContextError::ReservedKind);
	}
	let valid = !kind.is_empty()
		&& kind
			.chars()
			.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
	if !valid {
		return Err(InvalidContextError::InvalidKindName(kind.to_string()));
	}
	Ok(())
}

impl Serialize for EvaluationContext {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		match self {
			EvaluationContext::Single { kind, attrs } => {
				let mut json = match attrs.to_json() {
					Value::Object(map) => map,
					_ => unreachable!("to_json always yields an object"),
				};
				json.insert(KIND_ATTR.to_string(), Value::String(kind.clone()));
				json.serialize(serializer)
			}
			EvaluationContext::Multi(kinds) => {
				let mut map = serializer.serialize_map(Some(kinds.len() + 1))?;
				map.serialize_entry(KIND_ATTR, MULTI_KIND)?;
				for (kind, attrs) in kinds {
					map.serialize_entry(kind, &attrs.to_json())?;
				}
				map.end()
			}
		}
	}
}

impl<'de> Deserialize<'de> for EvaluationContext {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let value = Value::deserialize(deserializer)?;
		EvaluationContext::from_value(value).map_err(serde::de::Error::custom)
	}
}

/// A validated context in canonical multi-kind form.
///
/// Kinds are held in lexicographic order; equivalent contexts supplied with
/// kinds in different orders compare equal and serialize identically.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalContext {
	kinds: BTreeMap<String, ContextAttributes>,
}

impl CanonicalContext {
	/// Iterates the kind names in lexicographic order.
	pub fn kinds(&self) -> impl Iterator<Item = &str> {
		self.kinds.keys().map(String::as_str)
	}

	/// Looks up the attributes for one kind.
	pub fn get(&self, kind: &str) -> Option<&ContextAttributes> {
		self.kinds.get(kind)
	}

	/// Number of kinds in this context.
	pub fn kind_count(&self) -> usize {
		self.kinds.len()
	}

	/// Derives the stable cache key for this context.
	pub fn derive_key(&self) -> CanonicalKey {
		// Lone user-kind contexts keep the bare key for compactness; the
		// escaping keeps multi-kind keys unambiguous.
		if self.kinds.len() == 1 {
			if let Some(attrs) = self.kinds.get("user") {
				return CanonicalKey(escape_key(&attrs.key));
			}
		}
		let joined = self
			.kinds
			.iter()
			.map(|(kind, attrs)| format!("{kind}:{}", escape_key(&attrs.key)))
			.collect::<Vec<_>>()
			.join(":");
		CanonicalKey(joined)
	}
}

impl Serialize for CanonicalContext {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		let mut map = serializer.serialize_map(Some(self.kinds.len() + 1))?;
		map.serialize_entry(KIND_ATTR, MULTI_KIND)?;
		for (kind, attrs) in &self.kinds {
			map.serialize_entry(kind, &attrs.to_json())?;
		}
		map.end()
	}
}

fn escape_key(key: &str) -> String {
	key.replace('%', "%25").replace(':', "%3A")
}

/// Stable string identity for a canonical context, used to partition the
/// flag store and any persisted cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanonicalKey(String);

impl CanonicalKey {
	/// The key as a string slice.
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for CanonicalKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}
