// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! In-memory flag store for the active context.
//!
//! Exactly one snapshot is active at a time. It is replaced by a single
//! writer (the orchestrator, via the data source callbacks it owns) and read
//! by evaluation callers without blocking: readers clone the `Arc` to the
//! active snapshot and never observe a partially applied update.
//!
//! Every mutating call is guarded by the canonical key it was issued for, so
//! an update raced by a context switch lands as a no-op rather than mixing
//! data from two contexts.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use flagsync_core::{CanonicalKey, FlagSnapshot, FlagState, StoredFlag};
use serde_json::Value;
use tracing::debug;

#[derive(Debug)]
struct StoreInner {
	target: Option<CanonicalKey>,
	snapshot: Arc<FlagSnapshot>,
}

/// The authoritative local cache of flag state for the active context.
#[derive(Debug)]
pub struct FlagStore {
	inner: RwLock<StoreInner>,
}

impl FlagStore {
	/// Creates an empty store with no target context.
	pub fn new() -> Self {
		FlagStore {
			inner: RwLock::new(StoreInner {
				target: None,
				snapshot: Arc::new(FlagSnapshot::new()),
			}),
		}
	}

	/// Retargets the store at a new canonical context, clearing the snapshot
	/// when the key actually changes.
	pub fn set_target(&self, key: CanonicalKey) {
		let mut inner = self.write();
		if inner.target.as_ref() != Some(&key) {
			inner.target = Some(key);
			inner.snapshot = Arc::new(FlagSnapshot::new());
		}
	}

	/// The canonical key the store currently accepts writes for.
	pub fn target(&self) -> Option<CanonicalKey> {
		self.read().target.clone()
	}

	/// Atomically swaps in a full snapshot.
	///
	/// Returns the sorted set of flag keys whose visible values changed, or
	/// `None` when `key` no longer matches the store target (stale-context
	/// guard). An identical snapshot yields an empty change set.
	pub fn replace_all(
		&self,
		key: &CanonicalKey,
		flags: HashMap<String, FlagState>,
	) -> Option<Vec<String>> {
		let mut inner = self.write();
		if inner.target.as_ref() != Some(key) {
			debug!(key = %key, "dropping full state for stale context");
			return None;
		}

		let mut next = FlagSnapshot::new();
		for (flag_key, state) in flags {
			next.insert(flag_key, StoredFlag::Active(state));
		}
		let changed = diff_visible(&inner.snapshot, &next);
		inner.snapshot = Arc::new(next);
		Some(changed)
	}

	/// Seeds the store from a persisted snapshot, only while the store is
	/// still empty for the target key. Returns the visible keys, or `None`
	/// on a stale key or non-empty store.
	pub fn seed(&self, key: &CanonicalKey, snapshot: FlagSnapshot) -> Option<Vec<String>> {
		let mut inner = self.write();
		if inner.target.as_ref() != Some(key) || !inner.snapshot.is_empty() {
			return None;
		}
		let mut keys: Vec<String> = snapshot
			.iter()
			.filter(|(_, slot)| slot.state().is_some())
			.map(|(k, _)| k.clone())
			.collect();
		keys.sort();
		inner.snapshot = Arc::new(snapshot);
		Some(keys)
	}

	/// Applies one incremental update. Ignored when the key mismatches the
	/// target or the incoming version is not strictly greater than the
	/// stored one (idempotent replay protection).
	pub fn apply_patch(&self, key: &CanonicalKey, flag_key: &str, state: FlagState) -> bool {
		let mut inner = self.write();
		if inner.target.as_ref() != Some(key) {
			debug!(key = %key, flag_key, "dropping patch for stale context");
			return false;
		}
		if let Some(existing) = inner.snapshot.get(flag_key) {
			if state.version <= existing.version() {
				debug!(
					flag_key,
					incoming = state.version,
					stored = existing.version(),
					"ignoring stale patch"
				);
				return false;
			}
		}
		let mut next = (*inner.snapshot).clone();
		next.insert(flag_key.to_string(), StoredFlag::Active(state));
		inner.snapshot = Arc::new(next);
		true
	}

	/// Tombstones one flag. Same guards as [`FlagStore::apply_patch`].
	pub fn apply_delete(&self, key: &CanonicalKey, flag_key: &str, version: u64) -> bool {
		let mut inner = self.write();
		if inner.target.as_ref() != Some(key) {
			debug!(key = %key, flag_key, "dropping delete for stale context");
			return false;
		}
		if let Some(existing) = inner.snapshot.get(flag_key) {
			if version <= existing.version() {
				return false;
			}
		}
		let mut next = (*inner.snapshot).clone();
		next.insert(flag_key.to_string(), StoredFlag::Tombstone { version });
		inner.snapshot = Arc::new(next);
		true
	}

	/// Reads one flag from the active snapshot. Never blocks on the network;
	/// tombstones read as absent.
	pub fn get(&self, flag_key: &str) -> Option<FlagState> {
		self.read()
			.snapshot
			.get(flag_key)
			.and_then(|slot| slot.state())
			.cloned()
	}

	/// All visible flag values in the active snapshot.
	pub fn all_flags(&self) -> HashMap<String, Value> {
		self.read()
			.snapshot
			.iter()
			.filter_map(|(key, slot)| slot.state().map(|s| (key.clone(), s.value.clone())))
			.collect()
	}

	/// A cheap handle to the active snapshot, e.g. for persistence.
	pub fn snapshot(&self) -> Arc<FlagSnapshot> {
		Arc::clone(&self.read().snapshot)
	}

	fn read(&self) -> std::sync::RwLockReadGuard<'_, StoreInner> {
		self.inner.read().unwrap_or_else(PoisonError::into_inner)
	}

	fn write(&self) -> std::sync::RwLockWriteGuard<'_, StoreInner> {
		self.inner.write().unwrap_or_else(PoisonError::into_inner)
	}
}

impl Default for FlagStore {
	fn default() -> Self {
		Self::new()
	}
}

/// Sorted keys whose visible value differs between two snapshots.
fn diff_visible(old: &FlagSnapshot, new: &FlagSnapshot) -> Vec<String> {
	let mut changed = Vec::new();
	for (key, slot) in new {
		let before = old.get(key).and_then(StoredFlag::state);
		if before.map(|s| &s.value) != slot.state().map(|s| &s.value) {
			changed.push(key.clone());
		}
	}
	for (key, slot) in old {
		if slot.state().is_some() && !new.contains_key(key) {
			changed.push(key.clone());
		}
	}
	changed.sort();
	changed.dedup();
	changed
}


#[cfg(test)]
mod proptests {
	use super::*;
	use flagsync_core::EvaluationContext;
	use proptest::prelude::*;

	proptest! {
		// Replay/out-of-order delivery: applying any interleaving of patches
		// leaves the store identical to applying only the highest-version
		// patch per flag.
		#[test]
		fn patch_replay_is_idempotent(
			patches in prop::collection::vec(
				("[ab]", 1u64..20, 0i64..1000),
				1..40,
			),
		) {
			let store = FlagStore::new();
			let (key, _) = EvaluationContext::user("u1").canonicalize().unwrap();
			store.set_target(key.clone());

			let mut highest: std::collections::HashMap<String, (u64, i64)> =
				std::collections::HashMap::new();
			for (flag_key, version, value) in &patches {
				store.apply_patch(
					&key,
					flag_key,
					FlagState::new(serde_json::json!(value), *version),
				);
				let entry = highest.entry(flag_key.clone()).or_insert((*version, *value));
				if *version > entry.0 {
					*entry = (*version, *value);
				}
			}

			for (flag_key, (version, value)) in highest {
				let stored = store.get(&flag_key).unwrap();
				prop_assert_eq!(stored.version, version);
				prop_assert_eq!(stored.value, serde_json::json!(value));
			}
		}
	}
}
