// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Optional bootstrap persistence for flag snapshots.
//!
//! A persistence store lets a fresh client serve flags for a known context
//! before the first data-source response arrives: the flag store is seeded
//! from `load` on a context switch and written back via `save` after each
//! successful full replace. Concrete adapters (disk, browser storage, etc.)
//! live outside the core; the SDK only depends on this contract.

use std::collections::HashMap;

use async_trait::async_trait;
use flagsync_core::{CanonicalKey, FlagSnapshot};
use tokio::sync::RwLock;

/// Contract for persisting per-context flag snapshots.
#[async_trait]
pub trait PersistenceStore: Send + Sync + 'static {
	/// Loads the snapshot cached for a canonical context, if any.
	async fn load(&self, key: &CanonicalKey) -> Option<FlagSnapshot>;

	/// Persists the snapshot for a canonical context. Failures are the
	/// adapter's to log; the synchronization path never blocks on them.
	async fn save(&self, key: &CanonicalKey, snapshot: &FlagSnapshot);
}

/// In-memory persistence, useful for tests and short-lived processes.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
	entries: RwLock<HashMap<CanonicalKey, FlagSnapshot>>,
}

impl MemoryPersistence {
	/// Creates an empty store.
	pub fn new() -> Self {
		Self::default()
	}

	/// Number of contexts with a cached snapshot.
	pub async fn len(&self) -> usize {
		self.entries.read().await.len()
	}

	/// Whether nothing has been cached yet.
	pub async fn is_empty(&self) -> bool {
		self.entries.read().await.is_empty()
	}
}

#[async_trait]
impl PersistenceStore for MemoryPersistence {
	async fn load(&self, key: &CanonicalKey) -> Option<FlagSnapshot> {
		self.entries.read().await.get(key).cloned()
	}

	async fn save(&self, key: &CanonicalKey, snapshot: &FlagSnapshot) {
		self.entries
			.write()
			.await
			.insert(key.clone(), snapshot.clone());
	}
}
