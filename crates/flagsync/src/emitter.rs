// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Listener fan-out for flag-change and connection-status notifications.
//!
//! Delivery is synchronous relative to the store mutation that triggered it:
//! listeners observe the new state, never an intermediate one. The listener
//! list is snapshotted before dispatch, so registering or unregistering from
//! inside a listener affects the next dispatch, not the current one. A
//! panicking listener is isolated and logged.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use flagsync_core::ConnectionStatus;
use tracing::warn;

/// Opaque handle returned on registration, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type FlagChangeFn = Arc<dyn Fn(&[String]) + Send + Sync>;
type StatusFn = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;

/// Multi-subscriber fan-out of store-change notifications.
#[derive(Default)]
pub struct EventEmitter {
	next_id: AtomicU64,
	flag_listeners: Mutex<Vec<(ListenerId, FlagChangeFn)>>,
	status_listeners: Mutex<Vec<(ListenerId, StatusFn)>>,
}

impl EventEmitter {
	/// Creates an emitter with no listeners.
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a listener for flag changes. The callback receives the set
	/// of flag keys whose values changed.
	pub fn on_flag_change<F>(&self, listener: F) -> ListenerId
	where
		F: Fn(&[String]) + Send + Sync + 'static,
	{
		let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
		self.lock_flags().push((id, Arc::new(listener)));
		id
	}

	/// Registers a listener for connection status transitions.
	pub fn on_connection_status<F>(&self, listener: F) -> ListenerId
	where
		F: Fn(ConnectionStatus) + Send + Sync + 'static,
	{
		let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
		self.lock_status().push((id, Arc::new(listener)));
		id
	}

	/// Unregisters a listener. Returns false when the id is unknown.
	pub fn off(&self, id: ListenerId) -> bool {
		let mut flags = self.lock_flags();
		if let Some(pos) = flags.iter().position(|(lid, _)| *lid == id) {
			flags.remove(pos);
			return true;
		}
		drop(flags);
		let mut status = self.lock_status();
		if let Some(pos) = status.iter().position(|(lid, _)| *lid == id) {
			status.remove(pos);
			return true;
		}
		false
	}

	/// Notifies flag-change listeners of the changed keys.
	pub fn emit_flag_change(&self, changed: &[String]) {
		// Snapshot before dispatch so listeners may (un)register freely.
		let listeners: Vec<FlagChangeFn> =
			self.lock_flags().iter().map(|(_, f)| Arc::clone(f)).collect();
		for listener in listeners {
			if catch_unwind(AssertUnwindSafe(|| listener(changed))).is_err() {
				warn!("flag change listener panicked");
			}
		}
	}

	/// Notifies connection-status listeners of a transition.
	pub fn emit_connection_status(&self, status: ConnectionStatus) {
		let listeners: Vec<StatusFn> = self
			.lock_status()
			.iter()
			.map(|(_, f)| Arc::clone(f))
			.collect();
		for listener in listeners {
			if catch_unwind(AssertUnwindSafe(|| listener(status))).is_err() {
				warn!(status = %status, "connection status listener panicked");
			}
		}
	}

	fn lock_flags(&self) -> std::sync::MutexGuard<'_, Vec<(ListenerId, FlagChangeFn)>> {
		self.flag_listeners
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
	}

	fn lock_status(&self) -> std::sync::MutexGuard<'_, Vec<(ListenerId, StatusFn)>> {
		self.status_listeners
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
	}
}

impl std::fmt::Debug for EventEmitter {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("EventEmitter")
			.field("flag_listeners", &self.lock_flags().len())
			.field("status_listeners", &self.lock_status().len())
			.finish()
	}
}
