// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The data source seam: how flag data reaches the orchestrator.
//!
//! A data source maintains the live channel to the flag service and emits
//! full-state, incremental-update, status, and fault events over a channel.
//! Two variants ship with the SDK (streaming and polling); the orchestrator
//! is agnostic to which is active, and tests can inject their own.
//!
//! Every emission is tagged with the generation the source was started
//! under. Stopping a source is cooperative: the handle signals shutdown and
//! aborts the task, but emissions already in flight may still arrive. The
//! generation tag is what actually enforces cancellation; the orchestrator
//! drops anything tagged with a superseded generation.

pub mod polling;
pub mod streaming;

use std::collections::HashMap;

use flagsync_core::{CanonicalContext, ConnectionStatus, FlagState};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// One emission from a data source, tagged with its generation.
#[derive(Debug, Clone)]
pub struct DataSourceEvent {
	/// Generation the source was started under.
	pub generation: u64,
	/// What happened.
	pub payload: DataSourcePayload,
}

/// The kinds of events a data source emits.
#[derive(Debug, Clone)]
pub enum DataSourcePayload {
	/// Authoritative full state for the subscribed context.
	FullState(HashMap<String, FlagState>),
	/// Incremental update to one flag.
	Patch {
		/// The flag that changed.
		flag_key: String,
		/// Its new state.
		state: FlagState,
	},
	/// Removal of one flag.
	Delete {
		/// The flag that was removed.
		flag_key: String,
		/// Version of the delete.
		version: u64,
	},
	/// Connection health transition.
	Status(ConnectionStatus),
	/// A failure. Recoverable faults are informational (the source is
	/// already retrying); non-recoverable faults precede `Status(Off)`.
	Fault {
		/// Human-readable description.
		message: String,
		/// Whether the source will keep trying.
		recoverable: bool,
	},
}

/// Capability interface over the live connection to the flag service.
pub trait DataSource: Send + Sync {
	/// Starts delivering events for the given context, tagging every
	/// emission with `generation`. Returns a handle used to stop it.
	fn start(
		&self,
		context: CanonicalContext,
		generation: u64,
		events: mpsc::Sender<DataSourceEvent>,
	) -> DataSourceHandle;
}

/// Handle to a running data source instance.
#[derive(Debug)]
pub struct DataSourceHandle {
	shutdown: Option<mpsc::Sender<()>>,
	task: Option<JoinHandle<()>>,
}

impl DataSourceHandle {
	/// Wraps a background task and its shutdown signal.
	pub fn new(shutdown: mpsc::Sender<()>, task: JoinHandle<()>) -> Self {
		DataSourceHandle {
			shutdown: Some(shutdown),
			task: Some(task),
		}
	}

	/// A handle for sources with no background task of their own (test
	/// doubles driven from the outside).
	pub fn detached() -> Self {
		DataSourceHandle {
			shutdown: None,
			task: None,
		}
	}

	/// Signals shutdown and aborts the background task. The task is expected
	/// to cease emitting promptly, but late emissions are tolerated; the
	/// generation tag makes them harmless.
	pub fn stop(mut self) {
		if let Some(tx) = self.shutdown.take() {
			let _ = tx.try_send(());
		}
		if let Some(task) = self.task.take() {
			task.abort();
		}
	}
}

impl Drop for DataSourceHandle {
	fn drop(&mut self) {
		if let Some(task) = self.task.take() {
			task.abort();
		}
	}
}

/// Generation-tagging wrapper around the event channel, shared by the
/// built-in source implementations.
#[derive(Debug, Clone)]
pub struct EventSink {
	generation: u64,
	tx: mpsc::Sender<DataSourceEvent>,
}

impl EventSink {
	/// Creates a sink tagging every event with `generation`.
	pub fn new(generation: u64, tx: mpsc::Sender<DataSourceEvent>) -> Self {
		EventSink { generation, tx }
	}

	/// Sends one event. Errors (receiver gone) are ignored; a closed client
	/// no longer cares.
	pub async fn send(&self, payload: DataSourcePayload) {
		let _ = self
			.tx
			.send(DataSourceEvent {
				generation: self.generation,
				payload,
			})
			.await;
	}
}

/// Authorization failures never recover by retrying.
pub(crate) fn is_fatal_status(status: u16) -> bool {
	matches!(status, 401 | 403)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn event_sink_tags_generation() {
		let (tx, mut rx) = mpsc::channel(4);
		let sink = EventSink::new(42, tx);
		sink.send(DataSourcePayload::Status(ConnectionStatus::Valid))
			.await;

		let event = rx.recv().await.unwrap();
		assert_eq!(event.generation, 42);
		assert!(matches!(
			event.payload,
			DataSourcePayload::Status(ConnectionStatus::Valid)
		));
	}

	#[tokio::test]
	async fn event_sink_tolerates_closed_receiver() {
		let (tx, rx) = mpsc::channel(1);
		drop(rx);
		let sink = EventSink::new(1, tx);
		// Must not panic or error.
		sink.send(DataSourcePayload::Status(ConnectionStatus::Off))
			.await;
	}

	#[test]
	fn only_auth_failures_are_fatal() {
		assert!(is_fatal_status(401));
		assert!(is_fatal_status(403));
		assert!(!is_fatal_status(500));
		assert!(!is_fatal_status(429));
	}
}
