// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! The Flagsync client and its identify/synchronization state machine.
//!
//! The client owns the current context generation. Every identify call
//! increments it, supersedes any in-flight identify, and races the data
//! source against a cancellable timeout. Data-source events carry the
//! generation their source was started under; anything tagged with a
//! superseded generation is dropped before it can touch the flag store or
//! settle a future, which is what guarantees callers never observe a store
//! mixing data from two contexts.
//!
//! State machine: `Idle -> Synchronizing -> Synchronized`, with
//! `Synchronizing -> TimedOut` on timer expiry. `TimedOut` is not terminal:
//! the data source keeps running and a late full state still moves the
//! client to `Synchronized`, just without resolving the already-rejected
//! future.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use flagsync_core::{
	CanonicalContext, CanonicalKey, ConnectionStatus, EvaluationContext, EvaluationReason,
	FlagState,
};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::analytics::{FlagExposure, NoOpAnalyticsHook, SharedAnalyticsHook};
use crate::config::{DataSourceKind, FlagsConfig, IdentifyOptions};
use crate::datasource::polling::PollingDataSource;
use crate::datasource::streaming::StreamingDataSource;
use crate::datasource::{DataSource, DataSourceEvent, DataSourceHandle, DataSourcePayload};
use crate::emitter::{EventEmitter, ListenerId};
use crate::error::{FlagsError, Result};
use crate::persist::PersistenceStore;
use crate::store::FlagStore;

/// Capacity of the data-source event channel. Small is fine: a single
/// dispatcher drains it and sources emit at network pace.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Value plus the evaluation metadata that accompanied it.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationDetail {
	/// The value served.
	pub value: Value,
	/// Index of the variation, when the service reported one.
	pub variation_index: Option<u32>,
	/// Why this value was served.
	pub reason: Option<EvaluationReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncPhase {
	Idle,
	Synchronizing,
	Synchronized,
	TimedOut,
}

struct PendingIdentify {
	generation: u64,
	resolve: oneshot::Sender<Result<()>>,
	timeout: JoinHandle<()>,
}

impl PendingIdentify {
	/// Settles the caller's future and cancels the timer. Called on every
	/// exit from `Synchronizing` (success, timeout, supersede, fatal), so no
	/// timer ever fires against an already-settled future.
	fn settle(self, result: Result<()>) {
		self.timeout.abort();
		let _ = self.resolve.send(result);
	}
}

struct SyncState {
	current_generation: u64,
	source_generation: u64,
	canonical_key: Option<CanonicalKey>,
	context: Option<CanonicalContext>,
	source: Option<DataSourceHandle>,
	pending: Option<PendingIdentify>,
	phase: SyncPhase,
	status: ConnectionStatus,
	closed: bool,
}

impl SyncState {
	fn new() -> Self {
		SyncState {
			current_generation: 0,
			source_generation: 0,
			canonical_key: None,
			context: None,
			source: None,
			pending: None,
			phase: SyncPhase::Idle,
			status: ConnectionStatus::Initializing,
			closed: false,
		}
	}
}

struct ClientInner {
	config: FlagsConfig,
	store: FlagStore,
	emitter: EventEmitter,
	source: Box<dyn DataSource>,
	persistence: Option<Arc<dyn PersistenceStore>>,
	analytics: SharedAnalyticsHook,
	events_tx: mpsc::Sender<DataSourceEvent>,
	sync: Mutex<SyncState>,
	dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Client for live feature-flag synchronization and evaluation.
///
/// Cheap to clone; all clones share one synchronization state machine.
#[derive(Clone)]
pub struct FlagsClient {
	inner: Arc<ClientInner>,
}

impl std::fmt::Debug for FlagsClient {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let st = self.inner.lock_sync();
		f.debug_struct("FlagsClient")
			.field("generation", &st.current_generation)
			.field("status", &st.status)
			.finish()
	}
}

impl FlagsClient {
	/// Starts building a client.
	pub fn builder() -> FlagsClientBuilder {
		FlagsClientBuilder::default()
	}

	/// Switches the client to a new evaluation context and waits until the
	/// flag store is consistent with it, using the configured default
	/// timeout.
	pub async fn identify(&self, context: EvaluationContext) -> Result<()> {
		self.identify_with(context, IdentifyOptions::default()).await
	}

	/// [`FlagsClient::identify`] with per-call options.
	///
	/// Calling identify again while a previous call is in flight supersedes
	/// it: the earlier future rejects with [`FlagsError::Superseded`].
	/// A timeout rejects the future but leaves the data source running, so
	/// a late response still populates the store.
	pub async fn identify_with(
		&self,
		context: EvaluationContext,
		options: IdentifyOptions,
	) -> Result<()> {
		// Invalid input fails before any generation is consumed.
		let (key, canonical) = context.canonicalize()?;

		let timeout = options
			.timeout
			.unwrap_or(self.inner.config.default_identify_timeout);
		if timeout > self.inner.config.high_timeout_threshold {
			warn!(
				timeout_s = timeout.as_secs(),
				threshold_s = self.inner.config.high_timeout_threshold.as_secs(),
				"identify timeout greater than the recommended threshold"
			);
		}

		// Load any cached snapshot before touching synchronization state;
		// the seed only applies while the store is still empty for the key.
		let seed = match &self.inner.persistence {
			Some(persistence) => persistence.load(&key).await,
			None => None,
		};

		let mut seeded_keys: Option<Vec<String>> = None;
		let mut status_change: Option<ConnectionStatus> = None;
		let rx = {
			let mut st = self.inner.lock_sync();
			if st.closed {
				return Err(FlagsError::Closed);
			}

			st.current_generation += 1;
			let generation = st.current_generation;

			if let Some(previous) = st.pending.take() {
				debug!(
					superseded = previous.generation,
					current = generation,
					"superseding in-flight identify"
				);
				previous.settle(Err(FlagsError::Superseded));
			}

			if st.canonical_key.as_ref() == Some(&key) {
				// Equivalent context: keep the live data source and only
				// advance bookkeeping, avoiding a needless reconnect.
				st.context = Some(canonical.clone());
				if st.phase == SyncPhase::Synchronized {
					return Ok(());
				}
				if st.source.is_none() {
					// The previous source stopped fatally; start fresh.
					st.source_generation = generation;
					st.source = Some(self.inner.source.start(
						canonical,
						generation,
						self.inner.events_tx.clone(),
					));
				}
				st.phase = SyncPhase::Synchronizing;
			} else {
				if let Some(handle) = st.source.take() {
					handle.stop();
				}
				debug!(key = %key, generation, "starting data source for new context");
				st.canonical_key = Some(key.clone());
				st.context = Some(canonical.clone());
				self.inner.store.set_target(key.clone());
				seeded_keys = seed.and_then(|snapshot| self.inner.store.seed(&key, snapshot));
				st.source_generation = generation;
				st.source = Some(self.inner.source.start(
					canonical,
					generation,
					self.inner.events_tx.clone(),
				));
				st.phase = SyncPhase::Synchronizing;
				if st.status != ConnectionStatus::Initializing {
					st.status = ConnectionStatus::Initializing;
					status_change = Some(ConnectionStatus::Initializing);
				}
			}

			let (tx, rx) = oneshot::channel();
			st.pending = Some(PendingIdentify {
				generation,
				resolve: tx,
				timeout: self.spawn_timeout(generation, timeout),
			});
			rx
		};

		if let Some(keys) = seeded_keys.filter(|keys| !keys.is_empty()) {
			self.inner.emitter.emit_flag_change(&keys);
		}
		if let Some(status) = status_change {
			self.inner.emitter.emit_connection_status(status);
		}

		match rx.await {
			Ok(result) => result,
			Err(_) => Err(FlagsError::Closed),
		}
	}

	/// The canonical multi-kind form of the active context.
	pub fn current_context(&self) -> Option<CanonicalContext> {
		self.inner.lock_sync().context.clone()
	}

	/// Current connection health.
	pub fn connection_status(&self) -> ConnectionStatus {
		self.inner.lock_sync().status
	}

	/// Evaluates one flag against the local store. Never blocks on the
	/// network; returns `default` when the flag is absent.
	pub fn variation(&self, flag_key: &str, default: Value) -> Value {
		match self.inner.store.get(flag_key) {
			Some(state) => {
				self.inner.record_exposure(flag_key, &state);
				state.value
			}
			None => default,
		}
	}

	/// [`FlagsClient::variation`] plus the evaluation metadata.
	pub fn variation_detail(&self, flag_key: &str, default: Value) -> EvaluationDetail {
		match self.inner.store.get(flag_key) {
			Some(state) => {
				self.inner.record_exposure(flag_key, &state);
				EvaluationDetail {
					value: state.value,
					variation_index: state.variation_index,
					reason: state.reason,
				}
			}
			None => EvaluationDetail {
				value: default,
				variation_index: None,
				reason: Some(EvaluationReason::Error {
					error_kind: "FLAG_NOT_FOUND".to_string(),
				}),
			},
		}
	}

	/// Boolean-typed evaluation.
	pub fn bool_variation(&self, flag_key: &str, default: bool) -> bool {
		self.variation(flag_key, Value::Bool(default))
			.as_bool()
			.unwrap_or(default)
	}

	/// String-typed evaluation.
	pub fn string_variation(&self, flag_key: &str, default: &str) -> String {
		match self.variation(flag_key, Value::String(default.to_string())) {
			Value::String(s) => s,
			_ => default.to_string(),
		}
	}

	/// All visible flag values for the active context.
	pub fn all_flags(&self) -> HashMap<String, Value> {
		self.inner.store.all_flags()
	}

	/// Registers a flag-change listener.
	pub fn on_flag_change<F>(&self, listener: F) -> ListenerId
	where
		F: Fn(&[String]) + Send + Sync + 'static,
	{
		self.inner.emitter.on_flag_change(listener)
	}

	/// Registers a connection-status listener.
	pub fn on_connection_status<F>(&self, listener: F) -> ListenerId
	where
		F: Fn(ConnectionStatus) + Send + Sync + 'static,
	{
		self.inner.emitter.on_connection_status(listener)
	}

	/// Unregisters a listener.
	pub fn off(&self, id: ListenerId) -> bool {
		self.inner.emitter.off(id)
	}

	/// Shuts the client down: stops the data source, rejects any in-flight
	/// identify, and stops dispatching events.
	pub fn close(&self) {
		let mut status_change = None;
		{
			let mut st = self.inner.lock_sync();
			if st.closed {
				return;
			}
			st.closed = true;
			if let Some(handle) = st.source.take() {
				handle.stop();
			}
			if let Some(pending) = st.pending.take() {
				pending.settle(Err(FlagsError::Closed));
			}
			st.phase = SyncPhase::Idle;
			if st.status != ConnectionStatus::Off {
				st.status = ConnectionStatus::Off;
				status_change = Some(ConnectionStatus::Off);
			}
		}
		if let Some(status) = status_change {
			self.inner.emitter.emit_connection_status(status);
		}
		if let Some(task) = self
			.inner
			.dispatcher
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take()
		{
			task.abort();
		}
	}

	fn spawn_timeout(&self, generation: u64, timeout: Duration) -> JoinHandle<()> {
		let inner = Arc::downgrade(&self.inner);
		tokio::spawn(async move {
			tokio::time::sleep(timeout).await;
			if let Some(inner) = inner.upgrade() {
				inner.on_identify_timeout(generation, timeout);
			}
		})
	}
}

impl ClientInner {
	fn lock_sync(&self) -> std::sync::MutexGuard<'_, SyncState> {
		self.sync.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn on_identify_timeout(&self, generation: u64, timeout: Duration) {
		let mut st = self.lock_sync();
		if st.pending.as_ref().map(|p| p.generation) != Some(generation) {
			return;
		}
		if let Some(pending) = st.pending.take() {
			st.phase = SyncPhase::TimedOut;
			error!(generation, timeout_s = timeout.as_secs(), "identify timed out");
			// The data source stays up: a late success still populates the
			// store for the next caller.
			pending.settle(Err(FlagsError::IdentifyTimeout(timeout)));
		}
	}

	fn handle_source_event(&self, event: DataSourceEvent) {
		let mut flag_changes: Option<Vec<String>> = None;
		let mut status_change: Option<ConnectionStatus> = None;
		let mut save_key: Option<CanonicalKey> = None;
		{
			let mut st = self.lock_sync();
			if st.closed {
				return;
			}
			if event.generation != st.source_generation {
				debug!(
					event_generation = event.generation,
					active = st.source_generation,
					"dropping event from superseded generation"
				);
				return;
			}
			let Some(key) = st.canonical_key.clone() else {
				return;
			};

			match event.payload {
				DataSourcePayload::FullState(flags) => {
					if let Some(changed) = self.store.replace_all(&key, flags) {
						if !changed.is_empty() {
							flag_changes = Some(changed);
						}
						if self.persistence.is_some() {
							save_key = Some(key);
						}
						st.phase = SyncPhase::Synchronized;
						if let Some(pending) = st.pending.take() {
							debug!(generation = pending.generation, "identify synchronized");
							pending.settle(Ok(()));
						}
					}
				}
				DataSourcePayload::Patch { flag_key, state } => {
					if self.store.apply_patch(&key, &flag_key, state) {
						flag_changes = Some(vec![flag_key]);
					}
				}
				DataSourcePayload::Delete { flag_key, version } => {
					if self.store.apply_delete(&key, &flag_key, version) {
						flag_changes = Some(vec![flag_key]);
					}
				}
				DataSourcePayload::Status(status) => {
					if st.status != status {
						debug!(from = %st.status, to = %status, "connection status changed");
						st.status = status;
						status_change = Some(status);
					}
					if status == ConnectionStatus::Off {
						// The source loop has exited; drop the dead handle so
						// a later identify starts a fresh one.
						if let Some(handle) = st.source.take() {
							handle.stop();
						}
						if let Some(pending) = st.pending.take() {
							st.phase = SyncPhase::Idle;
							pending.settle(Err(FlagsError::ConnectionFailed(
								"data source stopped".to_string(),
							)));
						}
					}
				}
				DataSourcePayload::Fault {
					message,
					recoverable,
				} => {
					if recoverable {
						debug!(%message, "recoverable data source fault");
					} else {
						warn!(%message, "fatal data source fault");
						if let Some(pending) = st.pending.take() {
							st.phase = SyncPhase::Idle;
							pending.settle(Err(FlagsError::ConnectionFailed(message)));
						}
					}
				}
			}
		}

		// Listener dispatch happens outside the state lock so listeners may
		// call back into the client.
		if let Some(changed) = flag_changes {
			self.emitter.emit_flag_change(&changed);
		}
		if let Some(status) = status_change {
			self.emitter.emit_connection_status(status);
		}
		if let (Some(key), Some(persistence)) = (save_key, self.persistence.clone()) {
			let snapshot = self.store.snapshot();
			tokio::spawn(async move {
				persistence.save(&key, &snapshot).await;
			});
		}
	}

	fn record_exposure(&self, flag_key: &str, state: &FlagState) {
		if !state.track_events {
			return;
		}
		let Some(context_key) = self.lock_sync().canonical_key.clone() else {
			return;
		};
		let reason = state
			.reason
			.as_ref()
			.filter(|_| state.track_reason)
			.map(|r| r.kind().to_string());
		let exposure = FlagExposure::new(
			flag_key,
			state.value.clone(),
			context_key.as_str(),
			reason,
		);
		let hook = Arc::clone(&self.analytics);
		match tokio::runtime::Handle::try_current() {
			Ok(handle) => {
				handle.spawn(async move {
					hook.on_flag_evaluated(exposure).await;
				});
			}
			Err(_) => debug!(flag_key, "no async runtime, dropping exposure"),
		}
	}
}

async fn run_dispatcher(mut rx: mpsc::Receiver<DataSourceEvent>, inner: Weak<ClientInner>) {
	while let Some(event) = rx.recv().await {
		let Some(inner) = inner.upgrade() else { break };
		inner.handle_source_event(event);
	}
}

/// Builder for [`FlagsClient`].
#[derive(Default)]
pub struct FlagsClientBuilder {
	sdk_key: Option<String>,
	base_url: Option<String>,
	config: FlagsConfig,
	data_source: Option<Box<dyn DataSource>>,
	persistence: Option<Arc<dyn PersistenceStore>>,
	analytics: Option<SharedAnalyticsHook>,
}

impl FlagsClientBuilder {
	/// SDK key used to authenticate against the flag service.
	pub fn sdk_key(mut self, sdk_key: impl Into<String>) -> Self {
		self.sdk_key = Some(sdk_key.into());
		self
	}

	/// Base URL of the flag service.
	pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
		self.base_url = Some(base_url.into());
		self
	}

	/// Selects the data source variant.
	pub fn data_source_kind(mut self, kind: DataSourceKind) -> Self {
		self.config.data_source = kind;
		self
	}

	/// Timeout applied to identify calls that supply none.
	pub fn default_identify_timeout(mut self, timeout: Duration) -> Self {
		self.config.default_identify_timeout = timeout;
		self
	}

	/// Threshold above which an identify timeout logs an advisory warning.
	pub fn high_timeout_threshold(mut self, threshold: Duration) -> Self {
		self.config.high_timeout_threshold = threshold;
		self
	}

	/// Initial reconnect delay for the streaming source.
	pub fn backoff_initial(mut self, initial: Duration) -> Self {
		self.config.backoff_initial = initial;
		self
	}

	/// Ceiling on the reconnect delay.
	pub fn backoff_max(mut self, max: Duration) -> Self {
		self.config.backoff_max = max;
		self
	}

	/// Healthy-connection duration that resets the reconnect penalty.
	pub fn backoff_reset(mut self, reset: Duration) -> Self {
		self.config.backoff_reset = reset;
		self
	}

	/// Fetch interval for the polling source.
	pub fn poll_interval(mut self, interval: Duration) -> Self {
		self.config.poll_interval = interval;
		self
	}

	/// Injects a custom data source, bypassing `sdk_key`/`base_url`. This is
	/// the seam tests use to script synchronization scenarios.
	pub fn data_source(mut self, source: Box<dyn DataSource>) -> Self {
		self.data_source = Some(source);
		self
	}

	/// Seeds and persists flag snapshots through the given store.
	pub fn persistence(mut self, persistence: Arc<dyn PersistenceStore>) -> Self {
		self.persistence = Some(persistence);
		self
	}

	/// Receives exposure events for tracked flags.
	pub fn analytics_hook(mut self, hook: SharedAnalyticsHook) -> Self {
		self.analytics = Some(hook);
		self
	}

	/// Builds the client and starts its event dispatcher. Must be called
	/// within a Tokio runtime.
	pub fn build(self) -> Result<FlagsClient> {
		let source: Box<dyn DataSource> = match self.data_source {
			Some(source) => source,
			None => {
				let sdk_key = self
					.sdk_key
					.ok_or_else(|| FlagsError::Config("sdk_key is required".to_string()))?;
				let base_url = self
					.base_url
					.ok_or_else(|| FlagsError::Config("base_url is required".to_string()))?;
				match self.config.data_source {
					DataSourceKind::Streaming => {
						Box::new(StreamingDataSource::new(base_url, sdk_key, &self.config))
					}
					DataSourceKind::Polling => Box::new(PollingDataSource::new(
						base_url,
						sdk_key,
						self.config.poll_interval,
					)),
				}
			}
		};

		let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
		let inner = Arc::new(ClientInner {
			config: self.config,
			store: FlagStore::new(),
			emitter: EventEmitter::new(),
			source,
			persistence: self.persistence,
			analytics: self.analytics.unwrap_or_else(|| Arc::new(NoOpAnalyticsHook)),
			events_tx,
			sync: Mutex::new(SyncState::new()),
			dispatcher: Mutex::new(None),
		});

		let dispatcher = tokio::spawn(run_dispatcher(events_rx, Arc::downgrade(&inner)));
		*inner
			.dispatcher
			.lock()
			.unwrap_or_else(PoisonError::into_inner) = Some(dispatcher);

		Ok(FlagsClient { inner })
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::persist::MemoryPersistence;
	use flagsync_core::{FlagSnapshot, StoredFlag};
	use std::sync::Mutex as StdMutex;

	#[derive(Clone)]
	struct StartRecord {
		generation: u64,
		context: CanonicalContext,
		tx: mpsc::Sender<DataSourceEvent>,
	}

	/// A data source driven entirely from the test body.
	#[derive(Clone, Default)]
	struct ScriptedSource {
		starts: Arc<StdMutex<Vec<StartRecord>>>,
	}

	impl ScriptedSource {
		fn start_count(&self) -> usize {
			self.starts.lock().unwrap().len()
		}

		fn record(&self, index: usize) -> StartRecord {
			self.starts.lock().unwrap()[index].clone()
		}

		async fn wait_for_starts(&self, n: usize) {
			for _ in 0..200 {
				if self.start_count() >= n {
					return;
				}
				tokio::task::yield_now().await;
			}
			panic!("data source was not started {n} time(s)");
		}
	}

	impl DataSource for ScriptedSource {
		fn start(
			&self,
			context: CanonicalContext,
			generation: u64,
			events: mpsc::Sender<DataSourceEvent>,
		) -> DataSourceHandle {
			self.starts.lock().unwrap().push(StartRecord {
				generation,
				context,
				tx: events,
			});
			DataSourceHandle::detached()
		}
	}

	fn client_with(source: &ScriptedSource) -> FlagsClient {
		FlagsClient::builder()
			.data_source(Box::new(source.clone()))
			.build()
			.unwrap()
	}

	/// Captures warn-and-above tracing output for the current thread.
	#[derive(Clone, Default)]
	struct LogCapture {
		buffer: Arc<StdMutex<Vec<u8>>>,
	}

	impl LogCapture {
		fn contents(&self) -> String {
			String::from_utf8_lossy(&self.buffer.lock().unwrap()).into_owned()
		}
	}

	impl std::io::Write for LogCapture {
		fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
			self.buffer.lock().unwrap().extend_from_slice(buf);
			Ok(buf.len())
		}

		fn flush(&mut self) -> std::io::Result<()> {
			Ok(())
		}
	}

	fn capture_warnings() -> (LogCapture, tracing::subscriber::DefaultGuard) {
		let capture = LogCapture::default();
		let writer = capture.clone();
		let subscriber = tracing_subscriber::fmt()
			.with_max_level(tracing::Level::WARN)
			.with_writer(move || writer.clone())
			.finish();
		(capture, tracing::subscriber::set_default(subscriber))
	}

	fn default_flags() -> HashMap<String, FlagState> {
		let mut flags = HashMap::new();
		flags.insert(
			"dev-test-flag".to_string(),
			FlagState::new(serde_json::json!(true), 1),
		);
		flags.insert(
			"log-level".to_string(),
			FlagState::new(serde_json::json!("warn"), 2),
		);
		flags
	}

	async fn wait_until(mut condition: impl FnMut() -> bool) {
		for _ in 0..200 {
			if condition() {
				return;
			}
			tokio::task::yield_now().await;
		}
		panic!("condition not reached");
	}

	#[tokio::test(start_paused = true)]
	async fn rejects_with_default_timeout_of_5s() {
		let source = ScriptedSource::default();
		let client = client_with(&source);

		let started = tokio::time::Instant::now();
		let err = client
			.identify(EvaluationContext::new("car", "test-car"))
			.await
			.unwrap_err();

		assert!(matches!(err, FlagsError::IdentifyTimeout(t) if t == Duration::from_secs(5)));
		assert_eq!(started.elapsed(), Duration::from_secs(5));
	}

	#[tokio::test(start_paused = true)]
	async fn rejects_with_custom_timeout() {
		let source = ScriptedSource::default();
		let client = client_with(&source);

		let started = tokio::time::Instant::now();
		let err = client
			.identify_with(
				EvaluationContext::new("car", "test-car"),
				IdentifyOptions::with_timeout(Duration::from_secs(15)),
			)
			.await
			.unwrap_err();

		assert!(matches!(err, FlagsError::IdentifyTimeout(t) if t == Duration::from_secs(15)));
		assert_eq!(started.elapsed(), Duration::from_secs(15));
	}

	#[tokio::test(start_paused = true)]
	async fn late_response_lands_without_resolving_the_settled_future() {
		let source = ScriptedSource::default();
		let client = client_with(&source);

		let err = client
			.identify(EvaluationContext::new("car", "test-car"))
			.await
			.unwrap_err();
		assert!(matches!(err, FlagsError::IdentifyTimeout(_)));

		// The data source is still running; a late success populates the
		// store and status for the next caller.
		let record = source.record(0);
		record
			.tx
			.send(DataSourceEvent {
				generation: record.generation,
				payload: DataSourcePayload::Status(ConnectionStatus::Valid),
			})
			.await
			.unwrap();
		record
			.tx
			.send(DataSourceEvent {
				generation: record.generation,
				payload: DataSourcePayload::FullState(default_flags()),
			})
			.await
			.unwrap();

		let c = client.clone();
		wait_until(move || !c.all_flags().is_empty()).await;
		assert_eq!(client.connection_status(), ConnectionStatus::Valid);

		// Now synchronized: an identify for the same context resolves
		// immediately without starting another source.
		client
			.identify(EvaluationContext::new("car", "test-car"))
			.await
			.unwrap();
		assert_eq!(source.start_count(), 1);
	}

	#[tokio::test(start_paused = true)]
	async fn resolves_when_full_state_arrives_in_time() {
		let source = ScriptedSource::default();
		let client = client_with(&source);

		let cl = client.clone();
		let task = tokio::spawn(async move {
			cl.identify_with(
				EvaluationContext::new("car", "test-car"),
				IdentifyOptions::with_timeout(Duration::from_secs(15)),
			)
			.await
		});

		source.wait_for_starts(1).await;
		let record = source.record(0);
		record
			.tx
			.send(DataSourceEvent {
				generation: record.generation,
				payload: DataSourcePayload::FullState(default_flags()),
			})
			.await
			.unwrap();

		task.await.unwrap().unwrap();

		// The active context is the canonical multi-kind form.
		let context = client.current_context().unwrap();
		assert_eq!(context.get("car").unwrap().key, "test-car");
		let json = serde_json::to_value(&context).unwrap();
		assert_eq!(json["kind"], "multi");

		let flags = client.all_flags();
		assert_eq!(flags["dev-test-flag"], serde_json::json!(true));
		assert_eq!(flags["log-level"], serde_json::json!("warn"));
	}

	#[tokio::test(start_paused = true)]
	async fn second_identify_supersedes_the_first() {
		let source = ScriptedSource::default();
		let client = client_with(&source);

		let cl = client.clone();
		let first = tokio::spawn(async move { cl.identify(EvaluationContext::user("u1")).await });
		source.wait_for_starts(1).await;

		let cl = client.clone();
		let second = tokio::spawn(async move { cl.identify(EvaluationContext::user("u2")).await });
		source.wait_for_starts(2).await;

		let err = first.await.unwrap().unwrap_err();
		assert!(matches!(err, FlagsError::Superseded));

		// Anything the first generation still emits is dropped, never mixed
		// into the second context's store.
		let stale = source.record(0);
		stale
			.tx
			.send(DataSourceEvent {
				generation: stale.generation,
				payload: DataSourcePayload::FullState(default_flags()),
			})
			.await
			.unwrap();
		for _ in 0..20 {
			tokio::task::yield_now().await;
		}
		assert!(client.all_flags().is_empty());

		let current = source.record(1);
		assert_eq!(current.context.get("user").unwrap().key, "u2");
		current
			.tx
			.send(DataSourceEvent {
				generation: current.generation,
				payload: DataSourcePayload::FullState(default_flags()),
			})
			.await
			.unwrap();
		second.await.unwrap().unwrap();
		assert!(!client.all_flags().is_empty());
	}

	#[tokio::test]
	async fn invalid_context_consumes_no_generation() {
		let source = ScriptedSource::default();
		let client = client_with(&source);

		let err = client
			.identify(EvaluationContext::new("user", ""))
			.await
			.unwrap_err();
		assert!(matches!(err, FlagsError::InvalidContext(_)));
		assert_eq!(source.start_count(), 0);

		// The failed call consumed no generation: the first valid identify
		// starts at generation 1.
		let cl = client.clone();
		let task = tokio::spawn(async move { cl.identify(EvaluationContext::user("u1")).await });
		source.wait_for_starts(1).await;
		let record = source.record(0);
		assert_eq!(record.generation, 1);
		record
			.tx
			.send(DataSourceEvent {
				generation: record.generation,
				payload: DataSourcePayload::FullState(HashMap::new()),
			})
			.await
			.unwrap();
		task.await.unwrap().unwrap();
	}

	#[tokio::test(start_paused = true)]
	async fn equivalent_context_reuses_the_data_source() {
		let source = ScriptedSource::default();
		let client = client_with(&source);

		let cl = client.clone();
		let task = tokio::spawn(async move { cl.identify(EvaluationContext::user("u1")).await });
		source.wait_for_starts(1).await;
		let record = source.record(0);
		record
			.tx
			.send(DataSourceEvent {
				generation: record.generation,
				payload: DataSourcePayload::FullState(default_flags()),
			})
			.await
			.unwrap();
		task.await.unwrap().unwrap();

		// Same canonical key, different attributes: no reconnect, and the
		// stored context picks up the new attributes.
		client
			.identify(
				EvaluationContext::user("u1")
					.with_attribute("plan", serde_json::json!("enterprise")),
			)
			.await
			.unwrap();
		assert_eq!(source.start_count(), 1);
		let context = client.current_context().unwrap();
		assert_eq!(
			context.get("user").unwrap().attributes.get("plan"),
			Some(&serde_json::json!("enterprise"))
		);
	}

	#[tokio::test(start_paused = true)]
	async fn fatal_status_rejects_the_pending_identify() {
		let source = ScriptedSource::default();
		let client = client_with(&source);

		let cl = client.clone();
		let task = tokio::spawn(async move { cl.identify(EvaluationContext::user("u1")).await });
		source.wait_for_starts(1).await;

		let record = source.record(0);
		record
			.tx
			.send(DataSourceEvent {
				generation: record.generation,
				payload: DataSourcePayload::Status(ConnectionStatus::Off),
			})
			.await
			.unwrap();

		let err = task.await.unwrap().unwrap_err();
		assert!(matches!(err, FlagsError::ConnectionFailed(_)));
		assert_eq!(client.connection_status(), ConnectionStatus::Off);
	}

	#[tokio::test(start_paused = true)]
	async fn high_timeout_warns_but_is_advisory_only() {
		let (logs, _guard) = capture_warnings();
		let source = ScriptedSource::default();
		let client = client_with(&source);

		let cl = client.clone();
		let task = tokio::spawn(async move {
			cl.identify_with(
				EvaluationContext::user("u1"),
				IdentifyOptions::with_timeout(Duration::from_secs(60)),
			)
			.await
		});
		source.wait_for_starts(1).await;
		let record = source.record(0);
		record
			.tx
			.send(DataSourceEvent {
				generation: record.generation,
				payload: DataSourcePayload::FullState(default_flags()),
			})
			.await
			.unwrap();

		// Above-threshold timeouts warn but never fail the call.
		task.await.unwrap().unwrap();
		assert!(logs.contents().contains("timeout greater"));
	}

	#[tokio::test(start_paused = true)]
	async fn timeout_at_or_below_threshold_never_warns() {
		let (logs, _guard) = capture_warnings();
		let source = ScriptedSource::default();
		let client = client_with(&source);

		let cl = client.clone();
		let task = tokio::spawn(async move {
			// Exactly at the threshold, then at the default.
			cl.identify_with(
				EvaluationContext::user("u1"),
				IdentifyOptions::with_timeout(Duration::from_secs(15)),
			)
			.await?;
			cl.identify(EvaluationContext::user("u1")).await
		});
		source.wait_for_starts(1).await;
		let record = source.record(0);
		record
			.tx
			.send(DataSourceEvent {
				generation: record.generation,
				payload: DataSourcePayload::FullState(default_flags()),
			})
			.await
			.unwrap();
		task.await.unwrap().unwrap();

		assert!(!logs.contents().contains("timeout greater"));
	}

	#[tokio::test(start_paused = true)]
	async fn listeners_observe_changes_and_status() {
		let source = ScriptedSource::default();
		let client = client_with(&source);

		let changes: Arc<StdMutex<Vec<Vec<String>>>> = Arc::new(StdMutex::new(vec![]));
		let statuses: Arc<StdMutex<Vec<ConnectionStatus>>> = Arc::new(StdMutex::new(vec![]));
		let c = Arc::clone(&changes);
		client.on_flag_change(move |keys| c.lock().unwrap().push(keys.to_vec()));
		let s = Arc::clone(&statuses);
		client.on_connection_status(move |status| s.lock().unwrap().push(status));

		let cl = client.clone();
		let task = tokio::spawn(async move { cl.identify(EvaluationContext::user("u1")).await });
		source.wait_for_starts(1).await;
		let record = source.record(0);
		record
			.tx
			.send(DataSourceEvent {
				generation: record.generation,
				payload: DataSourcePayload::Status(ConnectionStatus::Valid),
			})
			.await
			.unwrap();
		record
			.tx
			.send(DataSourceEvent {
				generation: record.generation,
				payload: DataSourcePayload::FullState(default_flags()),
			})
			.await
			.unwrap();
		task.await.unwrap().unwrap();

		record
			.tx
			.send(DataSourceEvent {
				generation: record.generation,
				payload: DataSourcePayload::Patch {
					flag_key: "dev-test-flag".to_string(),
					state: FlagState::new(serde_json::json!(false), 5),
				},
			})
			.await
			.unwrap();

		let c = Arc::clone(&changes);
		wait_until(move || c.lock().unwrap().len() >= 2).await;

		let changes = changes.lock().unwrap();
		let mut full = changes[0].clone();
		full.sort();
		assert_eq!(full, vec!["dev-test-flag".to_string(), "log-level".to_string()]);
		assert_eq!(changes[1], vec!["dev-test-flag".to_string()]);
		assert!(statuses.lock().unwrap().contains(&ConnectionStatus::Valid));
	}

	#[tokio::test(start_paused = true)]
	async fn stale_patch_versions_are_ignored() {
		let source = ScriptedSource::default();
		let client = client_with(&source);

		let cl = client.clone();
		let task = tokio::spawn(async move { cl.identify(EvaluationContext::user("u1")).await });
		source.wait_for_starts(1).await;
		let record = source.record(0);
		record
			.tx
			.send(DataSourceEvent {
				generation: record.generation,
				payload: DataSourcePayload::FullState(default_flags()),
			})
			.await
			.unwrap();
		task.await.unwrap().unwrap();

		// Replayed patch at the stored version: ignored.
		record
			.tx
			.send(DataSourceEvent {
				generation: record.generation,
				payload: DataSourcePayload::Patch {
					flag_key: "dev-test-flag".to_string(),
					state: FlagState::new(serde_json::json!(false), 1),
				},
			})
			.await
			.unwrap();
		record
			.tx
			.send(DataSourceEvent {
				generation: record.generation,
				payload: DataSourcePayload::Delete {
					flag_key: "log-level".to_string(),
					version: 7,
				},
			})
			.await
			.unwrap();

		let c = client.clone();
		wait_until(move || !c.all_flags().contains_key("log-level")).await;
		assert_eq!(
			client.all_flags()["dev-test-flag"],
			serde_json::json!(true)
		);
	}

	#[tokio::test(start_paused = true)]
	async fn persistence_seeds_before_first_response_and_saves_after() {
		let persistence = Arc::new(MemoryPersistence::new());
		let (key, _) = EvaluationContext::user("u1").canonicalize().unwrap();
		let mut cached = FlagSnapshot::new();
		cached.insert(
			"cached-flag".to_string(),
			StoredFlag::Active(FlagState::new(serde_json::json!("seeded"), 1)),
		);
		persistence.save(&key, &cached).await;

		let source = ScriptedSource::default();
		let client = FlagsClient::builder()
			.data_source(Box::new(source.clone()))
			.persistence(persistence.clone())
			.build()
			.unwrap();

		let cl = client.clone();
		let task = tokio::spawn(async move { cl.identify(EvaluationContext::user("u1")).await });
		source.wait_for_starts(1).await;

		// Seeded data is visible before any data-source response.
		assert_eq!(
			client.variation("cached-flag", serde_json::json!(null)),
			serde_json::json!("seeded")
		);

		let record = source.record(0);
		record
			.tx
			.send(DataSourceEvent {
				generation: record.generation,
				payload: DataSourcePayload::FullState(default_flags()),
			})
			.await
			.unwrap();
		task.await.unwrap().unwrap();

		// The fresh snapshot replaces the seed and gets persisted.
		let c = client.clone();
		wait_until(move || !c.all_flags().contains_key("cached-flag")).await;
		let mut saved = false;
		for _ in 0..200 {
			if persistence
				.load(&key)
				.await
				.is_some_and(|snap| snap.contains_key("dev-test-flag"))
			{
				saved = true;
				break;
			}
			tokio::task::yield_now().await;
		}
		assert!(saved, "fresh snapshot was not persisted");
	}

	#[tokio::test]
	async fn close_rejects_future_identify_calls() {
		let source = ScriptedSource::default();
		let client = client_with(&source);

		client.close();
		assert_eq!(client.connection_status(), ConnectionStatus::Off);

		let err = client
			.identify(EvaluationContext::user("u1"))
			.await
			.unwrap_err();
		assert!(matches!(err, FlagsError::Closed));
	}

	#[tokio::test]
	async fn builder_requires_credentials_without_custom_source() {
		let err = FlagsClient::builder().build().unwrap_err();
		assert!(matches!(err, FlagsError::Config(_)));

		let err = FlagsClient::builder().sdk_key("key").build().unwrap_err();
		assert!(matches!(err, FlagsError::Config(_)));
	}
}
