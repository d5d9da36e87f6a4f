// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Streaming data source: a persistent SSE channel with reconnect.
//!
//! Opens a server-push stream for the subscribed context and maps the wire
//! events (`put`/`patch`/`delete`) onto data-source emissions. On channel
//! drop the source reports `Interrupted` and reconnects with jittered
//! exponential backoff; a connection that stays healthy long enough resets
//! the penalty. Authorization failures are fatal: the source reports `Off`
//! and stops retrying.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use eventsource_stream::{Event, Eventsource};
use flagsync_core::{CanonicalContext, ConnectionStatus, FlagStreamEvent};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::FlagsConfig;
use crate::datasource::{
	is_fatal_status, DataSource, DataSourceEvent, DataSourceHandle, DataSourcePayload, EventSink,
};
use crate::error::FlagsError;

/// SSE-backed data source.
#[derive(Debug, Clone)]
pub struct StreamingDataSource {
	base_url: String,
	sdk_key: String,
	backoff_initial: Duration,
	backoff_max: Duration,
	backoff_reset: Duration,
}

impl StreamingDataSource {
	/// Creates a streaming source against the given service.
	pub fn new(base_url: impl Into<String>, sdk_key: impl Into<String>, config: &FlagsConfig) -> Self {
		StreamingDataSource {
			base_url: base_url.into(),
			sdk_key: sdk_key.into(),
			backoff_initial: config.backoff_initial,
			backoff_max: config.backoff_max,
			backoff_reset: config.backoff_reset,
		}
	}

	fn stream_url(&self, context: &CanonicalContext) -> Result<String, FlagsError> {
		let body = serde_json::to_vec(context)
			.map_err(|e| FlagsError::ParseFailed(format!("context serialization: {e}")))?;
		Ok(format!(
			"{}/api/v1/flags/stream/{}",
			self.base_url.trim_end_matches('/'),
			URL_SAFE_NO_PAD.encode(body)
		))
	}
}

impl DataSource for StreamingDataSource {
	fn start(
		&self,
		context: CanonicalContext,
		generation: u64,
		events: mpsc::Sender<DataSourceEvent>,
	) -> DataSourceHandle {
		let sink = EventSink::new(generation, events);
		let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);

		let url = match self.stream_url(&context) {
			Ok(url) => url,
			Err(e) => {
				let task = tokio::spawn(async move {
					sink.send(DataSourcePayload::Fault {
						message: e.to_string(),
						recoverable: false,
					})
					.await;
					sink.send(DataSourcePayload::Status(ConnectionStatus::Off))
						.await;
				});
				return DataSourceHandle::new(shutdown_tx, task);
			}
		};

		let sdk_key = self.sdk_key.clone();
		let backoff = Backoff::new(self.backoff_initial, self.backoff_max, self.backoff_reset);
		let task = tokio::spawn(run_stream_loop(url, sdk_key, backoff, sink, shutdown_rx));
		DataSourceHandle::new(shutdown_tx, task)
	}
}

/// Connect/process/reconnect loop for the stream.
async fn run_stream_loop(
	url: String,
	sdk_key: String,
	mut backoff: Backoff,
	sink: EventSink,
	mut shutdown_rx: mpsc::Receiver<()>,
) {
	let client = match reqwest::Client::builder().build() {
		Ok(client) => client,
		Err(e) => {
			error!(error = %e, "failed to build HTTP client for flag stream");
			sink.send(DataSourcePayload::Fault {
				message: e.to_string(),
				recoverable: false,
			})
			.await;
			sink.send(DataSourcePayload::Status(ConnectionStatus::Off))
				.await;
			return;
		}
	};

	loop {
		if shutdown_rx.try_recv().is_ok() {
			info!("flag stream received shutdown signal");
			break;
		}

		info!(url = %url, "connecting to flag stream");
		let connected_at = Instant::now();
		let mut established = false;

		match connect_and_process(&client, &url, &sdk_key, &sink, &mut established).await {
			Ok(()) => {
				debug!("flag stream ended normally");
			}
			Err(StreamFailure::Fatal(e)) => {
				error!(error = %e, "fatal flag stream error, stopping");
				sink.send(DataSourcePayload::Fault {
					message: e.to_string(),
					recoverable: false,
				})
				.await;
				sink.send(DataSourcePayload::Status(ConnectionStatus::Off))
					.await;
				break;
			}
			Err(StreamFailure::Transient(e)) => {
				warn!(error = %e, "flag stream error");
			}
		}

		if established {
			backoff.note_connection(connected_at.elapsed());
		}
		sink.send(DataSourcePayload::Status(ConnectionStatus::Interrupted))
			.await;

		let delay = backoff.next_delay();
		warn!(
			delay_ms = delay.as_millis() as u64,
			failures = backoff.consecutive_failures(),
			"reconnecting to flag stream"
		);

		tokio::select! {
			_ = tokio::time::sleep(delay) => {}
			_ = shutdown_rx.recv() => {
				info!("flag stream received shutdown signal during reconnect wait");
				break;
			}
		}
	}
}

enum StreamFailure {
	Fatal(FlagsError),
	Transient(FlagsError),
}

/// Connects to the stream and forwards events until disconnection.
async fn connect_and_process(
	client: &reqwest::Client,
	url: &str,
	sdk_key: &str,
	sink: &EventSink,
	established: &mut bool,
) -> Result<(), StreamFailure> {
	let response = client
		.get(url)
		.bearer_auth(sdk_key)
		.header("Accept", "text/event-stream")
		.header("Cache-Control", "no-cache")
		.send()
		.await
		.map_err(|e| StreamFailure::Transient(FlagsError::Http(e)))?;

	let status = response.status().as_u16();
	if !response.status().is_success() {
		let message = response.text().await.unwrap_or_default();
		let err = FlagsError::ServerError { status, message };
		return if is_fatal_status(status) {
			Err(StreamFailure::Fatal(err))
		} else {
			Err(StreamFailure::Transient(err))
		};
	}

	*established = true;
	info!("flag stream established");
	sink.send(DataSourcePayload::Status(ConnectionStatus::Valid))
		.await;

	let mut event_stream = response.bytes_stream().eventsource();
	while let Some(event_result) = event_stream.next().await {
		match event_result {
			Ok(event) => {
				if let Err(e) = process_event(event, sink).await {
					warn!(error = %e, "failed to process stream event");
				}
			}
			Err(e) => {
				return Err(StreamFailure::Transient(FlagsError::SseStream(
					e.to_string(),
				)));
			}
		}
	}

	Ok(())
}

/// Maps one SSE event onto a data-source emission.
async fn process_event(event: Event, sink: &EventSink) -> Result<(), FlagsError> {
	// Comments and keep-alive padding arrive as empty data.
	if event.data.is_empty() {
		return Ok(());
	}

	let parsed: FlagStreamEvent = serde_json::from_str(&event.data).map_err(|e| {
		warn!(data = %event.data, error = %e, "failed to parse stream event");
		FlagsError::ParseFailed(e.to_string())
	})?;

	debug!(event_type = %parsed.event_type(), "processing stream event");

	match parsed {
		FlagStreamEvent::Put(data) => {
			sink.send(DataSourcePayload::FullState(data.flags)).await;
		}
		FlagStreamEvent::Patch(data) => {
			sink.send(DataSourcePayload::Patch {
				flag_key: data.flag_key,
				state: data.state,
			})
			.await;
		}
		FlagStreamEvent::Delete(data) => {
			sink.send(DataSourcePayload::Delete {
				flag_key: data.flag_key,
				version: data.version,
			})
			.await;
		}
		FlagStreamEvent::Heartbeat(_) => {
			debug!("heartbeat received");
		}
	}

	Ok(())
}
