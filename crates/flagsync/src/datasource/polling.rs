// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Polling data source: periodic full-state fetches.
//!
//! The fallback when streaming is unavailable. Each tick posts the canonical
//! context to the snapshot endpoint; a successful fetch becomes a full-state
//! emission plus a `Valid` status, a failed fetch reports `Interrupted` and
//! keeps polling. The fixed interval already rate-limits retries, so there
//! is no additional backoff. Authorization failures stop the source for
//! good, as with streaming.

use std::time::Duration;

use flagsync_core::{CanonicalContext, ConnectionStatus, PutData};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::datasource::{
	is_fatal_status, DataSource, DataSourceEvent, DataSourceHandle, DataSourcePayload, EventSink,
};
use crate::error::FlagsError;

/// Fixed-interval polling source.
#[derive(Debug, Clone)]
pub struct PollingDataSource {
	base_url: String,
	sdk_key: String,
	interval: Duration,
}

impl PollingDataSource {
	/// Creates a polling source against the given service.
	pub fn new(base_url: impl Into<String>, sdk_key: impl Into<String>, interval: Duration) -> Self {
		PollingDataSource {
			base_url: base_url.into(),
			sdk_key: sdk_key.into(),
			interval,
		}
	}

	fn snapshot_url(&self) -> String {
		format!(
			"{}/api/v1/flags/snapshot",
			self.base_url.trim_end_matches('/')
		)
	}
}

impl DataSource for PollingDataSource {
	fn start(
		&self,
		context: CanonicalContext,
		generation: u64,
		events: mpsc::Sender<DataSourceEvent>,
	) -> DataSourceHandle {
		let sink = EventSink::new(generation, events);
		let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
		let task = tokio::spawn(run_poll_loop(
			self.snapshot_url(),
			self.sdk_key.clone(),
			context,
			self.interval,
			sink,
			shutdown_rx,
		));
		DataSourceHandle::new(shutdown_tx, task)
	}
}

enum PollFailure {
	Fatal(FlagsError),
	Transient(FlagsError),
}

/// Fetch loop. Polls immediately on start, then at the fixed interval.
async fn run_poll_loop(
	url: String,
	sdk_key: String,
	context: CanonicalContext,
	interval: Duration,
	sink: EventSink,
	mut shutdown_rx: mpsc::Receiver<()>,
) {
	let client = match reqwest::Client::builder().build() {
		Ok(client) => client,
		Err(e) => {
			error!(error = %e, "failed to build HTTP client for flag polling");
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
			info!("flag polling received shutdown signal");
			break;
		}

		match fetch_snapshot(&client, &url, &sdk_key, &context).await {
			Ok(put) => {
				debug!(flags = put.flags.len(), "flag snapshot fetched");
				sink.send(DataSourcePayload::Status(ConnectionStatus::Valid))
					.await;
				sink.send(DataSourcePayload::FullState(put.flags)).await;
			}
			Err(PollFailure::Fatal(e)) => {
				error!(error = %e, "fatal flag polling error, stopping");
				sink.send(DataSourcePayload::Fault {
					message: e.to_string(),
					recoverable: false,
				})
				.await;
				sink.send(DataSourcePayload::Status(ConnectionStatus::Off))
					.await;
				break;
			}
			Err(PollFailure::Transient(e)) => {
				warn!(error = %e, "flag polling failed, will retry next interval");
				sink.send(DataSourcePayload::Status(ConnectionStatus::Interrupted))
					.await;
			}
		}

		tokio::select! {
			_ = tokio::time::sleep(interval) => {}
			_ = shutdown_rx.recv() => {
				info!("flag polling received shutdown signal during wait");
				break;
			}
		}
	}
}

/// Fetches one full snapshot for the context.
async fn fetch_snapshot(
	client: &reqwest::Client,
	url: &str,
	sdk_key: &str,
	context: &CanonicalContext,
) -> Result<PutData, PollFailure> {
	let response = client
		.post(url)
		.bearer_auth(sdk_key)
		.json(context)
		.send()
		.await
		.map_err(|e| PollFailure::Transient(FlagsError::Http(e)))?;

	let status = response.status().as_u16();
	if !response.status().is_success() {
		let message = response.text().await.unwrap_or_default();
		let err = FlagsError::ServerError { status, message };
		return if is_fatal_status(status) {
			Err(PollFailure::Fatal(err))
		} else {
			Err(PollFailure::Transient(err))
		};
	}

	response
		.json::<PutData>()
		.await
		.map_err(|e| PollFailure::Transient(FlagsError::ParseFailed(e.to_string())))
}
