// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Reconnect backoff with jitter for the streaming data source.

use std::time::Duration;

/// Exponential backoff: the delay doubles per consecutive failure up to a
/// ceiling, with jitter so reconnecting clients spread out. A connection
/// that stays healthy for the reset interval clears the penalty, so one
/// long-lived connection is enough to start over from the initial delay.
#[derive(Debug)]
pub struct Backoff {
	initial: Duration,
	max: Duration,
	reset_interval: Duration,
	consecutive_failures: u32,
}

impl Backoff {
	/// Creates a backoff schedule.
	pub fn new(initial: Duration, max: Duration, reset_interval: Duration) -> Self {
		Backoff {
			initial,
			max,
			reset_interval,
			consecutive_failures: 0,
		}
	}

	/// Records a failure and returns the jittered delay before the next
	/// attempt. The jittered value lies in `[base/2, base]` where `base` is
	/// the capped exponential delay.
	pub fn next_delay(&mut self) -> Duration {
		let factor = 2u64.saturating_pow(self.consecutive_failures.min(16));
		let base_ms = (self.initial.as_millis() as u64)
			.saturating_mul(factor)
			.min(self.max.as_millis() as u64);
		self.consecutive_failures = self.consecutive_failures.saturating_add(1);

		let half = base_ms / 2;
		Duration::from_millis(half + fastrand::u64(0..=base_ms - half))
	}

	/// Records how long the last connection stayed healthy. Clears the
	/// failure count once the connection outlived the reset interval.
	pub fn note_connection(&mut self, healthy_for: Duration) {
		if healthy_for >= self.reset_interval {
			self.consecutive_failures = 0;
		}
	}

	/// Number of consecutive failures currently counted.
	pub fn consecutive_failures(&self) -> u32 {
		self.consecutive_failures
	}
}
