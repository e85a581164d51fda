// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Circuit breaker protecting the HMC from cascading failures.
use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::HmcError;
use crate::metrics;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    Closed,   // Normal operation - requests allowed
    Open,     // Circuit tripped - requests blocked
    HalfOpen, // Testing if the HMC has recovered
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Three-state breaker gating the transport.
///
/// A request outcome counts as failure iff the network errored or the status
/// was 429 or 5xx; 401 and other 4xx reset the failure counter. All state
/// mutation happens under one mutex so the check-and-transition pair in
/// [`CircuitBreaker::before_request`] cannot race.
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    threshold: u32,
    cooldown: Duration,
}

pub const DEFAULT_THRESHOLD: u32 = 5;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30);

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            threshold,
            cooldown,
        }
    }

    /// Gate one request. Returns `Err(circuit open)` without touching the
    /// network while the circuit is Open (cooldown pending) or while the
    /// HalfOpen probe slot is taken.
    pub fn before_request(&self) -> Result<(), HmcError> {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.cooldown {
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_in_flight = true;
                    debug!("Circuit breaker state changed to Half-Open, probe allowed");
                    Ok(())
                } else {
                    Err(HmcError::circuit_open())
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(HmcError::circuit_open())
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a qualifying success (2xx, or any 4xx other than 429).
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failures = 0;
                inner.opened_at = None;
                inner.probe_in_flight = false;
                info!("Circuit breaker reset to Closed state after successful probe");
            }
            CircuitState::Closed => {
                inner.failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Record a qualifying failure (network error, 429 or 5xx).
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                    metrics::track_breaker_open();
                    warn!(
                        "Circuit breaker tripped to Open state after {} consecutive failures",
                        inner.failures
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_in_flight = false;
                metrics::track_breaker_open();
                warn!("Circuit breaker returned to Open state after failed probe");
            }
            CircuitState::Open => {
                debug!("Failure recorded while circuit is already Open");
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().expect("breaker mutex poisoned").state
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_THRESHOLD, DEFAULT_COOLDOWN)
    }
}
