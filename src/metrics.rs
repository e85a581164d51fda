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

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, HistogramVec,
    IntCounter, IntCounterVec,
};

lazy_static! {
    pub static ref HMC_REQUESTS: IntCounterVec = register_int_counter_vec!(
        "hmc_client_requests_total",
        "HTTP requests performed against the HMC, by outcome",
        &["method", "endpoint", "outcome"]
    )
    .expect("Failed to create hmc_client_requests_total counter vector");

    pub static ref HMC_REQUEST_LATENCY: HistogramVec = register_histogram_vec!(
        "hmc_client_request_seconds",
        "Latency of HMC requests in seconds",
        &["method", "endpoint"]
    )
    .expect("Failed to create hmc_client_request_seconds histogram vector");

    pub static ref RETRY_COUNT: IntCounterVec = register_int_counter_vec!(
        "hmc_client_retry_count",
        "Number of retries per endpoint",
        &["endpoint"]
    )
    .expect("Failed to create hmc_client_retry_count counter vector");

    pub static ref CIRCUIT_BREAKER_OPEN: IntCounter = register_int_counter!(
        "hmc_circuit_breaker_open_total",
        "Number of times the circuit breaker opened"
    )
    .expect("Failed to create hmc_circuit_breaker_open_total counter");

    pub static ref APPLY_RESULTS: IntCounterVec = register_int_counter_vec!(
        "hmc_apply_results_total",
        "Resize operations applied, by outcome",
        &["outcome"]
    )
    .expect("Failed to create hmc_apply_results_total counter vector");
}

/// Record the outcome of one HMC request attempt.
pub fn track_request(method: &str, endpoint: &str, outcome: &str) {
    HMC_REQUESTS
        .with_label_values(&[method, endpoint, outcome])
        .inc();
}

/// Observe a request latency sample.
pub fn observe_latency(method: &str, endpoint: &str, seconds: f64) {
    HMC_REQUEST_LATENCY
        .with_label_values(&[method, endpoint])
        .observe(seconds);
}

/// Track a retry for a specific endpoint.
pub fn track_retry(endpoint: &str) {
    RETRY_COUNT.with_label_values(&[endpoint]).inc();
}

/// Track the circuit breaker tripping open.
pub fn track_breaker_open() {
    CIRCUIT_BREAKER_OPEN.inc();
}

/// Track a resize application outcome ("success" or "failure").
pub fn track_apply(outcome: &str) {
    APPLY_RESULTS.with_label_values(&[outcome]).inc();
}
