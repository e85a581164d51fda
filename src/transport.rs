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

//! HTTP transport: the sole emitter of network I/O.
//!
//! Builds a connection-pooled client bound to the HMC base URL and executes
//! single requests. Never retries, never interprets status codes; that is
//! the session's and retry loop's job.
use std::fs;
use std::time::Duration;

use log::{debug, info};
use reqwest::{Certificate, Client, ClientBuilder, Method, Response};
use serde_json::Value;

use crate::config::{Config, VerifyTls};
use crate::error::{ConfigError, HmcError};

pub const CORRELATION_HEADER: &str = "X-Correlation-ID";
pub const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

pub struct Transport {
    client: Client,
    base_url: String,
    run_id: String,
}

impl Transport {
    /// Create a transport bound to `https://{host}:{port}` from the config.
    pub fn new(config: &Config, run_id: &str) -> Result<Self, ConfigError> {
        Self::with_base_url(config, run_id, config.base_url())
    }

    /// Create a transport against an explicit base URL (test harnesses).
    pub fn with_base_url(
        config: &Config,
        run_id: &str,
        base_url: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let connect = Duration::from_secs_f64(config.timeout.connect);
        let read = Duration::from_secs_f64(config.timeout.read);

        let mut builder = ClientBuilder::new()
            .connect_timeout(connect)
            // Deadline for the whole request: connect plus read budget.
            .timeout(connect + read)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .user_agent(format!("hmc-orchestrator/{}", env!("CARGO_PKG_VERSION")));

        builder = match &config.verify {
            VerifyTls::Flag(true) => builder,
            VerifyTls::Flag(false) => builder.danger_accept_invalid_certs(true),
            VerifyTls::Bundle(path) => {
                let pem = fs::read(path).map_err(|e| ConfigError::FileError {
                    path: path.display().to_string(),
                    error: e.to_string(),
                })?;
                let cert = Certificate::from_pem(&pem)
                    .map_err(|e| ConfigError::invalid(format!("invalid CA bundle: {}", e)))?;
                builder.add_root_certificate(cert)
            }
        };

        let client = builder
            .build()
            .map_err(|e| ConfigError::invalid(format!("failed to build HTTP client: {}", e)))?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        info!(
            "Created HMC transport for {} with connect timeout {:?}, read timeout {:?}",
            base_url, connect, read
        );

        Ok(Self {
            client,
            base_url,
            run_id: run_id.to_string(),
        })
    }

    pub fn url_for(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Execute one request. Every request carries the run correlation id;
    /// non-idempotent methods additionally carry the caller's idempotency
    /// key so the HMC can deduplicate retried mutations.
    pub async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        idempotency_key: Option<&str>,
    ) -> Result<Response, HmcError> {
        let url = self.url_for(path);
        debug!("HTTP {} {}", method, url);

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header(CORRELATION_HEADER, &self.run_id);
        if let Some(key) = idempotency_key {
            request = request.header(IDEMPOTENCY_HEADER, key);
        }
        if let Some(json) = body {
            request = request.json(json);
        }

        request
            .send()
            .await
            .map_err(|e| HmcError::network(method.as_str(), url, e.to_string()))
    }
}
