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

//! Authenticated HMC session management.
//!
//! The session exclusively owns the transport, the circuit breaker and the
//! login state. Requests flow through the retry loop; each attempt acquires
//! a per-frame semaphore permit so permits are not held across backoff
//! sleeps.
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use reqwest::{Method, Response};
use serde_json::{json, Value};
use tokio::sync::{Mutex, Semaphore};
use uuid::Uuid;

use crate::circuitbreaker::CircuitBreaker;
use crate::config::Config;
use crate::error::HmcError;
use crate::metrics;
use crate::retry::with_retry;
use crate::transport::Transport;

pub const LOGON_PATH: &str = "/rest/api/web/Logon";
pub const LOGOFF_PATH: &str = "/rest/api/web/Logoff";

const LOGOFF_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Session {
    transport: Transport,
    breaker: CircuitBreaker,
    semaphore: Semaphore,
    logged_in: Mutex<bool>,
    config: Config,
}

impl Session {
    pub fn new(config: &Config, run_id: &str) -> Result<Self, crate::error::ConfigError> {
        let transport = Transport::new(config, run_id)?;
        Ok(Self::from_transport(config, transport))
    }

    /// Session against an explicit base URL (test harnesses).
    pub fn with_base_url(
        config: &Config,
        run_id: &str,
        base_url: impl Into<String>,
    ) -> Result<Self, crate::error::ConfigError> {
        let transport = Transport::with_base_url(config, run_id, base_url)?;
        Ok(Self::from_transport(config, transport))
    }

    fn from_transport(config: &Config, transport: Transport) -> Self {
        Self {
            transport,
            breaker: CircuitBreaker::default(),
            semaphore: Semaphore::new(config.concurrency.per_frame),
            logged_in: Mutex::new(false),
            config: config.clone(),
        }
    }

    pub fn run_id(&self) -> &str {
        self.transport.run_id()
    }

    /// Perform one request with login handling, retries and backoff.
    ///
    /// A non-idempotent method gets one idempotency key for the whole
    /// logical operation, reused verbatim across retries.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Response, HmcError> {
        let idempotency_key = if method == Method::GET || method == Method::HEAD {
            None
        } else {
            Some(Uuid::new_v4().to_string())
        };

        with_retry(&self.config.retries, path, || {
            let method = method.clone();
            let body = body.clone();
            let idempotency_key = idempotency_key.clone();
            async move {
                let _permit = self
                    .semaphore
                    .acquire()
                    .await
                    .expect("session semaphore closed");
                self.request_once(method, path, body.as_ref(), idempotency_key.as_deref())
                    .await
            }
        })
        .await
    }

    pub async fn get(&self, path: &str) -> Result<Response, HmcError> {
        self.request(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<Response, HmcError> {
        self.request(Method::POST, path, Some(body)).await
    }

    /// GET a path and decode the JSON body.
    pub async fn get_json(&self, path: &str) -> Result<Value, HmcError> {
        let resp = self.get(path).await?;
        let text = resp
            .text()
            .await
            .map_err(|e| HmcError::network("GET", self.transport.url_for(path), e.to_string()))?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Best-effort logout; no-op when not logged in, never blocks the
    /// caller beyond a short timeout.
    pub async fn close(&self) {
        let mut logged_in = self.logged_in.lock().await;
        if !*logged_in {
            return;
        }
        *logged_in = false;
        let logoff = self
            .transport
            .execute(Method::POST, LOGOFF_PATH, None, None);
        match tokio::time::timeout(LOGOFF_TIMEOUT, logoff).await {
            Ok(Ok(_)) => info!("HMC session logged off"),
            Ok(Err(e)) => warn!("Logoff failed: {}", e),
            Err(_) => warn!("Logoff timed out after {:?}", LOGOFF_TIMEOUT),
        }
    }

    async fn request_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        idempotency_key: Option<&str>,
    ) -> Result<Response, HmcError> {
        self.ensure_login().await?;
        match self.send_gated(method, path, body, idempotency_key).await {
            Err(err @ HmcError::Auth { .. }) => {
                // Session expired mid-run; the next retry re-logs in.
                *self.logged_in.lock().await = false;
                debug!("Session expired (401), cleared login state");
                Err(err)
            }
            other => other,
        }
    }

    /// Log in if needed. Serialized under the login mutex so concurrent
    /// requests trigger at most one Logon.
    async fn ensure_login(&self) -> Result<(), HmcError> {
        let mut logged_in = self.logged_in.lock().await;
        if *logged_in {
            return Ok(());
        }
        let body = json!({
            "userid": self.config.username,
            "password": self.config.password,
        });
        let key = Uuid::new_v4().to_string();
        self.send_gated(Method::POST, LOGON_PATH, Some(&body), Some(&key))
            .await?;
        *logged_in = true;
        info!("Logged in to HMC as {}", self.config.username);
        Ok(())
    }

    /// One network attempt behind the circuit breaker, with the response
    /// classified into the error taxonomy.
    async fn send_gated(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        idempotency_key: Option<&str>,
    ) -> Result<Response, HmcError> {
        self.breaker.before_request()?;

        let started = Instant::now();
        let method_name = method.as_str().to_string();
        let result = self
            .transport
            .execute(method, path, body, idempotency_key)
            .await;
        metrics::observe_latency(&method_name, path, started.elapsed().as_secs_f64());

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                self.breaker.record_failure();
                metrics::track_request(&method_name, path, "network_error");
                return Err(err);
            }
        };

        let status = response.status();
        let url = response.url().to_string();
        if status.is_success() {
            self.breaker.record_success();
            metrics::track_request(&method_name, path, "success");
            return Ok(response);
        }

        let retry_after = parse_retry_after(&response);
        let body_text = response.text().await.unwrap_or_default();
        match status.as_u16() {
            401 => {
                // Not a breaker failure; the service is answering.
                self.breaker.record_success();
                metrics::track_request(&method_name, path, "auth_error");
                Err(HmcError::auth(method_name, url, &body_text))
            }
            429 => {
                self.breaker.record_failure();
                metrics::track_request(&method_name, path, "rate_limit");
                Err(HmcError::rate_limited(method_name, url, retry_after))
            }
            code if code >= 500 => {
                self.breaker.record_failure();
                metrics::track_request(&method_name, path, "server_error");
                Err(HmcError::transient(
                    method_name,
                    url,
                    Some(code),
                    &body_text,
                    retry_after,
                ))
            }
            code => {
                self.breaker.record_success();
                metrics::track_request(&method_name, path, "client_error");
                Err(HmcError::permanent(method_name, url, code, &body_text))
            }
        }
    }
}

fn parse_retry_after(response: &Response) -> Option<f64> {
    response
        .headers()
        .get("Retry-After")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
}
