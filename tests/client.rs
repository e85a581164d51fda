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

//! HTTP-level tests for the session, retry loop and circuit breaker against
//! a mock HMC.
use std::collections::HashMap;

use futures::TryStreamExt;
use serde_json::{json, Value};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use hmc_orchestrator::api::HmcApi;
use hmc_orchestrator::config::{Concurrency, Config, Retries, Timeout, VerifyTls};
use hmc_orchestrator::error::HmcError;
use hmc_orchestrator::session::Session;

fn test_config(retries_total: u32) -> Config {
    Config {
        host: "hmc.test".to_string(),
        port: 12443,
        username: "hscroot".to_string(),
        password: "secret".to_string(),
        verify: VerifyTls::Flag(false),
        timeout: Timeout {
            connect: 1.0,
            read: 5.0,
        },
        retries: Retries {
            total: retries_total,
            backoff_base: 0.001,
            max_backoff: 0.002,
        },
        concurrency: Concurrency { per_frame: 4 },
    }
}

async fn mount_logon(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/rest/api/web/Logon"))
        .respond_with(ResponseTemplate::new(200))
        .mount(server)
        .await;
}

async fn requests_to(server: &MockServer, target: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.url.path() == target)
        .count()
}

#[tokio::test]
async fn test_session_relogin_on_401() {
    let server = MockServer::start().await;
    mount_logon(&server).await;

    // First inventory call hits an expired session, second succeeds.
    Mock::given(method("GET"))
        .and(path("/rest/api/uom/ManagedSystem"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/api/uom/ManagedSystem"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Items": []})))
        .mount(&server)
        .await;

    let session = Session::with_base_url(&test_config(5), "run-1", server.uri()).unwrap();
    let api = HmcApi::new(session);
    let systems = api.list_managed_systems().await.unwrap();
    assert!(systems.is_empty());

    assert_eq!(requests_to(&server, "/rest/api/web/Logon").await, 2);
    assert_eq!(requests_to(&server, "/rest/api/uom/ManagedSystem").await, 2);
}

#[tokio::test]
async fn test_retry_succeeds_after_server_error() {
    let server = MockServer::start().await;
    mount_logon(&server).await;

    Mock::given(method("GET"))
        .and(path("/rest/api/uom/ManagedSystem"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/api/uom/ManagedSystem"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Items": [{"uuid": "f1", "name": "frame-1"}]
        })))
        .mount(&server)
        .await;

    let session = Session::with_base_url(&test_config(3), "run-1", server.uri()).unwrap();
    let api = HmcApi::new(session);
    let systems = api.list_managed_systems().await.unwrap();
    assert_eq!(systems.len(), 1);
    assert_eq!(systems[0].name, "frame-1");
    assert_eq!(requests_to(&server, "/rest/api/uom/ManagedSystem").await, 2);
}

#[tokio::test]
async fn test_permanent_error_not_retried() {
    let server = MockServer::start().await;
    mount_logon(&server).await;

    Mock::given(method("GET"))
        .and(path("/rest/api/uom/ManagedSystem"))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .mount(&server)
        .await;

    let session = Session::with_base_url(&test_config(5), "run-1", server.uri()).unwrap();
    let api = HmcApi::new(session);
    let err = api.list_managed_systems().await.unwrap_err();
    assert!(matches!(err, HmcError::Permanent { status: 403, .. }));
    assert!(err.to_string().contains("forbidden"));
    assert_eq!(requests_to(&server, "/rest/api/uom/ManagedSystem").await, 1);
}

#[tokio::test]
async fn test_rate_limit_retry_after_honored() {
    let server = MockServer::start().await;
    mount_logon(&server).await;

    Mock::given(method("GET"))
        .and(path("/rest/api/uom/ManagedSystem"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/api/uom/ManagedSystem"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Items": []})))
        .mount(&server)
        .await;

    let session = Session::with_base_url(&test_config(3), "run-1", server.uri()).unwrap();
    let api = HmcApi::new(session);
    api.list_managed_systems().await.unwrap();
    assert_eq!(requests_to(&server, "/rest/api/uom/ManagedSystem").await, 2);
}

#[tokio::test]
async fn test_breaker_opens_after_consecutive_failures() {
    let server = MockServer::start().await;
    mount_logon(&server).await;

    Mock::given(method("GET"))
        .and(path("/rest/api/uom/ManagedSystem"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    // Breaker threshold is 5; the sixth attempt must fail without touching
    // the network.
    let session = Session::with_base_url(&test_config(6), "run-1", server.uri()).unwrap();
    let api = HmcApi::new(session);
    let err = api.list_managed_systems().await.unwrap_err();
    assert!(err.to_string().contains("circuit open"));
    assert_eq!(requests_to(&server, "/rest/api/uom/ManagedSystem").await, 5);
}

#[tokio::test]
async fn test_correlation_and_idempotency_headers() {
    let server = MockServer::start().await;
    mount_logon(&server).await;

    Mock::given(method("POST"))
        .and(path("/api/lpars/l1/resize"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/lpars/l1/resize"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let session = Session::with_base_url(&test_config(3), "run-xyz", server.uri()).unwrap();
    let api = HmcApi::new(session);
    api.resize_lpar("l1", 2.0, 2048).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let resizes: Vec<_> = requests
        .iter()
        .filter(|r| r.url.path() == "/api/lpars/l1/resize")
        .collect();
    assert_eq!(resizes.len(), 2);

    // Correlation id is the run id on every request; the idempotency key is
    // stable across retries of one logical mutation.
    for request in &requests {
        assert_eq!(
            request
                .headers
                .get("X-Correlation-ID")
                .and_then(|v| v.to_str().ok()),
            Some("run-xyz")
        );
    }
    let keys: Vec<_> = resizes
        .iter()
        .map(|r| r.headers.get("Idempotency-Key").unwrap().clone())
        .collect();
    assert_eq!(keys[0], keys[1]);

    let body: Value = serde_json::from_slice(&resizes[0].body).unwrap();
    assert_eq!(body, json!({"cpu": 2.0, "mem": 2048}));
}

#[tokio::test]
async fn test_lpar_listing_projection() {
    let server = MockServer::start().await;
    mount_logon(&server).await;

    Mock::given(method("GET"))
        .and(path("/rest/api/uom/LogicalPartition"))
        .and(query_param("managedSystemUuid", "f1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Items": [
                {"uuid": "l1", "name": "LP1", "state": "Running",
                 "entitledProcUnits": 1.5, "memory": 4096},
                {"uuid": "l2"}
            ]
        })))
        .mount(&server)
        .await;

    let session = Session::with_base_url(&test_config(3), "run-1", server.uri()).unwrap();
    let api = HmcApi::new(session);
    let lpars = api.list_lpars("f1").await.unwrap();
    assert_eq!(lpars.len(), 2);
    assert_eq!(lpars[0].cpu_entitlement, 1.5);
    assert_eq!(lpars[0].memory_mb, 4096);
    assert_eq!(lpars[0].frame_uuid, "f1");
    // Missing fields fall back to defaults.
    assert_eq!(lpars[1].state, "unknown");
    assert_eq!(lpars[1].cpu_entitlement, 0.0);
}

#[tokio::test]
async fn test_pcm_absent_maps_to_not_enabled() {
    let server = MockServer::start().await;
    mount_logon(&server).await;

    Mock::given(method("GET"))
        .and(path(
            "/rest/api/pcm/ManagedSystem/f1/LogicalPartition/l1/Metrics",
        ))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let session = Session::with_base_url(&test_config(3), "run-1", server.uri()).unwrap();
    let api = HmcApi::new(session);
    let err = api.pcm_metrics("f1", "l1").await.unwrap_err();
    assert!(matches!(err, HmcError::PcmNotEnabled { .. }));
}

#[tokio::test]
async fn test_collection_pagination_follows_next() {
    let server = MockServer::start().await;
    mount_logon(&server).await;

    Mock::given(method("GET"))
        .and(path("/api/lpars"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Items": [{"name": "LP3"}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/lpars"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Items": [{"name": "LP1"}, {"name": "LP2"}],
            "next": "/api/lpars?page=2"
        })))
        .mount(&server)
        .await;

    let session = Session::with_base_url(&test_config(3), "run-1", server.uri()).unwrap();
    let api = HmcApi::new(session);
    let items: Vec<Value> = api.iter_collection("/api/lpars").try_collect().await.unwrap();
    let names: Vec<_> = items
        .iter()
        .map(|i| i["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["LP1", "LP2", "LP3"]);
}

#[tokio::test]
async fn test_logoff_on_close() {
    let server = MockServer::start().await;
    mount_logon(&server).await;

    Mock::given(method("POST"))
        .and(path("/rest/api/web/Logoff"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rest/api/uom/ManagedSystem"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Items": []})))
        .mount(&server)
        .await;

    let session = Session::with_base_url(&test_config(3), "run-1", server.uri()).unwrap();
    let api = HmcApi::new(session);
    api.list_managed_systems().await.unwrap();
    api.session().close().await;
    // Closing twice must not log off twice.
    api.session().close().await;
    assert_eq!(requests_to(&server, "/rest/api/web/Logoff").await, 1);
}

#[tokio::test]
async fn test_concurrent_requests_share_one_login() {
    let server = MockServer::start().await;
    mount_logon(&server).await;

    Mock::given(method("GET"))
        .and(path("/rest/api/uom/ManagedSystem"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Items": []})))
        .mount(&server)
        .await;

    let session = Session::with_base_url(&test_config(3), "run-1", server.uri()).unwrap();
    let api = std::sync::Arc::new(HmcApi::new(session));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let api = api.clone();
        handles.push(tokio::spawn(async move {
            api.list_managed_systems().await.map(|s| s.len())
        }));
    }
    let mut results = HashMap::new();
    for handle in handles {
        let count = handle.await.unwrap().unwrap();
        *results.entry(count).or_insert(0) += 1;
    }
    assert_eq!(results.get(&0), Some(&8));
    assert_eq!(requests_to(&server, "/rest/api/web/Logon").await, 1);
}
