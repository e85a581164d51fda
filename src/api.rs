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

//! Typed wrappers around the HMC UOM and PCM endpoints.
use std::collections::VecDeque;

use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::HmcError;
use crate::session::Session;

/// A physical server (frame) managed by the HMC.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManagedSystem {
    pub uuid: String,
    pub name: String,
}

/// A logical partition on a managed system. Immutable within a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogicalPartition {
    pub uuid: String,
    pub name: String,
    pub state: String,
    pub cpu_entitlement: f64,
    pub memory_mb: i64,
    /// Owning managed system, filled in by [`HmcApi::list_lpars`].
    pub frame_uuid: String,
}

/// One PCM metrics sample for an LPAR.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    #[serde(default)]
    pub cpu_util_pct: f64,
    /// Seconds remaining until the next change is permitted.
    #[serde(default)]
    pub cooldown: i64,
    #[serde(default)]
    pub mem_free_mb: Option<i64>,
}

pub struct HmcApi {
    session: Session,
}

impl HmcApi {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn list_managed_systems(&self) -> Result<Vec<ManagedSystem>, HmcError> {
        let data = self.session.get_json("/rest/api/uom/ManagedSystem").await?;
        let mut systems = Vec::new();
        for item in items(&data) {
            systems.push(ManagedSystem {
                uuid: str_field(item, "uuid"),
                name: str_field(item, "name"),
            });
        }
        Ok(systems)
    }

    pub async fn list_lpars(&self, ms_uuid: &str) -> Result<Vec<LogicalPartition>, HmcError> {
        let path = format!(
            "/rest/api/uom/LogicalPartition?managedSystemUuid={}",
            ms_uuid
        );
        let data = self.session.get_json(&path).await?;
        let mut lpars = Vec::new();
        for item in items(&data) {
            lpars.push(LogicalPartition {
                uuid: str_field(item, "uuid"),
                name: str_field(item, "name"),
                state: item
                    .get("state")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown")
                    .to_string(),
                cpu_entitlement: num_field(item, "entitledProcUnits"),
                memory_mb: num_field(item, "memory") as i64,
                frame_uuid: ms_uuid.to_string(),
            });
        }
        Ok(lpars)
    }

    /// Fetch one PCM sample; a 404 means PCM is not enabled for the LPAR.
    pub async fn pcm_metrics(
        &self,
        ms_uuid: &str,
        lpar_uuid: &str,
    ) -> Result<MetricSample, HmcError> {
        let path = format!(
            "/rest/api/pcm/ManagedSystem/{}/LogicalPartition/{}/Metrics",
            ms_uuid, lpar_uuid
        );
        let data = match self.session.get_json(&path).await {
            Ok(data) => data,
            Err(HmcError::Permanent { status: 404, .. }) => {
                return Err(HmcError::PcmNotEnabled {
                    lpar_uuid: lpar_uuid.to_string(),
                })
            }
            Err(err) => return Err(err),
        };
        Ok(serde_json::from_value(data)?)
    }

    /// Resize an LPAR's CPU entitlement and memory.
    pub async fn resize_lpar(
        &self,
        lpar_uuid: &str,
        cpu: f64,
        mem_mb: i64,
    ) -> Result<(), HmcError> {
        let path = format!("/api/lpars/{}/resize", lpar_uuid);
        self.session
            .post(&path, json!({"cpu": cpu, "mem": mem_mb}))
            .await?;
        Ok(())
    }

    /// Stream items from a paginated HMC collection, following the `next`
    /// cursor until absent. Finite, not restartable.
    pub fn iter_collection<'a>(
        &'a self,
        path: &str,
    ) -> impl Stream<Item = Result<Value, HmcError>> + 'a {
        let state = (Some(path.to_string()), VecDeque::new());
        stream::try_unfold(state, move |(mut next, mut buffered)| async move {
            loop {
                if let Some(item) = buffered.pop_front() {
                    return Ok(Some((item, (next, buffered))));
                }
                let Some(page) = next.take() else {
                    return Ok(None);
                };
                let data = self.session.get_json(&page).await?;
                next = data
                    .get("next")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                if let Some(items) = data.get("Items").and_then(Value::as_array) {
                    buffered.extend(items.iter().cloned());
                }
            }
        })
    }
}

fn items(data: &Value) -> impl Iterator<Item = &Value> {
    data.get("Items")
        .and_then(Value::as_array)
        .map(|v| v.iter())
        .unwrap_or_default()
}

fn str_field(item: &Value, key: &str) -> String {
    item.get(key)
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

/// Numeric field that may arrive as a JSON number or numeric string.
fn num_field(item: &Value, key: &str) -> f64 {
    match item.get(key) {
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        Some(Value::String(s)) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lpar_projection_defaults() {
        let item = json!({"uuid": "l1"});
        assert_eq!(str_field(&item, "uuid"), "l1");
        assert_eq!(str_field(&item, "name"), "unknown");
        assert_eq!(num_field(&item, "entitledProcUnits"), 0.0);
    }

    #[test]
    fn test_num_field_accepts_strings() {
        let item = json!({"entitledProcUnits": "1.5", "memory": 4096});
        assert_eq!(num_field(&item, "entitledProcUnits"), 1.5);
        assert_eq!(num_field(&item, "memory"), 4096.0);
    }

    #[test]
    fn test_metric_sample_decodes_partial_payload() {
        let sample: MetricSample =
            serde_json::from_value(json!({"cpu_util_pct": 42.0})).unwrap();
        assert_eq!(sample.cpu_util_pct, 42.0);
        assert_eq!(sample.cooldown, 0);
        assert_eq!(sample.mem_free_mb, None);
    }
}
