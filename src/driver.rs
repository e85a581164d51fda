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

//! Plan/apply driver: orchestrates list -> evaluate -> report -> apply.
//!
//! The driver owns the per-run artifact paths and releases the session on
//! every exit path. Per-target apply failures are captured, not propagated;
//! the run continues and reports them all at the end.
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use comfy_table::Table;
use futures::TryStreamExt;
use log::{info, warn};
use serde_json::Value;

use crate::api::{HmcApi, LogicalPartition, MetricSample};
use crate::audit::AuditLog;
use crate::engine::{evaluate, Decision};
use crate::error::HmcError;
use crate::metrics;
use crate::policy::load_policy;

/// Utilization stubbed in for dry runs, where metrics collection is not
/// wired.
const DRY_RUN_UTIL_PCT: f64 = 10.0;

pub struct ApplyOptions {
    pub apply: bool,
    pub confirm: bool,
    pub audit_log: Option<PathBuf>,
}

pub struct Driver {
    api: HmcApi,
    output_dir: PathBuf,
    json_out: bool,
}

impl Driver {
    pub fn new(api: HmcApi, output_dir: impl Into<PathBuf>, json_out: bool) -> Self {
        Self {
            api,
            output_dir: output_dir.into(),
            json_out,
        }
    }

    pub fn run_id(&self) -> &str {
        self.api.session().run_id()
    }

    /// Stream the flat LPAR collection and tabulate it.
    pub async fn inventory(&self) -> Result<i32> {
        let result = self.inventory_inner().await;
        self.api.session().close().await;
        result
    }

    /// Evaluate a policy against live inventory and write the plan artifact.
    pub async fn plan(&self, policy_path: &Path) -> Result<i32> {
        let result = self.plan_inner(policy_path).await;
        self.api.session().close().await;
        result
    }

    /// Plan, then mutate. Requires both `--apply` and `--confirm`.
    pub async fn apply(&self, policy_path: &Path, opts: &ApplyOptions) -> Result<i32> {
        if !(opts.apply && opts.confirm) {
            eprintln!("refusing to apply: pass both --apply and --confirm");
            return Ok(1);
        }
        let result = self.apply_inner(policy_path, opts).await;
        self.api.session().close().await;
        result
    }

    /// Evaluate a policy with stubbed metrics, optionally writing a report.
    pub async fn policy_dry_run(&self, policy_path: &Path, report: Option<&Path>) -> Result<i32> {
        let result = self.dry_run_inner(policy_path, report).await;
        self.api.session().close().await;
        result
    }

    async fn inventory_inner(&self) -> Result<i32> {
        let items: Vec<Value> = self.api.iter_collection("/api/lpars").try_collect().await?;
        if self.json_out {
            println!("{}", serde_json::to_string_pretty(&items)?);
            return Ok(0);
        }
        let mut table = Table::new();
        table.set_header(vec!["name", "uuid", "state", "cpu", "memory_mb"]);
        for item in &items {
            table.add_row(vec![
                field(item, "name"),
                field(item, "uuid"),
                field(item, "state"),
                field(item, "cpu"),
                field(item, "memory_mb"),
            ]);
        }
        println!("{table}");
        info!("Listed {} LPARs", items.len());
        Ok(0)
    }

    async fn plan_inner(&self, policy_path: &Path) -> Result<i32> {
        let policy = load_policy(policy_path)?;
        let lpars = self.list_all_lpars().await?;
        let metrics = self.collect_metrics(&lpars).await?;
        let decisions = evaluate(&policy, &lpars, &metrics, Utc::now())?;

        let artifact = self.artifact_path("plan");
        write_json(&artifact, &decisions)?;
        info!(
            "Wrote plan with {} decisions to {}",
            decisions.len(),
            artifact.display()
        );

        self.render_decisions(&decisions)?;
        Ok(0)
    }

    async fn apply_inner(&self, policy_path: &Path, opts: &ApplyOptions) -> Result<i32> {
        let policy = load_policy(policy_path)?;
        let lpars = self.list_all_lpars().await?;
        let samples = self.collect_metrics(&lpars).await?;
        let decisions = evaluate(&policy, &lpars, &samples, Utc::now())?;

        let artifact = self.artifact_path("apply");
        write_json(&artifact, &decisions)?;
        self.render_decisions(&decisions)?;

        let audit = match &opts.audit_log {
            Some(path) => Some(AuditLog::new(path).context("failed to open audit log")?),
            None => None,
        };

        let mut succeeded: usize = 0;
        let mut failures: Vec<(String, String)> = Vec::new();
        for decision in &decisions {
            let outcome = self
                .api
                .resize_lpar(
                    &decision.lpar_uuid,
                    decision.target.cpu_ent,
                    decision.target.mem_mb,
                )
                .await;
            match outcome {
                Ok(()) => {
                    succeeded += 1;
                    metrics::track_apply("success");
                    if let Some(audit) = &audit {
                        audit.append(self.run_id(), decision)?;
                    }
                }
                Err(err) => {
                    metrics::track_apply("failure");
                    failures.push((decision.lpar_name.clone(), err.to_string()));
                }
            }
        }

        for (lpar, reason) in &failures {
            eprintln!("{}: {}", lpar, reason);
        }
        println!("{} succeeded, {} failed", succeeded, failures.len());
        Ok(if failures.is_empty() { 0 } else { 1 })
    }

    async fn dry_run_inner(&self, policy_path: &Path, report: Option<&Path>) -> Result<i32> {
        let policy = load_policy(policy_path)?;
        let lpars = self.list_all_lpars().await?;
        let samples: HashMap<String, MetricSample> = lpars
            .iter()
            .map(|lp| {
                (
                    lp.uuid.clone(),
                    MetricSample {
                        cpu_util_pct: DRY_RUN_UTIL_PCT,
                        cooldown: 0,
                        mem_free_mb: None,
                    },
                )
            })
            .collect();
        let decisions = evaluate(&policy, &lpars, &samples, Utc::now())?;

        if let Some(report) = report {
            write_report(report, &decisions)?;
            info!("Wrote report to {}", report.display());
        }
        for d in &decisions {
            println!(
                "{}: CPU {} -> {} ({})",
                d.lpar_name,
                d.current.cpu_ent,
                d.target.cpu_ent,
                d.reasons.join(",")
            );
        }
        Ok(0)
    }

    /// All LPARs across all managed systems, in frame order.
    async fn list_all_lpars(&self) -> Result<Vec<LogicalPartition>, HmcError> {
        let mut lpars = Vec::new();
        for system in self.api.list_managed_systems().await? {
            let mut frame_lpars = self.api.list_lpars(&system.uuid).await?;
            info!(
                "Managed system {} ({}): {} LPARs",
                system.name,
                system.uuid,
                frame_lpars.len()
            );
            lpars.append(&mut frame_lpars);
        }
        Ok(lpars)
    }

    /// One metric sample per LPAR. PCM being disabled is not fatal; those
    /// LPARs evaluate with zero utilization.
    async fn collect_metrics(
        &self,
        lpars: &[LogicalPartition],
    ) -> Result<HashMap<String, MetricSample>, HmcError> {
        let mut samples = HashMap::new();
        for lpar in lpars {
            let sample = match self.api.pcm_metrics(&lpar.frame_uuid, &lpar.uuid).await {
                Ok(sample) => sample,
                Err(HmcError::PcmNotEnabled { .. }) => {
                    warn!("metrics unavailable for LPAR {}", lpar.name);
                    MetricSample::default()
                }
                Err(err) => return Err(err),
            };
            samples.insert(lpar.uuid.clone(), sample);
        }
        Ok(samples)
    }

    fn artifact_path(&self, kind: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}-{}.json", kind, self.run_id()))
    }

    fn render_decisions(&self, decisions: &[Decision]) -> Result<()> {
        if self.json_out {
            println!("{}", serde_json::to_string_pretty(decisions)?);
            return Ok(());
        }
        let mut table = Table::new();
        table.set_header(vec![
            "lpar", "frame", "cpu", "target", "delta", "mem_mb", "reasons", "cooldown",
        ]);
        for d in decisions {
            table.add_row(vec![
                d.lpar_name.clone(),
                d.frame_uuid.clone(),
                d.current.cpu_ent.to_string(),
                d.target.cpu_ent.to_string(),
                format!("{:+}", d.delta.cpu_ent),
                format!("{} -> {}", d.current.mem_mb, d.target.mem_mb),
                d.reasons.join("; "),
                d.cooldown_remaining.to_string(),
            ]);
        }
        println!("{table}");
        Ok(())
    }
}

/// Validate a policy file without touching the HMC.
pub fn validate_policy(policy_path: &Path) -> Result<i32> {
    load_policy(policy_path)?;
    println!("Policy is valid");
    Ok(0)
}

fn field(item: &Value, key: &str) -> String {
    match item.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(value) => value.to_string(),
        None => "-".to_string(),
    }
}

fn write_json(path: &Path, decisions: &[Decision]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let file = File::create(path)
        .with_context(|| format!("failed to create artifact {}", path.display()))?;
    serde_json::to_writer_pretty(file, decisions)?;
    Ok(())
}

/// Write a decision report as `.json` or `.csv`; any other suffix is a user
/// error.
pub fn write_report(path: &Path, decisions: &[Decision]) -> Result<()> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => write_json(path, decisions),
        Some("csv") => write_csv(path, decisions),
        _ => Err(anyhow!("report must end with .json or .csv")),
    }
}

fn write_csv(path: &Path, decisions: &[Decision]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create report {}", path.display()))?;
    writer.write_record([
        "frame_uuid",
        "lpar_uuid",
        "lpar_name",
        "current_cpu_ent",
        "current_mem_mb",
        "target_cpu_ent",
        "target_mem_mb",
        "delta_cpu_ent",
        "delta_mem_mb",
        "reasons",
        "window",
        "cooldown_remaining",
    ])?;
    for d in decisions {
        writer.write_record([
            d.frame_uuid.clone(),
            d.lpar_uuid.clone(),
            d.lpar_name.clone(),
            d.current.cpu_ent.to_string(),
            d.current.mem_mb.to_string(),
            d.target.cpu_ent.to_string(),
            d.target.mem_mb.to_string(),
            d.delta.cpu_ent.to_string(),
            d.delta.mem_mb.to_string(),
            d.reasons.join(";"),
            d.window.clone().unwrap_or_default(),
            d.cooldown_remaining.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Resources;

    fn decision() -> Decision {
        Decision {
            frame_uuid: "f1".to_string(),
            lpar_uuid: "l1".to_string(),
            lpar_name: "LP1".to_string(),
            current: Resources {
                cpu_ent: 1.0,
                mem_mb: 1024,
            },
            target: Resources {
                cpu_ent: 2.0,
                mem_mb: 1024,
            },
            reasons: vec!["CPU above high threshold".to_string()],
            delta: Resources {
                cpu_ent: 1.0,
                mem_mb: 0,
            },
            window: Some("00:00-23:59,Mon-Sun".to_string()),
            cooldown_remaining: 0,
        }
    }

    #[test]
    fn test_json_report_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let decisions = vec![decision()];
        write_report(&path, &decisions).unwrap();
        let restored: Vec<Decision> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(restored, decisions);
    }

    #[test]
    fn test_csv_report_joins_reasons() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.csv");
        let mut d = decision();
        d.reasons.push("Window closed".to_string());
        write_report(&path, &[d]).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("frame_uuid,"));
        assert!(content.contains("CPU above high threshold;Window closed"));
    }

    #[test]
    fn test_unknown_report_suffix_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.xml");
        let err = write_report(&path, &[decision()]).unwrap_err();
        assert!(err.to_string().contains(".json or .csv"));
    }
}
