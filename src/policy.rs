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

//! Autoscaling policy model and loader.
//!
//! Policies are YAML or JSON. The loader performs minimal structural
//! validation: the top level must be a mapping with a `rules` sequence, each
//! rule must carry `match` and `targets`, and unknown top-level keys are
//! rejected. Extra keys on a rule are folded into its overrides.
use std::env;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

use crate::error::PolicyError;

/// Per-rule scaling knobs; every field optional so rules can override
/// defaults selectively.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CpuPolicyCfg {
    pub cpu_util_high_pct: Option<f64>,
    pub cpu_util_low_pct: Option<f64>,
    pub min_cpu_step: Option<f64>,
    pub min_cpu: Option<f64>,
    pub max_cpu: Option<f64>,
    /// `"HH:MM-HH:MM[,Days]"`; evaluation is gated outside the window.
    pub window: Option<String>,
    pub min_mem_mb: Option<i64>,
    pub max_mem_mb: Option<i64>,
    pub step_mem_mb: Option<i64>,
    pub scale_up_mem_free_mb: Option<i64>,
    pub scale_down_mem_free_mb: Option<i64>,
}

impl CpuPolicyCfg {
    /// Field-wise merge; values in `overlay` win when present.
    pub fn merged_with(&self, overlay: &CpuPolicyCfg) -> CpuPolicyCfg {
        CpuPolicyCfg {
            cpu_util_high_pct: overlay.cpu_util_high_pct.or(self.cpu_util_high_pct),
            cpu_util_low_pct: overlay.cpu_util_low_pct.or(self.cpu_util_low_pct),
            min_cpu_step: overlay.min_cpu_step.or(self.min_cpu_step),
            min_cpu: overlay.min_cpu.or(self.min_cpu),
            max_cpu: overlay.max_cpu.or(self.max_cpu),
            window: overlay.window.clone().or_else(|| self.window.clone()),
            min_mem_mb: overlay.min_mem_mb.or(self.min_mem_mb),
            max_mem_mb: overlay.max_mem_mb.or(self.max_mem_mb),
            step_mem_mb: overlay.step_mem_mb.or(self.step_mem_mb),
            scale_up_mem_free_mb: overlay.scale_up_mem_free_mb.or(self.scale_up_mem_free_mb),
            scale_down_mem_free_mb: overlay
                .scale_down_mem_free_mb
                .or(self.scale_down_mem_free_mb),
        }
    }

    fn validate(&self, context: &str) -> Result<(), PolicyError> {
        if let (Some(low), Some(high)) = (self.cpu_util_low_pct, self.cpu_util_high_pct) {
            if low >= high {
                return Err(PolicyError::schema(format!(
                    "{}: cpu_util_low_pct must be below cpu_util_high_pct",
                    context
                )));
            }
        }
        if let (Some(min), Some(max)) = (self.min_cpu, self.max_cpu) {
            if min > max {
                return Err(PolicyError::schema(format!(
                    "{}: min_cpu must not exceed max_cpu",
                    context
                )));
            }
        }
        if let Some(step) = self.min_cpu_step {
            if step <= 0.0 {
                return Err(PolicyError::schema(format!(
                    "{}: min_cpu_step must be greater than zero",
                    context
                )));
            }
        }
        if let Some(step) = self.step_mem_mb {
            if step <= 0 {
                return Err(PolicyError::schema(format!(
                    "{}: step_mem_mb must be greater than zero",
                    context
                )));
            }
        }
        if let (Some(min), Some(max)) = (self.min_mem_mb, self.max_mem_mb) {
            if min > max {
                return Err(PolicyError::schema(format!(
                    "{}: min_mem_mb must not exceed max_mem_mb",
                    context
                )));
            }
        }
        Ok(())
    }
}

/// Which LPARs a rule applies to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MatchSpec {
    #[serde(default)]
    pub lpar_names: Vec<String>,
    #[serde(default)]
    pub lpar_uuids: Vec<String>,
}

impl MatchSpec {
    pub fn matches(&self, name: &str, uuid: &str) -> bool {
        self.lpar_names.iter().any(|n| n == name) || self.lpar_uuids.iter().any(|u| u == uuid)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Rule {
    #[serde(rename = "match")]
    pub match_spec: MatchSpec,
    pub targets: CpuPolicyCfg,
    #[serde(default)]
    pub overrides: CpuPolicyCfg,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Policy {
    #[serde(default)]
    pub defaults: CpuPolicyCfg,
    pub rules: Vec<Rule>,
    /// LPAR names never considered by any rule.
    #[serde(default)]
    pub exclude_lpars: Vec<String>,
}

impl Policy {
    /// Effective config for an LPAR: first matching rule, merged
    /// defaults <- overrides <- targets. `None` when no rule matches or the
    /// LPAR is excluded.
    pub fn config_for(&self, name: &str, uuid: &str) -> Option<CpuPolicyCfg> {
        if self.exclude_lpars.iter().any(|n| n == name) {
            return None;
        }
        let rule = self.rules.iter().find(|r| r.match_spec.matches(name, uuid))?;
        Some(
            self.defaults
                .merged_with(&rule.overrides)
                .merged_with(&rule.targets),
        )
    }

    fn validate(&self) -> Result<(), PolicyError> {
        self.defaults.validate("defaults")?;
        for (i, rule) in self.rules.iter().enumerate() {
            let context = format!("rule {}", i);
            if rule.match_spec.lpar_names.is_empty() && rule.match_spec.lpar_uuids.is_empty() {
                return Err(PolicyError::schema(format!(
                    "{}: match requires lpar_names or lpar_uuids",
                    context
                )));
            }
            rule.targets.validate(&context)?;
            rule.overrides.validate(&context)?;
        }
        Ok(())
    }
}

const TOP_LEVEL_KEYS: &[&str] = &["defaults", "rules", "exclude_lpars"];
const RULE_KEYS: &[&str] = &["match", "targets", "overrides"];

/// Load a policy file from inside the current working directory tree.
pub fn load_policy(path: impl AsRef<Path>) -> Result<Policy, PolicyError> {
    let path = path.as_ref();
    reject_traversal(path)?;

    let content = fs::read_to_string(path).map_err(|e| PolicyError::FileError {
        path: path.display().to_string(),
        error: e.to_string(),
    })?;
    parse_policy(&content)
}

/// Parse and structurally validate a policy document.
pub fn parse_policy(content: &str) -> Result<Policy, PolicyError> {
    let doc: Value = serde_yaml::from_str(content)?;
    let mapping = doc
        .as_mapping()
        .ok_or_else(|| PolicyError::schema("policy must be a mapping"))?;

    for key in mapping.keys() {
        let name = key.as_str().unwrap_or_default();
        if !TOP_LEVEL_KEYS.contains(&name) {
            return Err(PolicyError::schema(format!(
                "unknown top-level key '{}'",
                name
            )));
        }
    }
    let rules = mapping
        .get("rules")
        .ok_or_else(|| PolicyError::schema("rules required"))?;
    let rules = rules
        .as_sequence()
        .ok_or_else(|| PolicyError::schema("rules must be a sequence"))?;

    let mut normalized = Mapping::new();
    for (key, value) in mapping {
        if key.as_str() != Some("rules") {
            normalized.insert(key.clone(), value.clone());
        }
    }
    let mut normalized_rules = Vec::with_capacity(rules.len());
    for (i, rule) in rules.iter().enumerate() {
        normalized_rules.push(normalize_rule(rule, i)?);
    }
    normalized.insert(Value::from("rules"), Value::Sequence(normalized_rules));

    let policy: Policy = serde_yaml::from_value(Value::Mapping(normalized))?;
    policy.validate()?;
    Ok(policy)
}

/// Each rule must carry `match` and `targets`; any other key is folded into
/// the rule's overrides mapping.
fn normalize_rule(rule: &Value, index: usize) -> Result<Value, PolicyError> {
    let mapping = rule
        .as_mapping()
        .ok_or_else(|| PolicyError::schema(format!("rule {} must be a mapping", index)))?;
    if !mapping.contains_key("match") || !mapping.contains_key("targets") {
        return Err(PolicyError::schema("each rule requires match and targets"));
    }

    let mut normalized = Mapping::new();
    let mut overrides = mapping
        .get("overrides")
        .and_then(Value::as_mapping)
        .cloned()
        .unwrap_or_default();
    for (key, value) in mapping {
        let name = key.as_str().unwrap_or_default();
        if RULE_KEYS.contains(&name) {
            normalized.insert(key.clone(), value.clone());
        } else {
            overrides.insert(key.clone(), value.clone());
        }
    }
    normalized.insert(Value::from("overrides"), Value::Mapping(overrides));
    Ok(Value::Mapping(normalized))
}

/// The policy path must resolve inside the process's working directory.
fn reject_traversal(path: &Path) -> Result<(), PolicyError> {
    let invalid = || PolicyError::InvalidPath {
        path: path.display().to_string(),
    };
    let cwd = env::current_dir()
        .and_then(|d| d.canonicalize())
        .map_err(|_| invalid())?;
    let resolved = path.canonicalize().map_err(|_| invalid())?;
    if resolved.starts_with(&cwd) {
        Ok(())
    } else {
        Err(invalid())
    }
}
