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

//! Policy evaluation engine.
//!
//! `evaluate` is a pure function of the policy, the LPAR inventory, the
//! metric samples and the supplied clock. Decisions come out in LPAR input
//! order; LPARs no rule matches are skipped.
use std::collections::HashMap;

use chrono::{DateTime, Datelike, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::api::{LogicalPartition, MetricSample};
use crate::error::PolicyError;
use crate::policy::{CpuPolicyCfg, Policy};

pub const REASON_NO_CHANGE: &str = "No change";
pub const REASON_COOLDOWN: &str = "Cooldown active";
pub const REASON_WINDOW_CLOSED: &str = "Window closed";
pub const REASON_CPU_HIGH: &str = "CPU above high threshold";
pub const REASON_CPU_LOW: &str = "CPU below low threshold";
pub const REASON_MEM_LOW_FREE: &str = "Memory free below threshold";
pub const REASON_MEM_HIGH_FREE: &str = "Memory free above threshold";

const DEFAULT_CPU_STEP: f64 = 1.0;
const DEFAULT_MIN_CPU: f64 = 0.0;

/// CPU entitlement and memory for one LPAR at one point in time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Resources {
    pub cpu_ent: f64,
    pub mem_mb: i64,
}

/// The engine's proposal for one LPAR in one evaluation. Immutable once
/// emitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub frame_uuid: String,
    pub lpar_uuid: String,
    pub lpar_name: String,
    pub current: Resources,
    pub target: Resources,
    pub delta: Resources,
    pub reasons: Vec<String>,
    pub window: Option<String>,
    pub cooldown_remaining: i64,
}

impl Decision {
    /// Whether applying this decision would change anything.
    pub fn is_change(&self) -> bool {
        self.delta.cpu_ent != 0.0 || self.delta.mem_mb != 0
    }
}

/// Evaluate a policy against the inventory and metric samples.
pub fn evaluate(
    policy: &Policy,
    lpars: &[LogicalPartition],
    metrics: &HashMap<String, MetricSample>,
    now: DateTime<Utc>,
) -> Result<Vec<Decision>, PolicyError> {
    let mut decisions = Vec::new();
    for lpar in lpars {
        let Some(cfg) = policy.config_for(&lpar.name, &lpar.uuid) else {
            continue;
        };
        let metric = metrics.get(&lpar.uuid).cloned().unwrap_or_default();
        decisions.push(compute_decision(lpar, &cfg, &metric, now)?);
    }
    Ok(decisions)
}

fn compute_decision(
    lpar: &LogicalPartition,
    cfg: &CpuPolicyCfg,
    metric: &MetricSample,
    now: DateTime<Utc>,
) -> Result<Decision, PolicyError> {
    let mut reasons = Vec::new();
    let current = Resources {
        cpu_ent: lpar.cpu_entitlement,
        mem_mb: lpar.memory_mb,
    };
    let mut target = current;
    let cooldown = metric.cooldown.max(0);

    // Gating: both reasons are reported when simultaneously true.
    if cooldown > 0 {
        reasons.push(REASON_COOLDOWN.to_string());
    }
    if let Some(window) = &cfg.window {
        if !within_window(window, now) {
            reasons.push(REASON_WINDOW_CLOSED.to_string());
        }
    }

    if reasons.is_empty() {
        let (cpu_target, cpu_reason) = adjust_cpu(current.cpu_ent, metric.cpu_util_pct, cfg)?;
        target.cpu_ent = cpu_target;
        if let Some(reason) = cpu_reason {
            reasons.push(reason.to_string());
        }
        if let Some(free_mb) = metric.mem_free_mb {
            let (mem_target, mem_reason) = adjust_memory(current.mem_mb, free_mb, cfg)?;
            target.mem_mb = mem_target;
            if let Some(reason) = mem_reason {
                reasons.push(reason.to_string());
            }
        }
    }

    if reasons.is_empty() {
        reasons.push(REASON_NO_CHANGE.to_string());
    }

    Ok(Decision {
        frame_uuid: lpar.frame_uuid.clone(),
        lpar_uuid: lpar.uuid.clone(),
        lpar_name: lpar.name.clone(),
        current,
        target,
        delta: Resources {
            cpu_ent: target.cpu_ent - current.cpu_ent,
            mem_mb: target.mem_mb - current.mem_mb,
        },
        reasons,
        window: cfg.window.clone(),
        cooldown_remaining: cooldown,
    })
}

/// New CPU entitlement and the reason, or the current value when no
/// adjustment is required. Thresholds are strict inequalities; the high
/// branch is checked first.
fn adjust_cpu(
    current: f64,
    util: f64,
    cfg: &CpuPolicyCfg,
) -> Result<(f64, Option<&'static str>), PolicyError> {
    let step = cfg.min_cpu_step.unwrap_or(DEFAULT_CPU_STEP);
    if step <= 0.0 {
        return Err(PolicyError::schema("min_cpu_step must be greater than zero"));
    }
    let min_cpu = cfg.min_cpu.unwrap_or(DEFAULT_MIN_CPU);

    if let Some(high) = cfg.cpu_util_high_pct {
        if util > high && cfg.max_cpu.map_or(true, |max| current < max) {
            let mut target = current + step;
            if let Some(max) = cfg.max_cpu {
                target = target.min(max);
            }
            return Ok((target, Some(REASON_CPU_HIGH)));
        }
    }

    if let Some(low) = cfg.cpu_util_low_pct {
        if util < low && current > min_cpu {
            let target = (current - step).max(min_cpu);
            return Ok((target, Some(REASON_CPU_LOW)));
        }
    }

    Ok((current, None))
}

/// Memory counterpart of [`adjust_cpu`], driven by free-memory headroom.
fn adjust_memory(
    current_mb: i64,
    free_mb: i64,
    cfg: &CpuPolicyCfg,
) -> Result<(i64, Option<&'static str>), PolicyError> {
    let Some(step) = cfg.step_mem_mb else {
        return Ok((current_mb, None));
    };
    if step <= 0 {
        return Err(PolicyError::schema("step_mem_mb must be greater than zero"));
    }

    if let Some(up_below) = cfg.scale_up_mem_free_mb {
        if free_mb < up_below && cfg.max_mem_mb.map_or(true, |max| current_mb < max) {
            let mut target = current_mb + step;
            if let Some(max) = cfg.max_mem_mb {
                target = target.min(max);
            }
            return Ok((target, Some(REASON_MEM_LOW_FREE)));
        }
    }

    if let Some(down_above) = cfg.scale_down_mem_free_mb {
        let min_mem = cfg.min_mem_mb.unwrap_or(0);
        if free_mb > down_above && current_mb > min_mem {
            let target = (current_mb - step).max(min_mem);
            return Ok((target, Some(REASON_MEM_HIGH_FREE)));
        }
    }

    Ok((current_mb, None))
}

/// Whether `now` falls inside a `"HH:MM-HH:MM[,Days]"` window. Malformed
/// windows evaluate to closed.
pub fn within_window(window: &str, now: DateTime<Utc>) -> bool {
    let Some((start, end, days)) = parse_window(window) else {
        return false;
    };
    if !days.contains(&now.weekday()) {
        return false;
    }
    let time = now.time();
    if start <= end {
        start <= time && time <= end
    } else {
        // Start past end wraps across midnight.
        time >= start || time <= end
    }
}

fn parse_window(window: &str) -> Option<(NaiveTime, NaiveTime, Vec<Weekday>)> {
    let (hours, days) = match window.split_once(',') {
        Some((hours, days)) => (hours, days),
        None => (window, "Mon-Sun"),
    };
    let (start_s, end_s) = hours.split_once('-')?;
    let start = NaiveTime::parse_from_str(start_s.trim(), "%H:%M").ok()?;
    let end = NaiveTime::parse_from_str(end_s.trim(), "%H:%M").ok()?;
    Some((start, end, expand_days(days)?))
}

/// Expand `Mon-Fri` (wrapping allowed) or `Mon;Wed;Fri` into weekdays.
fn expand_days(days: &str) -> Option<Vec<Weekday>> {
    if let Some((start, end)) = days.split_once('-') {
        let start = parse_day(start)?;
        let end = parse_day(end)?;
        let mut expanded = vec![start];
        let mut day = start;
        while day != end {
            day = day.succ();
            expanded.push(day);
        }
        return Some(expanded);
    }
    days.split(';').map(parse_day).collect()
}

fn parse_day(day: &str) -> Option<Weekday> {
    match day.trim() {
        "Mon" => Some(Weekday::Mon),
        "Tue" => Some(Weekday::Tue),
        "Wed" => Some(Weekday::Wed),
        "Thu" => Some(Weekday::Thu),
        "Fri" => Some(Weekday::Fri),
        "Sat" => Some(Weekday::Sat),
        "Sun" => Some(Weekday::Sun),
        _ => None,
    }
}
