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

//! Logging configuration for the orchestrator CLI.
use chrono::Utc;
use env_logger::{Builder, Env};
use log::LevelFilter;
use std::io::Write;

/// Set up logging from the global CLI flags.
///
/// `--quiet` wins over `--verbose`; `--json` switches to one JSON object per
/// line so the output can be shipped alongside the audit log.
pub fn setup_logging(verbose: bool, quiet: bool, json: bool) {
    let level = if quiet {
        LevelFilter::Error
    } else if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let mut builder = Builder::from_env(Env::default());

    if json {
        builder.format(|buf, record| {
            let json = serde_json::json!({
                "timestamp": Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
                "level": record.level().to_string(),
                "target": record.target().to_string(),
                "message": record.args().to_string(),
            });
            writeln!(buf, "{}", json)
        });
    } else {
        builder.format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
                record.level(),
                record.target(),
                record.args()
            )
        });
    }

    builder.filter_level(level);
    // Tests and embedding callers may initialize more than once.
    let _ = builder.try_init();
}
