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

//! CLI entry point for the HMC orchestrator.
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::error;
use uuid::Uuid;

use hmc_orchestrator::api::HmcApi;
use hmc_orchestrator::config::{load_config, CliOverrides};
use hmc_orchestrator::driver::{validate_policy, ApplyOptions, Driver};
use hmc_orchestrator::error::{ConfigError, PolicyError};
use hmc_orchestrator::logging::setup_logging;
use hmc_orchestrator::session::Session;

/// IBM HMC LPAR CPU/memory orchestrator
#[derive(Parser)]
#[command(name = "hmc-orchestrator")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Disable TLS certificate verification
    #[arg(long, global = true)]
    no_verify: bool,

    /// Output JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    /// Run identifier; defaults to a fresh UUID
    #[arg(long, global = true)]
    run_id: Option<String>,

    /// Directory for plan/apply artifacts
    #[arg(long, global = true, default_value = ".")]
    output: PathBuf,

    /// Path to the YAML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List LPARs across all managed systems
    #[command(alias = "list")]
    Inventory,

    /// Evaluate a policy and write the plan artifact
    Plan {
        /// Policy YAML/JSON file
        policy: PathBuf,
    },

    /// Evaluate a policy and apply the resulting decisions
    Apply {
        /// Policy YAML/JSON file
        policy: PathBuf,

        /// Actually mutate LPARs (with --confirm)
        #[arg(long)]
        apply: bool,

        /// Confirm the mutation (with --apply)
        #[arg(long)]
        confirm: bool,

        /// Append applied decisions to this JSONL file
        #[arg(long)]
        audit_log: Option<PathBuf>,
    },

    /// Policy commands
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },
}

#[derive(Subcommand)]
enum PolicyCommands {
    /// Validate a policy file
    Validate {
        /// Policy YAML/JSON file
        file: PathBuf,
    },

    /// Evaluate a policy with stubbed metrics
    DryRun {
        /// Policy YAML/JSON file
        file: PathBuf,

        /// Write decisions to FILE.{json,csv}
        #[arg(long)]
        report: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose, cli.quiet, cli.json);

    match run(cli).await {
        Ok(code) => ExitCode::from(code.min(u8::MAX as i32) as u8),
        Err(err) => {
            error!("{:#}", err);
            eprintln!("Error: {:#}", err);
            let validation = err.downcast_ref::<ConfigError>().is_some()
                || err.downcast_ref::<PolicyError>().is_some();
            ExitCode::from(if validation { 2 } else { 1 })
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    // Validation needs neither credentials nor a session.
    if let Commands::Policy {
        command: PolicyCommands::Validate { file },
    } = &cli.command
    {
        return validate_policy(file);
    }

    let overrides = CliOverrides {
        no_verify: cli.no_verify,
        config_path: cli.config.clone(),
    };
    let config = load_config(&overrides)?;

    let run_id = cli
        .run_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let session = Session::new(&config, &run_id)?;
    let driver = Driver::new(HmcApi::new(session), &cli.output, cli.json);

    match &cli.command {
        Commands::Inventory => driver.inventory().await,
        Commands::Plan { policy } => driver.plan(policy).await,
        Commands::Apply {
            policy,
            apply,
            confirm,
            audit_log,
        } => {
            let opts = ApplyOptions {
                apply: *apply,
                confirm: *confirm,
                audit_log: audit_log.clone(),
            };
            driver.apply(policy, &opts).await
        }
        Commands::Policy { command } => match command {
            PolicyCommands::Validate { file } => validate_policy(file),
            PolicyCommands::DryRun { file, report } => {
                driver.policy_dry_run(file, report.as_deref()).await
            }
        },
    }
}
