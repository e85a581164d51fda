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

//! Configuration for the HMC orchestrator.
//!
//! Precedence is CLI > environment > YAML file. The file defaults to
//! `~/.hmc_orchestrator.yaml` and can be pointed elsewhere with `HMC_CONFIG`
//! or `--config`.
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// TLS verification mode: a boolean toggle or a CA bundle path.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum VerifyTls {
    Flag(bool),
    Bundle(PathBuf),
}

impl Default for VerifyTls {
    fn default() -> Self {
        VerifyTls::Flag(true)
    }
}

/// Connect and read timeouts in seconds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Timeout {
    #[serde(default = "default_timeout_connect")]
    pub connect: f64,

    #[serde(default = "default_timeout_read")]
    pub read: f64,
}

/// Retry tuning for the HMC client.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Retries {
    /// Total attempt budget, not additional retries.
    #[serde(default = "default_retries_total")]
    pub total: u32,

    /// Base delay in seconds for exponential backoff; also the jitter bound.
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,

    /// Upper bound in seconds for any single backoff sleep.
    #[serde(default = "default_max_backoff")]
    pub max_backoff: f64,
}

/// Concurrency limits.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Concurrency {
    /// Simultaneous in-flight requests per HMC session.
    #[serde(default = "default_per_frame")]
    pub per_frame: usize,
}

/// Immutable orchestrator configuration, constructed once at startup.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    pub username: String,

    pub password: String,

    #[serde(default)]
    pub verify: VerifyTls,

    #[serde(default)]
    pub timeout: Timeout,

    #[serde(default)]
    pub retries: Retries,

    #[serde(default)]
    pub concurrency: Concurrency,
}

impl Config {
    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.host, self.port)
    }

    /// Copy with the password replaced, safe to log.
    pub fn sanitized(&self) -> Self {
        Config {
            password: "[REDACTED]".to_string(),
            ..self.clone()
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::MissingField {
                field: "host".to_string(),
            });
        }
        if self.username.is_empty() {
            return Err(ConfigError::MissingField {
                field: "username".to_string(),
            });
        }
        if self.password.is_empty() {
            return Err(ConfigError::MissingField {
                field: "password".to_string(),
            });
        }
        if self.timeout.connect <= 0.0 || self.timeout.read <= 0.0 {
            return Err(ConfigError::invalid("timeouts must be greater than zero"));
        }
        if self.retries.backoff_base < 0.0 || self.retries.max_backoff < 0.0 {
            return Err(ConfigError::invalid("backoff values must not be negative"));
        }
        if self.retries.backoff_base > self.retries.max_backoff {
            return Err(ConfigError::invalid(
                "retries.backoff_base must not exceed retries.max_backoff",
            ));
        }
        if self.concurrency.per_frame < 1 {
            return Err(ConfigError::invalid("concurrency.per_frame must be >= 1"));
        }
        Ok(())
    }
}

/// Overrides supplied on the command line; highest precedence.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub no_verify: bool,
    pub config_path: Option<PathBuf>,
}

/// Load configuration respecting precedence CLI > env > YAML.
pub fn load_config(cli: &CliOverrides) -> Result<Config, ConfigError> {
    load_config_from(cli, &env::vars().collect())
}

/// Same as [`load_config`] but with an explicit environment, for tests.
pub fn load_config_from(
    cli: &CliOverrides,
    env: &HashMap<String, String>,
) -> Result<Config, ConfigError> {
    let path = config_file_path(cli, env);
    let mut raw = read_yaml(&path)?;

    apply_env_overrides(&mut raw, env);

    if cli.no_verify {
        raw.verify = Some(VerifyTls::Flag(false));
    }

    let mut config = raw.into_config()?;
    config.password = expand_password(&config.password, env);
    config.validate()?;
    debug!("Loaded configuration: {:?}", config.sanitized());
    Ok(config)
}

fn config_file_path(cli: &CliOverrides, env: &HashMap<String, String>) -> PathBuf {
    if let Some(path) = &cli.config_path {
        return path.clone();
    }
    if let Some(path) = env.get("HMC_CONFIG") {
        return PathBuf::from(path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".hmc_orchestrator.yaml")
}

/// Partially-specified config as read from YAML, before env overrides fill
/// the gaps. Unknown keys in the file are rejected.
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    verify: Option<VerifyTls>,
    #[serde(default)]
    timeout: Option<Timeout>,
    #[serde(default)]
    retries: Option<Retries>,
    #[serde(default)]
    concurrency: Option<Concurrency>,
}

impl RawConfig {
    fn into_config(self) -> Result<Config, ConfigError> {
        Ok(Config {
            host: self.host.unwrap_or_default(),
            port: self.port.unwrap_or_else(default_port),
            username: self.username.unwrap_or_default(),
            password: self.password.unwrap_or_default(),
            verify: self.verify.unwrap_or_default(),
            timeout: self.timeout.unwrap_or_default(),
            retries: self.retries.unwrap_or_default(),
            concurrency: self.concurrency.unwrap_or_default(),
        })
    }
}

fn read_yaml(path: &Path) -> Result<RawConfig, ConfigError> {
    if !path.is_file() {
        return Ok(RawConfig::default());
    }
    let content = fs::read_to_string(path).map_err(|e| ConfigError::FileError {
        path: path.display().to_string(),
        error: e.to_string(),
    })?;
    let raw: RawConfig = serde_yaml::from_str(&content)?;
    Ok(raw)
}

/// Apply environment variable overrides to the raw configuration.
fn apply_env_overrides(raw: &mut RawConfig, env: &HashMap<String, String>) {
    if let Some(host) = env.get("HMC_HOST") {
        raw.host = Some(host.clone());
    }
    if let Some(port) = env.get("HMC_PORT").and_then(|p| p.parse().ok()) {
        raw.port = Some(port);
    }
    if let Some(user) = env.get("HMC_USERNAME").or_else(|| env.get("HMC_USER")) {
        raw.username = Some(user.clone());
    }
    if let Some(pass) = env.get("HMC_PASSWORD").or_else(|| env.get("HMC_PASS")) {
        raw.password = Some(pass.clone());
    }
    if let Some(verify) = env.get("HMC_VERIFY") {
        raw.verify = Some(VerifyTls::Flag(parse_bool(verify)));
    }
    // A CA bundle wins over the boolean toggle.
    if let Some(bundle) = env.get("HMC_CA_BUNDLE") {
        raw.verify = Some(VerifyTls::Bundle(PathBuf::from(bundle)));
    }
    if let Some(connect) = env.get("HMC_TIMEOUT_CONNECT").and_then(|v| v.parse().ok()) {
        raw.timeout.get_or_insert_with(Timeout::default).connect = connect;
    }
    if let Some(read) = env.get("HMC_TIMEOUT_READ").and_then(|v| v.parse().ok()) {
        raw.timeout.get_or_insert_with(Timeout::default).read = read;
    }
    if let Some(total) = env.get("HMC_RETRIES_TOTAL").and_then(|v| v.parse().ok()) {
        raw.retries.get_or_insert_with(Retries::default).total = total;
    }
    if let Some(base) = env
        .get("HMC_RETRIES_BACKOFF_BASE")
        .and_then(|v| v.parse().ok())
    {
        raw.retries.get_or_insert_with(Retries::default).backoff_base = base;
    }
    if let Some(max) = env
        .get("HMC_RETRIES_MAX_BACKOFF")
        .and_then(|v| v.parse().ok())
    {
        raw.retries.get_or_insert_with(Retries::default).max_backoff = max;
    }
    if let Some(per_frame) = env
        .get("HMC_CONCURRENCY_PER_FRAME")
        .and_then(|v| v.parse().ok())
    {
        raw.concurrency
            .get_or_insert_with(Concurrency::default)
            .per_frame = per_frame;
    }
}

/// Resolve a `$VAR` or `${VAR}` password reference from the environment.
fn expand_password(password: &str, env: &HashMap<String, String>) -> String {
    let name = if let Some(stripped) = password.strip_prefix("${") {
        stripped.strip_suffix('}')
    } else {
        password.strip_prefix('$')
    };
    match name {
        Some(var) if !var.is_empty() => match env.get(var) {
            Some(value) => value.clone(),
            None => {
                warn!("Failed to resolve environment variable {} for password", var);
                String::new()
            }
        },
        _ => password.to_string(),
    }
}

pub fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl Default for Timeout {
    fn default() -> Self {
        Self {
            connect: default_timeout_connect(),
            read: default_timeout_read(),
        }
    }
}

impl Default for Retries {
    fn default() -> Self {
        Self {
            total: default_retries_total(),
            backoff_base: default_backoff_base(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl Default for Concurrency {
    fn default() -> Self {
        Self {
            per_frame: default_per_frame(),
        }
    }
}

fn default_port() -> u16 {
    12443
}

fn default_timeout_connect() -> f64 {
    5.0
}

fn default_timeout_read() -> f64 {
    20.0
}

fn default_retries_total() -> u32 {
    5
}

fn default_backoff_base() -> f64 {
    0.5
}

fn default_max_backoff() -> f64 {
    8.0
}

fn default_per_frame() -> usize {
    4
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn base_env() -> HashMap<String, String> {
        let mut env = HashMap::new();
        env.insert("HMC_HOST".to_string(), "hmc.example".to_string());
        env.insert("HMC_USER".to_string(), "hscroot".to_string());
        env.insert("HMC_PASS".to_string(), "secret".to_string());
        // Keep the loader away from any real ~/.hmc_orchestrator.yaml.
        env.insert("HMC_CONFIG".to_string(), "/nonexistent/cfg.yaml".to_string());
        env
    }

    #[test]
    fn test_env_loading_with_defaults() {
        let cfg = load_config_from(&CliOverrides::default(), &base_env()).unwrap();
        assert_eq!(cfg.host, "hmc.example");
        assert_eq!(cfg.port, 12443);
        assert_eq!(cfg.username, "hscroot");
        assert_eq!(cfg.base_url(), "https://hmc.example:12443");
        assert_eq!(cfg.retries.total, 5);
        assert_eq!(cfg.concurrency.per_frame, 4);
    }

    #[test]
    fn test_missing_host_fails() {
        let mut env = base_env();
        env.remove("HMC_HOST");
        let err = load_config_from(&CliOverrides::default(), &env).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { field } if field == "host"));
    }

    #[test]
    fn test_yaml_file_loading_and_env_precedence() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "host: filehost\nusername: fileuser\npassword: filepass\nport: 443\nretries:\n  total: 2"
        )
        .unwrap();

        let mut env = HashMap::new();
        env.insert("HMC_CONFIG".to_string(), file.path().display().to_string());
        env.insert("HMC_HOST".to_string(), "envhost".to_string());

        let cfg = load_config_from(&CliOverrides::default(), &env).unwrap();
        assert_eq!(cfg.host, "envhost");
        assert_eq!(cfg.username, "fileuser");
        assert_eq!(cfg.port, 443);
        assert_eq!(cfg.retries.total, 2);
    }

    #[test]
    fn test_unknown_yaml_key_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "host: h\nusername: u\npassword: p\nbogus: 1").unwrap();
        let mut env = HashMap::new();
        env.insert("HMC_CONFIG".to_string(), file.path().display().to_string());
        assert!(matches!(
            load_config_from(&CliOverrides::default(), &env),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_password_env_expansion() {
        let mut env = base_env();
        env.insert("HMC_PASS".to_string(), "${REAL_SECRET}".to_string());
        env.insert("REAL_SECRET".to_string(), "s3cret".to_string());
        let cfg = load_config_from(&CliOverrides::default(), &env).unwrap();
        assert_eq!(cfg.password, "s3cret");

        env.insert("HMC_PASS".to_string(), "$REAL_SECRET".to_string());
        let cfg = load_config_from(&CliOverrides::default(), &env).unwrap();
        assert_eq!(cfg.password, "s3cret");
    }

    #[test]
    fn test_ca_bundle_overrides_verify_flag() {
        let mut env = base_env();
        env.insert("HMC_VERIFY".to_string(), "false".to_string());
        env.insert("HMC_CA_BUNDLE".to_string(), "/etc/ssl/hmc.pem".to_string());
        let cfg = load_config_from(&CliOverrides::default(), &env).unwrap();
        assert_eq!(cfg.verify, VerifyTls::Bundle(PathBuf::from("/etc/ssl/hmc.pem")));
    }

    #[test]
    fn test_no_verify_cli_wins() {
        let mut env = base_env();
        env.insert("HMC_VERIFY".to_string(), "true".to_string());
        let cli = CliOverrides {
            no_verify: true,
            config_path: None,
        };
        let cfg = load_config_from(&cli, &env).unwrap();
        assert_eq!(cfg.verify, VerifyTls::Flag(false));
    }

    #[test]
    fn test_backoff_invariant_enforced() {
        let mut env = base_env();
        env.insert("HMC_RETRIES_BACKOFF_BASE".to_string(), "10".to_string());
        env.insert("HMC_RETRIES_MAX_BACKOFF".to_string(), "2".to_string());
        assert!(matches!(
            load_config_from(&CliOverrides::default(), &env),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_sanitized_hides_password() {
        let cfg = load_config_from(&CliOverrides::default(), &base_env()).unwrap();
        assert_eq!(cfg.sanitized().password, "[REDACTED]");
        assert_eq!(cfg.sanitized().host, cfg.host);
    }

    #[test]
    fn test_parse_bool() {
        for v in ["1", "true", "YES", " on "] {
            assert!(parse_bool(v));
        }
        for v in ["0", "false", "no", "off", ""] {
            assert!(!parse_bool(v));
        }
    }
}
