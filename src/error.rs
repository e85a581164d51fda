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

use std::fmt;

use thiserror::Error;

/// Maximum number of response-body characters carried in an error message.
const SNIPPET_LIMIT: usize = 200;

/// Truncate a response body to a single-line snippet for error messages.
pub fn snippet(body: &str) -> String {
    let trimmed = body.trim().replace('\n', " ");
    trimmed.chars().take(SNIPPET_LIMIT).collect()
}

/// Error classification used for metrics labels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ErrorKind {
    Auth,
    RateLimit,
    Transient,
    Permanent,
    Network,
    PcmNotEnabled,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Auth => write!(f, "auth"),
            ErrorKind::RateLimit => write!(f, "rate_limit"),
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Permanent => write!(f, "permanent"),
            ErrorKind::Network => write!(f, "network"),
            ErrorKind::PcmNotEnabled => write!(f, "pcm_not_enabled"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// Errors raised by the HMC client stack.
///
/// The retry loop treats `Auth`, `RateLimit`, `Transient` and `Network` as
/// retryable; `Permanent` and everything else surfaces to the caller
/// immediately.
#[derive(Debug, Error)]
pub enum HmcError {
    #[error("Auth error: {method} {url} returned 401: {snippet}")]
    Auth {
        method: String,
        url: String,
        snippet: String,
    },

    #[error("Rate limited: {method} {url} returned 429")]
    RateLimit {
        method: String,
        url: String,
        retry_after: Option<f64>,
    },

    #[error("Transient error: {method} {url}: {message}")]
    Transient {
        method: String,
        url: String,
        status: Option<u16>,
        message: String,
        retry_after: Option<f64>,
    },

    #[error("Permanent error: {method} {url} returned {status}: {snippet}")]
    Permanent {
        method: String,
        url: String,
        status: u16,
        snippet: String,
    },

    #[error("Network error: {method} {url}: {message}")]
    Network {
        method: String,
        url: String,
        message: String,
    },

    #[error("PCM metrics not enabled for LPAR {lpar_uuid}")]
    PcmNotEnabled { lpar_uuid: String },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl HmcError {
    pub fn auth(method: impl Into<String>, url: impl Into<String>, body: &str) -> Self {
        Self::Auth {
            method: method.into(),
            url: url.into(),
            snippet: snippet(body),
        }
    }

    pub fn rate_limited(
        method: impl Into<String>,
        url: impl Into<String>,
        retry_after: Option<f64>,
    ) -> Self {
        Self::RateLimit {
            method: method.into(),
            url: url.into(),
            retry_after,
        }
    }

    pub fn transient(
        method: impl Into<String>,
        url: impl Into<String>,
        status: Option<u16>,
        body: &str,
        retry_after: Option<f64>,
    ) -> Self {
        Self::Transient {
            method: method.into(),
            url: url.into(),
            status,
            message: snippet(body),
            retry_after,
        }
    }

    /// The circuit breaker rejected a request without touching the network.
    pub fn circuit_open() -> Self {
        Self::Transient {
            method: String::new(),
            url: String::new(),
            status: None,
            message: "circuit open".to_string(),
            retry_after: None,
        }
    }

    pub fn permanent(
        method: impl Into<String>,
        url: impl Into<String>,
        status: u16,
        body: &str,
    ) -> Self {
        Self::Permanent {
            method: method.into(),
            url: url.into(),
            status,
            snippet: snippet(body),
        }
    }

    pub fn network(
        method: impl Into<String>,
        url: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Network {
            method: method.into(),
            url: url.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth { .. } => ErrorKind::Auth,
            Self::RateLimit { .. } => ErrorKind::RateLimit,
            Self::Transient { .. } => ErrorKind::Transient,
            Self::Permanent { .. } => ErrorKind::Permanent,
            Self::Network { .. } => ErrorKind::Network,
            Self::PcmNotEnabled { .. } => ErrorKind::PcmNotEnabled,
            Self::Json(_) | Self::Io(_) => ErrorKind::Internal,
        }
    }

    /// Whether the retry loop may attempt the operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Auth { .. }
                | Self::RateLimit { .. }
                | Self::Transient { .. }
                | Self::Network { .. }
        )
    }

    /// Server-requested delay in seconds, parsed from `Retry-After`.
    pub fn retry_after(&self) -> Option<f64> {
        match self {
            Self::RateLimit { retry_after, .. } | Self::Transient { retry_after, .. } => {
                *retry_after
            }
            _ => None,
        }
    }
}

/// Configuration loading and validation failures. Fail fast, never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing configuration field '{field}'")]
    MissingField { field: String },
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
    #[error("File error for '{path}': {error}")]
    FileError { path: String, error: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl ConfigError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

/// Policy loading and structural validation failures.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("invalid path: '{path}' resolves outside the working directory")]
    InvalidPath { path: String },
    #[error("Schema error: {message}")]
    Schema { message: String },
    #[error("File error for '{path}': {error}")]
    FileError { path: String, error: String },
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl PolicyError {
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
        }
    }
}
