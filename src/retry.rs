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

//! Retry functionality with exponential backoff
use std::future::Future;
use std::time::Duration;

use log::debug;
use tokio::time::sleep;

use crate::config::Retries;
use crate::error::HmcError;
use crate::metrics::track_retry;

/// Retry a fallible async operation with exponential backoff.
///
/// `cfg.total` is the total attempt budget, not additional retries. Only
/// retryable errors (auth, rate limit, transient, network) consume further
/// attempts; a permanent error is surfaced immediately. When the server sent
/// `Retry-After`, that delay is honored instead of the computed backoff,
/// still capped at `cfg.max_backoff`.
pub async fn with_retry<F, Fut, T>(cfg: &Retries, endpoint: &str, operation: F) -> Result<T, HmcError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, HmcError>>,
{
    let budget = cfg.total.max(1);
    let mut attempt = 1;

    loop {
        let result = operation().await;

        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !err.is_retryable() || attempt >= budget {
            return Err(err);
        }

        track_retry(endpoint);
        let delay = backoff_delay(cfg, attempt, err.retry_after());
        debug!(
            "Retry {}/{} for {} after {:?}, waiting {:?} before next attempt",
            attempt, budget, endpoint, err, delay
        );
        sleep(delay).await;
        attempt += 1;
    }
}

/// Delay between attempt `i` and `i+1`.
///
/// `min(max_backoff, backoff_base * 2^(i-1)) + uniform_jitter(0, backoff_base)`,
/// or the server-requested `Retry-After` capped at `max_backoff`.
pub fn backoff_delay(cfg: &Retries, attempt: u32, retry_after: Option<f64>) -> Duration {
    if let Some(seconds) = retry_after {
        return Duration::from_secs_f64(seconds.max(0.0).min(cfg.max_backoff));
    }
    let exponential = cfg.backoff_base * 2f64.powi(attempt.saturating_sub(1) as i32);
    let base = exponential.min(cfg.max_backoff);
    let jitter = rand::random::<f64>() * cfg.backoff_base;
    Duration::from_secs_f64(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn retries(total: u32) -> Retries {
        Retries {
            total,
            backoff_base: 0.001,
            max_backoff: 0.002,
        }
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&retries(3), "/x", || async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(HmcError::transient("GET", "https://hmc/x", Some(500), "boom", None))
            } else {
                Ok(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&retries(5), "/x", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(HmcError::permanent("GET", "https://hmc/x", 404, "missing"))
        })
        .await;
        assert!(matches!(result, Err(HmcError::Permanent { status: 404, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_surfaces_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&retries(3), "/x", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(HmcError::network("GET", "https://hmc/x", "reset"))
        })
        .await;
        assert!(matches!(result, Err(HmcError::Network { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let cfg = Retries {
            total: 5,
            backoff_base: 1.0,
            max_backoff: 3.0,
        };
        // Jitter is uniform in [0, backoff_base); check the deterministic part.
        let d1 = backoff_delay(&cfg, 1, None).as_secs_f64();
        assert!((1.0..2.0).contains(&d1));
        let d2 = backoff_delay(&cfg, 2, None).as_secs_f64();
        assert!((2.0..3.0).contains(&d2));
        let d4 = backoff_delay(&cfg, 4, None).as_secs_f64();
        assert!((3.0..4.0).contains(&d4));
    }

    #[test]
    fn test_retry_after_honored_and_capped() {
        let cfg = Retries {
            total: 5,
            backoff_base: 0.5,
            max_backoff: 8.0,
        };
        assert_eq!(backoff_delay(&cfg, 1, Some(2.0)), Duration::from_secs(2));
        assert_eq!(backoff_delay(&cfg, 1, Some(60.0)), Duration::from_secs(8));
    }
}
