// Copyright (c) Syncpoint contributors
// SPDX-License-Identifier: Apache-2.0

//! Small utilities shared across the service.

use std::{future::Future, path::Path, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{sync::Semaphore, task::JoinSet};
use tracing_subscriber::EnvFilter;

/// Initializes the tracing subscriber for a daemon or CLI invocation.
///
/// Respects `RUST_LOG`; defaults to `info`.
pub fn init_tracing_subscriber() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .try_init()
        .map_err(|error| anyhow::anyhow!(error))
}

/// Writes `content` to `path` atomically: sibling temp file, then rename.
pub fn atomic_write_text(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)
}

/// Serializes `value` as pretty JSON and writes it atomically.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let mut text = serde_json::to_string_pretty(value).map_err(std::io::Error::other)?;
    text.push('\n');
    atomic_write_text(path, &text)
}

/// Number of attempts for operations worth retrying on transient failure.
pub const TRANSIENT_ATTEMPTS: u32 = 3;

/// Fixed delay between retry attempts.
pub const TRANSIENT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Retries an operation on transient failures, with a fixed delay between
/// attempts.
///
/// `is_transient` decides which errors are worth another attempt; the last
/// error is returned once attempts are exhausted.
pub async fn with_retries<T, E, F, Fut, P>(
    attempts: u32,
    delay: Duration,
    is_transient: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut remaining = attempts.max(1);
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if remaining > 1 && is_transient(&error) => {
                remaining -= 1;
                tracing::warn!(%error, remaining, "transient failure; retrying");
                tokio::time::sleep(delay).await;
            }
            Err(error) => return Err(error),
        }
    }
}

/// Maps `f` over `items` in parallel, at most `cap` at a time, preserving
/// input order in the result.
///
/// This is the fan-out primitive for per-instance work: every item owns its
/// own resources, so tasks share nothing.
pub async fn parallel_map<I, T, F, Fut>(items: Vec<I>, cap: usize, f: F) -> Vec<T>
where
    I: Send + 'static,
    T: Send + 'static,
    F: Fn(I) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = T> + Send,
{
    let semaphore = Arc::new(Semaphore::new(cap.max(1)));
    let mut set = JoinSet::new();
    let len = items.len();
    for (index, item) in items.into_iter().enumerate() {
        let semaphore = semaphore.clone();
        let f = f.clone();
        set.spawn(async move {
            let _permit = semaphore
                .acquire()
                .await
                .expect("semaphore is never closed");
            (index, f(item).await)
        });
    }

    let mut results: Vec<Option<T>> = (0..len).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        let (index, value) = joined.expect("worker tasks do not panic");
        results[index] = Some(value);
    }
    results
        .into_iter()
        .map(|slot| slot.expect("every index was joined"))
        .collect()
}

/// Like [`parallel_map`] for fallible work: the first error aborts all
/// outstanding workers and is returned.
pub async fn parallel_try_map<I, T, E, F, Fut>(
    items: Vec<I>,
    cap: usize,
    f: F,
) -> Result<Vec<T>, E>
where
    I: Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
    F: Fn(I) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send,
{
    let semaphore = Arc::new(Semaphore::new(cap.max(1)));
    let mut set = JoinSet::new();
    let len = items.len();
    for (index, item) in items.into_iter().enumerate() {
        let semaphore = semaphore.clone();
        let f = f.clone();
        set.spawn(async move {
            let _permit = semaphore
                .acquire()
                .await
                .expect("semaphore is never closed");
            (index, f(item).await)
        });
    }

    let mut results: Vec<Option<T>> = (0..len).map(|_| None).collect();
    while let Some(joined) = set.join_next().await {
        let (index, value) = joined.expect("worker tasks do not panic");
        match value {
            Ok(value) => results[index] = Some(value),
            Err(error) => {
                set.abort_all();
                return Err(error);
            }
        }
    }
    Ok(results
        .into_iter()
        .map(|slot| slot.expect("every index was joined"))
        .collect())
}
