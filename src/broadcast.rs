//! Message fan-out across many sessions.
//!
//! A broadcast never aborts on the first failure: every target is attempted
//! and failures come back per session, so one dead connection cannot starve
//! the rest of the room.

use bytes::Bytes;
use futures::StreamExt;
use std::sync::{Mutex, PoisonError};

use crate::session::{Session, SessionId};
use crate::WebSocketError;

/// How a broadcast walks its targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BroadcastMode {
    /// Sequential for small groups, concurrent fan-out for large ones.
    #[default]
    Auto,
    /// One session at a time, in registry order.
    Sequential,
    /// Concurrent fan-out bounded by the caller's concurrency limit.
    Parallel,
}

/// Auto mode switches to concurrent fan-out once the group is several times
/// larger than the host's parallelism.
pub(crate) fn should_parallelize(mode: BroadcastMode, count: usize) -> bool {
    match mode {
        BroadcastMode::Sequential => false,
        BroadcastMode::Parallel => true,
        BroadcastMode::Auto => {
            let parallelism = std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(1);
            count > 4 * parallelism
        }
    }
}

/// Sends a text message to every session, collecting per-session failures.
pub async fn broadcast_text(
    sessions: &[Session],
    text: &str,
    mode: BroadcastMode,
    max_concurrency: usize,
) -> Vec<(SessionId, WebSocketError)> {
    fan_out(sessions, mode, max_concurrency, |session| async move {
        session.send_text(text).await
    })
    .await
}

/// Sends a binary message to every session, collecting per-session failures.
pub async fn broadcast_binary(
    sessions: &[Session],
    data: &Bytes,
    mode: BroadcastMode,
    max_concurrency: usize,
) -> Vec<(SessionId, WebSocketError)> {
    fan_out(sessions, mode, max_concurrency, |session| {
        let data = data.clone();
        async move { session.send_binary(data).await }
    })
    .await
}

async fn fan_out<'a, F, Fut>(
    sessions: &'a [Session],
    mode: BroadcastMode,
    max_concurrency: usize,
    send: F,
) -> Vec<(SessionId, WebSocketError)>
where
    F: Fn(&'a Session) -> Fut,
    Fut: std::future::Future<Output = crate::Result<()>>,
{
    if !should_parallelize(mode, sessions.len()) {
        let mut failures = Vec::new();
        for session in sessions {
            if let Err(err) = send(session).await {
                failures.push((session.raw_id(), err));
            }
        }
        return failures;
    }

    let failures = Mutex::new(Vec::new());
    futures::stream::iter(sessions)
        .for_each_concurrent(max_concurrency.max(1), |session| {
            let failures = &failures;
            let fut = send(session);
            async move {
                if let Err(err) = fut.await {
                    failures
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push((session.raw_id(), err));
                }
            }
        })
        .await;
    failures.into_inner().unwrap_or_else(PoisonError::into_inner)
}
