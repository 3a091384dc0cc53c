use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::error::{FailureReason, Result, SessionError};
use crate::link::PacketLink;

/// Default attempts per reliable send.
pub const DEFAULT_TRIES: usize = 3;
/// Default wait for a reply, per attempt.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(600);

/// How a candidate reply relates to an outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyVerdict {
    /// Not a reply to this request; keep waiting.
    Pending,
    /// The request completed.
    Success,
    /// The attempt failed but another may succeed.
    Retry(FailureReason),
    /// The request failed for good.
    Fatal(FailureReason),
}

/// Attempt budget for [`send_and_wait_for`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Transmissions before giving up. Zero is treated as one.
    pub tries: usize,
    /// Wait per attempt.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            tries: DEFAULT_TRIES,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Send `packet` and wait for a reply accepted by `matcher`.
///
/// Each attempt subscribes before transmitting, so a reply that arrives
/// while the write is still in flight is not missed. Returns the number of
/// transmissions on success.
pub async fn send_and_wait_for<L, F>(
    link: &L,
    packet: &[u8],
    mut matcher: F,
    policy: RetryPolicy,
) -> Result<usize>
where
    L: PacketLink + ?Sized,
    F: FnMut(&[u8]) -> ReplyVerdict,
{
    let tries = policy.tries.max(1);
    let mut reason = FailureReason::Timeout;

    for attempt in 1..=tries {
        let mut replies = link.subscribe();
        link.send(packet).await?;

        let verdict =
            match tokio::time::timeout(policy.timeout, next_verdict(&mut replies, &mut matcher))
                .await
            {
                Ok(verdict) => verdict?,
                Err(_) => ReplyVerdict::Retry(FailureReason::Timeout),
            };

        match verdict {
            ReplyVerdict::Success => return Ok(attempt),
            ReplyVerdict::Fatal(fatal) => {
                debug!(attempt, reason = %fatal, "request rejected");
                return Err(SessionError::Rejected(fatal));
            }
            ReplyVerdict::Retry(retry) => {
                debug!(attempt, tries, reason = %retry, "attempt failed");
                reason = retry;
            }
            // Filtered out by next_verdict.
            ReplyVerdict::Pending => {}
        }
    }

    Err(SessionError::RetriesExhausted {
        attempts: tries,
        reason,
    })
}

async fn next_verdict<F>(
    replies: &mut broadcast::Receiver<Bytes>,
    matcher: &mut F,
) -> Result<ReplyVerdict>
where
    F: FnMut(&[u8]) -> ReplyVerdict,
{
    loop {
        match replies.recv().await {
            Ok(packet) => match matcher(&packet) {
                ReplyVerdict::Pending => continue,
                verdict => return Ok(verdict),
            },
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "reply wait fell behind the packet stream");
            }
            Err(RecvError::Closed) => return Err(SessionError::Closed),
        }
    }
}
