//! Backpressure-aware forwarding.
//!
//! A direction reads one chunk, then writes all of it before reading again.
//! When the destination's write is not immediately ready its buffer is
//! saturated: the direction stops reading from its source until the
//! destination drains. At most one chunk per direction is ever held.

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::Poll;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Pause/resume counters for one forwarding direction.
#[derive(Debug, Default)]
pub struct FlowStats {
    pauses: AtomicU64,
    resumes: AtomicU64,
}

impl FlowStats {
    /// Times reading was suspended because the destination was saturated.
    pub fn pauses(&self) -> u64 {
        self.pauses.load(Ordering::Relaxed)
    }

    /// Times the destination drained and reading continued.
    pub fn resumes(&self) -> u64 {
        self.resumes.load(Ordering::Relaxed)
    }

    /// A direction is paused while a saturated write is outstanding.
    pub fn is_paused(&self) -> bool {
        self.pauses() > self.resumes()
    }
}

/// Write `chunk` to `writer` in full, recording saturation in `stats`.
pub async fn forward<W>(writer: &mut W, chunk: &[u8], stats: &FlowStats) -> io::Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut written = 0;
    while written < chunk.len() {
        let mut saturated = false;
        let n = poll_fn(|cx| {
            let poll = Pin::new(&mut *writer).poll_write(cx, &chunk[written..]);
            if poll.is_pending() && !saturated {
                saturated = true;
                stats.pauses.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(outstanding = chunk.len() - written, "Destination saturated, pausing reads");
            }
            poll
        })
        .await?;

        if saturated {
            stats.resumes.fetch_add(1, Ordering::Relaxed);
            tracing::trace!("Destination drained, resuming reads");
        }
        if n == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        written += n;
    }
    writer.flush().await
}
