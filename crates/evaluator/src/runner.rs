//! Run-once stream race.
//!
//! One drain task per run owns the unit's output channel and both capture
//! buffers. The caller writes the program, half-closes stdin, then races the
//! drain's completion against the request deadline. On expiry the drain is
//! told to stop, which drops the output channel and with it the attached
//! connection; the drain is joined before returning on every path, and its
//! buffers come back by value, so no buffer is ever shared.

use std::io;

use futures_util::StreamExt;
use sandbox::{Attachment, InputStream, OutputChunk, OutputStream, SandboxError, UnitHandle};
use tokio::io::AsyncWriteExt;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::capture::Capture;
use crate::context::RequestContext;
use crate::error::RunError;
use crate::response::RunResponse;

struct Drained {
    stdout: Capture,
    stderr: Capture,
    error: Option<SandboxError>,
}

impl Drained {
    fn into_response(self, timeout: bool) -> RunResponse {
        let truncated = self.stdout.truncated() || self.stderr.truncated();
        RunResponse {
            stdout: self.stdout.into_text(),
            stderr: self.stderr.into_text(),
            timeout,
            truncated,
        }
    }
}

enum FeedError {
    Write(io::Error),
    Close(io::Error),
}

enum Fed {
    Done(Result<(), FeedError>),
    Expired,
}

enum Waited {
    Drained(Result<Drained, JoinError>),
    Expired,
}

/// Write `body` to the unit, collect its output, and resolve on end-of-stream
/// or on the context's deadline, whichever comes first.
pub(crate) async fn run_attached(
    unit: &UnitHandle,
    attachment: Attachment,
    body: &[u8],
    ctx: &RequestContext,
    capture_limit: Option<usize>,
) -> Result<RunResponse, RunError> {
    let started = Instant::now();
    let Attachment { mut input, output } = attachment;
    let stop = CancellationToken::new();
    let mut drain = tokio::spawn(drain_output(output, stop.clone(), capture_limit));

    let fed = tokio::select! {
        res = feed(&mut input, body) => Fed::Done(res),
        () = ctx.done() => Fed::Expired,
    };
    match fed {
        Fed::Done(Ok(())) => {}
        Fed::Done(Err(FeedError::Close(e))) => {
            warn!(unit = %unit, error = %e, "could not close unit stdin");
        }
        Fed::Done(Err(FeedError::Write(e))) => {
            drop(input);
            // The drain is stopped, not awaited to end-of-stream.
            if let Err(join) = close_and_join(drain, &stop).await {
                warn!(unit = %unit, error = %join, "drain task failed after write error");
            }
            return Err(RunError::WriteFailed(e.to_string()));
        }
        Fed::Expired => {
            drop(input);
            debug!(unit = %unit, "deadline elapsed while writing program");
            let drained = close_and_join(drain, &stop).await?;
            return Ok(finish(unit, drained, true, started));
        }
    }
    debug!(unit = %unit, bytes = body.len(), "program written; waiting for output");

    let waited = tokio::select! {
        joined = &mut drain => Waited::Drained(joined),
        () = ctx.done() => Waited::Expired,
    };
    drop(input);

    match waited {
        Waited::Drained(Ok(Drained {
            error: Some(e),
            ..
        })) => Err(RunError::DrainFailed(e.to_string())),
        Waited::Drained(Ok(drained)) => Ok(finish(unit, drained, false, started)),
        Waited::Drained(Err(join)) => Err(RunError::DrainFailed(format!("drain task: {join}"))),
        Waited::Expired => {
            let drained = close_and_join(drain, &stop).await?;
            Ok(finish(unit, drained, true, started))
        }
    }
}

async fn feed(input: &mut InputStream, body: &[u8]) -> Result<(), FeedError> {
    input.write_all(body).await.map_err(FeedError::Write)?;
    input.flush().await.map_err(FeedError::Write)?;
    input.shutdown().await.map_err(FeedError::Close)
}

/// Force the drain to stop and wait for it. Returns promptly: the drain
/// checks the token before every read.
async fn close_and_join(
    drain: JoinHandle<Drained>,
    stop: &CancellationToken,
) -> Result<Drained, RunError> {
    stop.cancel();
    drain
        .await
        .map_err(|e| RunError::DrainFailed(format!("drain task: {e}")))
}

fn finish(unit: &UnitHandle, drained: Drained, timeout: bool, started: Instant) -> RunResponse {
    if let Some(e) = &drained.error
        && timeout
    {
        debug!(unit = %unit, error = %e, "stream error after forced close ignored");
    }
    debug!(
        unit = %unit,
        timeout,
        stdout_bytes = drained.stdout.len(),
        stderr_bytes = drained.stderr.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "run finished"
    );
    drained.into_response(timeout)
}

async fn drain_output(
    mut output: OutputStream,
    stop: CancellationToken,
    limit: Option<usize>,
) -> Drained {
    let mut stdout = Capture::new(limit);
    let mut stderr = Capture::new(limit);

    let error = loop {
        let frame = tokio::select! {
            biased;
            () = stop.cancelled() => break None,
            frame = output.next() => frame,
        };
        match frame {
            Some(Ok(OutputChunk::Stdout(bytes))) => stdout.push(&bytes),
            Some(Ok(OutputChunk::Stderr(bytes))) => stderr.push(&bytes),
            Some(Err(e)) => break Some(e),
            None => break None,
        }
    };

    Drained {
        stdout,
        stderr,
        error,
    }
}
