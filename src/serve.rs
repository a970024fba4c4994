//! JSON line protocol over a byte stream.
//!
//! Each input line is one control message (`{"type":"load"}`, ...); each
//! output line is one status event. At end of input the worker finishes
//! whatever is queued, then the loop returns.

use crate::backend::ModelBackend;
use crate::error::{ModelhostError, Result};
use crate::protocol::{ControlMessage, WorkerEvent};
use crate::task::Task;
use crate::worker::WorkerContext;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

async fn write_event<W>(output: &mut W, event: &WorkerEvent) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = event.to_json()?;
    line.push('\n');
    output.write_all(line.as_bytes()).await?;
    output.flush().await?;
    Ok(())
}

/// Serve one worker context hosting `backend` over `input`/`output`.
///
/// Malformed lines are answered with an `error` event and otherwise
/// ignored. Returns once input is exhausted and the worker has exited, or
/// as soon as the worker exits on its own (e.g. after a failed load).
pub async fn serve<R, W>(
    task: Task,
    backend: Box<dyn ModelBackend>,
    input: R,
    mut output: W,
    join_timeout: Duration,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut context = WorkerContext::spawn(task, backend, 1)?;
    let mut events = context.take_events().ok_or(ModelhostError::ContextClosed)?;
    let mut lines = input.lines();
    let mut input_open = true;
    info!(%task, "serving worker protocol");

    loop {
        tokio::select! {
            line = lines.next_line(), if input_open => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match ControlMessage::from_json(line.trim()) {
                    Ok(message) => {
                        if let Err(e) = context.send(message) {
                            debug!(%task, error = %e, "worker gone; dropping message");
                        }
                    }
                    Err(e) => {
                        warn!(%task, error = %e, "invalid control message");
                        write_event(&mut output, &WorkerEvent::error(format!("invalid message: {e}")))
                            .await?;
                    }
                },
                None => {
                    debug!(%task, "input closed; draining worker");
                    input_open = false;
                    context.close();
                }
            },
            event = events.recv() => match event {
                Some(event) => write_event(&mut output, &event).await?,
                None => break,
            },
        }
    }

    if !context.terminate().wait(join_timeout).await {
        warn!(%task, "worker did not exit in time; detached");
    }
    info!(%task, "worker protocol session ended");
    Ok(())
}
