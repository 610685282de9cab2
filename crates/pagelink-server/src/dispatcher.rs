//! Per-connection receive loop.
//!
//! `OPEN -> (receive, dispatch)* -> CLOSED`. Invocations run as their own
//! tasks so a handler that calls back into the peer cannot stall the loop
//! that would deliver its answer.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use pagelink_core::{safe_json, DispatchError, Frame, Invocation, Resolution};

use crate::bridge::Bridge;
use crate::connection::Connection;

/// Drive `frames` until the peer closes, sends an empty frame, sends
/// undecodable JSON, a frame handler panics, or the connection is closed
/// from the host side. The connection is always removed from the manager on
/// exit.
pub async fn run_receive_loop<S>(bridge: Bridge, conn: Arc<Connection>, frames: S)
where
    S: Stream<Item = String>,
{
    let mut frames = std::pin::pin!(frames.take_until(conn.closed()));

    while let Some(text) = frames.next().await {
        if text.is_empty() {
            tracing::debug!(connection_id = %conn.id, "Empty frame, closing");
            break;
        }

        let outcome =
            std::panic::catch_unwind(AssertUnwindSafe(|| handle_frame(&bridge, &conn, &text)));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) if !err.is_fatal() => {
                tracing::warn!(connection_id = %conn.id, error = %err, "Skipping frame");
            }
            Ok(Err(err)) => {
                tracing::warn!(connection_id = %conn.id, error = %err, "Closing connection");
                break;
            }
            Err(panic) => {
                tracing::error!(
                    connection_id = %conn.id,
                    panic = %panic_message(&*panic),
                    "Frame handler panicked, closing connection"
                );
                break;
            }
        }
    }

    bridge.manager().remove(&conn.id);
}

fn handle_frame(bridge: &Bridge, conn: &Arc<Connection>, text: &str) -> Result<(), DispatchError> {
    match Frame::decode(text)? {
        Frame::Invoke(invocation) => {
            tokio::spawn(answer_invocation(bridge.clone(), Arc::clone(conn), invocation));
            Ok(())
        }
        Frame::Resolve(resolution) => {
            let id = resolution.call_id().ok_or_else(|| {
                DispatchError::Malformed(format!("non-numeric return id {}", resolution.id))
            })?;
            tracing::trace!(connection_id = %conn.id, call_id = %id, "Resolution received");
            bridge.correlator().resolve(id, resolution.into_result());
            Ok(())
        }
    }
}

async fn answer_invocation(bridge: Bridge, conn: Arc<Connection>, invocation: Invocation) {
    let Invocation { id, name, args } = invocation;
    tracing::debug!(connection_id = %conn.id, function = %name, "Invocation received");

    let resolution = match bridge.registry().invoke(&name, args).await {
        Ok(value) => Resolution::ok(id, value),
        Err(err) => Resolution::error(id, err.to_peer_error()),
    };

    let retry = bridge.manager().retry_policy();
    if !conn.send_with_retry(safe_json(&resolution), retry).await {
        tracing::warn!(connection_id = %conn.id, function = %name, "Could not deliver result");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
