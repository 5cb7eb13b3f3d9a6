use anyhow::{Context, Result};
use modelsync_common::protocol::jsonrpc::{
    named_params, Request, Response, RpcError, INVALID_PARAMS, METHOD_NOT_FOUND,
};
use modelsync_common::protocol::rpc_methods::SESSION_ATTACH;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{self, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::rpc::methods::{handle_raw_request, RpcServerState};

#[derive(Debug, Deserialize)]
struct AttachParams {
    session_id: String,
}

/// Serve newline-delimited JSON-RPC 2.0 on `listener` until a shutdown
/// signal arrives. Connections already accepted keep running on their own
/// tasks.
pub async fn serve_unix_until_shutdown(
    listener: UnixListener,
    state: RpcServerState,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("unix rpc listener stopping");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, _) = accepted.context("failed to accept unix rpc connection")?;
                let connection_state = state.clone();
                tokio::spawn(async move {
                    if let Err(error) = serve_connection(stream, connection_state).await {
                        warn!(?error, "unix rpc connection failed");
                    }
                });
            }
        }
    }
}

/// Handle a single RPC stream. Each request line yields one response line.
pub async fn serve_connection<IO>(stream: IO, state: RpcServerState) -> Result<()>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = io::split(stream);
    let mut reader = BufReader::new(read_half);

    loop {
        let mut line = Vec::new();
        let bytes_read =
            reader.read_until(b'\n', &mut line).await.context("failed to read json-rpc request")?;
        if bytes_read == 0 {
            return Ok(());
        }

        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        if let Some(request) = attach_request(&line) {
            return stream_session(request, reader, write_half, &state).await;
        }

        let response = handle_raw_request(&line, &state).await;
        write_line(&mut write_half, &response).await?;
    }
}

fn attach_request(line: &[u8]) -> Option<Request> {
    serde_json::from_slice::<Request>(line).ok().filter(|request| request.method == SESSION_ATTACH)
}

/// Answer `session.attach`, then forward every push the hub routes to the
/// session, one frame per line, until the peer hangs up.
async fn stream_session<R, W>(
    request: Request,
    mut reader: BufReader<R>,
    mut writer: W,
    state: &RpcServerState,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let params = named_params(request.params.unwrap_or(Value::Null), &["session_id"]);
    let attached = match (serde_json::from_value::<AttachParams>(params), state.hub()) {
        (Ok(params), Some(hub)) => Ok((hub.attach(&params.session_id), params.session_id)),
        (Err(error), _) => Err(RpcError::new(INVALID_PARAMS, "Invalid params")
            .with_data(json!({ "reason": error.to_string() }))),
        (Ok(_), None) => Err(RpcError::new(METHOD_NOT_FOUND, "Session streaming unavailable")),
    };
    let (mut pushes, session_id) = match attached {
        Ok(attached) => {
            write_line(&mut writer, &Response::success(request.id, json!({ "ok": true }))).await?;
            attached
        }
        Err(error) => return write_line(&mut writer, &Response::error(request.id, error)).await,
    };
    info!(session = %session_id, "session push stream attached");

    let mut inbound = Vec::new();
    loop {
        tokio::select! {
            maybe_frame = pushes.recv() => {
                let Some(frame) = maybe_frame else {
                    return Ok(());
                };
                write_line(&mut writer, &frame).await?;
            }
            read = reader.read_until(b'\n', &mut inbound) => {
                if read.context("failed to read attached session stream")? == 0 {
                    debug!(session = %session_id, "session push stream closed by peer");
                    return Ok(());
                }
                // Nothing is expected from the peer once attached.
                inbound.clear();
            }
        }
    }
}

async fn write_line<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut encoded = serde_json::to_vec(message).context("failed to serialize json-rpc line")?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await.context("failed to write json-rpc line")?;
    writer.flush().await.context("failed to flush json-rpc line")
}
