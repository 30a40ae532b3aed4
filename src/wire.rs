use std::io;
use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

use crate::engine::Engine;
use crate::limits::MAX_FRAME_LEN;
use crate::model::UserId;
use crate::notify::Notification;
use crate::rpc::{self, Function, RpcError};

/// A connection's notification subscription.
struct Listening {
    user_id: UserId,
    rx: broadcast::Receiver<Notification>,
}

fn codec_err(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::new(io::ErrorKind::InvalidData, other),
    }
}

async fn next_notification(
    listening: &mut Option<Listening>,
) -> Result<Notification, broadcast::error::RecvError> {
    match listening {
        Some(l) => l.rx.recv().await,
        None => std::future::pending().await,
    }
}

fn stop_listening(engine: &Engine, listening: &mut Option<Listening>) {
    if let Some(l) = listening.take() {
        let user_id = l.user_id;
        drop(l);
        engine.notify.release(user_id);
    }
}

/// Serve one client: read request lines, answer each in order, and push
/// notifications for the listened-to user in between.
pub async fn process_connection<S>(socket: S, engine: Arc<Engine>, token: Arc<str>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_FRAME_LEN));
    let mut listening: Option<Listening> = None;

    let result = loop {
        tokio::select! {
            line = framed.next() => {
                let reply = match line {
                    None => break Ok(()),
                    Some(Ok(line)) if line.trim().is_empty() => continue,
                    Some(Ok(line)) => handle_line(&engine, &token, &line, &mut listening).await,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        warn!("request line longer than {MAX_FRAME_LEN} bytes");
                        rpc::error_response(Value::Null, &RpcError::Malformed("request line too long".into()))
                    }
                    Some(Err(e)) => break Err(codec_err(e)),
                };
                if let Err(e) = framed.send(reply.to_string()).await {
                    break Err(codec_err(e));
                }
            }
            note = next_notification(&mut listening) => {
                match note {
                    Ok(n) => {
                        let line = serde_json::json!({ "notification": n }).to_string();
                        if let Err(e) = framed.send(line).await {
                            break Err(codec_err(e));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "listener fell behind, notifications dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => listening = None,
                }
            }
        }
    };

    stop_listening(&engine, &mut listening);
    result
}

async fn handle_line(
    engine: &Engine,
    token: &str,
    line: &str,
    listening: &mut Option<Listening>,
) -> Value {
    let call = match rpc::parse(line, token) {
        Ok(call) => call,
        Err((id, e)) => {
            debug!("rejected request: {e}");
            return rpc::error_response(id, &e);
        }
    };

    match call.function {
        Function::Listen => {
            let started = Instant::now();
            stop_listening(engine, listening);
            *listening = Some(Listening {
                user_id: call.caller,
                rx: engine.notify.subscribe(call.caller),
            });
            debug!(user = call.caller, "listening for notifications");
            rpc::record(&Function::Listen, true, started);
            rpc::ok_response(call.id, Value::Null)
        }
        Function::Unlisten => {
            let started = Instant::now();
            stop_listening(engine, listening);
            rpc::record(&Function::Unlisten, true, started);
            rpc::ok_response(call.id, Value::Null)
        }
        function => match rpc::invoke(engine, call.caller, function).await {
            Ok(payload) => rpc::ok_response(call.id, payload),
            Err(e) => rpc::error_response(call.id, &e),
        },
    }
}
