//! Session and debug WebSockets, JSON-RPC framed.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::Response as HttpResponse;
use futures::{SinkExt, StreamExt};
use kiln_engine::{Env, LogSink, Session, SourceFile};
use serde_json::Value as Json;
use tokio::sync::mpsc;

use super::present;
use crate::error::ErrorEnvelope;
use crate::extract::{Identity, SCOPE_CALL, SCOPE_DEBUG};
use crate::jsonrpc::{Notification, Request, Response};
use crate::state::AppState;

fn parse_args(raw: Option<&String>) -> Result<Json, ErrorEnvelope> {
    match raw {
        None => Ok(serde_json::json!({})),
        Some(text) => serde_json::from_str(text)
            .map_err(|_| ErrorEnvelope::new(400, "Corrupted args, expected a JSON value.")),
    }
}

/// `GET /session/{app}/{version}/{class}` — WebSocket upgrade; `call`
/// requests are routed to the instance, `log(...)` comes back as
/// notifications, and disconnect invokes `released({code, reason})`.
pub async fn session_ws(
    State(state): State<AppState>,
    Path((app, version, class)): Path<(String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
    identity: Identity,
    ws: WebSocketUpgrade,
) -> Result<HttpResponse, ErrorEnvelope> {
    identity.require_scope(SCOPE_CALL)?;
    let args = parse_args(query.get("args"))?;
    let env = identity.env(&app, &version);
    Ok(ws.on_upgrade(move |socket| run_session(state, socket, app, version, class, args, env)))
}

/// `GET /debug/{app}/{version}/{class}` — like a session, plus `upload`,
/// `start` and `eval`; the build is assembled ad hoc from uploaded files.
pub async fn debug_ws(
    State(state): State<AppState>,
    Path((app, version, class)): Path<(String, String, String)>,
    Query(query): Query<HashMap<String, String>>,
    identity: Identity,
    ws: WebSocketUpgrade,
) -> Result<HttpResponse, ErrorEnvelope> {
    identity.require_scope(SCOPE_DEBUG)?;
    let args = parse_args(query.get("args"))?;
    let env = identity.env(&app, &version);
    Ok(ws.on_upgrade(move |socket| run_debug(state, socket, class, args, env)))
}

fn channel_sink() -> (LogSink, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let sink: LogSink = Arc::new(move |message: &str| {
        let _ = tx.send(message.to_string());
    });
    (sink, rx)
}

async fn run_session(
    state: AppState,
    socket: WebSocket,
    app: String,
    version: String,
    class: String,
    args: Json,
    env: Env,
) {
    let (mut sender, mut receiver) = socket.split();
    let (sink, mut log_rx) = channel_sink();

    let session = match state
        .engine
        .open_session(&app, &version, &class, args, env, Some(sink))
        .await
    {
        Ok(session) => session,
        Err(e) => {
            let envelope = ErrorEnvelope::from(e);
            let reply = Response::error(None, envelope.code as i64, envelope.message);
            let _ = sender.send(Message::Text(reply.to_text().into())).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    };

    let (code, reason) = loop {
        tokio::select! {
            Some(line) = log_rx.recv() => {
                let text = Notification::log(&line).to_text();
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break (1006, "Connection closed".to_string());
                }
            }
            incoming = receiver.next() => match incoming {
                None => break (1006, "Connection closed".to_string()),
                Some(Err(_)) => break (1006, "Connection error".to_string()),
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.as_ref().map(|f| f.code).unwrap_or(1000);
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "Closed normally".to_string());
                    break (code, reason);
                }
                Some(Ok(Message::Text(text))) => {
                    let reply = dispatch_session(&session, text.as_str()).await;
                    if sender.send(Message::Text(reply.to_text().into())).await.is_err() {
                        break (1006, "Connection closed".to_string());
                    }
                }
                Some(Ok(_)) => {}
            }
        }
    };

    let _ = session.release(code, &reason).await;
}

async fn dispatch_session(session: &Session, text: &str) -> Response {
    let request = match Request::parse(text) {
        Err(message) => return Response::error(None, 400, message),
        Ok(request) => request,
    };

    match request.method.as_str() {
        "call" => {
            let Some(method) = request.param_str("method_name") else {
                return Response::error(request.id, 400, "method_name is required");
            };
            let args = request.param("arguments");
            match session.call(&method, args).await {
                Ok(value) => Response::result(request.id, present(value)),
                Err(e) => {
                    let envelope = ErrorEnvelope::from(e);
                    Response::error(request.id, envelope.code as i64, envelope.message)
                }
            }
        }
        other => Response::error(request.id, 405, format!("No such method: {other}")),
    }
}

struct DebugState {
    files: Vec<SourceFile>,
    session: Option<Session>,
}

async fn run_debug(state: AppState, socket: WebSocket, class: String, args: Json, env: Env) {
    let (mut sender, mut receiver) = socket.split();
    let (sink, mut log_rx) = channel_sink();

    let mut debug = DebugState {
        files: Vec::new(),
        session: None,
    };

    let (code, reason) = loop {
        tokio::select! {
            Some(line) = log_rx.recv() => {
                let text = Notification::log(&line).to_text();
                if sender.send(Message::Text(text.into())).await.is_err() {
                    break (1006, "Connection closed".to_string());
                }
            }
            incoming = receiver.next() => match incoming {
                None => break (1006, "Connection closed".to_string()),
                Some(Err(_)) => break (1006, "Connection error".to_string()),
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.as_ref().map(|f| f.code).unwrap_or(1000);
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "Closed normally".to_string());
                    break (code, reason);
                }
                Some(Ok(Message::Text(text))) => {
                    let reply = dispatch_debug(
                        &state,
                        &mut debug,
                        &class,
                        &args,
                        &env,
                        &sink,
                        text.as_str(),
                    )
                    .await;
                    if sender.send(Message::Text(reply.to_text().into())).await.is_err() {
                        break (1006, "Connection closed".to_string());
                    }
                }
                Some(Ok(_)) => {}
            }
        }
    };

    if let Some(session) = debug.session.take() {
        let _ = session.release(code, &reason).await;
    }
}

async fn dispatch_debug(
    state: &AppState,
    debug: &mut DebugState,
    class: &str,
    args: &Json,
    env: &Env,
    sink: &LogSink,
    text: &str,
) -> Response {
    let request = match Request::parse(text) {
        Err(message) => return Response::error(None, 400, message),
        Ok(request) => request,
    };

    match request.method.as_str() {
        "upload" => {
            if debug.session.is_some() {
                return Response::error(request.id, 409, "Session is already initialized");
            }
            let Some(filename) = request.param_str("filename") else {
                return Response::error(request.id, 400, "filename is required");
            };
            let Some(contents) = request.param_str("contents") else {
                return Response::error(request.id, 400, "contents is required");
            };
            debug.files.retain(|f| f.name != filename);
            debug.files.push(SourceFile::new(filename, contents));
            Response::result(request.id, serde_json::json!("OK"))
        }
        "start" => {
            if debug.session.is_some() {
                return Response::error(request.id, 409, "Session is already initialized");
            }
            let build = match state
                .engine
                .create_debug_build(debug.files.clone(), env.clone())
                .await
            {
                Ok(build) => build,
                Err(e) => {
                    let envelope = ErrorEnvelope::from(e);
                    return Response::error(request.id, envelope.code as i64, envelope.message);
                }
            };
            match state
                .engine
                .open_debug_session(
                    build,
                    class,
                    args.clone(),
                    env.clone(),
                    None,
                    Some(sink.clone()),
                )
                .await
            {
                Ok(session) => {
                    debug.session = Some(session);
                    Response::result(request.id, serde_json::json!("OK"))
                }
                Err(e) => {
                    let envelope = ErrorEnvelope::from(e);
                    Response::error(request.id, envelope.code as i64, envelope.message)
                }
            }
        }
        "call" => {
            let Some(session) = &debug.session else {
                return Response::error(request.id, 405, "Session is not initialized yet");
            };
            let Some(method) = request.param_str("method_name") else {
                return Response::error(request.id, 400, "method_name is required");
            };
            match session.call(&method, request.param("arguments")).await {
                Ok(value) => Response::result(request.id, present(value)),
                Err(e) => {
                    let envelope = ErrorEnvelope::from(e);
                    Response::error(request.id, envelope.code as i64, envelope.message)
                }
            }
        }
        "eval" => {
            let Some(session) = &debug.session else {
                return Response::error(request.id, 405, "Session is not initialized yet");
            };
            let Some(text) = request.param_str("text") else {
                return Response::error(request.id, 400, "text is required");
            };
            match session.eval(&text).await {
                Ok(value) => {
                    Response::result(request.id, serde_json::json!({"result": value}))
                }
                Err(e) => {
                    let envelope = ErrorEnvelope::from(e);
                    Response::error(request.id, envelope.code as i64, envelope.message)
                }
            }
        }
        other => Response::error(request.id, 405, format!("No such method: {other}")),
    }
}
