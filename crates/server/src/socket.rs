//! WebSocket gateway: upgrade, then one read pump and one write pump per
//! session.

use std::time::Duration;

use axum::{
    extract::{
        rejection::QueryRejection,
        ws::{rejection::WebSocketUpgradeRejection, Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use parley_core::{ClientEnvelope, ServerEvent};
use serde::Deserialize;
use tokio::{
    sync::mpsc,
    time::{interval_at, timeout, timeout_at, Instant},
};
use tracing::{debug, error};
use uuid::Uuid;

use crate::{
    config::HubConfig,
    error::{ApiError, INTERNAL_ERROR_MESSAGE},
    hub::{Hub, Payload, SessionKey},
    messaging::{MessagingError, MessagingService},
    rate_limit::RateLimiter,
    session::bearer_token,
    AppState,
};

const INVALID_FORMAT: &str = "invalid message format";
const RATE_LIMITED: &str = "rate limit exceeded";

#[derive(Debug, Default, Deserialize)]
pub struct SocketQuery {
    pub token: Option<String>,
}

#[derive(Clone)]
struct PumpContext {
    hub: Hub,
    messaging: MessagingService,
    rate_limiter: RateLimiter,
    write_wait: Duration,
    pong_wait: Duration,
    ping_period: Duration,
}

impl PumpContext {
    fn new(state: &AppState, config: &HubConfig) -> Self {
        Self {
            hub: state.hub().clone(),
            messaging: state.messaging().clone(),
            rate_limiter: state.rate_limiter().clone(),
            write_wait: config.write_wait(),
            pong_wait: config.pong_wait(),
            ping_period: config.ping_period(),
        }
    }
}

/// `GET /ws`: the access token comes from `?token=` or a bearer header and is
/// checked before the upgrade is accepted.
pub async fn ws_handler(
    State(state): State<AppState>,
    query: Result<Query<SocketQuery>, QueryRejection>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let token = query
        .ok()
        .and_then(|Query(query)| query.token)
        .filter(|token| !token.is_empty())
        .or_else(|| bearer_token(&headers).map(str::to_owned));
    let Some(token) = token else {
        return ApiError::Unauthorized("missing access token".into()).into_response();
    };
    let user_id = match state.auth().authenticate(&token) {
        Ok(user_id) => user_id,
        Err(err) => return ApiError::from(err).into_response(),
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let config = &state.config().hub;
    let context = PumpContext::new(&state, config);
    ws.max_message_size(config.max_message_size)
        .max_frame_size(config.max_message_size)
        .on_upgrade(move |socket| run_session(socket, user_id, context))
}

async fn run_session(socket: WebSocket, user_id: Uuid, context: PumpContext) {
    let session = context.hub.register(user_id).await;
    let key = session.key;
    let (sink, stream) = socket.split();

    let mut write = tokio::spawn(write_pump(
        sink,
        session.outbound,
        context.write_wait,
        context.ping_period,
    ));
    let mut read = tokio::spawn(read_pump(stream, key, context.clone()));

    tokio::select! {
        _ = &mut read => {
            context.hub.unregister(key).await;
            // Unregistering closes the queue; give the write pump one write
            // deadline to flush and send its close frame.
            if timeout(context.write_wait, &mut write).await.is_err() {
                write.abort();
            }
        }
        _ = &mut write => {
            read.abort();
            context.hub.unregister(key).await;
        }
    }
    let still_online = context.hub.is_user_online(user_id).await;
    debug!(%user_id, session_id = %key.session_id, still_online, "session closed");
}

async fn read_pump(mut stream: SplitStream<WebSocket>, key: SessionKey, context: PumpContext) {
    let mut deadline = Instant::now() + context.pong_wait;
    loop {
        let frame = match timeout_at(deadline, stream.next()).await {
            Err(_) => {
                debug!(user_id = %key.user_id, "read deadline elapsed");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                debug!(user_id = %key.user_id, ?err, "websocket read failed");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            WsMessage::Text(text) => handle_frame(&context, key, text.as_str()).await,
            WsMessage::Binary(_) => reply(&context, key, INVALID_FORMAT).await,
            WsMessage::Pong(_) => deadline = Instant::now() + context.pong_wait,
            WsMessage::Ping(_) => {}
            WsMessage::Close(_) => break,
        }
    }
}

async fn handle_frame(context: &PumpContext, key: SessionKey, frame: &str) {
    let request = match ClientEnvelope::parse(frame) {
        Ok(request) => request,
        Err(err) => {
            reply(context, key, err.to_string()).await;
            return;
        }
    };

    if !context.rate_limiter.check(key.user_id).await {
        reply(context, key, RATE_LIMITED).await;
        return;
    }

    if let Err(err) = context
        .messaging
        .deliver(key.user_id, request.target, &request.content)
        .await
    {
        let reason = match err {
            MessagingError::Storage(inner) => {
                error!(error = ?inner, user_id = %key.user_id, "failed to deliver message");
                INTERNAL_ERROR_MESSAGE.to_string()
            }
            other => other.to_string(),
        };
        reply(context, key, reason).await;
    }
}

async fn reply(context: &PumpContext, key: SessionKey, reason: impl Into<String>) {
    context
        .hub
        .send_to_session(key, &ServerEvent::error(reason))
        .await;
}

async fn write_pump(
    mut sink: SplitSink<WebSocket, WsMessage>,
    mut outbound: mpsc::Receiver<Payload>,
    write_wait: Duration,
    ping_period: Duration,
) {
    let mut ticker = interval_at(Instant::now() + ping_period, ping_period);
    loop {
        tokio::select! {
            queued = outbound.recv() => {
                let Some(first) = queued else {
                    let _ = timeout(write_wait, sink.send(WsMessage::Close(None))).await;
                    break;
                };
                let batch = drain_batch(&first, &mut outbound);
                if !send_frame(&mut sink, WsMessage::Text(batch.into()), write_wait).await {
                    break;
                }
            }
            _ = ticker.tick() => {
                if !send_frame(&mut sink, WsMessage::Ping(Default::default()), write_wait).await {
                    break;
                }
            }
        }
    }
}

/// Join `first` with whatever is already queued, newline-delimited, so one
/// frame carries every envelope that is ready.
fn drain_batch(first: &Payload, outbound: &mut mpsc::Receiver<Payload>) -> String {
    let mut batch = String::from(&**first);
    while let Ok(next) = outbound.try_recv() {
        batch.push('\n');
        batch.push_str(&next);
    }
    batch
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, WsMessage>,
    frame: WsMessage,
    write_wait: Duration,
) -> bool {
    match timeout(write_wait, sink.send(frame)).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            debug!(?err, "websocket write failed");
            false
        }
        Err(_) => {
            debug!("websocket write timed out");
            false
        }
    }
}
