use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::SinkExt;
use futures::stream::{SplitSink, StreamExt};
use market_data::candles::ClientId;
use market_data::subscription::{
    ClientTransport, ControlMessage, SubscriptionProcessor, TransportError,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::state::AppState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Write half of a client socket.
struct SocketTransport {
    sender: Mutex<SplitSink<WebSocket, Message>>,
}

#[async_trait]
impl ClientTransport for SocketTransport {
    async fn send_text(&self, text: String) -> Result<(), TransportError> {
        self.sender
            .lock()
            .await
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| TransportError::Closed)
    }
}

/// Apply one inbound text frame. Malformed or rejected messages are
/// logged and ignored.
pub fn apply_control(processor: &SubscriptionProcessor, text: &str) {
    let client = processor.client();
    let message = match serde_json::from_str::<ControlMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(client, error = %e, "Ignoring malformed control message");
            return;
        }
    };
    match processor.handle_control(message) {
        Ok(true) => {}
        Ok(false) => debug!(client, "Control message had no effect"),
        Err(e) => warn!(client, error = %e, "Control message rejected"),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let client: ClientId = state.next_client_id();
    let (sender, mut receiver) = socket.split();
    let transport = Arc::new(SocketTransport {
        sender: Mutex::new(sender),
    });
    let processor = Arc::new(SubscriptionProcessor::start(
        client,
        Arc::clone(&state.processors),
        transport,
        state.flush_timeout,
    ));
    state.clients.insert(client, Arc::clone(&processor));
    let mut shutdown = state.shutdown_signal();
    info!(client, "Stream client connected");

    if !state.is_shutting_down() {
        loop {
            tokio::select! {
                msg = receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => apply_control(&processor, text.as_str()),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(client, error = %e, "Stream receive failed");
                        break;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
    }

    state.clients.remove(&client);
    processor.shutdown().await;
    info!(client, "Stream client disconnected");
}
