use crate::{
    server::SharedState,
    session::Dispatcher,
    transport::{Inbound, Outbound, TransportError},
};
use axum::{
    extract::{
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
};
use futures::{future, SinkExt, StreamExt};
use std::net::SocketAddr;
use tracing::instrument;

#[instrument(skip(ws, state))]
pub async fn frame_socket(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    let dispatcher = state.dispatcher.clone();

    ws.max_message_size(state.max_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, dispatcher, peer))
}

async fn handle_socket(socket: WebSocket, dispatcher: Dispatcher, peer: SocketAddr) {
    let (sink, stream) = socket.split();

    let inbound = stream.filter_map(|message| future::ready(to_inbound(message)));
    let outbound = sink
        .sink_map_err(|e| TransportError::Send(e.to_string()))
        .with(|message: Outbound| future::ready(Ok::<_, TransportError>(to_message(message))));

    dispatcher.serve(inbound, outbound, Some(peer)).await;
}

fn to_inbound(message: Result<Message, axum::Error>) -> Option<Result<Inbound, TransportError>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(Inbound::Text(text))),
        Ok(Message::Binary(bytes)) => Some(Ok(Inbound::Binary(bytes))),
        Ok(Message::Close(_)) => Some(Ok(Inbound::Close)),
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
        Err(e) => Some(Err(TransportError::Receive(e.to_string()))),
    }
}

fn to_message(message: Outbound) -> Message {
    match message {
        Outbound::Text(text) => Message::Text(text.into()),
        Outbound::Close { code, reason } => Message::Close(Some(CloseFrame {
            code,
            reason: Utf8Bytes::from_static(reason),
        })),
    }
}
