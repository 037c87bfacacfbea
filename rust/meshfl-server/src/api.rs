//! A websocket API for the rendezvous protocol.

use std::{convert::Infallible, future::Future, net::SocketAddr};

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use warp::{
    ws::{Message, WebSocket, Ws},
    Filter,
};

use crate::{rendezvous::RendezvousHandle, settings::ApiSettings};
use meshfl_core::message::{ClientMessage, FromBytes, ServerMessage, ToBytes};

/// Binds a websocket server to the given address, serving the nodes of every task
/// under `/rendezvous/<task>`.
///
/// Returns the bound address and the server future.
///
/// # Errors
/// Fails if the address can't be bound.
pub fn bind(
    api_settings: &ApiSettings,
    rendezvous: RendezvousHandle,
) -> Result<(SocketAddr, impl Future<Output = ()>), warp::Error> {
    let routes = warp::path!("rendezvous" / String)
        .and(warp::ws())
        .and(with_rendezvous(rendezvous))
        .map(|task: String, ws: Ws, rendezvous: RendezvousHandle| {
            ws.on_upgrade(move |socket| handle_socket(socket, task, rendezvous))
        })
        .with(warp::log("http"));

    warp::serve(routes).try_bind_ephemeral(api_settings.bind_address)
}

/// Runs the websocket server until it fails.
///
/// # Errors
/// Fails if the address can't be bound.
pub async fn serve(
    api_settings: ApiSettings,
    rendezvous: RendezvousHandle,
) -> Result<(), warp::Error> {
    let (address, server) = bind(&api_settings, rendezvous)?;
    info!("rendezvous server listening on {}", address);
    server.await;
    Ok(())
}

/// Bridges a websocket to the rendezvous logic.
async fn handle_socket(socket: WebSocket, task: String, rendezvous: RendezvousHandle) {
    let (mut sink, mut stream) = socket.split();
    let (client_tx, client_rx) = mpsc::unbounded_channel::<ClientMessage>();
    let (server_tx, mut server_rx) = mpsc::unbounded_channel::<ServerMessage>();

    let writer = tokio::spawn(async move {
        while let Some(message) = server_rx.recv().await {
            let bytes = match message.to_bytes() {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!("dropping message to a node: {}", err);
                    continue;
                }
            };
            if let Err(err) = sink.send(Message::binary(bytes)).await {
                debug!("failed to send to a node: {}", err);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let reader = tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    debug!("websocket error: {}", err);
                    break;
                }
            };
            if frame.is_close() {
                break;
            }
            if !frame.is_binary() {
                continue;
            }
            match ClientMessage::from_byte_slice(frame.as_bytes()) {
                Ok(message) => {
                    if client_tx.send(message).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!("invalid message from a node: {:#}", err);
                    break;
                }
            }
        }
    });

    let _ = rendezvous.serve(task, client_rx, server_tx).await;
    reader.abort();
    let _ = writer.await;
}

/// Converts a rendezvous handle into a `warp` filter.
fn with_rendezvous(
    rendezvous: RendezvousHandle,
) -> impl Filter<Extract = (RendezvousHandle,), Error = Infallible> + Clone {
    warp::any().map(move || rendezvous.clone())
}
