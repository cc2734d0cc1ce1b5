//! WebSocket client for the signaling relay.

use futures_util::{SinkExt, StreamExt};
use shared::{ClientEvent, ProtocolError, ServerEvent};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum SignalingClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("signaling connection closed")]
    Closed,
}

/// One live relay connection. Events from the relay arrive on the receiver
/// returned by [`SignalingClient::connect`].
#[derive(Debug)]
pub struct SignalingClient {
    outbound: mpsc::UnboundedSender<ClientEvent>,
    shutdown: Option<oneshot::Sender<()>>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl SignalingClient {
    /// Connects to the relay's WebSocket endpoint, e.g. `ws://127.0.0.1:8000/ws`.
    pub async fn connect(
        url: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerEvent>), SignalingClientError> {
        let (stream, _response) = connect_async(url).await?;
        info!(%url, "connected to signaling relay");
        let (mut sink, mut source) = stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerEvent>();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = outbound_rx.recv() => {
                        let Some(event) = event else { break };
                        let frame = match event.to_frame() {
                            Ok(frame) => frame,
                            Err(err) => {
                                warn!(error = %err, "failed to encode event");
                                continue;
                            }
                        };
                        if sink.send(Message::Text(frame)).await.is_err() {
                            return;
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        });

        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => match ServerEvent::from_frame(&text) {
                        Ok(event) => {
                            if inbound_tx.send(event).is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(error = %err, "dropping malformed relay frame"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        debug!(error = %err, "relay read failed");
                        break;
                    }
                }
            }
        });

        let client = Self {
            outbound: outbound_tx,
            shutdown: Some(shutdown_tx),
            writer,
            reader,
        };
        Ok((client, inbound_rx))
    }

    pub fn send(&self, event: ClientEvent) -> Result<(), SignalingClientError> {
        self.outbound
            .send(event)
            .map_err(|_| SignalingClientError::Closed)
    }

    /// Sender for components that emit events on their own, e.g. a call session.
    pub fn sender(&self) -> mpsc::UnboundedSender<ClientEvent> {
        self.outbound.clone()
    }

    /// Sends a close frame and waits for the connection to wind down.
    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let _ = (&mut self.writer).await;
        let _ = (&mut self.reader).await;
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.writer.abort();
        self.reader.abort();
    }
}
