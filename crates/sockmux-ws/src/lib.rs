//! WebSocket transport for the sockmux topic multiplexer.
//!
//! Wraps `tokio-tungstenite` into the reliable duplex message channel the
//! multiplexer expects: frames are JSON text messages, the connection is
//! retried forever with a fixed delay, and open/close lifecycle transitions
//! are surfaced as [`TransportEvent`]s for the multiplexer to rebuild its
//! wire subscriptions against.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use sockmux::transport::{Transport, TransportEvent, TransportEvents};
use sockmux::wire::Frame;
use sockmux::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

/// Fixed delay between reconnection attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Capacity of the event channel handed to the multiplexer.
const EVENT_CHANNEL_SIZE: usize = 1_000;

/// WebSocket-backed transport handle.
///
/// Frames submitted while the connection is down are queued and flushed
/// after the next successful reconnect. Dropping the handle (and every clone
/// of it) closes the connection and stops the connection task.
#[derive(Debug, Clone)]
pub struct WsTransport {
    outbound: mpsc::UnboundedSender<Frame>,
}

impl WsTransport {
    /// Spawn the connection task for `url` and return the transport handle
    /// together with the event stream to hand to
    /// [`Multiplexer::new`](sockmux::Multiplexer::new).
    pub fn connect(url: Url) -> (Self, TransportEvents) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(run(url, outbound_rx, events_tx));

        (
            Self {
                outbound: outbound_tx,
            },
            events_rx,
        )
    }
}

impl Transport for WsTransport {
    fn send(&self, frame: Frame) -> Result<(), Error> {
        self.outbound.send(frame).map_err(|_| Error::ChannelClosed)
    }
}

/// Connection loop: connect, pump frames both ways, reconnect on failure.
async fn run(
    url: Url,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    events: mpsc::Sender<TransportEvent>,
) {
    loop {
        tracing::debug!("Connecting to {url}");
        let ws_stream = match connect_async(url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(err) => {
                tracing::error!("Error connecting to {url}: {err:?}");
                sleep(RECONNECT_DELAY).await;
                continue;
            }
        };

        tracing::debug!("Connected to {url}");
        if events.send(TransportEvent::Open).await.is_err() {
            // multiplexer is gone
            return;
        }

        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                maybe_frame = outbound.recv() => {
                    let Some(frame) = maybe_frame else {
                        // every transport handle dropped
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    };
                    match serde_json::to_string(&frame) {
                        Ok(json) => {
                            if let Err(err) = write.send(Message::Text(json.into())).await {
                                tracing::error!("Send failed: {err:?}");
                                break;
                            }
                        }
                        Err(err) => tracing::error!("Could not serialize frame: {err:?}"),
                    }
                }
                maybe_msg = read.next() => {
                    match maybe_msg {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<Frame>(&text) {
                                Ok(frame) => {
                                    if events.send(TransportEvent::Frame(frame)).await.is_err() {
                                        return;
                                    }
                                }
                                Err(err) => tracing::warn!("Ignoring unparseable frame: {err}"),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        // binary, ping and pong frames are not part of the protocol
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            tracing::error!("Receive failed: {err:?}");
                            break;
                        }
                    }
                }
            }
        }

        if events.send(TransportEvent::Close).await.is_err() {
            return;
        }
        sleep(RECONNECT_DELAY).await;
    }
}
