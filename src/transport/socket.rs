use super::{frame::Frame, Ack, Listener, ListenerId, Listeners, Transport};
use crate::error::TransportError;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type AckSender = oneshot::Sender<Result<Value, TransportError>>;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// State shared between the public handle and the connection driver.
struct Shared {
    pending: Mutex<HashMap<u64, AckSender>>,
    next_ack: AtomicU64,
    connected: AtomicBool,
    listeners: Listeners,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, AckSender>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Routes one incoming frame. Returns the answer owed to the server, if
    /// it asked for one.
    fn handle_text(&self, text: &str) -> Option<Frame> {
        debug!("<- realtime frame: {}", text);

        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to parse realtime frame: {}", e);
                return None;
            }
        };

        match frame {
            Frame::Ack { ack, data, error } => {
                let sender = self.pending().remove(&ack);
                let Some(tx) = sender else {
                    warn!(ack, "acknowledgment for unknown request");
                    return None;
                };
                let result = match error {
                    Some(reason) => Err(TransportError::Rejected(reason)),
                    None => Ok(data.unwrap_or(Value::Null)),
                };
                let _ = tx.send(result);
                None
            }
            Frame::Event { event, data } => {
                self.dispatch(&event, &data);
                None
            }
            Frame::Emit { event, data, ack } => {
                self.dispatch(&event, &data);
                ack.map(|ack| Frame::Ack {
                    ack,
                    data: None,
                    error: None,
                })
            }
        }
    }

    fn dispatch(&self, event: &str, data: &Value) {
        if self.listeners.dispatch(event, data) == 0 {
            debug!(%event, "push with no bound listener");
        }
    }

    /// Settles every outstanding acknowledgment as disconnected.
    fn fail_pending(&self) {
        let drained: Vec<AckSender> = self.pending().drain().map(|(_, tx)| tx).collect();
        if !drained.is_empty() {
            warn!(count = drained.len(), "dropping unacknowledged requests");
        }
        for tx in drained {
            let _ = tx.send(Err(TransportError::Disconnected));
        }
    }
}

/// Websocket connection to the realtime endpoint.
///
/// A background driver owns the socket, writes queued frames, routes
/// acknowledgments to their waiters and pushes to listeners. When the socket
/// drops, outstanding acknowledgments fail and the driver reconnects with
/// exponential backoff; listeners stay bound across reconnects.
pub struct SocketTransport {
    shared: Arc<Shared>,
    outgoing: mpsc::UnboundedSender<Frame>,
    driver: JoinHandle<()>,
}

impl SocketTransport {
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let stream = open(url).await?;
        info!(url, "realtime connection established");

        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            next_ack: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            listeners: Listeners::default(),
        });
        let (outgoing, rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(url.to_string(), stream, rx, shared.clone()));

        Ok(Self {
            shared,
            outgoing,
            driver,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }
}

impl Transport for SocketTransport {
    fn emit(&self, event: &str, payload: Value) -> Ack {
        if !self.is_connected() {
            return Ack::ready(Err(TransportError::Disconnected));
        }

        let id = self.shared.next_ack.fetch_add(1, Ordering::Relaxed);
        let (tx, ack) = Ack::channel();
        self.shared.pending().insert(id, tx);

        if self.outgoing.send(Frame::emit(event, payload, id)).is_err() {
            // Driver is gone; the removed sender settles the ack as disconnected
            self.shared.pending().remove(&id);
        }
        ack
    }

    fn on(&self, event: &str) -> Listener {
        self.shared.listeners.add(event)
    }

    fn off(&self, event: &str, id: ListenerId) {
        self.shared.listeners.remove(event, id);
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

async fn open(url: &str) -> Result<WsStream, TransportError> {
    let (stream, _response) = connect_async(url)
        .await
        .map_err(|e| TransportError::Connect {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
    Ok(stream)
}

async fn drive(
    url: String,
    first: WsStream,
    mut outgoing: mpsc::UnboundedReceiver<Frame>,
    shared: Arc<Shared>,
) {
    let mut stream = Some(first);
    let mut backoff = INITIAL_BACKOFF;

    loop {
        let current = match stream.take() {
            Some(current) => current,
            None => match open(&url).await {
                Ok(reopened) => {
                    info!(%url, "realtime connection re-established");
                    backoff = INITIAL_BACKOFF;
                    reopened
                }
                Err(e) => {
                    warn!("Reconnect failed, retrying in {:?}: {}", backoff, e);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    continue;
                }
            },
        };

        shared.connected.store(true, Ordering::Release);
        let keep_going = pump(current, &mut outgoing, &shared).await;
        shared.connected.store(false, Ordering::Release);
        shared.fail_pending();

        // Frames queued for the lost socket are never sent
        while let Ok(frame) = outgoing.try_recv() {
            if let Frame::Emit { ack: Some(id), .. } = frame {
                if let Some(tx) = shared.pending().remove(&id) {
                    let _ = tx.send(Err(TransportError::Disconnected));
                }
            }
        }

        if !keep_going {
            debug!("realtime driver finished");
            return;
        }
        warn!(%url, "realtime connection lost");
    }
}

/// Runs one socket until it closes. Returns `false` once the transport handle
/// itself is gone.
async fn pump(
    stream: WsStream,
    outgoing: &mut mpsc::UnboundedReceiver<Frame>,
    shared: &Shared,
) -> bool {
    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            frame = outgoing.recv() => {
                let Some(frame) = frame else {
                    let _ = write.close().await;
                    return false;
                };
                let text = match frame.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode realtime frame: {}", e);
                        continue;
                    }
                };
                debug!("-> realtime frame: {}", text);
                if let Err(e) = write.send(WsMessage::Text(text)).await {
                    error!("Failed to write realtime frame: {}", e);
                    return true;
                }
            }
            incoming = read.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let Some(reply) = shared.handle_text(&text) else {
                        continue;
                    };
                    let encoded = match reply.encode() {
                        Ok(encoded) => encoded,
                        Err(e) => {
                            error!("Failed to encode realtime frame: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = write.send(WsMessage::Text(encoded)).await {
                        error!("Failed to answer realtime frame: {}", e);
                        return true;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => return true,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("Error reading realtime socket: {}", e);
                    return true;
                }
            },
        }
    }
}
