use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::signaling::{SignalingMessage, ABNORMAL_CLOSURE, NORMAL_CLOSURE};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One text frame, undecoded.
    Message(String),
    Closed { code: u16, reason: String },
    Error(String),
}

/// A reliable, ordered, full-duplex message channel to the room server.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Registers where inbound traffic goes. Called once, before `connect`.
    fn subscribe(&mut self, events: mpsc::UnboundedSender<TransportEvent>);

    /// Opens (or re-opens) the channel.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Best effort: when the channel is not open the message is dropped and logged.
    fn send(&self, message: &SignalingMessage);

    fn is_open(&self) -> bool;

    /// Closes with a normal-closure code.
    async fn close(&mut self);
}

pub struct WebSocketTransport {
    url: String,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    outgoing: Option<mpsc::UnboundedSender<Message>>,
    open: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl WebSocketTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            events: None,
            outgoing: None,
            open: Arc::new(AtomicBool::new(false)),
            tasks: Vec::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Encodes `message` and hands it to the writer task.
    pub fn enqueue(&self, message: &SignalingMessage) -> Result<(), TransportError> {
        let outgoing = match (&self.outgoing, self.is_open()) {
            (Some(outgoing), true) => outgoing,
            _ => return Err(TransportError::NotOpen),
        };
        let json = message.encode()?;
        outgoing
            .send(Message::Text(json))
            .map_err(|_| TransportError::WriterStopped)
    }

    fn shutdown_tasks(&mut self) {
        self.outgoing = None;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl SignalingTransport for WebSocketTransport {
    fn subscribe(&mut self, events: mpsc::UnboundedSender<TransportEvent>) {
        self.events = Some(events);
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        let events = self.events.clone().ok_or(TransportError::NoSubscriber)?;
        self.shutdown_tasks();

        info!(url = %self.url, "opening signaling channel");
        let (ws_stream, _) = connect_async(self.url.as_str()).await?;
        let (mut write, mut read) = ws_stream.split();

        // Fresh flag per connection so a stale reader cannot flip the new one.
        let open = Arc::new(AtomicBool::new(true));
        self.open = open.clone();

        let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();

        // Handle outgoing messages
        self.tasks.push(tokio::spawn(async move {
            while let Some(msg) = outgoing_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    debug!("signaling write failed: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }
        }));

        // Handle incoming messages
        self.tasks.push(tokio::spawn(async move {
            let (code, reason) = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if events.send(TransportEvent::Message(text)).is_err() {
                            break (NORMAL_CLOSURE, "session gone".to_string());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => (u16::from(frame.code), frame.reason.into_owned()),
                            None => (1005, String::new()),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        break (ABNORMAL_CLOSURE, e.to_string());
                    }
                    None => break (ABNORMAL_CLOSURE, "stream ended".to_string()),
                }
            };
            open.store(false, Ordering::SeqCst);
            let _ = events.send(TransportEvent::Closed { code, reason });
        }));

        self.outgoing = Some(outgoing_tx);
        info!("signaling channel established");
        Ok(())
    }

    fn send(&self, message: &SignalingMessage) {
        match self.enqueue(message) {
            Ok(()) => debug!(kind = message.kind(), target = ?message.target(), "[SEND]"),
            Err(e) => warn!(kind = message.kind(), "message dropped: {}", e),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&mut self) {
        if let Some(outgoing) = self.outgoing.take() {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "leaving".into(),
            };
            let _ = outgoing.send(Message::Close(Some(frame)));
        }
        self.open.store(false, Ordering::SeqCst);
        // The writer exits on its own after the close frame; the reader is
        // dropped so no close event reaches a session that already left.
        for task in self.tasks.drain(..).skip(1) {
            task.abort();
        }
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
