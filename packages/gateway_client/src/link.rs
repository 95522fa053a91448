//! Socket task: dials the gateway and shuttles frames to and from the supervisor.

use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::GatewayError;
use crate::protocol::Frame;

/// Everything a socket task reports, tagged with the attempt it belongs to.
#[derive(Debug)]
pub(crate) enum LinkEvent {
    Opened { epoch: u64, link: Link },
    DialFailed { epoch: u64, error: String },
    Text { epoch: u64, text: String },
    Closed { epoch: u64, reason: String },
}

impl LinkEvent {
    pub fn epoch(&self) -> u64 {
        match self {
            LinkEvent::Opened { epoch, .. }
            | LinkEvent::DialFailed { epoch, .. }
            | LinkEvent::Text { epoch, .. }
            | LinkEvent::Closed { epoch, .. } => *epoch,
        }
    }
}

/// Supervisor's grip on an open socket.
#[derive(Debug)]
pub(crate) struct Link {
    outbound: mpsc::UnboundedSender<Message>,
    cancel: CancellationToken,
}

impl Link {
    pub fn send_frame(&self, frame: &Frame) -> Result<(), GatewayError> {
        let json = frame.to_json()?;
        self.outbound
            .send(Message::Text(json.into()))
            .map_err(|_| GatewayError::ConnectionLost)
    }

    /// Ask the socket task to send a close frame and stop.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Dial `url` in the background. Exactly one `Opened` or `DialFailed` is
/// reported for `epoch`, and an `Opened` link is always followed by `Closed`.
pub(crate) fn spawn_dial(url: String, epoch: u64, events: mpsc::UnboundedSender<LinkEvent>) {
    tokio::spawn(async move {
        let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                let _ = events.send(LinkEvent::DialFailed {
                    epoch,
                    error: e.to_string(),
                });
                return;
            }
        };
        debug!(epoch, url = %url, "Gateway socket open");

        let (mut ws_write, mut ws_read) = ws.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let cancel = CancellationToken::new();
        let link = Link {
            outbound: outbound_tx,
            cancel: cancel.clone(),
        };
        if events.send(LinkEvent::Opened { epoch, link }).is_err() {
            return;
        }

        let reason = loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = ws_write.send(Message::Close(None)).await;
                    break "closed locally".to_string();
                }
                Some(msg) = outbound_rx.recv() => {
                    if let Err(e) = ws_write.send(msg).await {
                        break format!("write failed: {e}");
                    }
                }
                incoming = ws_read.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let _ = events.send(LinkEvent::Text {
                            epoch,
                            text: text.as_str().to_owned(),
                        });
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| format!("closed by gateway ({}): {}", f.code, f.reason.as_str()))
                            .unwrap_or_else(|| "closed by gateway".to_string());
                    }
                    Some(Ok(other)) => trace!(epoch, kind = ?other, "Ignoring non-text message"),
                    Some(Err(e)) => break format!("read failed: {e}"),
                    None => break "stream ended".to_string(),
                },
            }
        };

        debug!(epoch, reason = %reason, "Gateway socket closed");
        let _ = events.send(LinkEvent::Closed { epoch, reason });
    });
}
