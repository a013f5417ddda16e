//! Centrifugo broker link over a WebSocket
//!
//! `CentrifugoConnector::open` performs the WebSocket handshake and the
//! protocol `connect` exchange under one timeout, then hands the socket to a
//! background task. The returned [`CentrifugoLink`] only enqueues commands for
//! that task; everything the broker says comes back through the
//! [`LinkEventSink`].

use super::frame_handler::{FrameHandler, FrameRoute, ReplyOutcome, DEFAULT_CLIENT_NAME, PONG_FRAME};
use crate::config::ClientConfig;
use crate::error::{ChatError, ChatResult};
use crate::transport::{BrokerConnector, BrokerLink, LinkEvent, LinkEventSink, SubscriptionEvent};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn, Instrument};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONNECT_COMMAND_ID: u32 = 1;

/// Opens Centrifugo links
#[derive(Debug, Clone)]
pub struct CentrifugoConnector {
    client_name: String,
    connect_timeout: Duration,
}

impl Default for CentrifugoConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CLIENT_NAME, Duration::from_secs(10))
    }
}

impl CentrifugoConnector {
    pub fn new(client_name: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            client_name: client_name.into(),
            connect_timeout,
        }
    }

    pub fn from_config(config: &ClientConfig) -> Self {
        Self::new(config.broker.client_name.clone(), config.connect_timeout())
    }

    async fn handshake(&self, endpoint: &str, token: &str) -> ChatResult<WsStream> {
        let (mut ws, _response) = connect_async(endpoint)
            .await
            .map_err(|e| ChatError::link_open(format!("WebSocket handshake failed: {e}")))?;

        let connect = FrameHandler::connect_command(CONNECT_COMMAND_ID, token, &self.client_name);
        ws.send(WsMessage::Text(connect))
            .await
            .map_err(|e| ChatError::link_open(format!("failed to send connect: {e}")))?;

        loop {
            let text = match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => text,
                Some(Ok(WsMessage::Close(frame))) => {
                    let reason = frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_else(|| "no reason".to_string());
                    return Err(ChatError::link_open(format!(
                        "broker closed the socket during connect: {reason}"
                    )));
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    return Err(ChatError::link_open(format!("socket error during connect: {e}")))
                }
                None => return Err(ChatError::link_open("socket closed during connect")),
            };

            for line in FrameHandler::split_frame(&text) {
                match FrameHandler::route(line) {
                    FrameRoute::Reply {
                        id: CONNECT_COMMAND_ID,
                        outcome: ReplyOutcome::Ok(_),
                    } => return Ok(ws),
                    FrameRoute::Reply {
                        id: CONNECT_COMMAND_ID,
                        outcome: ReplyOutcome::Error { code, message },
                    } => {
                        return Err(ChatError::link_open(format!(
                            "connect rejected ({code}): {message}"
                        )))
                    }
                    FrameRoute::Ping => {
                        ws.send(WsMessage::Text(PONG_FRAME.to_string()))
                            .await
                            .map_err(|e| ChatError::link_open(format!("failed to answer ping: {e}")))?;
                    }
                    other => debug!(route = ?other, "Ignoring frame before connect reply"),
                }
            }
        }
    }
}

#[async_trait]
impl BrokerConnector for CentrifugoConnector {
    async fn open(
        &self,
        endpoint: &str,
        token: &str,
        sink: LinkEventSink,
    ) -> ChatResult<Box<dyn BrokerLink>> {
        validate_endpoint(endpoint)?;
        let ws = tokio::time::timeout(self.connect_timeout, self.handshake(endpoint, token))
            .await
            .map_err(|_| {
                ChatError::link_open(format!(
                    "connect timed out after {}ms",
                    self.connect_timeout.as_millis()
                ))
            })??;

        info!(endpoint, link_id = sink.link_id(), "Broker link established");

        let (commands, rx) = mpsc::unbounded_channel();
        let span = tracing::debug_span!("centrifugo_link", link_id = sink.link_id());
        let task = LinkTask {
            ws,
            commands: rx,
            sink,
            next_id: CONNECT_COMMAND_ID + 1,
            in_flight: HashMap::new(),
        };
        tokio::spawn(task.run().instrument(span));

        Ok(Box::new(CentrifugoLink { commands }))
    }
}

fn validate_endpoint(endpoint: &str) -> ChatResult<()> {
    let url = Url::parse(endpoint)
        .map_err(|e| ChatError::link_open(format!("invalid broker endpoint '{endpoint}': {e}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(ChatError::link_open(format!(
            "broker endpoint must use ws or wss, got '{other}'"
        ))),
    }
}

#[derive(Debug)]
enum LinkCommand {
    Subscribe(String),
    Unsubscribe(String),
    Close,
}

/// Handle to a running link task
///
/// Dropping it closes the socket.
#[derive(Debug)]
pub struct CentrifugoLink {
    commands: mpsc::UnboundedSender<LinkCommand>,
}

impl CentrifugoLink {
    fn enqueue(&self, channel: &str, command: LinkCommand) -> ChatResult<()> {
        self.commands
            .send(command)
            .map_err(|_| ChatError::subscription(channel, "broker link is closed"))
    }
}

impl BrokerLink for CentrifugoLink {
    fn subscribe(&self, channel: &str) -> ChatResult<()> {
        self.enqueue(channel, LinkCommand::Subscribe(channel.to_string()))
    }

    fn unsubscribe(&self, channel: &str) -> ChatResult<()> {
        self.enqueue(channel, LinkCommand::Unsubscribe(channel.to_string()))
    }

    fn close(&self) {
        let _ = self.commands.send(LinkCommand::Close);
    }
}

#[derive(Debug)]
enum InFlight {
    Subscribe(String),
    Unsubscribe(String),
}

/// How the link task ended
#[derive(Debug)]
enum LinkExit {
    /// Closed on request; nothing to report
    Closed,
    Lost(LinkEvent),
}

struct LinkTask {
    ws: WsStream,
    commands: mpsc::UnboundedReceiver<LinkCommand>,
    sink: LinkEventSink,
    next_id: u32,
    in_flight: HashMap<u32, InFlight>,
}

impl LinkTask {
    async fn run(mut self) {
        let exit = loop {
            tokio::select! {
                command = self.commands.recv() => {
                    if let Some(exit) = self.handle_command(command).await {
                        break exit;
                    }
                }
                frame = self.ws.next() => {
                    if let Some(exit) = self.handle_frame(frame).await {
                        break exit;
                    }
                }
            }
        };

        match exit {
            LinkExit::Closed => {
                if let Err(e) = self.ws.close(None).await {
                    debug!(error = %e, "Socket close handshake failed");
                }
                info!("Broker link closed");
            }
            LinkExit::Lost(event) => {
                warn!(event = ?event, "Broker link lost");
                self.sink.emit(event);
            }
        }
    }

    async fn handle_command(&mut self, command: Option<LinkCommand>) -> Option<LinkExit> {
        let (frame, pending) = match command {
            Some(LinkCommand::Subscribe(channel)) => {
                let id = self.allocate_id();
                self.sink
                    .emit_subscription(&channel, SubscriptionEvent::Subscribing);
                (
                    FrameHandler::subscribe_command(id, &channel),
                    (id, InFlight::Subscribe(channel)),
                )
            }
            Some(LinkCommand::Unsubscribe(channel)) => {
                let id = self.allocate_id();
                (
                    FrameHandler::unsubscribe_command(id, &channel),
                    (id, InFlight::Unsubscribe(channel)),
                )
            }
            Some(LinkCommand::Close) | None => return Some(LinkExit::Closed),
        };

        self.in_flight.insert(pending.0, pending.1);
        self.write(frame).await
    }

    async fn handle_frame(
        &mut self,
        frame: Option<Result<WsMessage, tokio_tungstenite::tungstenite::Error>>,
    ) -> Option<LinkExit> {
        match frame {
            Some(Ok(WsMessage::Text(text))) => {
                for line in FrameHandler::split_frame(&text) {
                    if let Some(exit) = self.handle_line(line).await {
                        return Some(exit);
                    }
                }
                None
            }
            Some(Ok(WsMessage::Close(frame))) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "socket closed by server".to_string());
                Some(LinkExit::Lost(LinkEvent::Disconnected {
                    reason,
                    server_initiated: true,
                }))
            }
            Some(Ok(_)) => None,
            Some(Err(e)) => Some(LinkExit::Lost(LinkEvent::Error(format!("socket error: {e}")))),
            None => Some(LinkExit::Lost(LinkEvent::Error(
                "socket ended without close frame".to_string(),
            ))),
        }
    }

    async fn handle_line(&mut self, line: &str) -> Option<LinkExit> {
        match FrameHandler::route(line) {
            FrameRoute::Ping => return self.write(PONG_FRAME.to_string()).await,
            FrameRoute::Reply { id, outcome } => self.on_reply(id, outcome),
            FrameRoute::Publication { channel, data } => {
                self.sink
                    .emit_subscription(&channel, SubscriptionEvent::Publication(data));
            }
            FrameRoute::Unsubscribed { channel, reason } => {
                self.sink
                    .emit_subscription(&channel, SubscriptionEvent::Unsubscribed(reason));
            }
            FrameRoute::Disconnect { code, reason } => {
                info!(code, reason = %reason, "Broker requested disconnect");
                return Some(LinkExit::Lost(LinkEvent::Disconnected {
                    reason,
                    server_initiated: true,
                }));
            }
            FrameRoute::Ignored(what) => debug!(what = %what, "Ignoring frame"),
            FrameRoute::Malformed(reason) => warn!(reason = %reason, "Dropping malformed frame"),
        }
        None
    }

    fn on_reply(&mut self, id: u32, outcome: ReplyOutcome) {
        match (self.in_flight.remove(&id), outcome) {
            (Some(InFlight::Subscribe(channel)), ReplyOutcome::Ok(_)) => {
                self.sink
                    .emit_subscription(&channel, SubscriptionEvent::Subscribed);
            }
            (Some(InFlight::Subscribe(channel)), ReplyOutcome::Error { code, message }) => {
                self.sink.emit_subscription(
                    &channel,
                    SubscriptionEvent::Error(format!("{message} ({code})")),
                );
            }
            (Some(InFlight::Unsubscribe(channel)), ReplyOutcome::Error { code, message }) => {
                debug!(%channel, code, message = %message, "Unsubscribe rejected");
            }
            (Some(InFlight::Unsubscribe(_)), ReplyOutcome::Ok(_)) => {}
            (None, _) => debug!(id, "Reply for unknown command"),
        }
    }

    async fn write(&mut self, frame: String) -> Option<LinkExit> {
        match self.ws.send(WsMessage::Text(frame)).await {
            Ok(()) => None,
            Err(e) => Some(LinkExit::Lost(LinkEvent::Error(format!("socket write failed: {e}")))),
        }
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(CONNECT_COMMAND_ID + 1);
        id
    }
}
