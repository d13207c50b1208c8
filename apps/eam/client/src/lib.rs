//! Control client for a running eam server.
//!
//! Speaks the JSON message protocol over `/ws`. Events that arrive while a
//! request is waiting for its response are buffered and handed out by
//! [`ControlClient::next_message`].

use std::{collections::VecDeque, time::Duration};

use eam_core::{
    message::{NoData, TaskerRef, ACTION_START, ACTION_STOP, EVENT_COMPLETED},
    Message, MessageKind, ProtocolError, Status,
};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{net::TcpStream, time::timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{self, Message as Frame},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, trace};

pub const DEFAULT_URL: &str = "ws://127.0.0.1:8000/ws";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),
    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("server closed the connection")]
    Closed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("{action} rejected: {message}")]
    Rejected { action: String, message: String },
}

pub struct ControlClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pending: VecDeque<Message>,
}

impl ControlClient {
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (stream, _) = match timeout(CONNECT_TIMEOUT, connect_async(url)).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(source)) => {
                return Err(ClientError::Connect {
                    url: url.to_string(),
                    source,
                })
            }
            Err(_) => return Err(ClientError::ConnectTimeout(url.to_string())),
        };
        debug!(url, "connected");
        Ok(Self {
            stream,
            pending: VecDeque::new(),
        })
    }

    pub async fn send(&mut self, msg: &Message) -> Result<(), ClientError> {
        let text = String::from_utf8_lossy(&msg.to_bytes()).into_owned();
        self.stream.send(Frame::Text(text.into())).await?;
        Ok(())
    }

    /// Sends raw text, bypassing the envelope. Useful for probing how the
    /// server treats malformed input.
    pub async fn send_raw(&mut self, text: &str) -> Result<(), ClientError> {
        self.stream.send(Frame::Text(text.to_string().into())).await?;
        Ok(())
    }

    pub async fn start(&mut self, tasker_id: &str) -> Result<Message, ClientError> {
        self.request(ACTION_START, tasker_id).await
    }

    pub async fn stop(&mut self, tasker_id: &str) -> Result<Message, ClientError> {
        self.request(ACTION_STOP, tasker_id).await
    }

    /// Sends a request and waits for the response to the same action. An
    /// `error` status becomes [`ClientError::Rejected`].
    pub async fn request(&mut self, action: &str, tasker_id: &str) -> Result<Message, ClientError> {
        self.send(&Message::request(action, &TaskerRef::new(tasker_id)))
            .await?;
        loop {
            let msg = self.read().await?;
            if msg.kind() == MessageKind::Response && msg.action() == action {
                return match msg.status() {
                    Some(Status::Success) => Ok(msg),
                    _ => Err(ClientError::Rejected {
                        action: action.to_string(),
                        message: msg.message().to_string(),
                    }),
                };
            }
            trace!(kind = ?msg.kind(), "buffering message while awaiting response");
            self.pending.push_back(msg);
        }
    }

    pub async fn next_message(&mut self) -> Result<Message, ClientError> {
        if let Some(msg) = self.pending.pop_front() {
            return Ok(msg);
        }
        self.read().await
    }

    /// Waits for the `completed` event of `tasker_id`, skipping other traffic.
    pub async fn wait_completed(&mut self, tasker_id: &str) -> Result<Message, ClientError> {
        loop {
            let msg = self.next_message().await?;
            if msg.kind() != MessageKind::Event || msg.event_name() != EVENT_COMPLETED {
                continue;
            }
            let done: TaskerRef = msg.decode_data()?;
            if done.tasker_id == tasker_id {
                return Ok(msg);
            }
        }
    }

    pub async fn close(mut self) -> Result<(), ClientError> {
        self.stream.close(None).await?;
        Ok(())
    }

    async fn read(&mut self) -> Result<Message, ClientError> {
        while let Some(frame) = self.stream.next().await {
            match frame? {
                Frame::Text(text) => return Ok(Message::from_slice(text.as_bytes())?),
                Frame::Binary(bytes) => return Ok(Message::from_slice(&bytes)?),
                Frame::Close(_) => return Err(ClientError::Closed),
                _ => continue,
            }
        }
        Err(ClientError::Closed)
    }
}

/// Empty request, handy for exercising unknown actions.
pub fn bare_request(action: &str) -> Message {
    Message::request(action, &NoData {})
}
