//! Remote transport abstraction.
//!
//! The remote provider talks to the sync service through the object-safe
//! [`RemoteTransport`]/[`RemoteConnection`] traits, so tests can substitute
//! an in-memory transport and the production build uses
//! [`WebSocketTransport`]. All methods return boxed futures to keep the
//! traits usable behind `dyn`.
//!
//! Connection errors are not retried at this layer; a failed connection is
//! reported once and the provider tears down.

use std::future::Future;
use std::pin::Pin;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::doc::Presence;
use crate::error::{Result, SyncError};

/// A boxed future for object-safe async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Parameters for opening a remote sync connection.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    /// Sync service endpoint (e.g., "wss://sync.notelet.app/api/sync")
    pub endpoint: String,

    /// Workspace/document id to join
    pub workspace_id: String,

    /// Auth token presented to the service
    pub auth_token: String,

    /// Presence advertised for the lifetime of the connection
    pub presence: Presence,

    /// Ask the transport to skip any echo prevention of its own; the
    /// document handle already deduplicates by origin. Always set.
    pub disable_local_echo: bool,
}

/// An open bidirectional channel to the sync service.
pub trait RemoteConnection: Send + Sync {
    /// Send one opaque update to the service.
    fn send<'a>(&'a self, update: &'a [u8]) -> BoxFuture<'a, Result<()>>;

    /// Receive the next update from the service.
    ///
    /// Returns `Ok(None)` when the service closed the connection.
    fn recv(&self) -> BoxFuture<'_, Result<Option<Vec<u8>>>>;

    /// Close the connection.
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// Factory for remote connections.
pub trait RemoteTransport: Send + Sync {
    /// Open a connection for the given parameters.
    fn open<'a>(&'a self, params: &'a ConnectParams)
    -> BoxFuture<'a, Result<Box<dyn RemoteConnection>>>;
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// WebSocket transport to the sync service.
///
/// The workspace id becomes a path segment and the auth token plus presence
/// peer id ride as query parameters; presence payload exchange is owned by
/// the service on the same socket.
#[derive(Debug, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    /// Create a WebSocket transport.
    pub fn new() -> Self {
        Self
    }

    fn build_url(params: &ConnectParams) -> Result<Url> {
        let mut url = Url::parse(&params.endpoint)
            .map_err(|e| SyncError::Transport(format!("invalid endpoint: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| SyncError::Transport("endpoint cannot be a base URL".to_string()))?
            .pop_if_empty()
            .push(&params.workspace_id);
        url.query_pairs_mut()
            .append_pair("token", &params.auth_token)
            .append_pair("peer", &params.presence.peer_id);
        Ok(url)
    }
}

impl RemoteTransport for WebSocketTransport {
    fn open<'a>(
        &'a self,
        params: &'a ConnectParams,
    ) -> BoxFuture<'a, Result<Box<dyn RemoteConnection>>> {
        Box::pin(async move {
            let url = Self::build_url(params)?;
            let (stream, _) = connect_async(url.as_str())
                .await
                .map_err(|e| SyncError::Transport(format!("WebSocket connect failed: {}", e)))?;
            log::info!("[WebSocket] connected to {}", url);

            let (write, read) = stream.split();
            Ok(Box::new(WebSocketConnection {
                write: tokio::sync::Mutex::new(write),
                read: tokio::sync::Mutex::new(read),
            }) as Box<dyn RemoteConnection>)
        })
    }
}

struct WebSocketConnection {
    write: tokio::sync::Mutex<futures_util::stream::SplitSink<WsStream, Message>>,
    read: tokio::sync::Mutex<futures_util::stream::SplitStream<WsStream>>,
}

impl RemoteConnection for WebSocketConnection {
    fn send<'a>(&'a self, update: &'a [u8]) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut write = self.write.lock().await;
            write
                .send(Message::Binary(update.to_vec().into()))
                .await
                .map_err(|e| SyncError::Transport(format!("WebSocket send failed: {}", e)))
        })
    }

    fn recv(&self) -> BoxFuture<'_, Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            let mut read = self.read.lock().await;
            loop {
                match read.next().await {
                    Some(Ok(Message::Binary(data))) => return Ok(Some(data.to_vec())),
                    Some(Ok(Message::Close(_))) | None => return Ok(None),
                    // Text frames and ping/pong are control traffic here.
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        return Err(SyncError::Transport(format!(
                            "WebSocket read failed: {}",
                            e
                        )));
                    }
                }
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut write = self.write.lock().await;
            let _ = write.send(Message::Close(None)).await;
            Ok(())
        })
    }
}
