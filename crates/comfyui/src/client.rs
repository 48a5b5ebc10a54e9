//! WebSocket client for the backend push channel.
//!
//! [`ComfyUIClient`] holds the connection configuration; calling
//! [`ComfyUIClient::connect`] opens a live [`ComfyUIConnection`] scoped
//! to a fresh client correlation id.

use tokio_tungstenite::{connect_async, MaybeTlsStream};

/// Configuration handle for the backend push channel.
#[derive(Debug, Clone)]
pub struct ComfyUIClient {
    ws_url: String,
}

/// A live WebSocket connection to the backend.
///
/// Holds the raw stream plus the correlation id the backend will use
/// to address messages back to this client. The same id must be sent
/// with the job submission so progress events reach this channel.
pub struct ComfyUIConnection {
    /// Client-generated correlation id sent during the handshake.
    pub client_id: String,
    /// The raw WebSocket stream for reading frames.
    pub ws_stream: tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

/// Errors that can occur when establishing the push channel.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIClientError {
    /// Failed to establish the initial WebSocket connection.
    #[error("Connection error: {0}")]
    Connection(String),
}

impl ComfyUIClient {
    /// Create a new client targeting a WebSocket base URL, e.g.
    /// `ws://host:8188`.
    pub fn new(ws_url: String) -> Self {
        Self { ws_url }
    }

    /// WebSocket base URL.
    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Connect to the backend WebSocket endpoint.
    ///
    /// Generates a unique correlation id (UUID v4) and appends it as
    /// the `clientId` query parameter so the backend can scope progress
    /// messages to this client.
    pub async fn connect(&self) -> Result<ComfyUIConnection, ComfyUIClientError> {
        let client_id = uuid::Uuid::new_v4().to_string();
        let url = format!("{}/ws?clientId={}", self.ws_url, client_id);

        let (ws_stream, _response) = connect_async(&url).await.map_err(|e| {
            ComfyUIClientError::Connection(format!(
                "Failed to connect to ComfyUI at {}: {e}",
                self.ws_url
            ))
        })?;

        tracing::info!(
            client_id = %client_id,
            "Connected to ComfyUI at {}",
            self.ws_url,
        );

        Ok(ComfyUIConnection {
            client_id,
            ws_stream,
        })
    }
}
