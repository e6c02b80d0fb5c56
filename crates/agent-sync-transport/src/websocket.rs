//! WebSocket transport for the control connection.

use agent_sync_core::SyncError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    self, Message,
    client::IntoClientRequest,
    http::{HeaderValue, StatusCode, header::AUTHORIZATION},
};

use crate::connector::{Connector, TransportParts};

/// Connects over `ws://` / `wss://` with a bearer credential.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl WsConnector {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn map_connect_error(err: tungstenite::Error) -> SyncError {
    match err {
        tungstenite::Error::Http(response)
            if matches!(response.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) =>
        {
            SyncError::Auth(format!("handshake refused with {}", response.status()))
        }
        other => SyncError::connection(other.to_string()),
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str, credential: &str) -> Result<TransportParts, SyncError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| SyncError::connection(format!("invalid url {url}: {e}")))?;
        let bearer = HeaderValue::from_str(&format!("Bearer {credential}"))
            .map_err(|_| SyncError::Auth("credential is not a valid header value".into()))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(map_connect_error)?;
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();

        // Forward outbound frames until the manager drops its sender.
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = source.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text.as_str().to_owned(),
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(s) => s,
                        Err(_) => {
                            tracing::warn!("Dropping non-UTF-8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        tracing::debug!(?frame, "Server closed control connection");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = in_tx.send(Err(SyncError::connection(e.to_string())));
                        break;
                    }
                };
                if in_tx.send(Ok(text)).is_err() {
                    break;
                }
            }
        });

        tracing::debug!(url, "WebSocket handshake complete");
        Ok(TransportParts {
            sender: out_tx,
            receiver: in_rx,
        })
    }
}
