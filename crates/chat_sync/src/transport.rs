use std::pin::Pin;

use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::AUTHORIZATION, HeaderValue},
        Message,
    },
};
use url::Url;

use crate::{connection::Session, error::TransportError};

pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// One open push connection, split into its outbound and inbound halves of JSON text frames.
pub struct TransportLink {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a connection authenticated with `session`; returning `Ok` is the handshake success.
    async fn open(&self, session: &Session) -> Result<TransportLink, TransportError>;
}

pub struct WebSocketTransport {
    socket_url: Url,
}

impl WebSocketTransport {
    pub fn new(socket_url: &str) -> Result<Self, TransportError> {
        let socket_url =
            Url::parse(socket_url).map_err(|err| TransportError::InvalidUrl(err.to_string()))?;
        if !matches!(socket_url.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme '{}' in {socket_url}",
                socket_url.scheme()
            )));
        }
        Ok(Self { socket_url })
    }

    pub fn socket_url(&self) -> &str {
        self.socket_url.as_str()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, session: &Session) -> Result<TransportLink, TransportError> {
        let mut request = self.socket_url.as_str().into_client_request()?;
        let bearer = HeaderValue::from_str(&format!("Bearer {}", session.token()))
            .map_err(|err| TransportError::Handshake(format!("invalid bearer token: {err}")))?;
        request.headers_mut().insert(AUTHORIZATION, bearer);

        let (ws_stream, _) = connect_async(request).await?;
        let (writer, reader) = ws_stream.split();

        let sink = writer.with(|frame: String| future::ok::<_, TransportError>(Message::Text(frame)));
        let stream = reader.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Close(frame)) => Some(Err(TransportError::Closed(
                    frame
                        .map(|frame| frame.reason.into_owned())
                        .unwrap_or_else(|| "closed by server".to_string()),
                ))),
                Ok(_) => None,
                Err(err) => Some(Err(err.into())),
            })
        });

        Ok(TransportLink {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
