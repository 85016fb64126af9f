//! WebSocket connector for the reconnecting client.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use roomlink_client::{ConnectError, Connector, Link, LinkEvent, Outbound};
use roomlink_core::close_codes;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self, Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};

/// Opens `ws://` / `wss://` links with tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

fn map_error(error: tungstenite::Error) -> ConnectError {
    match error {
        tungstenite::Error::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            ConnectError::Refused(e.to_string())
        }
        tungstenite::Error::Http(response) => {
            ConnectError::Refused(format!("HTTP {}", response.status()))
        }
        other => ConnectError::Transport(other.to_string()),
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Link, ConnectError> {
        let (stream, _response) = connect_async(url).await.map_err(map_error)?;
        tracing::debug!(url, "WebSocket connected");
        let (mut write, mut read) = stream.split();

        let (out_tx, out_rx) = mpsc::unbounded_channel::<Outbound>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<LinkEvent>();

        tokio::spawn(async move {
            let mut outgoing = UnboundedReceiverStream::new(out_rx);
            while let Some(out) = outgoing.next().await {
                match out {
                    Outbound::Text(text) => {
                        if let Err(e) = write.send(Message::text(text)).await {
                            tracing::debug!(error = %e, "WebSocket write failed");
                            break;
                        }
                    }
                    Outbound::Close { code, reason } => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        let _ = write.send(Message::Close(Some(frame))).await;
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                let event = match msg {
                    Ok(Message::Text(text)) => LinkEvent::Text(text.as_str().to_owned()),
                    Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => LinkEvent::Text(text),
                        Err(_) => continue,
                    },
                    Ok(Message::Close(frame)) => {
                        let (code, reason) = frame.map_or_else(
                            || (close_codes::NO_STATUS, String::new()),
                            |f| (u16::from(f.code), f.reason.as_str().to_owned()),
                        );
                        let _ = in_tx.send(LinkEvent::Closed { code, reason });
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = in_tx.send(LinkEvent::Error(e.to_string()));
                        return;
                    }
                };
                if in_tx.send(event).is_err() {
                    return;
                }
            }
            let _ = in_tx.send(LinkEvent::Closed {
                code: close_codes::ABNORMAL,
                reason: "stream ended".into(),
            });
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
