//! Message transport - a persistent, message-oriented link to a venue

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};
use url::Url;

use crate::core::{Error, Result};

/// An open link. Dropping `outbound` closes it; `inbound` ends when the venue side closes.
pub struct Link {
    pub outbound: flume::Sender<String>,
    pub inbound: flume::Receiver<String>,
}

/// Opens links; the seam between protocol logic and the network
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, url: &str) -> Result<Link>;
}

/// WebSocket transport
#[derive(Debug, Default, Clone, Copy)]
pub struct WsTransport;

#[async_trait]
impl Transport for WsTransport {
    async fn open(&self, url: &str) -> Result<Link> {
        let url = Url::parse(url).map_err(|e| Error::Config(format!("bad url {}: {}", url, e)))?;

        info!("Connecting to WebSocket: {}", url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();
        let (out_tx, out_rx) = flume::unbounded::<String>();
        let (in_tx, in_rx) = flume::unbounded::<String>();

        tokio::spawn(async move {
            while let Ok(text) = out_rx.recv_async().await {
                if let Err(e) = write.send(Message::Text(text)).await {
                    warn!("WebSocket write failed: {}", e);
                    return;
                }
            }
            let _ = write.send(Message::Close(None)).await;
        });

        tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(text).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(bin)) => match String::from_utf8(bin) {
                        Ok(text) => {
                            if in_tx.send(text).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Dropping non-UTF8 frame: {}", e),
                    },
                    Ok(Message::Close(frame)) => {
                        info!("WebSocket closed: {:?}", frame);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
            debug!("WebSocket reader finished");
        });

        Ok(Link {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
