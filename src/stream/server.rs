use futures_util::StreamExt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, warn};

use super::sender::run_client;
use crate::audio::SubscriberRegistry;
use crate::config::{AudioConfig, StreamConfig};
use crate::error::Result;

/// Websocket endpoint that streams capture chunks to every client.
pub struct StreamServer {
    listener: TcpListener,
    registry: Arc<SubscriberRegistry>,
    audio: Arc<AudioConfig>,
    stream: Arc<StreamConfig>,
}

impl StreamServer {
    pub async fn bind(
        registry: Arc<SubscriberRegistry>,
        audio: AudioConfig,
        stream: StreamConfig,
    ) -> Result<Self> {
        let listener = TcpListener::bind(stream.bind).await?;
        Ok(Self {
            listener,
            registry,
            audio: Arc::new(audio),
            stream: Arc::new(stream),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts clients until `shutdown` resolves. Client tasks already
    /// running are left to finish on their own.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Audio stream listening on ws://{}", self.local_addr()?);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((tcp, peer)) => self.spawn_client(tcp, peer),
                    Err(e) => warn!("Accept failed: {}", e),
                },
            }
        }

        info!("Audio stream server stopped");
        Ok(())
    }

    fn spawn_client(&self, tcp: TcpStream, peer: SocketAddr) {
        let registry = self.registry.clone();
        let audio = self.audio.clone();
        let stream = self.stream.clone();
        tokio::spawn(async move {
            let _ = tcp.set_nodelay(true);
            let ws = match tokio_tungstenite::accept_async(tcp).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("{}: websocket handshake failed: {}", peer, e);
                    return;
                }
            };
            let (write, read) = ws.split();
            run_client(write, read, peer.to_string(), registry, &audio, &stream).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::AudioConfigMessage;
    use bytes::Bytes;
    use futures_util::SinkExt;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message;

    const WAIT: Duration = Duration::from_secs(5);

    async fn start() -> (SocketAddr, Arc<SubscriberRegistry>, oneshot::Sender<()>) {
        let registry = Arc::new(SubscriberRegistry::new());
        let stream = StreamConfig {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..StreamConfig::default()
        };
        let server = StreamServer::bind(registry.clone(), AudioConfig::default(), stream)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(server.run(async move {
            let _ = stop_rx.await;
        }));
        (addr, registry, stop_tx)
    }

    async fn wait_for_subscribers(registry: &SubscriberRegistry, count: usize) {
        timeout(WAIT, async {
            while registry.len() != count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_config_then_chunks() {
        let (addr, registry, _stop) = start().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();

        let first = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
        let config: AudioConfigMessage = serde_json::from_str(first.to_text().unwrap()).unwrap();
        assert_eq!(config, AudioConfigMessage::new(&AudioConfig::default()));

        wait_for_subscribers(&registry, 1).await;
        registry.dispatch(&Bytes::from_static(&[1, 0, 2, 0]));

        let chunk = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(chunk.into_data().as_ref(), &[1, 0, 2, 0]);

        ws.close(None).await.unwrap();
        wait_for_subscribers(&registry, 0).await;
    }

    #[tokio::test]
    async fn test_throttled_client_receives_nothing() {
        let (addr, registry, _stop) = start().await;
        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
        wait_for_subscribers(&registry, 1).await;

        ws.send(Message::text(r#"{"type":"buffer_status","buffer_ms":500}"#))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        registry.dispatch(&Bytes::from_static(&[9, 9]));
        assert!(
            timeout(Duration::from_millis(200), ws.next())
                .await
                .is_err()
        );

        ws.send(Message::text(r#"{"type":"buffer_status","buffer_ms":10}"#))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        registry.dispatch(&Bytes::from_static(&[7, 7]));
        let chunk = timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap();
        assert_eq!(chunk.into_data().as_ref(), &[7, 7]);
    }
}
