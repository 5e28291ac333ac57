//! TCP accept loop and per-connection tasks.

use chronod_core::{ChronodConfig, ChronodError, Result};
use chronod_sched::Event;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::protocol::decode_line;

/// Accepts control connections and bridges them onto the event channel.
pub struct Gateway {
    listener: TcpListener,
    events: UnboundedSender<Event>,
    idle_timeout: Duration,
    next_client: u64,
}

impl Gateway {
    /// Bind the control socket. A bind failure is fatal at startup.
    pub async fn bind(config: &ChronodConfig, events: UnboundedSender<Event>) -> Result<Self> {
        let addr = format!("{}:{}", config.listen_host, config.listen_port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ChronodError::Config(format!("cannot bind {addr}: {e}")))?;
        tracing::info!("control socket listening on {addr}");
        Ok(Self {
            listener,
            events,
            idle_timeout: Duration::from_secs(config.client_timeout_secs),
            next_client: 0,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(mut self) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            self.next_client += 1;
            let client = self.next_client;
            tracing::debug!(client, "connection from {peer}");

            let (tx, rx) = unbounded_channel();
            // Connecting clients act as the daemon's own user until a request
            // names another one.
            let user = whoami::username();
            if self
                .events
                .send(Event::ClientConnected { client, user, tx })
                .is_err()
            {
                // Dispatcher is gone; nothing left to serve.
                return Ok(());
            }
            let events = self.events.clone();
            let idle = self.idle_timeout;
            tokio::spawn(async move {
                serve_connection(client, stream, rx, events.clone(), idle).await;
                let _ = events.send(Event::ClientDisconnected { client });
                tracing::debug!(client, "disconnected");
            });
        }
    }
}

/// Pump one connection until EOF, idle timeout, or dispatcher exit.
async fn serve_connection(
    client: u64,
    stream: TcpStream,
    mut rx: UnboundedReceiver<String>,
    events: UnboundedSender<Event>,
    idle: Duration,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    loop {
        tokio::select! {
            line = tokio::time::timeout(idle, lines.next_line()) => {
                match line {
                    Ok(Ok(Some(line))) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let request = decode_line(&line);
                        if request.is_none() {
                            tracing::warn!(client, "malformed request line");
                        }
                        if events.send(Event::ClientRequest { client, request }).is_err() {
                            return;
                        }
                    }
                    // EOF, read error, or idle timeout all end the session.
                    Ok(Ok(None)) | Ok(Err(_)) => return,
                    Err(_) => {
                        tracing::debug!(client, "idle timeout");
                        return;
                    }
                }
            }
            out = rx.recv() => {
                match out {
                    Some(mut line) => {
                        line.push('\n');
                        if write_half.write_all(line.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                    None => return,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronod_sched::ClientRequest;

    fn test_config() -> ChronodConfig {
        let mut config = ChronodConfig::default();
        config.listen_port = 0;
        config
    }

    #[tokio::test]
    async fn test_connection_produces_typed_events() {
        let (tx, mut rx) = unbounded_channel();
        let gateway = Gateway::bind(&test_config(), tx).await.unwrap();
        let addr = gateway.local_addr().unwrap();
        tokio::spawn(gateway.run());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"{\"action\":\"get_server_info\"}\nnot json\n")
            .await
            .unwrap();

        // Keep the push sender alive; dropping it would close the connection
        // from the server's side before the later events arrive.
        let _client_tx = match rx.recv().await.unwrap() {
            Event::ClientConnected { client, tx, .. } => {
                assert_eq!(client, 1);
                tx
            }
            other => panic!("expected connect, got {other:?}"),
        };
        match rx.recv().await.unwrap() {
            Event::ClientRequest { request, .. } => {
                assert!(matches!(request, Some(ClientRequest::GetServerInfo)));
            }
            other => panic!("expected request, got {other:?}"),
        }
        // The malformed line still reaches the dispatcher, as None.
        match rx.recv().await.unwrap() {
            Event::ClientRequest { request, .. } => assert!(request.is_none()),
            other => panic!("expected request, got {other:?}"),
        }

        drop(stream);
        match rx.recv().await.unwrap() {
            Event::ClientDisconnected { client } => assert_eq!(client, 1),
            other => panic!("expected disconnect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispatcher_lines_reach_the_client() {
        let (tx, mut rx) = unbounded_channel();
        let gateway = Gateway::bind(&test_config(), tx).await.unwrap();
        let addr = gateway.local_addr().unwrap();
        tokio::spawn(gateway.run());

        let stream = TcpStream::connect(addr).await.unwrap();
        let client_tx = match rx.recv().await.unwrap() {
            Event::ClientConnected { tx, .. } => tx,
            other => panic!("expected connect, got {other:?}"),
        };
        client_tx.send(r#"{"success":true}"#.to_string()).unwrap();

        let mut lines = BufReader::new(stream).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        assert_eq!(line, r#"{"success":true}"#);
    }
}
