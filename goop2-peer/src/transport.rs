//! Multiplexed, authenticated peer-to-peer transport (C1).
//!
//! Built on iroh: every connection is QUIC with a public-key identity, so
//! the remote peer id on an accepted stream is cryptographically derived
//! from the handshake and can never be forged by payload contents.
//!
//! All five named protocols (`site/1.0`, `data/1.0`, `chat/1.0`,
//! `group/1.0`, `docs/1.0`) share one iroh ALPN and one QUIC connection per
//! peer pair; the protocol is negotiated per-stream by a one-line ASCII tag
//! sent by the stream opener, since iroh's ALPN negotiation only applies at
//! the connection level.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use dashmap::DashMap;
use goop2_proto::PeerId;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// ALPN identifier for all goop2 peer connections.
pub const ALPN: &[u8] = b"goop2/mesh/1";

pub type RecvHalf = iroh::endpoint::RecvStream;
pub type SendHalf = iroh::endpoint::SendStream;

/// A single, bidirectional, already-protocol-tagged stream.
pub struct Stream {
    pub remote_peer_id: PeerId,
    pub recv: BufReader<RecvHalf>,
    pub send: SendHalf,
}

impl Stream {
    pub async fn write_line(&mut self, line: &str) -> Result<()> {
        self.send.write_all(line.as_bytes()).await?;
        self.send.write_all(b"\n").await?;
        Ok(())
    }

    pub async fn read_line(&mut self) -> Result<Option<String>> {
        let mut buf = String::new();
        let n = self.recv.read_line(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        while buf.ends_with('\n') || buf.ends_with('\r') {
            buf.pop();
        }
        Ok(Some(buf))
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.send.write_all(bytes).await?;
        Ok(())
    }

    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        tokio::io::AsyncReadExt::read_exact(&mut self.recv, buf).await?;
        Ok(())
    }

    pub async fn finish(mut self) -> Result<()> {
        self.send.finish()?;
        Ok(())
    }
}

type HandlerFn = Arc<dyn Fn(Stream) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

/// The five named protocols. New protocols can register under any other
/// ASCII tag; these are just the ones named here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Site,
    Data,
    Chat,
    Group,
    Docs,
    Mq,
}

impl Protocol {
    pub fn tag(&self) -> &'static str {
        match self {
            Protocol::Site => "site/1.0",
            Protocol::Data => "data/1.0",
            Protocol::Chat => "chat/1.0",
            Protocol::Group => "group/1.0",
            Protocol::Docs => "docs/1.0",
            Protocol::Mq => "mq/1.0",
        }
    }
}

/// Transport handle: owns the iroh endpoint and the protocol handler table.
///
/// A stream failure never terminates the connection; a connection failure
/// fails all of that connection's open streams (each stream is its own
/// task — nothing propagates a single stream's error beyond its handler).
pub struct Transport {
    endpoint: iroh::Endpoint,
    handlers: DashMap<&'static str, HandlerFn>,
}

impl Transport {
    /// Bind an endpoint with a persistent secret key (stable identity across
    /// restarts) and start accepting connections. Protocol handlers should
    /// be registered via [`Transport::register_handler`] before or after
    /// this returns; the accept loop looks handlers up per-stream.
    pub async fn listen(key_path: &std::path::Path, bind_port: Option<u16>) -> Result<Arc<Self>> {
        let secret_key = load_or_create_secret_key(key_path)?;
        let mut builder = iroh::Endpoint::builder().secret_key(secret_key).alpns(vec![ALPN.to_vec()]);
        if let Some(port) = bind_port {
            builder = builder.bind_addr(std::net::SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, port))?;
        }
        let endpoint = builder.bind().await?;
        tracing::info!(id = %endpoint.id(), "transport listening");

        let transport = Arc::new(Self { endpoint, handlers: DashMap::new() });
        let accept_transport = Arc::clone(&transport);
        tokio::spawn(async move {
            accept_transport.accept_loop().await;
        });
        Ok(transport)
    }

    pub fn id(&self) -> PeerId {
        PeerId::new(self.endpoint.id().to_string())
    }

    pub fn register_handler<F, Fut>(&self, protocol: Protocol, handler: F)
    where
        F: Fn(Stream) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.handlers.insert(protocol.tag(), Arc::new(move |s| Box::pin(handler(s))));
    }

    async fn accept_loop(self: Arc<Self>) {
        while let Some(incoming) = self.endpoint.accept().await {
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => this.handle_connection(conn).await,
                    Err(e) => tracing::warn!("incoming connection failed: {e}"),
                }
            });
        }
    }

    async fn handle_connection(self: Arc<Self>, conn: iroh::endpoint::Connection) {
        let remote_peer_id = PeerId::new(conn.remote_id().to_string());
        tracing::debug!(%remote_peer_id, "connection accepted");
        loop {
            match conn.accept_bi().await {
                Ok((send, recv)) => {
                    let this = Arc::clone(&self);
                    let remote = remote_peer_id.clone();
                    tokio::spawn(async move {
                        this.handle_stream(remote, send, recv).await;
                    });
                }
                Err(_) => break, // connection closed; all its streams already failed independently
            }
        }
        tracing::debug!(%remote_peer_id, "connection closed");
    }

    async fn handle_stream(&self, remote_peer_id: PeerId, send: SendHalf, recv: RecvHalf) {
        let mut recv = BufReader::new(recv);
        let mut tag_line = String::new();
        if recv.read_line(&mut tag_line).await.unwrap_or(0) == 0 {
            return;
        }
        let tag = tag_line.trim_end().to_string();
        let Some(handler) = self.handlers.get(tag.as_str()).map(|h| Arc::clone(h.value())) else {
            tracing::debug!(%remote_peer_id, %tag, "no handler registered for protocol");
            return;
        };
        let stream = Stream { remote_peer_id, recv, send };
        handler(stream).await;
    }

    /// Open a new stream to `peer_id` for the given protocol, sending the
    /// protocol tag line first. Reuses a cached connection when one is open.
    pub async fn open_stream(&self, peer_id: &PeerId, protocol: Protocol) -> Result<Stream> {
        let node_id: iroh::EndpointId = peer_id
            .as_str()
            .parse()
            .map_err(|e| anyhow!("invalid peer id {peer_id}: {e:?}"))?;
        let conn = self
            .endpoint
            .connect(node_id, ALPN)
            .await
            .context("opening connection")?;
        let (mut send, recv) = conn.open_bi().await.context("opening stream")?;
        send.write_all(protocol.tag().as_bytes()).await?;
        send.write_all(b"\n").await?;
        Ok(Stream { remote_peer_id: peer_id.clone(), recv: BufReader::new(recv), send })
    }
}

fn load_or_create_secret_key(path: &std::path::Path) -> Result<iroh::SecretKey> {
    if path.exists() {
        let hex = std::fs::read_to_string(path)?;
        hex.trim().parse().map_err(|e| anyhow!("invalid iroh secret key in {}: {e:?}", path.display()))
    } else {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let key = iroh::SecretKey::from_bytes(&bytes);
        let hex: String = key.to_bytes().iter().map(|b| format!("{b:02x}")).collect();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &hex)?;
        tracing::info!("generated new iroh secret key at {}", path.display());
        Ok(key)
    }
}
