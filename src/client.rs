//! Chat client: connection lifecycle, handshake state machine, and the
//! operational interface front-ends build on.
//!
//! A connected client is a pair of tasks over one split TCP stream: the
//! listen task frames and handles inbound records while sends go through
//! an outbound channel drained by a writer task. Consumers observe
//! everything through the [`ClientEvent`] stream handed out by
//! [`ChatClient::connect`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, RwLock};
use uuid::Uuid;

use crate::error::ChatError;
use crate::hybrid;
use crate::protocol::{chunk_data, reassemble_chunks, LineAssembler, Packet, PacketType};
use crate::rsa::{self, PublicKey, RsaKeyPair};
use crate::{CHUNK_SIZE, RSA_KEY_BITS, SERVER_SENDER_ID};

const READ_BUFFER_SIZE: usize = 8192;
const OUTBOUND_CHANNEL_SIZE: usize = 64;
const EVENT_CHANNEL_SIZE: usize = 256;

/// Poll interval while waiting for the handshake to finish.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Payload delivered in place of a text message that would not decrypt,
/// so one corrupt message never tears the session down.
pub const DECRYPT_PLACEHOLDER: &str = "[decryption failed]";

/// Connection-scoped handshake progression. Application packets may only
/// be sent from `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Disconnected,
    Connected,
    AwaitingPeerKey,
    Ready,
}

/// Decrypted payload attached to a received message.
#[derive(Debug, Clone)]
pub enum Payload {
    Text(String),
    Binary(Vec<u8>),
}

/// Everything a presentation layer needs to observe.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConnectionStatusChanged { connected: bool, detail: String },
    KeyExchangeCompleted,
    MessageReceived {
        packet: Packet,
        payload: Payload,
        own: bool,
    },
}

struct ClientInner {
    client_id: String,
    keys: RsaKeyPair,
    outbound: mpsc::Sender<String>,
    server_key: RwLock<Option<PublicKey>>,
    handshake: watch::Sender<HandshakeState>,
    shutdown: watch::Sender<bool>,
    events: mpsc::Sender<ClientEvent>,
}

/// Handle to a live connection. Cheap to clone; all clones share the same
/// session.
#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<ClientInner>,
}

impl ChatClient {
    /// Connect to a relay, generate this identity's key pair, and start
    /// the listen and writer tasks.
    ///
    /// Returns the client handle together with the event stream. The
    /// handshake completes in the background; call
    /// [`wait_until_ready`](Self::wait_until_ready) or watch for
    /// [`ClientEvent::KeyExchangeCompleted`] before sending.
    pub async fn connect(addr: &str) -> Result<(Self, mpsc::Receiver<ClientEvent>), ChatError> {
        debug!("generating client key pair ({} bits)", RSA_KEY_BITS);
        let keys = rsa::generate_keypair(RSA_KEY_BITS);

        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();

        let (outbound_tx, outbound_rx) = mpsc::channel::<String>(OUTBOUND_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel::<ClientEvent>(EVENT_CHANNEL_SIZE);
        let (handshake_tx, _) = watch::channel(HandshakeState::Connected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let inner = Arc::new(ClientInner {
            client_id: format!("client_{}", Uuid::new_v4()),
            keys,
            outbound: outbound_tx,
            server_key: RwLock::new(None),
            handshake: handshake_tx,
            shutdown: shutdown_tx,
            events: event_tx,
        });

        let _ = inner
            .events
            .send(ClientEvent::ConnectionStatusChanged {
                connected: true,
                detail: format!("connected to {}", addr),
            })
            .await;

        // The relay opens the exchange; all we can do is wait for its key.
        // The state must move before the listen task starts, or a fast
        // relay could complete the handshake only to be overwritten here.
        inner.handshake.send_replace(HandshakeState::AwaitingPeerKey);
        tokio::spawn(write_task(write_half, outbound_rx, shutdown_rx.clone()));
        tokio::spawn(listen_task(Arc::clone(&inner), read_half, shutdown_rx));

        info!("connected to {} as {}", addr, inner.client_id);

        Ok((Self { inner }, event_rx))
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn handshake_state(&self) -> HandshakeState {
        *self.inner.handshake.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.handshake_state() == HandshakeState::Ready
    }

    /// Poll until the handshake reaches `Ready`.
    ///
    /// There is no timeout: a relay that never offers its key keeps the
    /// caller waiting. The loop does terminate promptly once the
    /// connection drops.
    pub async fn wait_until_ready(&self) -> Result<(), ChatError> {
        loop {
            match self.handshake_state() {
                HandshakeState::Ready => return Ok(()),
                HandshakeState::Disconnected => {
                    return Err(ChatError::closed("connection dropped during handshake"))
                }
                _ => tokio::time::sleep(READY_POLL_INTERVAL).await,
            }
        }
    }

    /// Encrypt a text message for the relay and send it.
    ///
    /// A local echo is emitted on the event stream with `own: true`.
    pub async fn send_text(&self, message: &str) -> Result<(), ChatError> {
        self.ensure_ready()?;
        let server_key = self.server_key().await?;

        let (content, session_key) = hybrid::encrypt_text(message, &server_key);
        let packet = Packet {
            content,
            encrypted_session_key: session_key,
            sender_id: Some(self.inner.client_id.clone()),
            ..Packet::new(PacketType::Text)
        };
        self.queue(&packet).await?;

        let _ = self
            .inner
            .events
            .send(ClientEvent::MessageReceived {
                packet,
                payload: Payload::Text(message.to_string()),
                own: true,
            })
            .await;
        Ok(())
    }

    /// Encrypt file bytes for the relay and send them chunked.
    ///
    /// The whole payload is encrypted under one session key, then the
    /// encrypted blob is sliced into packets that all repeat the file
    /// name, the original size, and the message id. Returns the message
    /// id, which doubles as the download identifier once stored.
    pub async fn send_file(
        &self,
        file_name: &str,
        data: &[u8],
        kind: PacketType,
    ) -> Result<String, ChatError> {
        self.ensure_ready()?;
        let server_key = self.server_key().await?;

        let (encrypted, session_key) = hybrid::encrypt_bytes(data, &server_key);
        let chunks = chunk_data(&encrypted, CHUNK_SIZE);
        let total = chunks.len() as u32;
        let message_id = Uuid::new_v4().to_string();

        debug!(
            "sending {} ({} bytes plaintext, {} packets)",
            file_name,
            data.len(),
            total
        );
        for (index, chunk) in chunks.iter().enumerate() {
            let packet = Packet {
                content: base64::encode(chunk),
                encrypted_session_key: session_key.clone(),
                total_packets: total,
                packet_number: index as u32 + 1,
                file_name: Some(file_name.to_string()),
                file_size: Some(data.len() as u64),
                sender_id: Some(self.inner.client_id.clone()),
                message_id: message_id.clone(),
                ..Packet::new(kind)
            };
            self.queue(&packet).await?;
        }

        let echo = Packet {
            file_name: Some(file_name.to_string()),
            file_size: Some(data.len() as u64),
            sender_id: Some(self.inner.client_id.clone()),
            message_id: message_id.clone(),
            ..Packet::new(kind)
        };
        let _ = self
            .inner
            .events
            .send(ClientEvent::MessageReceived {
                packet: echo,
                payload: Payload::Binary(data.to_vec()),
                own: true,
            })
            .await;
        Ok(message_id)
    }

    /// Read a file from disk and send it via [`send_file`](Self::send_file).
    pub async fn send_file_from_path(
        &self,
        path: &Path,
        kind: PacketType,
    ) -> Result<String, ChatError> {
        let data = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("unnamed")
            .to_string();
        self.send_file(&file_name, &data, kind).await
    }

    /// Ask the relay for a stored file. The reassembled, decrypted bytes
    /// arrive later as a [`ClientEvent::MessageReceived`] with a binary
    /// payload.
    pub async fn request_download(&self, file_id: &str) -> Result<(), ChatError> {
        self.ensure_ready()?;
        let server_key = self.server_key().await?;

        let (content, session_key) = hybrid::encrypt_text(file_id, &server_key);
        let packet = Packet {
            content,
            encrypted_session_key: session_key,
            sender_id: Some(self.inner.client_id.clone()),
            // The response stream reuses this id for reassembly.
            message_id: file_id.to_string(),
            ..Packet::new(PacketType::FileDownloadRequest)
        };
        self.queue(&packet).await
    }

    /// Tear the connection down and emit a final status event.
    pub async fn disconnect(&self) {
        self.inner.handshake.send_replace(HandshakeState::Disconnected);
        let _ = self.inner.shutdown.send(true);
        let _ = self
            .inner
            .events
            .send(ClientEvent::ConnectionStatusChanged {
                connected: false,
                detail: "disconnected".to_string(),
            })
            .await;
        info!("disconnected");
    }

    fn ensure_ready(&self) -> Result<(), ChatError> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(ChatError::NotReady)
        }
    }

    async fn server_key(&self) -> Result<PublicKey, ChatError> {
        self.inner
            .server_key
            .read()
            .await
            .clone()
            .ok_or(ChatError::NotReady)
    }

    async fn queue(&self, packet: &Packet) -> Result<(), ChatError> {
        let line = packet.to_line()?;
        self.inner
            .outbound
            .send(line)
            .await
            .map_err(|_| ChatError::closed("connection closed"))
    }
}

async fn write_task(
    mut write_half: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let line = tokio::select! {
            _ = shutdown.changed() => break,
            line = outbound.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };

        if write_half.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        if write_half.write_all(b"\n").await.is_err() {
            break;
        }
        if write_half.flush().await.is_err() {
            break;
        }
    }
}

async fn listen_task(
    inner: Arc<ClientInner>,
    mut read_half: OwnedReadHalf,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut assembler = LineAssembler::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    // Download reassembly is private to this task and dies with it.
    let mut downloads: HashMap<String, Vec<Packet>> = HashMap::new();

    loop {
        let n = tokio::select! {
            _ = shutdown.changed() => break,
            result = read_half.read(&mut buf) => match result {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("read failed: {}", e);
                    break;
                }
            },
        };

        for line in assembler.push(&buf[..n]) {
            handle_record(&inner, &line, &mut downloads).await;
        }
    }

    let previous = *inner.handshake.borrow();
    inner.handshake.send_replace(HandshakeState::Disconnected);
    if previous != HandshakeState::Disconnected {
        let _ = inner
            .events
            .send(ClientEvent::ConnectionStatusChanged {
                connected: false,
                detail: "connection closed".to_string(),
            })
            .await;
    }
}

async fn handle_record(
    inner: &Arc<ClientInner>,
    line: &str,
    downloads: &mut HashMap<String, Vec<Packet>>,
) {
    let packet: Packet = match serde_json::from_str(line) {
        Ok(packet) => packet,
        Err(e) => {
            warn!("skipping malformed record: {}", e);
            return;
        }
    };

    let own = packet.sender_id.as_deref() == Some(inner.client_id.as_str());
    match packet.packet_type {
        PacketType::KeyExchange => handle_key_exchange(inner, packet).await,
        PacketType::Text if !own => handle_text(inner, packet).await,
        PacketType::File | PacketType::Photo if !own => {
            handle_file_notification(inner, packet).await
        }
        PacketType::FileDownloadResponse => {
            handle_download_chunk(inner, packet, downloads).await
        }
        _ => {}
    }
}

async fn handle_key_exchange(inner: &Arc<ClientInner>, packet: Packet) {
    // Only the relay's reserved identity carries the peer key we need.
    if packet.sender_id.as_deref() != Some(SERVER_SENDER_ID) {
        debug!(
            "ignoring key exchange from {:?}",
            packet.sender_id.as_deref()
        );
        return;
    }

    match PublicKey::from_wire(&packet.content) {
        Ok(key) => {
            *inner.server_key.write().await = Some(key);

            // Answer with our own key; only then is the session usable.
            let reply = Packet {
                content: inner.keys.public.to_wire(),
                sender_id: Some(inner.client_id.clone()),
                ..Packet::new(PacketType::KeyExchange)
            };
            let queued = match reply.to_line() {
                Ok(line) => inner.outbound.send(line).await.is_ok(),
                Err(_) => false,
            };

            if queued {
                inner.handshake.send_replace(HandshakeState::Ready);
                let _ = inner.events.send(ClientEvent::KeyExchangeCompleted).await;
                info!("key exchange completed");
            } else {
                fail_handshake(inner, "could not send public key").await;
            }
        }
        // Unusable key material is fatal to this connection attempt.
        Err(e) => fail_handshake(inner, &format!("bad relay key: {}", e)).await,
    }
}

async fn fail_handshake(inner: &Arc<ClientInner>, detail: &str) {
    warn!("handshake failed: {}", detail);
    inner.handshake.send_replace(HandshakeState::Disconnected);
    let _ = inner.shutdown.send(true);
    let _ = inner
        .events
        .send(ClientEvent::ConnectionStatusChanged {
            connected: false,
            detail: format!("handshake failed: {}", detail),
        })
        .await;
}

async fn handle_text(inner: &Arc<ClientInner>, packet: Packet) {
    let payload = match hybrid::decrypt_text(
        &packet.content,
        &packet.encrypted_session_key,
        &inner.keys.private,
    ) {
        Ok(text) => Payload::Text(text),
        Err(e) => {
            debug!("text from {:?} undecryptable: {}", packet.sender_id, e);
            Payload::Text(DECRYPT_PLACEHOLDER.to_string())
        }
    };

    let _ = inner
        .events
        .send(ClientEvent::MessageReceived {
            packet,
            payload,
            own: false,
        })
        .await;
}

async fn handle_file_notification(inner: &Arc<ClientInner>, packet: Packet) {
    // Availability notice: the text body announces the file, the metadata
    // fields carry name/size/id for a later download request.
    let payload = match hybrid::decrypt_text(
        &packet.content,
        &packet.encrypted_session_key,
        &inner.keys.private,
    ) {
        Ok(text) => Payload::Text(text),
        Err(e) => {
            debug!("notification from {:?} undecryptable: {}", packet.sender_id, e);
            Payload::Text(DECRYPT_PLACEHOLDER.to_string())
        }
    };

    let _ = inner
        .events
        .send(ClientEvent::MessageReceived {
            packet,
            payload,
            own: false,
        })
        .await;
}

async fn handle_download_chunk(
    inner: &Arc<ClientInner>,
    packet: Packet,
    downloads: &mut HashMap<String, Vec<Packet>>,
) {
    let message_id = packet.message_id.clone();
    let total = packet.total_packets;

    let buffered = downloads.entry(message_id.clone()).or_default();
    buffered.push(packet.clone());
    debug!(
        "download {}: {}/{} packets buffered",
        message_id,
        buffered.len(),
        total
    );

    if buffered.len() as u32 != total {
        return;
    }

    let chunks = downloads.remove(&message_id).unwrap_or_default();
    let result = reassemble_chunks(chunks).and_then(|blob| {
        hybrid::decrypt_bytes(&blob, &packet.encrypted_session_key, &inner.keys.private)
    });

    match result {
        Ok(mut data) => {
            if let Some(size) = packet.file_size {
                if data.len() as u64 > size {
                    data.truncate(size as usize);
                }
            }
            info!("download {} complete ({} bytes)", message_id, data.len());
            let _ = inner
                .events
                .send(ClientEvent::MessageReceived {
                    packet,
                    payload: Payload::Binary(data),
                    own: false,
                })
                .await;
        }
        Err(e) => {
            warn!("download {} failed: {}", message_id, e);
            let _ = inner
                .events
                .send(ClientEvent::ConnectionStatusChanged {
                    connected: true,
                    detail: format!("download {} failed: {}", message_id, e),
                })
                .await;
        }
    }
}
