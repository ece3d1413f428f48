//! Relay server: accepts client connections, brokers the key exchange,
//! and fans every message out re-encrypted per recipient.
//!
//! # Architecture
//! - One task per accepted connection reads and processes records; a
//!   paired writer task drains that connection's outbound channel so
//!   several broadcasts can target the same socket safely.
//! - The relay key pair is generated once at bind time and shared
//!   read-only with every connection task.
//! - The client table and the file store are shared maps behind RwLocks;
//!   connection tasks touch them only through per-key operations.
//! - Chunk reassembly buffers live inside the owning connection task and
//!   die with it. A sender that disconnects mid-transfer therefore leaks
//!   nothing across connections, but its partial upload is gone. Stored
//!   files are never evicted; bounding the store is a deliberate non-goal
//!   left to deployments.
//!
//! The relay never forwards a ciphertext it received: text is decrypted
//! with the relay's private key and re-encrypted under each ready
//! recipient's public key, so no two recipients ever see the same bytes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::error::ChatError;
use crate::hybrid;
use crate::protocol::{chunk_data, reassemble_chunks, LineAssembler, Packet, PacketType};
use crate::rsa::{self, PublicKey, RsaKeyPair};
use crate::{CHUNK_SIZE, RSA_KEY_BITS, SERVER_SENDER_ID};

// Socket reads land in buffers of this size before framing.
const READ_BUFFER_SIZE: usize = 8192;

// Per-connection outbound queue; senders await when a slow reader backs up.
const OUTBOUND_CHANNEL_SIZE: usize = 64;

/// A connected peer as the rest of the relay sees it: where to queue
/// outbound lines, and the public key learned from its handshake (absent
/// until the key exchange completes, which excludes it from fan-out).
#[derive(Clone)]
struct PeerHandle {
    outbound: mpsc::Sender<String>,
    public_key: Option<PublicKey>,
}

struct RelayState {
    keys: RsaKeyPair,
    clients: RwLock<HashMap<String, PeerHandle>>,
    files: RwLock<HashMap<String, Vec<u8>>>,
}

pub struct RelayServer {
    listener: TcpListener,
    state: Arc<RelayState>,
}

impl RelayServer {
    /// Bind the listener and generate the relay's key pair. The pair is
    /// immutable for the life of the process.
    pub async fn bind(addr: &str) -> Result<Self, ChatError> {
        let listener = TcpListener::bind(addr).await?;

        info!("generating relay key pair ({} bits)", RSA_KEY_BITS);
        let keys = rsa::generate_keypair(RSA_KEY_BITS);
        debug!("relay public modulus: {} bits", keys.public.n.bits());

        Ok(Self {
            listener,
            state: Arc::new(RelayState {
                keys,
                clients: RwLock::new(HashMap::new()),
                files: RwLock::new(HashMap::new()),
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ChatError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop. Each connection gets a generated identity and its own
    /// handler task; a failure inside one handler never touches another.
    pub async fn run(self) -> Result<(), ChatError> {
        loop {
            let (stream, addr) = self.listener.accept().await?;
            let client_id = Uuid::new_v4().to_string();
            info!("client {} connected from {}", client_id, addr);

            tokio::spawn(handle_connection(
                Arc::clone(&self.state),
                stream,
                client_id,
            ));
        }
    }
}

async fn handle_connection(state: Arc<RelayState>, stream: TcpStream, client_id: String) {
    let (read_half, write_half) = stream.into_split();
    let (outbound_tx, outbound_rx) = mpsc::channel::<String>(OUTBOUND_CHANNEL_SIZE);

    state.clients.write().await.insert(
        client_id.clone(),
        PeerHandle {
            outbound: outbound_tx.clone(),
            public_key: None,
        },
    );

    // The writer exits once every handle to this connection's channel is
    // gone, which happens below when the table entry is removed.
    tokio::spawn(write_task(write_half, outbound_rx));

    let mut connection = Connection {
        state: Arc::clone(&state),
        client_id: client_id.clone(),
        outbound: outbound_tx,
        reassembly: HashMap::new(),
    };

    // Open the handshake immediately: the key packet itself is the key
    // material, so it travels unprotected under the reserved identity.
    if let Err(e) = connection.send_server_key().await {
        warn!("client {}: could not start handshake: {}", client_id, e);
    } else if let Err(e) = connection.read_loop(read_half).await {
        debug!("client {}: connection ended: {}", client_id, e);
    }

    state.clients.write().await.remove(&client_id);
    info!("client {} disconnected", client_id);
}

async fn write_task(mut write_half: OwnedWriteHalf, mut outbound: mpsc::Receiver<String>) {
    while let Some(line) = outbound.recv().await {
        if write_half.write_all(line.as_bytes()).await.is_err() {
            break;
        }
        if write_half.write_all(b"\n").await.is_err() {
            break;
        }
        // Flush per record so small packets are not held hostage by the
        // socket buffer.
        if write_half.flush().await.is_err() {
            break;
        }
    }
}

/// Per-connection state owned exclusively by its handler task.
struct Connection {
    state: Arc<RelayState>,
    client_id: String,
    outbound: mpsc::Sender<String>,
    /// In-flight uploads from this client, keyed by message id.
    reassembly: HashMap<String, Vec<Packet>>,
}

impl Connection {
    async fn send_server_key(&self) -> Result<(), ChatError> {
        let packet = Packet {
            content: self.state.keys.public.to_wire(),
            sender_id: Some(SERVER_SENDER_ID.to_string()),
            ..Packet::new(PacketType::KeyExchange)
        };
        self.queue(&packet).await
    }

    async fn read_loop(&mut self, mut read_half: OwnedReadHalf) -> Result<(), ChatError> {
        let mut assembler = LineAssembler::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let n = read_half.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }

            for line in assembler.push(&buf[..n]) {
                // A record that fails costs itself, not the connection.
                // If the writer side is truly gone, the next read reports
                // it and ends the loop.
                if let Err(e) = self.process_record(&line).await {
                    warn!("client {}: dropped record: {}", self.client_id, e);
                }
            }
        }
    }

    async fn process_record(&mut self, line: &str) -> Result<(), ChatError> {
        let mut packet: Packet =
            serde_json::from_str(line).map_err(|e| ChatError::Protocol(e.to_string()))?;

        // The relay's identity assignment wins over whatever the client
        // wrote into the packet.
        packet.sender_id = Some(self.client_id.clone());

        match packet.packet_type {
            PacketType::KeyExchange => self.handle_key_exchange(&packet).await,
            PacketType::Text => self.handle_text(&packet).await,
            PacketType::File | PacketType::Photo => self.handle_file_chunk(packet).await,
            PacketType::FileDownloadRequest => self.handle_download_request(&packet).await,
            // Reserved enumerants and response types are not relay input.
            _ => Ok(()),
        }
    }

    async fn handle_key_exchange(&self, packet: &Packet) -> Result<(), ChatError> {
        let key = PublicKey::from_wire(&packet.content)?;

        let mut clients = self.state.clients.write().await;
        if let Some(peer) = clients.get_mut(&self.client_id) {
            peer.public_key = Some(key);
        }
        drop(clients);

        info!("recorded public key for client {}", self.client_id);
        Ok(())
    }

    async fn handle_text(&self, packet: &Packet) -> Result<(), ChatError> {
        // The sender addressed this to the relay; recover the plaintext
        // before re-encrypting it per recipient.
        let plaintext = hybrid::decrypt_text(
            &packet.content,
            &packet.encrypted_session_key,
            &self.state.keys.private,
        )?;
        debug!("text from {}: {} bytes", self.client_id, plaintext.len());

        let template = Packet {
            content: String::new(),
            encrypted_session_key: String::new(),
            ..packet.clone()
        };
        broadcast(&self.state, &self.client_id, &plaintext, template).await
    }

    async fn handle_file_chunk(&mut self, packet: Packet) -> Result<(), ChatError> {
        let message_id = packet.message_id.clone();
        let total = packet.total_packets;

        let buffered = self.reassembly.entry(message_id.clone()).or_default();
        buffered.push(packet.clone());
        debug!(
            "client {}: buffered chunk {}/{} of {}",
            self.client_id, packet.packet_number, total, message_id
        );

        // Completion is count-based: arrival order does not matter because
        // chunks are sorted before concatenation.
        if buffered.len() as u32 != total {
            return Ok(());
        }

        let chunks = self.reassembly.remove(&message_id).unwrap_or_default();
        let blob = reassemble_chunks(chunks)?;

        let mut data = hybrid::decrypt_bytes(
            &blob,
            &packet.encrypted_session_key,
            &self.state.keys.private,
        )?;
        // The declared size trims the cipher's even-length padding.
        if let Some(size) = packet.file_size {
            if data.len() as u64 > size {
                data.truncate(size as usize);
            }
        }

        info!(
            "stored file {} from client {} ({} bytes)",
            message_id,
            self.client_id,
            data.len()
        );
        self.state.files.write().await.insert(message_id.clone(), data);

        // Announce availability only; recipients pull the bytes on demand.
        let note = format!(
            "File available: {}",
            packet.file_name.as_deref().unwrap_or("unnamed")
        );
        let template = Packet {
            file_name: packet.file_name.clone(),
            file_size: packet.file_size,
            sender_id: Some(self.client_id.clone()),
            message_id,
            timestamp: packet.timestamp,
            ..Packet::new(packet.packet_type)
        };
        broadcast(&self.state, &self.client_id, &note, template).await
    }

    async fn handle_download_request(&self, packet: &Packet) -> Result<(), ChatError> {
        let file_id = hybrid::decrypt_text(
            &packet.content,
            &packet.encrypted_session_key,
            &self.state.keys.private,
        )?;

        let data = self.state.files.read().await.get(&file_id).cloned();
        let requester_key = self
            .state
            .clients
            .read()
            .await
            .get(&self.client_id)
            .and_then(|peer| peer.public_key.clone());

        let (data, requester_key) = match (data, requester_key) {
            (Some(data), Some(key)) => (data, key),
            (None, _) => {
                debug!("client {}: no stored file {}", self.client_id, file_id);
                return Ok(());
            }
            (_, None) => {
                debug!(
                    "client {}: download refused, no public key on record",
                    self.client_id
                );
                return Ok(());
            }
        };

        // Encrypt the whole file for this requester, then slice the
        // encrypted blob; the requester reassembles before decrypting.
        let (encrypted, session_key) = hybrid::encrypt_bytes(&data, &requester_key);
        let chunks = chunk_data(&encrypted, CHUNK_SIZE);
        let total = chunks.len() as u32;

        info!(
            "client {}: streaming file {} ({} packets)",
            self.client_id, file_id, total
        );
        for (index, chunk) in chunks.iter().enumerate() {
            let response = Packet {
                content: base64::encode(chunk),
                encrypted_session_key: session_key.clone(),
                total_packets: total,
                packet_number: index as u32 + 1,
                file_size: Some(data.len() as u64),
                message_id: packet.message_id.clone(),
                ..Packet::new(PacketType::FileDownloadResponse)
            };
            self.queue(&response).await?;
        }
        Ok(())
    }

    async fn queue(&self, packet: &Packet) -> Result<(), ChatError> {
        let line = packet.to_line()?;
        self.outbound
            .send(line)
            .await
            .map_err(|_| ChatError::closed("writer task gone"))
    }
}

/// Re-encrypt `plaintext` individually for every other handshake-complete
/// client and queue one packet per recipient.
///
/// Per-peer encrypt-and-queue operations run concurrently and fail
/// independently; the broadcast only errors when every single delivery
/// failed.
async fn broadcast(
    state: &Arc<RelayState>,
    sender_id: &str,
    plaintext: &str,
    template: Packet,
) -> Result<(), ChatError> {
    let recipients: Vec<(String, PublicKey, mpsc::Sender<String>)> = {
        let clients = state.clients.read().await;
        clients
            .iter()
            .filter(|(id, _)| id.as_str() != sender_id)
            .filter_map(|(id, peer)| {
                peer.public_key
                    .clone()
                    .map(|key| (id.clone(), key, peer.outbound.clone()))
            })
            .collect()
    };

    if recipients.is_empty() {
        debug!("no ready recipients for message from {}", sender_id);
        return Ok(());
    }

    let mut deliveries = Vec::with_capacity(recipients.len());
    for (peer_id, key, outbound) in recipients {
        let plaintext = plaintext.to_string();
        let template = template.clone();

        deliveries.push(tokio::spawn(async move {
            // Fresh session key per recipient: no shared ciphertext ever
            // leaves the relay.
            let (content, session_key) = hybrid::encrypt_text(&plaintext, &key);
            let packet = Packet {
                content,
                encrypted_session_key: session_key,
                ..template
            };

            let line = match packet.to_line() {
                Ok(line) => line,
                Err(e) => {
                    warn!("peer {}: could not encode packet: {}", peer_id, e);
                    return false;
                }
            };
            if outbound.send(line).await.is_err() {
                warn!("peer {}: delivery failed, connection gone", peer_id);
                return false;
            }
            true
        }));
    }

    let total = deliveries.len();
    let mut delivered = 0usize;
    for handle in deliveries {
        if handle.await.unwrap_or(false) {
            delivered += 1;
        }
    }

    debug!("broadcast from {}: {}/{} delivered", sender_id, delivered, total);
    if delivered == 0 {
        return Err(ChatError::closed("no recipient reachable"));
    }
    Ok(())
}
