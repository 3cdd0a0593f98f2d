use async_trait::async_trait;
use dbft_consensus::{encode, Envelope, Network, MAX_MESSAGE_SIZE};
use dbft_types::{ConsensusError, ValidatorIndex};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, trace, warn};

const HELLO_LEN: usize = 2;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
/// Frames buffered per peer before new ones are dropped.
const PEER_QUEUE: usize = 256;

/// Full mesh of plain TCP connections between validators.
///
/// Every connection starts with a hello frame carrying the sender's
/// validator index; indices missing from the address book are refused.
/// After that both directions carry length-prefixed consensus frames.
/// Received frames are handed to `inbound_tx` untouched; decoding and
/// signature checks happen in the consensus service. A slow peer never
/// blocks consensus: once its write queue is full, frames to it are dropped
/// and the protocol's timers and recovery fill the gap.
pub struct TcpMesh {
    local_index: ValidatorIndex,
    address_book: HashMap<ValidatorIndex, SocketAddr>,
    peers: Arc<RwLock<HashMap<ValidatorIndex, PeerConnection>>>,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    next_connection: Arc<AtomicU64>,
}

struct PeerConnection {
    id: u64,
    write_tx: mpsc::Sender<Vec<u8>>,
    addr: SocketAddr,
}

impl TcpMesh {
    pub fn new(
        local_index: ValidatorIndex,
        address_book: HashMap<ValidatorIndex, SocketAddr>,
        inbound_tx: mpsc::Sender<Vec<u8>>,
    ) -> Self {
        Self {
            local_index,
            address_book,
            peers: Arc::new(RwLock::new(HashMap::new())),
            inbound_tx,
            next_connection: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn local_index(&self) -> ValidatorIndex {
        self.local_index
    }

    /// Binds the listener and spawns the accept loop. Returns the bound
    /// address, which differs from `addr` when port 0 was requested.
    pub async fn listen_on(&self, addr: SocketAddr) -> anyhow::Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let bound = listener.local_addr()?;
        let peers = Arc::clone(&self.peers);
        let inbound_tx = self.inbound_tx.clone();
        let next_connection = Arc::clone(&self.next_connection);
        let local_index = self.local_index;
        let known: Arc<HashSet<ValidatorIndex>> = Arc::new(self.address_book.keys().copied().collect());

        info!("Validator {} listening for peers on {}", local_index, bound);

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((mut socket, peer_addr)) => {
                        let peers = Arc::clone(&peers);
                        let inbound_tx = inbound_tx.clone();
                        let known = Arc::clone(&known);
                        let id = next_connection.fetch_add(1, Ordering::Relaxed);

                        tokio::spawn(async move {
                            let hello =
                                tokio::time::timeout(HANDSHAKE_TIMEOUT, read_hello(&mut socket)).await;
                            let peer_index = match hello {
                                Ok(Ok(index)) => index,
                                Ok(Err(e)) => {
                                    warn!("Rejected connection from {}: {}", peer_addr, e);
                                    return;
                                }
                                Err(_) => {
                                    warn!("Handshake from {} timed out", peer_addr);
                                    return;
                                }
                            };
                            if peer_index == local_index {
                                warn!("Peer at {} claims our own index {}", peer_addr, local_index);
                                return;
                            }
                            if !known.contains(&peer_index) {
                                warn!("Peer at {} claims unknown validator index {}", peer_addr, peer_index);
                                return;
                            }

                            info!("Validator {} connected from {}", peer_index, peer_addr);
                            run_connection(socket, peer_index, peer_addr, id, peers, inbound_tx).await;
                        });
                    }
                    Err(e) => error!("Failed to accept connection: {}", e),
                }
            }
        });

        Ok(bound)
    }

    pub async fn connect_to_peer(&self, peer_index: ValidatorIndex, addr: SocketAddr) -> anyhow::Result<()> {
        let mut socket = tokio::time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| anyhow::anyhow!("connect to {} timed out", addr))??;
        write_frame(&mut socket, &self.local_index.0.to_be_bytes()).await?;

        info!("Connected to validator {} at {}", peer_index, addr);

        let peers = Arc::clone(&self.peers);
        let inbound_tx = self.inbound_tx.clone();
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        tokio::spawn(async move {
            run_connection(socket, peer_index, addr, id, peers, inbound_tx).await;
        });

        Ok(())
    }

    /// Dials every address book entry that has no live connection.
    pub async fn connect_missing(&self) -> usize {
        let connected = self.connected_peers().await;
        let mut dialed = 0;

        for (index, addr) in &self.address_book {
            if *index == self.local_index || connected.contains(index) {
                continue;
            }
            match self.connect_to_peer(*index, *addr).await {
                Ok(()) => dialed += 1,
                Err(e) => debug!("Validator {} at {} unavailable: {}", index, addr, e),
            }
        }

        dialed
    }

    /// Periodic reconnect loop. Runs until the task is aborted.
    pub async fn maintain_connections(self: Arc<Self>, interval: Duration) {
        loop {
            let dialed = self.connect_missing().await;
            let connected = self.connected_peers().await;
            debug!(
                "Mesh heartbeat: {} peers connected, {} dialed",
                connected.len(),
                dialed
            );
            tokio::time::sleep(interval).await;
        }
    }

    pub async fn connected_peers(&self) -> Vec<ValidatorIndex> {
        let peers = self.peers.read().await;
        let mut indices: Vec<ValidatorIndex> = peers.keys().copied().collect();
        indices.sort();
        indices
    }
}

#[async_trait]
impl Network for TcpMesh {
    async fn broadcast(&self, envelope: &Envelope) -> dbft_types::Result<()> {
        let data = encode(envelope)?;
        let peers = self.peers.read().await;

        let mut queued = 0;
        for (index, peer) in peers.iter() {
            match peer.write_tx.try_send(data.clone()) {
                Ok(()) => queued += 1,
                Err(TrySendError::Full(_)) => {
                    warn!("Write queue to validator {} full, dropping frame", index)
                }
                Err(TrySendError::Closed(_)) => debug!("Write channel to validator {} closed", index),
            }
        }

        trace!("Broadcast {} bytes to {}/{} peers", data.len(), queued, peers.len());
        Ok(())
    }

    async fn send_to(&self, validator: ValidatorIndex, envelope: &Envelope) -> dbft_types::Result<()> {
        let data = encode(envelope)?;
        let peers = self.peers.read().await;

        let peer = peers
            .get(&validator)
            .ok_or_else(|| ConsensusError::NetworkError(format!("validator {} not connected", validator)))?;
        peer.write_tx.try_send(data).map_err(|e| match e {
            TrySendError::Full(_) => {
                ConsensusError::NetworkError(format!("write queue to {} full", peer.addr))
            }
            TrySendError::Closed(_) => {
                ConsensusError::NetworkError(format!("connection to {} closed", peer.addr))
            }
        })
    }
}

/// Owns one peer connection until either side drops it. The reader stays
/// in this task and a spawned writer drains the peer's write channel, so
/// a partially read frame is never abandoned by a select.
async fn run_connection(
    socket: TcpStream,
    peer_index: ValidatorIndex,
    addr: SocketAddr,
    id: u64,
    peers: Arc<RwLock<HashMap<ValidatorIndex, PeerConnection>>>,
    inbound_tx: mpsc::Sender<Vec<u8>>,
) {
    let (mut reader, mut writer) = socket.into_split();
    let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(PEER_QUEUE);

    {
        let mut peers = peers.write().await;
        if peers.insert(peer_index, PeerConnection { id, write_tx, addr }).is_some() {
            debug!("Replaced older connection to validator {}", peer_index);
        }
    }

    let write_task = tokio::spawn(async move {
        while let Some(data) = write_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &data).await {
                warn!("Failed to write to validator {}: {}", peer_index, e);
                break;
            }
        }
    });

    loop {
        match read_frame(&mut reader).await {
            Ok(data) => {
                trace!("Received {} bytes from validator {}", data.len(), peer_index);
                if inbound_tx.send(data).await.is_err() {
                    debug!("Inbound channel closed, dropping connection to {}", peer_index);
                    break;
                }
            }
            Err(e) => {
                debug!("Connection to validator {} ended: {}", peer_index, e);
                break;
            }
        }
    }

    write_task.abort();

    let mut peers = peers.write().await;
    if peers.get(&peer_index).map(|p| p.id) == Some(id) {
        peers.remove(&peer_index);
        info!("Validator {} disconnected", peer_index);
    }
}

async fn read_hello<R: AsyncRead + Unpin>(stream: &mut R) -> anyhow::Result<ValidatorIndex> {
    let data = read_frame(stream).await?;
    let bytes: [u8; HELLO_LEN] = data
        .as_slice()
        .try_into()
        .map_err(|_| anyhow::anyhow!("hello frame has {} bytes, expected {}", data.len(), HELLO_LEN))?;
    Ok(ValidatorIndex(u16::from_be_bytes(bytes)))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(stream: &mut W, data: &[u8]) -> anyhow::Result<()> {
    if data.len() > MAX_MESSAGE_SIZE {
        anyhow::bail!("frame of {} bytes exceeds {}", data.len(), MAX_MESSAGE_SIZE);
    }

    // Length prefix (4 bytes)
    let len = data.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;

    stream.write_all(data).await?;
    stream.flush().await?;

    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> anyhow::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_MESSAGE_SIZE {
        anyhow::bail!("peer announced {} byte frame, limit is {}", len, MAX_MESSAGE_SIZE);
    }

    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await?;

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbft_consensus::{decode, ChangeView, ConsensusPayload};
    use dbft_crypto::KeyPair;
    use dbft_types::{BlockIndex, ChangeViewReason, ViewNumber};

    fn envelope(validator: u16) -> Envelope {
        let key = KeyPair::from_seed(&format!("validator-{}", validator));
        let payload = ConsensusPayload::ChangeView(ChangeView {
            new_view: ViewNumber(1),
            reason: ChangeViewReason::Timeout,
            timestamp_ms: 1_700_000_000_000,
        });
        Envelope::new_signed(BlockIndex(1), ValidatorIndex(validator), ViewNumber(0), payload, &key)
            .expect("sign")
    }

    async fn recv(rx: &mut mpsc::Receiver<Vec<u8>>) -> Vec<u8> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timeout")
            .expect("channel closed")
    }

    async fn wait_for_peers(mesh: &TcpMesh, count: usize) {
        for _ in 0..100 {
            if mesh.connected_peers().await.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("mesh never reached {} peers", count);
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, b"consensus").await.unwrap();
        let data = read_frame(&mut b).await.unwrap();
        assert_eq!(data, b"consensus");
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let len = (MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes();
        a.write_all(&len).await.unwrap();

        let result = read_frame(&mut b).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_bad_hello_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        write_frame(&mut a, &[1, 2, 3]).await.unwrap();
        assert!(read_hello(&mut b).await.is_err());

        write_frame(&mut a, &7u16.to_be_bytes()).await.unwrap();
        assert_eq!(read_hello(&mut b).await.unwrap(), ValidatorIndex(7));
    }

    #[tokio::test]
    async fn test_loopback_broadcast_and_send_to() {
        let (tx0, mut rx0) = mpsc::channel(16);
        let (tx1, mut rx1) = mpsc::channel(16);

        // node0 only accepts node1 and never dials it.
        let unreachable: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let node0 = TcpMesh::new(ValidatorIndex(0), HashMap::from([(ValidatorIndex(1), unreachable)]), tx0);
        let addr0 = node0.listen_on("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let book = HashMap::from([(ValidatorIndex(0), addr0)]);
        let node1 = TcpMesh::new(ValidatorIndex(1), book, tx1);
        assert_eq!(node1.connect_missing().await, 1);

        wait_for_peers(&node0, 1).await;
        wait_for_peers(&node1, 1).await;
        assert_eq!(node0.connected_peers().await, vec![ValidatorIndex(1)]);

        let sent = envelope(1);
        node1.broadcast(&sent).await.unwrap();
        let received = decode(&recv(&mut rx0).await).unwrap();
        assert_eq!(received, sent);

        let reply = envelope(0);
        node0.send_to(ValidatorIndex(1), &reply).await.unwrap();
        let received = decode(&recv(&mut rx1).await).unwrap();
        assert_eq!(received, reply);
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_fails() {
        let (tx, _rx) = mpsc::channel(1);
        let mesh = TcpMesh::new(ValidatorIndex(0), HashMap::new(), tx);

        let result = mesh.send_to(ValidatorIndex(3), &envelope(0)).await;
        assert!(matches!(result, Err(ConsensusError::NetworkError(_))));

        // Broadcast with no peers is not an error
        assert!(mesh.broadcast(&envelope(0)).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_validator_index_refused() {
        let (tx, _rx) = mpsc::channel(16);
        let book = HashMap::from([(ValidatorIndex(1), "127.0.0.1:1".parse().unwrap())]);
        let mesh = TcpMesh::new(ValidatorIndex(0), book, tx);
        let addr = mesh.listen_on("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let mut socket = TcpStream::connect(addr).await.unwrap();
        write_frame(&mut socket, &9u16.to_be_bytes()).await.unwrap();

        // The listener drops the socket right after the hello.
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), socket.read(&mut buf))
            .await
            .expect("timeout")
            .unwrap_or(0);
        assert_eq!(read, 0);
        assert!(mesh.connected_peers().await.is_empty());
    }

    #[tokio::test]
    async fn test_full_write_queue_drops_frames() {
        let (tx, _rx) = mpsc::channel(1);
        let mesh = TcpMesh::new(ValidatorIndex(0), HashMap::new(), tx);

        // A peer whose writer never drains.
        let (write_tx, _write_rx) = mpsc::channel(1);
        mesh.peers.write().await.insert(
            ValidatorIndex(1),
            PeerConnection {
                id: 0,
                write_tx,
                addr: "127.0.0.1:1".parse().unwrap(),
            },
        );

        mesh.send_to(ValidatorIndex(1), &envelope(0)).await.unwrap();
        let result = mesh.send_to(ValidatorIndex(1), &envelope(0)).await;
        assert!(matches!(result, Err(ConsensusError::NetworkError(_))));

        // Broadcast skips the congested peer without failing.
        assert!(mesh.broadcast(&envelope(0)).await.is_ok());
    }
}
