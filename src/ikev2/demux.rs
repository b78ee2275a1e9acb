use std::{collections::HashMap, error, fmt, io, net::SocketAddr, sync::Arc};

use log::{debug, info, warn};
use rand::Rng;
use tokio::{
    net::UdpSocket,
    runtime,
    sync::{mpsc, Mutex},
    task::JoinHandle,
};

use super::message::IkeHeader;

const MAX_DATAGRAM_SIZE: usize = 1500;

// Prefix distinguishing IKE from ESP traffic on a NAT-T port, RFC 3948.
const NON_ESP_MARKER: [u8; 4] = [0, 0, 0, 0];

/// An inbound IKE datagram routed to its owning session.
pub struct SessionDatagram {
    pub header: IkeHeader,
    pub data: Vec<u8>,
    pub remote_addr: SocketAddr,
}

pub type SessionSender = mpsc::Sender<SessionDatagram>;

/// A UDP socket shared between all sessions attached to one local address.
///
/// Sockets acquired in encapsulated mode transparently prepend the non-ESP
/// marker on send; the receive path strips it before routing.
#[derive(Clone)]
pub struct SharedSocket {
    local_addr: SocketAddr,
    encapsulated: bool,
    socket: Arc<UdpSocket>,
}

impl SharedSocket {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_encapsulated(&self) -> bool {
        self.encapsulated
    }

    pub async fn send_to(&self, data: &[u8], remote_addr: SocketAddr) -> Result<(), NetError> {
        if self.encapsulated {
            let mut encapsulated = Vec::with_capacity(NON_ESP_MARKER.len() + data.len());
            encapsulated.extend_from_slice(&NON_ESP_MARKER);
            encapsulated.extend_from_slice(data);
            self.socket.send_to(&encapsulated, remote_addr).await?;
        } else {
            self.socket.send_to(data, remote_addr).await?;
        }
        Ok(())
    }
}

struct Transport {
    socket: SharedSocket,
    receiver: JoinHandle<()>,
    sessions: HashMap<u64, SessionSender>,
}

/// Routes inbound IKE datagrams to sessions by their local SPI.
///
/// Each local address has at most one socket, shared by every session
/// registered on it; the socket closes when its last session releases it.
pub struct SpiRouter {
    transports: Mutex<HashMap<SocketAddr, Transport>>,
}

impl SpiRouter {
    pub fn new() -> SpiRouter {
        SpiRouter {
            transports: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a session on a local address, opening the socket on first
    /// use.
    ///
    /// The registry lock is held across the bind, so concurrent acquires
    /// for the same address cannot open two sockets.
    pub async fn acquire(
        self: &Arc<Self>,
        local_addr: SocketAddr,
        encapsulated: bool,
        local_spi: u64,
        session: SessionSender,
    ) -> Result<SharedSocket, NetError> {
        let mut transports = self.transports.lock().await;
        if let Some(transport) = transports.get_mut(&local_addr) {
            if transport.socket.encapsulated != encapsulated {
                return Err("Socket encapsulation mode mismatch".into());
            }
            if transport.sessions.contains_key(&local_spi) {
                return Err("SPI is already registered".into());
            }
            transport.sessions.insert(local_spi, session);
            return Ok(transport.socket.clone());
        }
        let socket = UdpSocket::bind(local_addr).await?;
        let local_addr = socket.local_addr()?;
        let socket = SharedSocket {
            local_addr,
            encapsulated,
            socket: Arc::new(socket),
        };
        let rt = runtime::Handle::current();
        let receiver = rt.spawn(run_receiver(self.clone(), socket.clone()));
        let mut sessions = HashMap::new();
        sessions.insert(local_spi, session);
        transports.insert(
            local_addr,
            Transport {
                socket: socket.clone(),
                receiver,
                sessions,
            },
        );
        info!(
            "Listening on {}{}",
            local_addr,
            if encapsulated { " (NAT-T)" } else { "" }
        );
        Ok(socket)
    }

    /// Deregisters a session; the last release closes the socket.
    pub async fn release(&self, socket: &SharedSocket, local_spi: u64) {
        let mut transports = self.transports.lock().await;
        let remove_transport = if let Some(transport) = transports.get_mut(&socket.local_addr) {
            if transport.sessions.remove(&local_spi).is_none() {
                warn!(
                    "Released SPI {:x} is not registered on {}",
                    local_spi, socket.local_addr
                );
            }
            transport.sessions.is_empty()
        } else {
            warn!("Released socket {} is not registered", socket.local_addr);
            false
        };
        if remove_transport {
            if let Some(transport) = transports.remove(&socket.local_addr) {
                transport.receiver.abort();
                info!("Closed socket {}", socket.local_addr);
            }
        }
    }

    /// Draws a random non-zero local SPI not registered on the transport.
    pub async fn reserve_spi(&self, local_addr: SocketAddr) -> u64 {
        let transports = self.transports.lock().await;
        let mut rng = rand::thread_rng();
        loop {
            let local_spi = rng.gen::<u64>();
            if local_spi == 0 {
                continue;
            }
            let in_use = transports
                .get(&local_addr)
                .map(|transport| transport.sessions.contains_key(&local_spi))
                .unwrap_or(false);
            if !in_use {
                return local_spi;
            }
        }
    }

    async fn dispatch_datagram(&self, socket: &SharedSocket, remote_addr: SocketAddr, data: &[u8]) {
        let data = if socket.encapsulated {
            if data.len() < NON_ESP_MARKER.len() || data[..NON_ESP_MARKER.len()] != NON_ESP_MARKER
            {
                debug!("Dropping non-IKE datagram from {}", remote_addr);
                return;
            }
            &data[NON_ESP_MARKER.len()..]
        } else {
            data
        };
        let header = match IkeHeader::from_datagram(data) {
            Ok(header) => header,
            Err(err) => {
                debug!("Dropping malformed datagram from {}: {}", remote_addr, err);
                return;
            }
        };
        if let Err(err) = header.check_valid(data.len()) {
            debug!("Dropping invalid datagram from {}: {}", remote_addr, err);
            return;
        }
        // The local side's SPI is the responder SPI for messages sent by
        // the original initiator, and vice versa.
        let local_spi = if header.from_initiator {
            header.responder_spi
        } else {
            header.initiator_spi
        };
        let session = {
            let transports = self.transports.lock().await;
            transports
                .get(&socket.local_addr)
                .and_then(|transport| transport.sessions.get(&local_spi))
                .cloned()
        };
        let session = match session {
            Some(session) => session,
            None => {
                debug!(
                    "Dropping datagram from {} for unknown SPI {:x}",
                    remote_addr, local_spi
                );
                return;
            }
        };
        let datagram = SessionDatagram {
            header,
            data: data.to_vec(),
            remote_addr,
        };
        if session.send(datagram).await.is_err() {
            debug!("Session for SPI {:x} is closed", local_spi);
        }
    }
}

async fn run_receiver(router: Arc<SpiRouter>, socket: SharedSocket) {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (bytes_res, remote_addr) = match socket.socket.recv_from(&mut buf).await {
            Ok(res) => res,
            Err(err) => {
                warn!(
                    "Failed to receive from socket {}: {}",
                    socket.local_addr, err
                );
                return;
            }
        };
        router
            .dispatch_datagram(&socket, remote_addr, &buf[..bytes_res])
            .await;
    }
}

#[derive(Debug)]
pub enum NetError {
    Internal(&'static str),
    Io(io::Error),
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Internal(msg) => f.write_str(msg),
            Self::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl error::Error for NetError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Internal(_) => None,
            Self::Io(err) => Some(err),
        }
    }
}

impl From<&'static str> for NetError {
    fn from(msg: &'static str) -> NetError {
        NetError::Internal(msg)
    }
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> NetError {
        NetError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::super::message::{ExchangeType, IkeHeader, Message, Payload, PayloadBody, PayloadType};
    use super::*;

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    fn local_addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn test_message(initiator_spi: u64, responder_spi: u64) -> Vec<u8> {
        let header = IkeHeader::new(
            initiator_spi,
            responder_spi,
            PayloadType::NONE,
            ExchangeType::IKE_SA_INIT,
            false,
            true,
            0,
            0,
        );
        let payloads = vec![Payload::new(false, PayloadBody::Nonce(vec![0x42; 32]))];
        Message::new(header, payloads).encode()
    }

    #[tokio::test]
    async fn acquire_shares_socket() {
        let router = Arc::new(SpiRouter::new());
        let (tx, _rx) = mpsc::channel(4);
        let socket1 = router
            .acquire(local_addr(), false, 1, tx.clone())
            .await
            .unwrap();
        let socket2 = router
            .acquire(socket1.local_addr(), false, 2, tx)
            .await
            .unwrap();
        assert_eq!(socket1.local_addr(), socket2.local_addr());
        assert!(Arc::ptr_eq(&socket1.socket, &socket2.socket));
    }

    #[tokio::test]
    async fn acquire_rejects_duplicate_spi() {
        let router = Arc::new(SpiRouter::new());
        let (tx, _rx) = mpsc::channel(4);
        let socket = router
            .acquire(local_addr(), false, 1, tx.clone())
            .await
            .unwrap();
        let result = router.acquire(socket.local_addr(), false, 1, tx).await;
        assert!(matches!(result, Err(NetError::Internal(_))));
    }

    #[tokio::test]
    async fn acquire_rejects_encapsulation_mismatch() {
        let router = Arc::new(SpiRouter::new());
        let (tx, _rx) = mpsc::channel(4);
        let socket = router
            .acquire(local_addr(), false, 1, tx.clone())
            .await
            .unwrap();
        let result = router.acquire(socket.local_addr(), true, 2, tx).await;
        assert!(matches!(result, Err(NetError::Internal(_))));
    }

    #[tokio::test]
    async fn dispatches_by_local_spi() {
        let router = Arc::new(SpiRouter::new());
        let (tx, mut rx) = mpsc::channel(4);
        let socket = router.acquire(local_addr(), false, 0x1234, tx).await.unwrap();
        let client = UdpSocket::bind(local_addr()).await.unwrap();
        let packet = test_message(0xabcd, 0x1234);
        client.send_to(&packet, socket.local_addr()).await.unwrap();
        let datagram = timeout(RECV_TIMEOUT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(datagram.header.initiator_spi, 0xabcd);
        assert_eq!(datagram.header.responder_spi, 0x1234);
        assert_eq!(datagram.data, packet);
        assert_eq!(datagram.remote_addr, client.local_addr().unwrap());
    }

    #[tokio::test]
    async fn drops_malformed_and_unknown_datagrams() {
        let router = Arc::new(SpiRouter::new());
        let (tx, mut rx) = mpsc::channel(4);
        let socket = router.acquire(local_addr(), false, 0x1234, tx).await.unwrap();
        let client = UdpSocket::bind(local_addr()).await.unwrap();
        // Too short to contain a header.
        client
            .send_to(&[0u8; 16], socket.local_addr())
            .await
            .unwrap();
        // Valid message for an unregistered SPI.
        client
            .send_to(&test_message(0xabcd, 0x9999), socket.local_addr())
            .await
            .unwrap();
        // Valid message for the registered SPI arrives after the dropped
        // ones, proving they did not stall or kill the receiver.
        client
            .send_to(&test_message(0xabcd, 0x1234), socket.local_addr())
            .await
            .unwrap();
        let datagram = timeout(RECV_TIMEOUT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(datagram.header.responder_spi, 0x1234);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn encapsulated_socket_strips_and_prepends_marker() {
        let router = Arc::new(SpiRouter::new());
        let (tx, mut rx) = mpsc::channel(4);
        let socket = router.acquire(local_addr(), true, 0x1234, tx).await.unwrap();
        let client = UdpSocket::bind(local_addr()).await.unwrap();
        let packet = test_message(0xabcd, 0x1234);
        // ESP-looking datagram (no marker) is dropped.
        client.send_to(&packet, socket.local_addr()).await.unwrap();
        let mut encapsulated = NON_ESP_MARKER.to_vec();
        encapsulated.extend_from_slice(&packet);
        client
            .send_to(&encapsulated, socket.local_addr())
            .await
            .unwrap();
        let datagram = timeout(RECV_TIMEOUT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(datagram.data, packet);
        assert!(rx.try_recv().is_err());
        // Send path prepends the marker.
        socket
            .send_to(&packet, client.local_addr().unwrap())
            .await
            .unwrap();
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let (bytes_res, _) = timeout(RECV_TIMEOUT, client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..bytes_res], encapsulated.as_slice());
    }

    #[tokio::test]
    async fn release_closes_socket_once_unused() {
        let router = Arc::new(SpiRouter::new());
        let (tx, _rx) = mpsc::channel(4);
        let socket1 = router
            .acquire(local_addr(), false, 1, tx.clone())
            .await
            .unwrap();
        let socket2 = router
            .acquire(socket1.local_addr(), false, 2, tx)
            .await
            .unwrap();
        router.release(&socket1, 1).await;
        assert_eq!(router.transports.lock().await.len(), 1);
        router.release(&socket2, 2).await;
        assert!(router.transports.lock().await.is_empty());
    }

    #[tokio::test]
    async fn reserve_spi_avoids_registered_spis() {
        let router = Arc::new(SpiRouter::new());
        let (tx, _rx) = mpsc::channel(4);
        let socket = router.acquire(local_addr(), false, 1, tx).await.unwrap();
        let local_spi = router.reserve_spi(socket.local_addr()).await;
        assert_ne!(local_spi, 0);
        assert_ne!(local_spi, 1);
    }
}
