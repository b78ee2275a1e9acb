use std::{
    error, fmt, io,
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use log::{debug, info};
use tokio::{runtime, signal, sync::mpsc};

pub mod demux;
pub mod message;
pub mod proposal;
pub mod sa;

use demux::{NetError, SessionDatagram, SpiRouter};
use proposal::{PolicyError, SaPolicy};
use sa::{ProtocolId, TransformType};

const SESSION_QUEUE_DEPTH: usize = 16;

pub struct Config {
    pub listen_ips: Vec<IpAddr>,
    pub port: u16,
    pub nat_port: u16,
}

pub struct Server {
    config: Config,
}

impl Server {
    pub fn new(config: Config) -> Server {
        Server { config }
    }

    pub fn run(&self) -> Result<(), IkeError> {
        let rt = runtime::Builder::new_current_thread().enable_all().build()?;
        rt.block_on(self.serve())
    }

    async fn serve(&self) -> Result<(), IkeError> {
        let policies = default_policies()?;
        let router = Arc::new(SpiRouter::new());
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_DEPTH);
        let mut sockets = Vec::new();
        for listen_ip in &self.config.listen_ips {
            for (port, encapsulated) in [(self.config.port, false), (self.config.nat_port, true)] {
                let local_addr = SocketAddr::new(*listen_ip, port);
                // SPI 0 receives IKE_SA_INIT requests, which carry a zero
                // responder SPI.
                let socket = router
                    .acquire(local_addr, encapsulated, 0, tx.clone())
                    .await?;
                sockets.push(socket);
            }
        }
        let rt = runtime::Handle::current();
        rt.spawn(log_inbound(rx, policies));
        signal::ctrl_c().await?;
        info!("Shutting down");
        for socket in &sockets {
            router.release(socket, 0).await;
        }
        Ok(())
    }
}

// Acceptable IKE SA suites, most preferred first.
fn default_policies() -> Result<Vec<SaPolicy>, PolicyError> {
    let aes_gcm = SaPolicy::builder(ProtocolId::IKE)
        .add_encryption(TransformType::ENCR_AES_GCM_16, Some(256))
        .add_encryption(TransformType::ENCR_AES_GCM_16, Some(128))
        .add_prf(TransformType::PRF_HMAC_SHA2_256)
        .add_dh_group(TransformType::DH_256_ECP)
        .add_dh_group(TransformType::DH_2048_MODP)
        .build()?;
    let aes_cbc = SaPolicy::builder(ProtocolId::IKE)
        .add_encryption(TransformType::ENCR_AES_CBC, Some(256))
        .add_encryption(TransformType::ENCR_AES_CBC, Some(128))
        .add_prf(TransformType::PRF_HMAC_SHA2_256)
        .add_prf(TransformType::PRF_HMAC_SHA1)
        .add_integrity(TransformType::AUTH_HMAC_SHA2_256_128)
        .add_integrity(TransformType::AUTH_HMAC_SHA1_96)
        .add_dh_group(TransformType::DH_2048_MODP)
        .add_dh_group(TransformType::DH_1024_MODP)
        .build()?;
    Ok(vec![aes_gcm, aes_cbc])
}

async fn log_inbound(mut rx: mpsc::Receiver<SessionDatagram>, policies: Vec<SaPolicy>) {
    while let Some(datagram) = rx.recv().await {
        let msg = match message::Message::from_datagram(&datagram.data) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(
                    "Failed to decode message from {}: {} ({})",
                    datagram.remote_addr,
                    err,
                    crate::logger::fmt_slice_hex(&datagram.data)
                );
                continue;
            }
        };
        info!("Received from {}:\n{:?}", datagram.remote_addr, msg);
        for payload in &msg.payloads {
            if let message::PayloadBody::SecurityAssociation(proposals) = payload.body() {
                match proposal::negotiate(proposals, &policies) {
                    Ok(negotiated) => info!(
                        "Would accept proposal {} from {} using policy {}",
                        negotiated.proposal().number(),
                        datagram.remote_addr,
                        negotiated.policy_index()
                    ),
                    Err(err) => info!(
                        "Rejecting offer from {}: {}",
                        datagram.remote_addr, err
                    ),
                }
            }
        }
    }
}

#[derive(Debug)]
pub enum IkeError {
    Policy(PolicyError),
    Net(NetError),
    Io(io::Error),
}

impl fmt::Display for IkeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Policy(e) => write!(f, "Policy error: {}", e),
            Self::Net(e) => write!(f, "Network error: {}", e),
            Self::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl error::Error for IkeError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Policy(err) => Some(err),
            Self::Net(err) => Some(err),
            Self::Io(err) => Some(err),
        }
    }
}

impl From<PolicyError> for IkeError {
    fn from(err: PolicyError) -> IkeError {
        IkeError::Policy(err)
    }
}

impl From<NetError> for IkeError {
    fn from(err: NetError) -> IkeError {
        IkeError::Net(err)
    }
}

impl From<io::Error> for IkeError {
    fn from(err: io::Error) -> IkeError {
        IkeError::Io(err)
    }
}
