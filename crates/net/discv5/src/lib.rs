#![warn(missing_docs, unreachable_pub)]
#![deny(unused_must_use, rust_2018_idioms)]
#![doc(test(
    no_crate_inject,
    attr(deny(warnings, rust_2018_idioms), allow(dead_code, unused_variables))
))]

//! Implementation of the [Discovery v5](https://github.com/ethereum/devp2p/blob/master/discv5/discv5.md)
//! peer discovery protocol.
//!
//! Nodes are identified by 256-bit ids and found by iterative XOR-distance lookups over an
//! authenticated, encrypted UDP channel. The service keeps a Kademlia-style routing table of
//! signed node records ([`Enr`]) and exchanges opaque application payloads with authenticated
//! peers via TALKREQ/TALKRESP.
//!
//! The entry point is [`Discv5::spawn`], which binds the configured UDP socket(s) and runs the
//! protocol on a background task. The returned [`Discv5`] handle exposes the API; events are
//! consumed through [`Discv5::event_stream`].

pub mod config;
pub mod crypto;
pub mod error;
pub mod kbucket;
mod lookup;
mod metrics;
pub mod node;
pub mod packet;
pub mod proto;
mod service;
mod session;
pub mod socket;

use crate::service::{Discv5Command, Discv5Service};
pub use config::{Discv5Config, Discv5ConfigBuilder};
pub use crypto::{CryptoProvider, DefaultCrypto};
pub use error::{CryptoError, DecoderError, Discv5Error, RequestError};
pub use kbucket::{ConnectionState, KBucketsTable, NodeEntry, MAX_NODES_PER_BUCKET};
pub use node::{Distance, NodeAddress, NodeContact};
pub use proto::{Pong, RequestId};
pub use socket::ListenConfig;

use enr::NodeId;
use parking_lot::RwLock;
use secp256k1::{PublicKey, SecretKey, SECP256K1};
use socket::Socket;
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::{mpsc, oneshot};

/// The node record type spoken by this implementation: secp256k1-signed ENRs.
pub type Enr = enr::Enr<SecretKey>;

/// Events emitted by the discovery service.
#[derive(Debug, Clone)]
pub enum Discv5Event {
    /// A record was learned from a NODES response. Discovered records are inserted into the
    /// routing table but have not proven liveness.
    Discovered(Enr),
    /// A record was added to the routing table.
    EnrAdded(Enr),
    /// A session with the peer was established.
    SessionEstablished(Enr, SocketAddr),
    /// An application request arrived; answer it with [`Discv5::send_talk_response`].
    TalkRequest(InboundTalkRequest),
    /// The local record was updated with a PONG-observed endpoint.
    SocketUpdated(SocketAddr),
}

/// An inbound TALKREQ surfaced to the application.
#[derive(Debug, Clone)]
pub struct InboundTalkRequest {
    /// Who is asking.
    pub node_address: NodeAddress,
    /// Request id to echo in the response.
    pub id: RequestId,
    /// Application protocol identifier.
    pub protocol: Vec<u8>,
    /// Request payload.
    pub request: Vec<u8>,
}

/// Frontend to a running discovery service.
///
/// Cheap to clone; all clones talk to the same background task. The service shuts down when
/// [`Discv5::shutdown`] is called or every handle is dropped.
#[derive(Debug, Clone)]
pub struct Discv5 {
    to_service: mpsc::UnboundedSender<Discv5Command>,
    local_enr: Arc<RwLock<Enr>>,
}

// === impl Discv5 ===

impl Discv5 {
    /// Binds the configured socket(s) and spawns the discovery service.
    ///
    /// `local_enr` must be signed by `local_key`.
    pub async fn spawn(
        local_enr: Enr,
        local_key: SecretKey,
        config: Discv5Config,
    ) -> Result<Self, Discv5Error> {
        if PublicKey::from_secret_key(SECP256K1, &local_key) != local_enr.public_key() {
            return Err(Discv5Error::EnrKeyMismatch)
        }

        let socket = Socket::bind(
            &config.listen_config,
            config.udp_ingress_message_buffer,
            config.udp_egress_message_buffer,
        )
        .await?;

        let local_enr = Arc::new(RwLock::new(local_enr));
        let (to_service, command_rx) = mpsc::unbounded_channel();
        let service = Discv5Service::new(local_enr.clone(), local_key, config, socket, command_rx);
        tokio::spawn(service.run());

        Ok(Self { to_service, local_enr })
    }

    /// The current local record.
    pub fn local_enr(&self) -> Enr {
        self.local_enr.read().clone()
    }

    /// The local node id.
    pub fn local_node_id(&self) -> NodeId {
        self.local_enr.read().node_id()
    }

    /// Inserts a record into the routing table.
    pub fn add_enr(&self, enr: Enr) -> Result<(), Discv5Error> {
        self.send_command(Discv5Command::AddEnr(enr))
    }

    /// Removes a record from the routing table.
    pub fn remove_enr(&self, node_id: NodeId) -> Result<(), Discv5Error> {
        self.send_command(Discv5Command::RemoveEnr(node_id))
    }

    /// All records currently held in the routing table.
    pub async fn table_entries(&self) -> Result<Vec<Enr>, Discv5Error> {
        let (tx, rx) = oneshot::channel();
        self.send_command(Discv5Command::TableEntries(tx))?;
        rx.await.map_err(|_| Discv5Error::ServiceNotRunning)
    }

    /// Runs an iterative lookup and returns the closest records found, ascending by distance
    /// to `target`.
    pub async fn find_node(&self, target: NodeId) -> Result<Vec<Enr>, RequestError> {
        let (tx, rx) = oneshot::channel();
        self.to_service
            .send(Discv5Command::FindNode(target, tx))
            .map_err(|_| RequestError::Shutdown)?;
        rx.await.map_err(|_| RequestError::Shutdown)?
    }

    /// Pings a peer, returning its PONG.
    pub async fn send_ping(&self, enr: Enr) -> Result<Pong, RequestError> {
        let (tx, rx) = oneshot::channel();
        self.to_service
            .send(Discv5Command::Ping(enr, tx))
            .map_err(|_| RequestError::Shutdown)?;
        rx.await.map_err(|_| RequestError::Shutdown)?
    }

    /// Sends an application request and resolves with the peer's response payload.
    pub async fn talk_request(
        &self,
        enr: Enr,
        protocol: Vec<u8>,
        request: Vec<u8>,
    ) -> Result<Vec<u8>, RequestError> {
        let (tx, rx) = oneshot::channel();
        self.to_service
            .send(Discv5Command::TalkRequest { enr, protocol, request, callback: tx })
            .map_err(|_| RequestError::Shutdown)?;
        rx.await.map_err(|_| RequestError::Shutdown)?
    }

    /// Answers an inbound [`InboundTalkRequest`].
    pub fn send_talk_response(
        &self,
        node_address: NodeAddress,
        id: RequestId,
        response: Vec<u8>,
    ) -> Result<(), Discv5Error> {
        self.send_command(Discv5Command::TalkResponse(node_address, id, response))
    }

    /// Registers a new event stream listener.
    pub async fn event_stream(&self) -> Result<mpsc::Receiver<Discv5Event>, Discv5Error> {
        let (tx, rx) = oneshot::channel();
        self.send_command(Discv5Command::EventStream(tx))?;
        rx.await.map_err(|_| Discv5Error::ServiceNotRunning)
    }

    /// Stops the service, failing everything in flight with [`RequestError::Shutdown`].
    pub fn shutdown(&self) {
        let _ = self.to_service.send(Discv5Command::Shutdown);
    }

    fn send_command(&self, command: Discv5Command) -> Result<(), Discv5Error> {
        self.to_service.send(command).map_err(|_| Discv5Error::ServiceNotRunning)
    }
}
