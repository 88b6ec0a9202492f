//! The discovery service task.
//!
//! A single task owns every piece of mutable state: the session map, the routing table, the
//! outstanding requests and the active lookups. It consumes an ordered stream of events
//! (API commands, inbound datagrams, timer ticks) via `select!`, so no state needs locking and
//! per-peer processing order follows arrival order.

use crate::{
    config::Discv5Config,
    crypto::CryptoProvider,
    error::{Discv5Error, RequestError},
    kbucket::{InsertResult, KBucketsTable, MAX_NODES_PER_BUCKET},
    lookup::{lookup_distances, Lookup, LookupId},
    node::{distance, NodeAddress, NodeContact},
    packet::{MessageNonce, Packet, PacketKind, MAX_PACKET_SIZE},
    proto::{FindNode, Message, Nodes, Ping, Pong, RequestId, TalkResponse},
    session::{self, HandshakeError, Session},
    metrics::Discv5Metrics,
    socket::{InboundDatagram, OutboundDatagram, Socket},
    Discv5Event, Enr, InboundTalkRequest,
};
use alloy_rlp::Encodable;
use enr::NodeId;
use parking_lot::RwLock;
use secp256k1::SecretKey;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

/// Cadence of the housekeeping timer driving request timeouts and expired handshakes.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Per-listener buffer of the event stream.
const EVENT_STREAM_BUFFER: usize = 256;

/// Encoded-size budget for the records of one NODES packet, leaving room for the packet
/// envelope and message framing within [`MAX_PACKET_SIZE`].
const NODES_PAYLOAD_BUDGET: usize = MAX_PACKET_SIZE - 280;

/// Commands the [`Discv5`](crate::Discv5) frontend sends to the service.
#[derive(Debug)]
pub(crate) enum Discv5Command {
    /// Insert a record into the routing table.
    AddEnr(Enr),
    /// Remove a record from the routing table.
    RemoveEnr(NodeId),
    /// Read all records in the routing table.
    TableEntries(oneshot::Sender<Vec<Enr>>),
    /// Run an iterative lookup for the given target.
    FindNode(NodeId, oneshot::Sender<Result<Vec<Enr>, RequestError>>),
    /// Ping a peer.
    Ping(Enr, oneshot::Sender<Result<Pong, RequestError>>),
    /// Send an application request to a peer.
    TalkRequest {
        /// Destination record.
        enr: Enr,
        /// Application protocol identifier.
        protocol: Vec<u8>,
        /// Request payload.
        request: Vec<u8>,
        /// Resolves with the response payload.
        callback: oneshot::Sender<Result<Vec<u8>, RequestError>>,
    },
    /// Answer an inbound TALKREQ previously surfaced as an event.
    TalkResponse(NodeAddress, RequestId, Vec<u8>),
    /// Register a new event listener.
    EventStream(oneshot::Sender<mpsc::Receiver<Discv5Event>>),
    /// Stop the service, cancelling everything in flight.
    Shutdown,
}

/// Completion handle of an outstanding request.
#[derive(Debug)]
enum RequestCallback {
    Ping(oneshot::Sender<Result<Pong, RequestError>>),
    Talk(oneshot::Sender<Result<Vec<u8>, RequestError>>),
}

/// Collects the pages of a multi-packet NODES response.
#[derive(Debug)]
struct NodesAccumulator {
    total: u64,
    received: u64,
    nodes: Vec<Enr>,
}

/// An outstanding request awaiting its response.
#[derive(Debug)]
struct ActiveRequest {
    contact: NodeContact,
    message: Message,
    /// Wire nonce of the last packet sent for this request; a WHOAREYOU answering it echoes
    /// this nonce.
    packet_nonce: MessageNonce,
    /// The datagram as last sent, for retransmission.
    encoded: Vec<u8>,
    sent_at: Instant,
    retries: u8,
    /// Set once this request's packet was upgraded to a handshake; a second WHOAREYOU for the
    /// same request is a protocol violation.
    handshake_sent: bool,
    callback: Option<RequestCallback>,
    lookup: Option<LookupId>,
    nodes: Option<NodesAccumulator>,
}

/// A request queued while the session handshake for its destination is in flight.
#[derive(Debug)]
struct PendingRequest {
    contact: NodeContact,
    message: Message,
    callback: Option<RequestCallback>,
    lookup: Option<LookupId>,
}

#[derive(Debug)]
struct LookupState {
    lookup: Lookup,
    callback: oneshot::Sender<Result<Vec<Enr>, RequestError>>,
}

/// The background service driving the discovery protocol.
#[must_use = "Service does nothing unless polled"]
pub(crate) struct Discv5Service {
    config: Discv5Config,
    crypto: Arc<dyn CryptoProvider>,
    /// The local signable record, shared with the frontend handle.
    local_enr: Arc<RwLock<Enr>>,
    local_key: SecretKey,
    local_id: NodeId,
    kbuckets: KBucketsTable,
    sessions: HashMap<NodeAddress, Session>,
    /// Deadlines of handshakes in flight; an expired entry drops its session.
    handshake_deadlines: HashMap<NodeAddress, Instant>,
    /// Requests queued until the destination session is keyed.
    pending_requests: HashMap<NodeAddress, Vec<PendingRequest>>,
    active_requests: HashMap<RequestId, ActiveRequest>,
    /// Index from sent packet nonces to their request, for WHOAREYOU correlation.
    nonce_to_request: HashMap<MessageNonce, RequestId>,
    lookups: HashMap<LookupId, LookupState>,
    next_lookup_id: u64,
    command_rx: mpsc::UnboundedReceiver<Discv5Command>,
    event_listeners: Vec<mpsc::Sender<Discv5Event>>,
    socket: Socket,
    metrics: Discv5Metrics,
}

// === impl Discv5Service ===

impl Discv5Service {
    /// Creates the service around an already bound socket.
    pub(crate) fn new(
        local_enr: Arc<RwLock<Enr>>,
        local_key: SecretKey,
        config: Discv5Config,
        socket: Socket,
        command_rx: mpsc::UnboundedReceiver<Discv5Command>,
    ) -> Self {
        let local_id = local_enr.read().node_id();
        Self {
            crypto: config.crypto.clone(),
            config,
            local_enr,
            local_key,
            local_id,
            kbuckets: KBucketsTable::new(local_id),
            sessions: HashMap::new(),
            handshake_deadlines: HashMap::new(),
            pending_requests: HashMap::new(),
            active_requests: HashMap::new(),
            nonce_to_request: HashMap::new(),
            lookups: HashMap::new(),
            next_lookup_id: 0,
            command_rx,
            event_listeners: Vec::new(),
            socket,
            metrics: Discv5Metrics::default(),
        }
    }

    /// The main execution loop.
    pub(crate) async fn run(mut self) {
        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut ping_interval = tokio::time::interval(self.config.ping_interval);
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        debug!(target: "discv5", node_id = %crate::node::fmt_node_id(&self.local_id), "service started");
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(Discv5Command::Shutdown) | None => break,
                    Some(command) => self.on_command(command),
                },
                Some(datagram) = self.socket.recv.recv() => self.on_datagram(datagram),
                _ = tick.tick() => self.on_tick(),
                _ = ping_interval.tick() => self.on_ping_interval(),
            }
        }
        self.on_shutdown();
    }

    /* Command handling */

    fn on_command(&mut self, command: Discv5Command) {
        match command {
            Discv5Command::AddEnr(enr) => {
                match self.kbuckets.insert_or_update(enr.clone()) {
                    InsertResult::Inserted | InsertResult::Pending => {
                        self.metrics.kbucket_insertions.increment(1);
                        self.send_event(Discv5Event::EnrAdded(enr));
                    }
                    InsertResult::Updated => {}
                    InsertResult::IsLocal => {
                        debug!(target: "discv5", "refusing to insert the local record");
                    }
                }
            }
            Discv5Command::RemoveEnr(node_id) => {
                self.kbuckets.remove(&node_id);
            }
            Discv5Command::TableEntries(callback) => {
                let _ = callback.send(self.kbuckets.table_entries());
            }
            Discv5Command::FindNode(target, callback) => self.start_lookup(target, callback),
            Discv5Command::Ping(enr, callback) => match NodeContact::try_from_enr(enr) {
                Ok(contact) => {
                    let message = Message::Ping(Ping {
                        id: RequestId::random(),
                        enr_seq: self.local_enr.read().seq(),
                    });
                    self.send_request(contact, message, Some(RequestCallback::Ping(callback)), None);
                }
                Err(_) => {
                    let _ = callback.send(Err(RequestError::UnroutableEnr));
                }
            },
            Discv5Command::TalkRequest { enr, protocol, request, callback } => {
                match NodeContact::try_from_enr(enr) {
                    Ok(contact) => {
                        let message = Message::TalkRequest(crate::proto::TalkRequest {
                            id: RequestId::random(),
                            protocol: protocol.into(),
                            request: request.into(),
                        });
                        self.send_request(
                            contact,
                            message,
                            Some(RequestCallback::Talk(callback)),
                            None,
                        );
                    }
                    Err(_) => {
                        let _ = callback.send(Err(RequestError::UnroutableEnr));
                    }
                }
            }
            Discv5Command::TalkResponse(node_address, id, payload) => {
                let message = Message::TalkResponse(TalkResponse { id, response: payload.into() });
                self.send_response(node_address, message);
            }
            Discv5Command::EventStream(callback) => {
                let (tx, rx) = mpsc::channel(EVENT_STREAM_BUFFER);
                self.event_listeners.push(tx);
                let _ = callback.send(rx);
            }
            Discv5Command::Shutdown => unreachable!("handled by the run loop"),
        }
    }

    /* Outbound path */

    /// Sends a request to a peer, transparently starting a handshake if no session exists.
    fn send_request(
        &mut self,
        contact: NodeContact,
        message: Message,
        callback: Option<RequestCallback>,
        lookup: Option<LookupId>,
    ) {
        let node_address = contact.node_address();
        if self.socket.local_sockets.contains(&node_address.socket_addr) {
            debug!(target: "discv5", "filtered request to self");
            self.complete_failed(callback, lookup, &node_address.node_id, RequestError::SelfRequest);
            return
        }

        match self.sessions.get_mut(&node_address) {
            Some(session) if session.is_keyed() => {
                let payload = message.encode();
                match session.encrypt_message(self.crypto.as_ref(), self.local_id, &payload) {
                    Ok(packet) => {
                        self.register_and_send(node_address, contact, message, packet, callback, lookup)
                    }
                    Err(err) => {
                        warn!(target: "discv5", %node_address, %err, "failed to encrypt request");
                        let err = match err {
                            Discv5Error::Crypto(crypto_err) => {
                                RequestError::EncryptionFailed(crypto_err)
                            }
                            _ => RequestError::InvalidHandshake,
                        };
                        self.complete_failed(callback, lookup, &node_address.node_id, err);
                    }
                }
            }
            Some(_) => {
                // Handshake in flight, queue behind it.
                trace!(target: "discv5", %node_address, "request queued for session establishment");
                self.pending_requests
                    .entry(node_address)
                    .or_default()
                    .push(PendingRequest { contact, message, callback, lookup });
            }
            None => {
                // No session: fire a random packet to provoke a WHOAREYOU and ride the
                // handshake with this request.
                trace!(target: "discv5", %node_address, "starting session, sending random packet");
                let packet = Packet::new_random(self.local_id);
                self.sessions.insert(node_address.clone(), Session::new_random_sent());
                self.metrics.active_sessions.set(self.sessions.len() as f64);
                self.handshake_deadlines.insert(
                    node_address.clone(),
                    Instant::now() + self.config.session_establish_timeout,
                );
                self.register_and_send(node_address, contact, message, packet, callback, lookup);
            }
        }
    }

    /// Registers the request under its id and nonce and puts the datagram on the wire.
    fn register_and_send(
        &mut self,
        node_address: NodeAddress,
        contact: NodeContact,
        message: Message,
        packet: Packet,
        callback: Option<RequestCallback>,
        lookup: Option<LookupId>,
    ) {
        let encoded = packet.encode(self.crypto.as_ref(), &node_address.node_id);
        let packet_nonce = *packet.message_nonce();
        let request_id = message.request_id().clone();

        trace!(target: "discv5", %node_address, id = %request_id, msg = %message, "sending request");
        self.nonce_to_request.insert(packet_nonce, request_id.clone());
        self.active_requests.insert(
            request_id,
            ActiveRequest {
                contact,
                message,
                packet_nonce,
                encoded: encoded.clone(),
                sent_at: Instant::now(),
                retries: 0,
                handshake_sent: false,
                callback,
                lookup,
                nodes: None,
            },
        );
        self.send_datagram(node_address.socket_addr, encoded);
    }

    /// Encrypts and sends a response over an existing session. Responses to peers without a
    /// keyed session are dropped.
    fn send_response(&mut self, node_address: NodeAddress, message: Message) {
        let Some(session) = self.sessions.get_mut(&node_address) else {
            return warn!(target: "discv5", %node_address, "no session, dropping response");
        };
        if !session.is_keyed() {
            return warn!(target: "discv5", %node_address, "session not keyed, dropping response");
        }
        let payload = message.encode();
        match session.encrypt_message(self.crypto.as_ref(), self.local_id, &payload) {
            Ok(packet) => {
                let encoded = packet.encode(self.crypto.as_ref(), &node_address.node_id);
                trace!(target: "discv5", %node_address, msg = %message, "sending response");
                self.send_datagram(node_address.socket_addr, encoded);
            }
            Err(err) => warn!(target: "discv5", %node_address, %err, "could not encrypt response"),
        }
    }

    fn send_datagram(&mut self, dst: SocketAddr, data: Vec<u8>) {
        if let Err(err) = self.socket.send.try_send(OutboundDatagram { dst, data }) {
            warn!(target: "discv5", %dst, %err, "outbound channel full, dropping datagram");
        }
    }

    /* Inbound path */

    fn on_datagram(&mut self, datagram: InboundDatagram) {
        let InboundDatagram { src, data } = datagram;
        let packet = match Packet::decode(self.crypto.as_ref(), &self.local_id, &data) {
            Ok(packet) => packet,
            Err(err) => {
                // Never answer malformed input, that would be an amplification vector.
                trace!(target: "discv5", %src, %err, "dropping undecodable packet");
                self.metrics.decode_failures.increment(1);
                return
            }
        };

        trace!(target: "discv5", %src, %packet, "received packet");
        match packet.header.kind.clone() {
            PacketKind::Message { src_id } => {
                self.on_message_packet(NodeAddress::new(src, src_id), packet)
            }
            PacketKind::WhoAreYou { enr_seq, .. } => self.on_whoareyou(src, packet, enr_seq),
            PacketKind::Handshake { src_id, id_signature, ephem_pubkey, enr_record } => self
                .on_handshake_packet(
                    NodeAddress::new(src, src_id),
                    &packet,
                    &id_signature,
                    &ephem_pubkey,
                    enr_record,
                ),
        }
    }

    /// An ordinary packet: decrypt under the session for its source, or challenge the sender.
    fn on_message_packet(&mut self, node_address: NodeAddress, packet: Packet) {
        let aad = packet.authenticated_data();
        let nonce = packet.header.message_nonce;

        let Some(session) = self.sessions.get_mut(&node_address) else {
            // A message from a stranger; could be anything, including a random packet. Ask who
            // it is.
            return self.send_challenge(node_address, nonce)
        };

        if !session.is_keyed() {
            if session.challenge().is_some() {
                trace!(target: "discv5", %node_address, "challenge already in flight, dropping message");
            } else {
                // Both sides initiated simultaneously; challenge them, our own request will be
                // answered by their WHOAREYOU.
                self.send_challenge(node_address, nonce);
            }
            return
        }

        match session.decrypt_message(self.crypto.as_ref(), &nonce, &packet.message, &aad) {
            Ok(plaintext) => {
                // The handshake (if any) is confirmed now.
                self.handshake_deadlines.remove(&node_address);
                match Message::decode(&plaintext) {
                    Ok(message) => self.on_message(node_address, message),
                    Err(err) => {
                        warn!(target: "discv5", %node_address, ?err, "failed to decode message")
                    }
                }
            }
            Err(_) => {
                if session.is_established() {
                    // The peer lost our keys, make it re-handshake.
                    debug!(target: "discv5", %node_address, "decryption failed on established session");
                    self.send_challenge(node_address, nonce);
                } else {
                    trace!(
                        target: "discv5",
                        %node_address,
                        state = session.state_name(),
                        "dropping undecryptable message during handshake"
                    );
                }
            }
        }
    }

    /// Issues a WHOAREYOU for the given undecryptable packet nonce, at most one in flight per
    /// peer.
    fn send_challenge(&mut self, node_address: NodeAddress, request_nonce: MessageNonce) {
        if let Some(session) = self.sessions.get(&node_address) {
            if session.challenge().is_some() {
                trace!(target: "discv5", %node_address, "WHOAREYOU already sent");
                return
            }
        }

        let remote_enr = self.kbuckets.get(&node_address.node_id).map(|entry| entry.enr.clone());
        let (packet, challenge) = session::new_challenge(request_nonce, remote_enr);
        let encoded = packet.encode(self.crypto.as_ref(), &node_address.node_id);

        debug!(target: "discv5", %node_address, "sending WHOAREYOU");
        match self.sessions.get_mut(&node_address) {
            Some(session) if session.is_established() => session.await_reestablishment(challenge),
            _ => {
                self.sessions.insert(node_address.clone(), Session::new_whoareyou_sent(challenge));
                self.metrics.active_sessions.set(self.sessions.len() as f64);
            }
        }
        self.handshake_deadlines
            .insert(node_address.clone(), Instant::now() + self.config.session_establish_timeout);
        self.send_datagram(node_address.socket_addr, encoded);
    }

    /// A WHOAREYOU challenging one of our requests: answer it with a handshake packet carrying
    /// that request.
    fn on_whoareyou(&mut self, src: SocketAddr, packet: Packet, enr_seq: u64) {
        let request_nonce = packet.header.message_nonce;
        let Some(request_id) = self.nonce_to_request.get(&request_nonce).cloned() else {
            trace!(target: "discv5", %src, "WHOAREYOU for unknown request, dropping");
            return
        };
        let Some(request) = self.active_requests.get(&request_id) else { return };

        let node_address = request.contact.node_address();
        if node_address.socket_addr != src {
            debug!(target: "discv5", %src, expected = %node_address, "WHOAREYOU from unexpected source");
            return
        }
        if request.handshake_sent {
            warn!(target: "discv5", %node_address, "second WHOAREYOU for one request, dropping session");
            self.fail_request(&request_id, RequestError::InvalidHandshake);
            return
        }

        let remote_pubkey = request.contact.public_key();
        let payload = request.message.encode();
        // Include our record if the challenger's view of it is stale.
        let updated_enr = {
            let local_enr = self.local_enr.read();
            (enr_seq < local_enr.seq()).then(|| local_enr.clone())
        };
        let challenge_data = packet.authenticated_data();

        let result = Session::encrypt_with_handshake(
            self.crypto.as_ref(),
            &self.local_key,
            self.local_id,
            node_address.node_id,
            &remote_pubkey,
            &challenge_data,
            updated_enr,
            &payload,
        );
        let (handshake_packet, session) = match result {
            Ok(output) => output,
            Err(err) => {
                error!(target: "discv5", %node_address, %err, "could not generate handshake");
                self.fail_request(&request_id, RequestError::InvalidHandshake);
                return
            }
        };

        // Swap in the keyed session; any previous state for this peer is superseded.
        self.sessions.insert(node_address.clone(), session);
        self.metrics.active_sessions.set(self.sessions.len() as f64);

        let encoded = handshake_packet.encode(self.crypto.as_ref(), &node_address.node_id);
        let new_nonce = *handshake_packet.message_nonce();
        self.nonce_to_request.remove(&request_nonce);
        self.nonce_to_request.insert(new_nonce, request_id.clone());
        if let Some(request) = self.active_requests.get_mut(&request_id) {
            request.packet_nonce = new_nonce;
            request.encoded = encoded.clone();
            request.handshake_sent = true;
            request.sent_at = Instant::now();
            request.retries = 0;
        }

        debug!(target: "discv5", %node_address, "sending handshake");
        self.send_datagram(src, encoded);

        if let Some(enr) = self.active_requests.get(&request_id).map(|r| r.contact.enr().clone()) {
            self.on_session_established(&node_address, enr);
        }
        self.flush_pending(node_address);
    }

    /// A handshake packet answering a WHOAREYOU we sent.
    fn on_handshake_packet(
        &mut self,
        node_address: NodeAddress,
        packet: &Packet,
        id_signature: &[u8],
        ephem_pubkey: &[u8],
        enr_record: Option<Enr>,
    ) {
        let Some(challenge) =
            self.sessions.get(&node_address).and_then(|session| session.challenge().cloned())
        else {
            // No recorded challenge, nothing to verify the signature against.
            trace!(target: "discv5", %node_address, "handshake without matching WHOAREYOU, dropping");
            return
        };

        match Session::establish_from_challenge(
            self.crypto.as_ref(),
            &self.local_key,
            self.local_id,
            &node_address,
            challenge,
            id_signature,
            ephem_pubkey,
            enr_record,
        ) {
            Ok((session, enr)) => {
                self.sessions.insert(node_address.clone(), session);
                self.metrics.active_sessions.set(self.sessions.len() as f64);
                self.handshake_deadlines.remove(&node_address);
                self.on_session_established(&node_address, enr);

                // The message that rode along decrypts under the fresh keys.
                let aad = packet.authenticated_data();
                let nonce = packet.header.message_nonce;
                if let Some(session) = self.sessions.get_mut(&node_address) {
                    match session.decrypt_message(
                        self.crypto.as_ref(),
                        &nonce,
                        &packet.message,
                        &aad,
                    ) {
                        Ok(plaintext) => match Message::decode(&plaintext) {
                            Ok(message) => self.on_message(node_address.clone(), message),
                            Err(err) => warn!(
                                target: "discv5",
                                %node_address, ?err, "failed to decode handshake message"
                            ),
                        },
                        Err(err) => {
                            warn!(target: "discv5", %node_address, %err, "handshake message did not decrypt")
                        }
                    }
                }
                self.flush_pending(node_address);
            }
            Err(HandshakeError::InvalidSignature) => {
                // Keep the challenge: the genuine peer may still answer it.
                warn!(target: "discv5", %node_address, "handshake with invalid id-signature, dropping");
            }
            Err(HandshakeError::UnknownEnr) => {
                warn!(target: "discv5", %node_address, "handshake without a usable ENR, dropping session");
                self.drop_session(&node_address, RequestError::InvalidRemoteEnr);
            }
            Err(err) => {
                warn!(target: "discv5", %node_address, %err, "handshake failed, dropping session");
                self.drop_session(&node_address, RequestError::InvalidHandshake);
            }
        }
    }

    /// A decrypted message from an authenticated peer.
    fn on_message(&mut self, node_address: NodeAddress, message: Message) {
        trace!(target: "discv5", %node_address, msg = %message, "handling message");
        if message.is_response() {
            return self.on_response(node_address, message)
        }
        match message {
            Message::Ping(ping) => {
                let pong = Message::Pong(Pong {
                    id: ping.id,
                    enr_seq: self.local_enr.read().seq(),
                    recipient_ip: node_address.socket_addr.ip(),
                    recipient_port: node_address.socket_addr.port(),
                });
                self.send_response(node_address.clone(), pong);
                self.kbuckets.mark_connected(&node_address.node_id);
                self.maybe_refresh_remote_enr(&node_address, ping.enr_seq);
            }
            Message::FindNode(request) => self.on_findnode(node_address, request),
            Message::TalkRequest(request) => {
                // Surfaced to the application, which answers via the TalkResponse command. A
                // request nobody answers simply times out on the asking side.
                self.send_event(Discv5Event::TalkRequest(InboundTalkRequest {
                    node_address,
                    id: request.id,
                    protocol: request.protocol.to_vec(),
                    request: request.request.to_vec(),
                }));
            }
            _ => unreachable!("responses are dispatched above"),
        }
    }

    /// Answers FINDNODE from the routing table, chunked into as many NODES packets as needed.
    fn on_findnode(&mut self, node_address: NodeAddress, request: FindNode) {
        let FindNode { id, mut distances } = request;
        distances.sort_unstable();
        distances.dedup();

        let mut enrs = Vec::new();
        for distance in &distances {
            if *distance == 0 {
                enrs.push(self.local_enr.read().clone());
            } else {
                enrs.extend(self.kbuckets.entries_at_distance(*distance));
            }
        }
        enrs.retain(|enr| enr.node_id() != node_address.node_id);
        enrs.truncate(MAX_NODES_PER_BUCKET);

        // Split into packets under the datagram limit.
        let mut chunks: Vec<Vec<Enr>> = vec![Vec::new()];
        let mut chunk_size = 0usize;
        for enr in enrs {
            let enr_size = enr.length();
            if chunk_size + enr_size > NODES_PAYLOAD_BUDGET && !chunks.last().unwrap().is_empty() {
                chunks.push(Vec::new());
                chunk_size = 0;
            }
            chunk_size += enr_size;
            chunks.last_mut().unwrap().push(enr);
        }

        let total = chunks.len() as u64;
        for nodes in chunks {
            let message = Message::Nodes(Nodes { id: id.clone(), total, nodes });
            self.send_response(node_address.clone(), message);
        }
    }

    /// A response to one of our requests.
    fn on_response(&mut self, node_address: NodeAddress, message: Message) {
        let request_id = message.request_id().clone();
        let Some(request) = self.active_requests.get(&request_id) else {
            trace!(target: "discv5", %node_address, id = %request_id, "response for unknown request, dropping");
            self.metrics.unsolicited_responses.increment(1);
            return
        };
        if request.contact.node_address() != node_address {
            warn!(target: "discv5", %node_address, "response from unexpected source, dropping");
            return
        }

        match message {
            Message::Pong(pong) => {
                let Some(request) = self.remove_request(&request_id) else { return };
                self.kbuckets.mark_connected(&node_address.node_id);
                self.maybe_refresh_remote_enr(&node_address, pong.enr_seq);
                self.maybe_update_local_enr(&pong);
                if let Some(RequestCallback::Ping(callback)) = request.callback {
                    let _ = callback.send(Ok(pong));
                }
            }
            Message::Nodes(nodes) => self.on_nodes_response(node_address, nodes),
            Message::TalkResponse(response) => {
                let Some(request) = self.remove_request(&request_id) else { return };
                self.kbuckets.mark_connected(&node_address.node_id);
                if let Some(RequestCallback::Talk(callback)) = request.callback {
                    let _ = callback.send(Ok(response.response.to_vec()));
                }
            }
            _ => unreachable!("only responses reach this point"),
        }
    }

    /// One page of a NODES response; completes the request once all pages arrived.
    fn on_nodes_response(&mut self, node_address: NodeAddress, nodes: Nodes) {
        let Nodes { id, total, nodes } = nodes;
        if total == 0 {
            warn!(target: "discv5", %node_address, "NODES with total 0, dropping response");
            return
        }
        let total = total.min(MAX_NODES_PER_BUCKET as u64);

        let Some(request) = self.active_requests.get_mut(&id) else { return };
        let collected = if let Some(accumulator) = &mut request.nodes {
            accumulator.received += 1;
            accumulator.nodes.extend(nodes);
            if accumulator.received < accumulator.total &&
                accumulator.nodes.len() < MAX_NODES_PER_BUCKET
            {
                // More pages are on the way, give them a fresh deadline.
                request.sent_at = Instant::now();
                return
            }
            std::mem::take(&mut accumulator.nodes)
        } else if total > 1 {
            request.nodes = Some(NodesAccumulator { total, received: 1, nodes });
            request.sent_at = Instant::now();
            return
        } else {
            nodes
        };

        let Some(request) = self.remove_request(&id) else { return };
        let mut enrs = collected;
        // Excess records beyond the per-response bound are dropped.
        enrs.truncate(MAX_NODES_PER_BUCKET);

        // Keep only records at the distances we actually asked about.
        if let Message::FindNode(FindNode { distances, .. }) = &request.message {
            enrs.retain(|enr| {
                match distance(&node_address.node_id, &enr.node_id()).log2() {
                    Some(d) => distances.contains(&d),
                    None => distances.contains(&0),
                }
            });
        }

        trace!(target: "discv5", %node_address, count = enrs.len(), "NODES response complete");
        self.kbuckets.mark_connected(&node_address.node_id);
        for enr in &enrs {
            if enr.node_id() == self.local_id {
                continue
            }
            if let InsertResult::Inserted = self.kbuckets.insert_or_update(enr.clone()) {
                self.metrics.kbucket_insertions.increment(1);
            }
            self.send_event(Discv5Event::Discovered(enr.clone()));
        }

        if let Some(lookup_id) = request.lookup {
            if let Some(state) = self.lookups.get_mut(&lookup_id) {
                state.lookup.on_success(&node_address.node_id, enrs);
            }
            self.advance_lookup(lookup_id);
        }
    }

    /* Session bookkeeping */

    fn on_session_established(&mut self, node_address: &NodeAddress, enr: Enr) {
        debug!(target: "discv5", %node_address, "session established");
        self.metrics.established_sessions.increment(1);
        if let InsertResult::Inserted = self.kbuckets.insert_or_update(enr.clone()) {
            self.metrics.kbucket_insertions.increment(1);
        }
        self.kbuckets.mark_connected(&node_address.node_id);
        self.send_event(Discv5Event::SessionEstablished(enr, node_address.socket_addr));
    }

    /// Re-submits the requests that were queued behind a completed handshake.
    fn flush_pending(&mut self, node_address: NodeAddress) {
        if let Some(pending) = self.pending_requests.remove(&node_address) {
            for PendingRequest { contact, message, callback, lookup } in pending {
                self.send_request(contact, message, callback, lookup);
            }
        }
    }

    /// Drops a session and fails everything queued on it.
    fn drop_session(&mut self, node_address: &NodeAddress, error: RequestError) {
        if self.sessions.remove(node_address).is_some() {
            self.metrics.active_sessions.set(self.sessions.len() as f64);
        }
        self.handshake_deadlines.remove(node_address);
        if let Some(pending) = self.pending_requests.remove(node_address) {
            for PendingRequest { callback, lookup, contact, .. } in pending {
                self.complete_failed(callback, lookup, &contact.node_id(), error.clone());
            }
        }
    }

    fn remove_request(&mut self, request_id: &RequestId) -> Option<ActiveRequest> {
        let request = self.active_requests.remove(request_id)?;
        self.nonce_to_request.remove(&request.packet_nonce);
        Some(request)
    }

    /// Fails a single request and tears down its unestablished session, if any.
    fn fail_request(&mut self, request_id: &RequestId, error: RequestError) {
        let Some(request) = self.remove_request(request_id) else { return };
        let node_address = request.contact.node_address();
        self.kbuckets.mark_disconnected(&node_address.node_id);
        self.complete_failed(request.callback, request.lookup, &node_address.node_id, error.clone());

        let keyed =
            self.sessions.get(&node_address).map(|session| session.is_keyed()).unwrap_or(true);
        if !keyed {
            // The handshake never completed; everything queued behind it fails too.
            self.drop_session(&node_address, error);
        }
    }

    /// Delivers a failure to a request's callback and lookup.
    fn complete_failed(
        &mut self,
        callback: Option<RequestCallback>,
        lookup: Option<LookupId>,
        node_id: &NodeId,
        error: RequestError,
    ) {
        match callback {
            Some(RequestCallback::Ping(tx)) => {
                let _ = tx.send(Err(error));
            }
            Some(RequestCallback::Talk(tx)) => {
                let _ = tx.send(Err(error));
            }
            None => {}
        }
        if let Some(lookup_id) = lookup {
            if let Some(state) = self.lookups.get_mut(&lookup_id) {
                state.lookup.on_failure(node_id);
            }
            self.advance_lookup(lookup_id);
        }
    }

    /* Lookups */

    fn start_lookup(
        &mut self,
        target: NodeId,
        callback: oneshot::Sender<Result<Vec<Enr>, RequestError>>,
    ) {
        let seeds = self.kbuckets.nearest(&target, self.config.lookup_num_results);
        debug!(target: "discv5", seeds = seeds.len(), "starting lookup");
        let lookup = Lookup::new(
            target,
            seeds,
            self.config.lookup_parallelism,
            self.config.lookup_num_results,
            self.config.lookup_request_limit,
            self.config.lookup_timeout,
        );
        let lookup_id = LookupId(self.next_lookup_id);
        self.next_lookup_id = self.next_lookup_id.wrapping_add(1);
        self.lookups.insert(lookup_id, LookupState { lookup, callback });
        self.advance_lookup(lookup_id);
    }

    /// Drives a lookup forward: completes it or queries the next batch of peers.
    fn advance_lookup(&mut self, lookup_id: LookupId) {
        loop {
            let (finished, batch, target) = match self.lookups.get_mut(&lookup_id) {
                Some(state) => {
                    let done = state.lookup.is_finished() || state.lookup.is_timed_out();
                    let batch = if done { Vec::new() } else { state.lookup.next_peers() };
                    (done, batch, state.lookup.target())
                }
                None => return,
            };

            if finished {
                if let Some(state) = self.lookups.remove(&lookup_id) {
                    let results = state.lookup.into_results();
                    debug!(target: "discv5", results = results.len(), "lookup finished");
                    let _ = state.callback.send(Ok(results));
                }
                return
            }
            if batch.is_empty() {
                return
            }

            let mut unreachable_peers = Vec::new();
            for enr in batch {
                let node_id = enr.node_id();
                match NodeContact::try_from_enr(enr) {
                    Ok(contact) => {
                        let message = Message::FindNode(FindNode {
                            id: RequestId::random(),
                            distances: lookup_distances(&target, &node_id),
                        });
                        self.send_request(contact, message, None, Some(lookup_id));
                    }
                    Err(_) => unreachable_peers.push(node_id),
                }
            }
            if unreachable_peers.is_empty() {
                return
            }
            if let Some(state) = self.lookups.get_mut(&lookup_id) {
                for node_id in &unreachable_peers {
                    state.lookup.on_failure(node_id);
                }
            }
            // Failures may have freed query slots or finished the lookup, go around again.
        }
    }

    /* ENR maintenance */

    /// Requests a peer's fresh record when it advertises a newer sequence number than the one
    /// we hold.
    fn maybe_refresh_remote_enr(&mut self, node_address: &NodeAddress, advertised_seq: u64) {
        let Some(entry) = self.kbuckets.get(&node_address.node_id) else { return };
        if advertised_seq <= entry.enr.seq() {
            return
        }
        let Ok(contact) = NodeContact::try_from_enr(entry.enr.clone()) else { return };
        debug!(target: "discv5", %node_address, advertised_seq, "peer has newer record, requesting it");
        let message =
            Message::FindNode(FindNode { id: RequestId::random(), distances: vec![0] });
        self.send_request(contact, message, None, None);
    }

    /// Updates the local record from a PONG-observed endpoint.
    fn maybe_update_local_enr(&mut self, pong: &Pong) {
        if !self.config.enr_update {
            return
        }
        let observed = pong.recipient_socket();
        let advertised = {
            let local_enr = self.local_enr.read();
            match observed {
                SocketAddr::V4(_) => local_enr.udp4_socket().map(SocketAddr::V4),
                SocketAddr::V6(_) => local_enr.udp6_socket().map(SocketAddr::V6),
            }
        };
        if advertised == Some(observed) {
            return
        }

        debug!(target: "discv5", %observed, "observed endpoint differs from record, updating local ENR");
        let result = self.local_enr.write().set_udp_socket(observed, &self.local_key);
        match result {
            Ok(()) => self.send_event(Discv5Event::SocketUpdated(observed)),
            Err(err) => warn!(target: "discv5", ?err, "failed to update local ENR"),
        }
    }

    /* Timers */

    fn on_tick(&mut self) {
        let now = Instant::now();

        // Request timeouts and retransmissions.
        let timed_out: Vec<RequestId> = self
            .active_requests
            .iter()
            .filter(|(_, request)| now.duration_since(request.sent_at) >= self.config.request_timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for request_id in timed_out {
            let resend = {
                let Some(request) = self.active_requests.get_mut(&request_id) else { continue };
                // A sibling request to the same peer can tear the session down mid-handshake;
                // a re-send is only worth it while the session is still live.
                let session_live = self
                    .sessions
                    .get(&request.contact.node_address())
                    .map(|session| session.is_keyed() || session.challenge().is_some())
                    .unwrap_or(false);
                if session_live && request.retries < self.config.request_retries {
                    request.retries += 1;
                    request.sent_at = now;
                    Some((request.contact.node_address().socket_addr, request.encoded.clone()))
                } else {
                    None
                }
            };
            match resend {
                Some((dst, encoded)) => {
                    trace!(target: "discv5", %dst, id = %request_id, "re-sending request");
                    self.send_datagram(dst, encoded);
                }
                None => {
                    debug!(target: "discv5", id = %request_id, "request timed out");
                    self.metrics.request_timeouts.increment(1);
                    self.fail_request(&request_id, RequestError::Timeout);
                }
            }
        }

        // Expired handshakes drop their session and everything buffered on it.
        let expired: Vec<NodeAddress> = self
            .handshake_deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(node_address, _)| node_address.clone())
            .collect();
        for node_address in expired {
            debug!(target: "discv5", %node_address, "handshake timed out, dropping session");
            self.drop_session(&node_address, RequestError::Timeout);
        }

        // Lookup deadlines: completing with whatever was found so far.
        let lookup_deadlines: Vec<LookupId> = self
            .lookups
            .iter()
            .filter(|(_, state)| state.lookup.is_timed_out())
            .map(|(id, _)| *id)
            .collect();
        for lookup_id in lookup_deadlines {
            self.advance_lookup(lookup_id);
        }
    }

    /// Liveness maintenance: expire idle sessions and re-ping connected table entries.
    fn on_ping_interval(&mut self) {
        let session_timeout = self.config.session_timeout;
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.is_expired(session_timeout));
        if self.sessions.len() != before {
            self.metrics.active_sessions.set(self.sessions.len() as f64);
        }

        for enr in self.kbuckets.connected_entries() {
            let Ok(contact) = NodeContact::try_from_enr(enr) else { continue };
            let message = Message::Ping(Ping {
                id: RequestId::random(),
                enr_seq: self.local_enr.read().seq(),
            });
            self.send_request(contact, message, None, None);
        }
    }

    /* Shutdown */

    /// Fails everything in flight with [`RequestError::Shutdown`].
    fn on_shutdown(&mut self) {
        debug!(target: "discv5", "service shutting down");
        let request_ids: Vec<RequestId> = self.active_requests.keys().cloned().collect();
        for request_id in request_ids {
            if let Some(request) = self.remove_request(&request_id) {
                self.complete_failed(
                    request.callback,
                    request.lookup,
                    &request.contact.node_id(),
                    RequestError::Shutdown,
                );
            }
        }
        for (_, pending) in std::mem::take(&mut self.pending_requests) {
            for PendingRequest { callback, contact, lookup, .. } in pending {
                self.complete_failed(callback, lookup, &contact.node_id(), RequestError::Shutdown);
            }
        }
        for (_, state) in std::mem::take(&mut self.lookups) {
            let _ = state.callback.send(Err(RequestError::Shutdown));
        }
        self.sessions.clear();
        self.metrics.active_sessions.set(0.0);
    }

    fn send_event(&mut self, event: Discv5Event) {
        self.event_listeners.retain(|listener| match listener.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                trace!(target: "discv5", "event listener lagging, dropping event");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}
