/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::collections::HashMap;
use std::net::SocketAddr;

use rand::Rng;
use tracing::{debug, trace, warn};

use crate::frame::{Frame, FRAME_CAPACITY};
use crate::peer::{Peer, PeerOptions};
use crate::protocol::{ETHER_HEADER_SIZE, ETHER_SOURCE_MAC, MTU_PROBES_PER_TICK, MTU_PROBE_MIN_LEN};
use crate::mtu::TickOutcome;

/// Stable handle to a peer record in the mesh arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub(crate) u32);

/// Stable handle to a graph edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EdgeId(pub(crate) u32);

/// Stable handle to a peer control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub(crate) u32);

/// Interface to the host environment: sockets, the virtual network device,
/// the control channels, and the handshake layer.
///
/// These are callbacks the datapath invokes while processing a packet or a
/// timer tick. The whole datapath runs on one cooperative thread, so
/// implementations must not call back into the mesh re-entrantly.
pub trait SystemInterface {
    /// Send a datagram from the given listening socket. Synchronous socket
    /// errors must be reported: an oversize error (EMSGSIZE) feeds path MTU
    /// discovery; anything else is merely logged.
    fn send_udp(&self, socket: usize, destination: &SocketAddr, datagram: &[u8]) -> std::io::Result<()>;

    /// Update the IP TOS byte on a listening socket. Only invoked when the
    /// value actually changes; the mesh remembers the last value per socket.
    fn set_tos(&self, socket: usize, tos: u8);

    /// Push a frame over a peer control channel. Returning false means the
    /// channel is broken and will be torn down.
    fn send_tcp(&self, connection: ConnectionId, frame: &[u8]) -> bool;

    /// Tear down a control channel after a failed send.
    fn terminate_connection(&self, connection: ConnectionId);

    /// Deliver a frame to the local virtual network device.
    fn write_frame(&self, frame: &[u8]);

    /// Ask the handshake layer to negotiate session keys with a peer.
    fn request_key(&self, peer: PeerId);

    /// Ask the handshake layer to roll this node's own key material.
    fn regenerate_key(&self);

    /// Monotonic time in milliseconds.
    fn time_ticks(&self) -> i64;
}

/// Interface between the datapath and the inner routing layer.
pub trait InnerProtocol {
    /// Hand over a frame that passed authentication, decryption, the replay
    /// window and decompression. Exactly one call per accepted packet.
    fn route(&self, source: PeerId, frame: &mut Frame);
}

/// Process-wide datapath configuration.
#[derive(Clone)]
pub struct Config {
    /// Name of the local node, for logs.
    pub name: String,
    /// Mirror the priority hint of outgoing frames into the IPv4 TOS byte.
    pub priority_inheritance: bool,
    /// Act as a tunnel server: never relay broadcasts for other nodes.
    pub tunnel_server: bool,
    /// Rewrite the source MAC of frames delivered to the local device.
    pub overwrite_mac: Option<[u8; 6]>,
    /// Force all of this node's traffic onto the TCP control channels.
    pub tcp_only: bool,
    /// Own-key lifetime in milliseconds; 0 disables timed rekeying.
    pub key_lifetime: i64,
    /// MTU of the virtual device; upper bound for path MTU discovery.
    pub device_mtu: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "trellis".to_owned(),
            priority_inheritance: false,
            tunnel_server: false,
            overwrite_mac: None,
            tcp_only: false,
            key_lifetime: 3_600_000,
            device_mtu: 1500,
        }
    }
}

pub(crate) struct Edge {
    pub(crate) to: PeerId,
    pub(crate) address: SocketAddr,
}

pub(crate) struct Connection {
    pub(crate) peer: PeerId,
    pub(crate) mst: bool,
}

pub(crate) struct ListenSocket {
    pub(crate) ipv6: bool,
    // Last TOS value applied to this socket, so the sockopt is only touched
    // when the outgoing priority actually changes.
    pub(crate) tos: u8,
}

/// The datapath context.
///
/// Owns the peer, edge and connection arenas (stable integer handles; the
/// graph collaborators insert and remove entries), the address index for
/// inbound peer lookup, the listening socket table, and the key lifetime
/// clock. All methods assume the single-threaded cooperative model: a packet
/// either completes its pipeline or is dropped within one call.
pub struct Mesh {
    pub(crate) config: Config,
    pub(crate) local: PeerId,
    pub(crate) peers: Vec<Option<Peer>>,
    pub(crate) edges: Vec<Option<Edge>>,
    pub(crate) connections: Vec<Option<Connection>>,
    pub(crate) addr_index: HashMap<SocketAddr, PeerId>,
    pub(crate) sockets: Vec<ListenSocket>,
    pub(crate) key_expires: i64,
    pub(crate) rekey_requested: bool,
}

impl Mesh {
    pub fn new(config: Config) -> Self {
        let mut mesh = Self {
            local: PeerId(0),
            peers: Vec::new(),
            edges: Vec::new(),
            connections: Vec::new(),
            addr_index: HashMap::new(),
            sockets: Vec::new(),
            key_expires: 0,
            rekey_requested: false,
            config,
        };
        let name = mesh.config.name.clone();
        mesh.local = mesh.add_peer(&name, "localhost", PeerOptions::default());
        if let Some(p) = mesh.peer_entry_mut(mesh.local) {
            p.reachable = true;
        }
        mesh
    }

    /// Handle of the local node itself.
    #[inline(always)]
    pub fn local(&self) -> PeerId {
        self.local
    }

    #[inline(always)]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register a listening socket. The index returned is the one passed
    /// back to [SystemInterface::send_udp]; registration order decides the
    /// "first matching family" egress rule.
    pub fn add_listen_socket(&mut self, ipv6: bool) -> usize {
        self.sockets.push(ListenSocket { ipv6, tos: 0 });
        self.sockets.len() - 1
    }

    pub fn add_peer(&mut self, name: &str, hostname: &str, options: PeerOptions) -> PeerId {
        self.peers.push(Some(Peer::new(name, hostname, options)));
        PeerId((self.peers.len() - 1) as u32)
    }

    pub fn remove_peer(&mut self, id: PeerId) {
        if id == self.local {
            return;
        }
        if let Some(slot) = self.peers.get_mut(id.0 as usize) {
            if let Some(p) = slot.take() {
                if let Some(addr) = p.address {
                    if self.addr_index.get(&addr) == Some(&id) {
                        self.addr_index.remove(&addr);
                    }
                }
            }
        }
    }

    #[inline(always)]
    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(id.0 as usize).and_then(|p| p.as_ref())
    }

    #[inline(always)]
    pub(crate) fn peer_entry_mut(&mut self, id: PeerId) -> Option<&mut Peer> {
        self.peers.get_mut(id.0 as usize).and_then(|p| p.as_mut())
    }

    pub fn add_edge(&mut self, to: PeerId, address: SocketAddr) -> EdgeId {
        self.edges.push(Some(Edge { to, address }));
        EdgeId((self.edges.len() - 1) as u32)
    }

    pub fn remove_edge(&mut self, id: EdgeId) {
        if let Some(slot) = self.edges.get_mut(id.0 as usize) {
            *slot = None;
        }
    }

    pub fn add_connection(&mut self, peer: PeerId, mst: bool) -> ConnectionId {
        self.connections.push(Some(Connection { peer, mst }));
        ConnectionId((self.connections.len() - 1) as u32)
    }

    pub fn remove_connection(&mut self, id: ConnectionId) {
        for p in self.peers.iter_mut().flatten() {
            if p.connection == Some(id) {
                p.connection = None;
            }
        }
        if let Some(slot) = self.connections.get_mut(id.0 as usize) {
            *slot = None;
        }
    }

    /// Flag a connection as part of the broadcast spanning tree.
    pub fn set_connection_mst(&mut self, id: ConnectionId, mst: bool) {
        if let Some(c) = self.connections.get_mut(id.0 as usize).and_then(|c| c.as_mut()) {
            c.mst = mst;
        }
    }

    pub fn set_nexthop(&mut self, id: PeerId, nexthop: Option<PeerId>) {
        if let Some(p) = self.peer_entry_mut(id) {
            p.nexthop = nexthop;
        }
    }

    pub fn set_via(&mut self, id: PeerId, via: Option<PeerId>) {
        if let Some(p) = self.peer_entry_mut(id) {
            p.via = via;
        }
    }

    pub fn set_connection(&mut self, id: PeerId, connection: Option<ConnectionId>) {
        if let Some(p) = self.peer_entry_mut(id) {
            p.connection = connection;
        }
    }

    /// Record the peer's current UDP address and index it for ingress lookup.
    pub fn set_peer_address(&mut self, id: PeerId, address: SocketAddr) {
        let old = match self.peer_entry_mut(id) {
            Some(p) => p.address.replace(address),
            None => return,
        };
        if let Some(old) = old {
            if self.addr_index.get(&old) == Some(&id) {
                self.addr_index.remove(&old);
            }
        }
        self.addr_index.insert(address, id);
    }

    /// Reachability transition. Becoming reachable restarts path MTU
    /// discovery from scratch.
    pub fn set_reachable(&mut self, id: PeerId, reachable: bool) {
        let device_mtu = self.config.device_mtu.min(FRAME_CAPACITY as u16);
        if let Some(p) = self.peer_entry_mut(id) {
            if p.reachable != reachable {
                p.reachable = reachable;
                if reachable {
                    p.pmtu.restart(device_mtu, p.options.pmtu_discovery);
                } else {
                    p.pmtu.probing = false;
                }
                debug!("node {} became {}", p.name, if reachable { "reachable" } else { "unreachable" });
            }
        }
    }

    /// Install the inbound session for a peer. Resets the replay window:
    /// the remote end restarts its counter with the new key.
    pub fn set_session_in(&mut self, id: PeerId, session: crate::session::SessionState) {
        if let Some(p) = self.peer_entry_mut(id) {
            p.session_in = Some(session);
            p.replay.reset();
        }
    }

    /// Install the outbound session for a peer, marking its key valid and
    /// restarting the send counter.
    pub fn set_session_out(&mut self, id: PeerId, session: crate::session::SessionState) {
        if let Some(p) = self.peer_entry_mut(id) {
            p.session_out = Some(session);
            p.sent_seqno = 0;
            p.valid_key = true;
            p.waiting_for_key = false;
        }
    }

    /// Mark a peer's outbound key unusable; the next packet for it will
    /// trigger a key request and fall back to TCP.
    pub fn invalidate_key(&mut self, id: PeerId) {
        if let Some(p) = self.peer_entry_mut(id) {
            p.valid_key = false;
        }
    }

    /// Note that the handshake layer finished rolling the local key, so the
    /// lifetime clock restarts.
    pub fn key_regenerated(&mut self, time: i64) {
        self.rekey_requested = false;
        self.key_expires = if self.config.key_lifetime > 0 { time + self.config.key_lifetime } else { 0 };
    }

    /// Send a frame to a node, choosing the transport.
    ///
    /// Local delivery goes straight to the device. Otherwise the frame goes
    /// to the re-encryption hop (`via`), or the forwarding hop when the
    /// frame is pinned to TCP or `via` is ourselves; TCP-only peers and
    /// pinned frames use the control channel, everything else UDP.
    pub fn send_packet<H: SystemInterface>(&mut self, host: &H, node: PeerId, frame: &mut Frame) {
        if node == self.local {
            if let Some(mac) = self.config.overwrite_mac {
                if frame.len() >= ETHER_HEADER_SIZE {
                    frame.payload_mut()[ETHER_SOURCE_MAC].copy_from_slice(&mac);
                }
            }
            host.write_frame(frame.payload());
            return;
        }

        let (reachable, via) = match self.peer(node) {
            Some(p) => {
                let via = if frame.priority() == -1 || p.via == Some(self.local) || p.via.is_none() {
                    p.nexthop
                } else {
                    p.via
                };
                (p.reachable, via)
            }
            None => return,
        };
        if !reachable {
            debug!("dropping packet for unreachable node");
            return;
        }
        let via = match via {
            Some(v) => v,
            None => {
                debug!("no route to node, dropping packet");
                return;
            }
        };

        let via_tcp_only = self.peer(via).map_or(false, |v| v.options.tcp_only);
        if frame.priority() == -1 || self.config.tcp_only || via_tcp_only {
            let connection = self.peer(via).and_then(|v| v.connection);
            self.send_via_tcp(host, connection, frame);
        } else {
            self.send_udp_packet(host, via, frame);
        }
    }

    /// Flood a frame along the broadcast spanning tree.
    ///
    /// A frame arriving from elsewhere is also delivered locally. The
    /// connection it arrived through (the origin's forwarding hop) is never
    /// sent back to, which keeps the flood acyclic; in tunnel-server mode
    /// foreign broadcasts are not relayed at all.
    pub fn broadcast_packet<H: SystemInterface>(&mut self, host: &H, from: PeerId, frame: &mut Frame) {
        if from != self.local {
            let local = self.local;
            self.send_packet(host, local, frame);
            if self.config.tunnel_server {
                return;
            }
        }

        let exclude = self
            .peer(from)
            .and_then(|p| p.nexthop)
            .and_then(|nh| self.peer(nh))
            .and_then(|nh| nh.connection);

        let targets: Vec<PeerId> = self
            .connections
            .iter()
            .enumerate()
            .filter_map(|(i, c)| {
                let c = c.as_ref()?;
                (c.mst && exclude != Some(ConnectionId(i as u32))).then_some(c.peer)
            })
            .collect();
        for node in targets {
            self.send_packet(host, node, frame);
        }
    }

    /// Entry point for a datagram read from a listening socket.
    pub fn receive_udp_datagram<H: SystemInterface, R: InnerProtocol>(
        &mut self,
        host: &H,
        router: &R,
        source: SocketAddr,
        datagram: &[u8],
    ) {
        let node = match self.addr_index.get(&source) {
            Some(&id) => Some(id),
            None => self.try_harder(source, datagram),
        };
        match node {
            Some(id) => self.receive_udp_packet(host, router, id, datagram),
            None => trace!("received UDP packet from unknown source {}", source),
        }
    }

    /// Fuzzy source lookup: the peer may have moved ports (NAT rebind). Try
    /// every edge with a matching address regardless of port and adopt the
    /// first whose inbound key authenticates this very datagram. A peer that
    /// matches by address but not by MAC is only named in the log; the
    /// packet is still dropped.
    fn try_harder(&mut self, source: SocketAddr, datagram: &[u8]) -> Option<PeerId> {
        let mut fallback: Option<PeerId> = None;
        let mut found: Option<PeerId> = None;
        for e in self.edges.iter().flatten() {
            if e.address.ip() != source.ip() {
                continue;
            }
            let p = match self.peer(e.to) {
                Some(p) => p,
                None => continue,
            };
            let verified = p
                .session_in
                .as_ref()
                .map_or(false, |s| s.digest().is_some() && s.verify_wire(datagram));
            if verified {
                found = Some(e.to);
                break;
            }
            fallback = Some(e.to);
        }

        if let Some(id) = found {
            self.set_peer_address(id, source);
            if let Some(p) = self.peer(id) {
                debug!("learned new UDP address {} for node {}", source, p.name);
            }
            return Some(id);
        }
        if let Some(id) = fallback {
            if let Some(p) = self.peer(id) {
                debug!("received UDP packet from unknown source {} (possibly {})", source, p.name);
            }
        }
        None
    }

    /// Periodic background work: MTU probe timers and the key lifetime.
    /// Call roughly once per second from the event loop.
    pub fn service<H: SystemInterface>(&mut self, host: &H) {
        let time = host.time_ticks();

        if self.rekey_requested {
            host.regenerate_key();
            self.rekey_requested = false;
        }
        if self.config.key_lifetime > 0 {
            if self.key_expires == 0 {
                self.key_expires = time + self.config.key_lifetime;
            } else if time >= self.key_expires {
                debug!("key lifetime elapsed, requesting regeneration");
                host.regenerate_key();
                self.key_expires = time + self.config.key_lifetime;
            }
        }

        let due: Vec<PeerId> = self
            .peers
            .iter_mut()
            .enumerate()
            .filter_map(|(i, p)| {
                let p = p.as_mut()?;
                (p.pmtu.probing && p.pmtu.gate.gate(time)).then_some(PeerId(i as u32))
            })
            .collect();
        for id in due {
            self.mtu_probe_tick(host, id);
        }
    }

    /// One MTU probe timer tick for one peer.
    fn mtu_probe_tick<H: SystemInterface>(&mut self, host: &H, id: PeerId) {
        let (outcome, lo, hi, mtu, name) = match self.peer_entry_mut(id) {
            Some(p) => {
                let outcome = p.pmtu.tick();
                (outcome, p.pmtu.min_mtu, p.pmtu.max_mtu, p.pmtu.mtu, p.name.clone())
            }
            None => return,
        };

        match outcome {
            TickOutcome::NoResponse => {
                debug!("node {} did not respond to MTU probes", name);
            }
            TickOutcome::Fixed => {
                debug!("fixed MTU of node {} at {}", name, mtu);
            }
            TickOutcome::Probe => {
                if hi < MTU_PROBE_MIN_LEN {
                    return;
                }
                let floor = MTU_PROBE_MIN_LEN.max(lo + 1).min(hi);
                let mut rng = rand::thread_rng();
                for _ in 0..MTU_PROBES_PER_TICK {
                    let len = rng.gen_range(floor..=hi) as usize;
                    let mut probe = Frame::new();
                    probe.set_len(len);
                    rng.fill(&mut probe.payload_mut()[ETHER_HEADER_SIZE..]);
                    trace!("sending {} byte MTU probe to {}", len, name);
                    self.send_udp_packet(host, id, &mut probe);
                }
            }
        }
    }

    /// Inbound frame with EtherType zero: either one of our probes coming
    /// back, or a probe from the peer that wants reflecting.
    pub(crate) fn handle_mtu_probe<H: SystemInterface>(
        &mut self,
        host: &H,
        id: PeerId,
        frame: &mut Frame,
        origlen: usize,
    ) {
        if frame.is_empty() {
            return;
        }
        if frame.payload()[0] == 0 {
            // An outbound probe from the peer: flip the marker and send it
            // back through normal dispatch, so the reply can take the TCP
            // path if UDP is not usable yet.
            frame.payload_mut()[0] = 1;
            self.send_packet(host, id, frame);
        } else if let Some(p) = self.peer_entry_mut(id) {
            trace!("got {} byte MTU probe reply from {}", origlen, p.name);
            p.pmtu.confirm(origlen.min(u16::MAX as usize) as u16);
        }
    }

    /// Final ingress step shared by the UDP and TCP paths: hand an accepted
    /// frame to the routing layer.
    pub(crate) fn receive_packet<R: InnerProtocol>(&mut self, router: &R, id: PeerId, frame: &mut Frame) {
        if let Some(p) = self.peer(id) {
            trace!("received packet of {} bytes from {}", frame.len(), p.name);
        }
        router.route(id, frame);
    }

    /// Push a frame over a control channel, tearing the channel down if the
    /// write fails.
    pub(crate) fn send_via_tcp<H: SystemInterface>(
        &self,
        host: &H,
        connection: Option<ConnectionId>,
        frame: &Frame,
    ) {
        match connection {
            Some(c) => {
                if !host.send_tcp(c, frame.payload()) {
                    warn!("control channel write failed, terminating connection");
                    host.terminate_connection(c);
                }
            }
            None => debug!("no control connection for TCP fallback, dropping packet"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use crate::protocol::MAX_SEQNO;
    use crate::testhost::{mesh_with_peer, plaintext_pair, secured_session, TestHost, TestRouter};
    use crate::{Config, Frame, Mesh, PeerOptions};
    use crate::mesh::SystemInterface;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn local_delivery_overwrites_source_mac() {
        let host = TestHost::new();
        let config = Config { overwrite_mac: Some([0xaa; 6]), ..Config::default() };
        let mut mesh = Mesh::new(config);
        let local = mesh.local();

        let mut frame = Frame::from_payload(&[1_u8; 64]).unwrap();
        mesh.send_packet(&host, local, &mut frame);
        let device = host.device.lock();
        assert_eq!(device.len(), 1);
        assert_eq!(&device[0][6..12], &[0xaa; 6]);
        assert_eq!(&device[0][..6], &[1_u8; 6]);
    }

    #[test]
    fn unreachable_node_drops_silently() {
        let host = TestHost::new();
        let mut mesh = Mesh::new(Config::default());
        mesh.add_listen_socket(false);
        let peer = mesh.add_peer("peer", "", PeerOptions::default());

        let mut frame = Frame::from_payload(&[1_u8; 64]).unwrap();
        mesh.send_packet(&host, peer, &mut frame);
        assert!(host.udp.lock().is_empty());
        assert!(host.tcp.lock().is_empty());
        assert!(host.key_requests.lock().is_empty());
    }

    #[test]
    fn pinned_priority_stays_on_tcp() {
        let host = TestHost::new();
        let (mut mesh, peer) =
            mesh_with_peer(Config::default(), PeerOptions::default(), "10.0.0.2:655", Some(plaintext_pair()));
        let conn = mesh.add_connection(peer, false);
        mesh.set_connection(peer, Some(conn));

        let mut frame = Frame::from_payload(&[4_u8; 80]).unwrap();
        frame.set_priority(-1);
        mesh.send_packet(&host, peer, &mut frame);
        assert!(host.udp.lock().is_empty());
        assert_eq!(host.tcp.lock().len(), 1);
    }

    #[test]
    fn broadcast_walks_mst_and_skips_origin() {
        let host = TestHost::new();
        let mut mesh = Mesh::new(Config::default());
        mesh.add_listen_socket(false);

        let mut nodes = Vec::new();
        for (i, name) in ["b", "c", "d"].iter().enumerate() {
            let id = mesh.add_peer(name, "", PeerOptions::default());
            mesh.set_peer_address(id, addr(&format!("10.0.0.{}:655", i + 2)));
            mesh.set_nexthop(id, Some(id));
            mesh.set_via(id, Some(id));
            mesh.set_reachable(id, true);
            let (sin, sout) = plaintext_pair();
            mesh.set_session_in(id, sin);
            mesh.set_session_out(id, sout);
            nodes.push(id);
        }
        let (b, c, d) = (nodes[0], nodes[1], nodes[2]);
        let cb = mesh.add_connection(b, true);
        mesh.set_connection(b, Some(cb));
        let cc = mesh.add_connection(c, true);
        mesh.set_connection(c, Some(cc));
        let cd = mesh.add_connection(d, false);
        mesh.set_connection(d, Some(cd));

        // Foreign broadcast: delivered locally, relayed along the MST but
        // never back through the connection it came from.
        let mut frame = Frame::from_payload(&[9_u8; 60]).unwrap();
        mesh.broadcast_packet(&host, b, &mut frame);
        assert_eq!(host.device.lock().len(), 1);
        let sent = host.udp.lock();
        assert_eq!(sent.len(), 1, "only the MST edge toward c relays");
        assert_eq!(sent[0].1, addr("10.0.0.3:655"));
        drop(sent);

        // Our own broadcast fans out to every MST connection.
        let local = mesh.local();
        mesh.broadcast_packet(&host, local, &mut frame);
        assert_eq!(host.device.lock().len(), 1, "own broadcasts are not looped back");
        assert_eq!(host.udp.lock().len(), 3);
    }

    #[test]
    fn tunnel_server_does_not_relay_foreign_broadcasts() {
        let host = TestHost::new();
        let config = Config { tunnel_server: true, ..Config::default() };
        let (mut mesh, peer) =
            mesh_with_peer(config, PeerOptions::default(), "10.0.0.2:655", Some(plaintext_pair()));
        let conn = mesh.add_connection(peer, true);
        mesh.set_connection(peer, Some(conn));

        let mut frame = Frame::from_payload(&[9_u8; 60]).unwrap();
        mesh.broadcast_packet(&host, peer, &mut frame);
        assert_eq!(host.device.lock().len(), 1);
        assert!(host.udp.lock().is_empty());
    }

    #[test]
    fn ip_traffic_waits_for_path_mtu_on_tcp() {
        let host = TestHost::new();
        let options = PeerOptions { tcp_only: false, pmtu_discovery: true };
        let (mut mesh, peer) =
            mesh_with_peer(Config::default(), options, "10.0.0.2:655", Some(plaintext_pair()));
        let conn = mesh.add_connection(peer, false);
        mesh.set_connection(peer, Some(conn));

        let mut payload = [0_u8; 100];
        payload[12] = 0x08; // IPv4 EtherType
        let mut frame = Frame::from_payload(&payload).unwrap();
        mesh.send_packet(&host, peer, &mut frame);
        assert!(host.udp.lock().is_empty(), "IP frames must not race MTU discovery");
        assert_eq!(host.tcp.lock().len(), 1);
    }

    #[test]
    fn mtu_probe_discovery_converges() {
        let host_a = TestHost::new();
        let host_b = TestHost::new();
        let router = TestRouter::new();
        let options = PeerOptions { tcp_only: false, pmtu_discovery: true };
        let (mut a, b_in_a) =
            mesh_with_peer(Config::default(), options, "10.0.0.2:655", Some(plaintext_pair()));
        let (mut b, _a_in_b) =
            mesh_with_peer(Config::default(), PeerOptions::default(), "10.0.0.1:655", Some(plaintext_pair()));

        host_a.advance(1000);
        a.service(&host_a);
        let probes: Vec<Vec<u8>> = host_a.udp.lock().iter().map(|s| s.2.clone()).collect();
        assert_eq!(probes.len(), 3, "one tick emits three probes");
        for wire in &probes {
            let len = wire.len() - 4;
            assert!((64..=1500).contains(&len));
            assert!(wire[4..18].iter().all(|b| *b == 0), "probes carry a zeroed Ethernet header");
        }

        // The peer reflects each probe with the first byte flipped to 1.
        for wire in &probes {
            b.receive_udp_datagram(&host_b, &router, addr("10.0.0.1:655"), wire);
        }
        let replies: Vec<Vec<u8>> = host_b.udp.lock().iter().map(|s| s.2.clone()).collect();
        assert_eq!(replies.len(), 3);
        assert!(replies.iter().all(|w| w[4] == 1));
        for wire in &replies {
            a.receive_udp_datagram(&host_a, &router, addr("10.0.0.2:655"), wire);
        }
        let confirmed = a.peer(b_in_a).unwrap().pmtu().min_mtu;
        assert!(confirmed >= 68, "largest reflected datagram confirms the lower bound");

        // Drive the prober to its attempt budget; it must latch and disarm.
        for _ in 0..40 {
            host_a.advance(1000);
            a.service(&host_a);
        }
        let pmtu = a.peer(b_in_a).unwrap().pmtu();
        assert!(pmtu.fixed());
        assert!(pmtu.mtu >= 64);
        let sent_before = host_a.udp.lock().len();
        host_a.advance(5000);
        a.service(&host_a);
        assert_eq!(host_a.udp.lock().len(), sent_before, "no probes after the MTU is fixed");
        assert!(router.routed.lock().is_empty(), "probe traffic never reaches the router");
    }

    #[test]
    fn fuzzy_lookup_adopts_rebound_source_port() {
        let host_a = TestHost::new();
        let host_b = TestHost::new();
        let router = TestRouter::new();
        let (mut a, bob) = mesh_with_peer(
            Config::default(),
            PeerOptions::default(),
            "10.0.0.2:655",
            Some((secured_session(0), secured_session(0))),
        );
        a.add_edge(bob, addr("10.0.0.2:655"));
        let (mut b, alice_in_b) = mesh_with_peer(
            Config::default(),
            PeerOptions::default(),
            "10.0.0.1:655",
            Some((secured_session(0), secured_session(0))),
        );

        let mut frame = Frame::from_payload(&[0xab_u8; 100]).unwrap();
        b.send_packet(&host_b, alice_in_b, &mut frame);
        let wire = host_b.udp.lock()[0].2.clone();

        // Same host, NAT-rebound port: the edge matches by address and the
        // MAC verifies, so the new source is adopted.
        a.receive_udp_datagram(&host_a, &router, addr("10.0.0.2:9999"), &wire);
        assert_eq!(router.routed.lock().len(), 1);
        assert_eq!(a.peer(bob).unwrap().address(), Some(addr("10.0.0.2:9999")));

        // A source that matches no edge at all stays unknown.
        b.send_packet(&host_b, alice_in_b, &mut frame);
        let wire2 = host_b.udp.lock()[1].2.clone();
        a.receive_udp_datagram(&host_a, &router, addr("10.9.9.9:1"), &wire2);
        assert_eq!(router.routed.lock().len(), 1);
    }

    #[test]
    fn key_lifetime_requests_regeneration() {
        let host = TestHost::new();
        let config = Config { key_lifetime: 1000, ..Config::default() };
        let mut mesh = Mesh::new(config);

        mesh.service(&host);
        assert_eq!(*host.regenerations.lock(), 0);
        host.advance(1000);
        mesh.service(&host);
        assert_eq!(*host.regenerations.lock(), 1);
        mesh.key_regenerated(host.time_ticks());
        host.advance(999);
        mesh.service(&host);
        assert_eq!(*host.regenerations.lock(), 1);
    }

    #[test]
    fn seqno_past_ceiling_requests_rekey_once() {
        let host = TestHost::new();
        let router = TestRouter::new();
        let (mut mesh, _) =
            mesh_with_peer(Config::default(), PeerOptions::default(), "10.0.0.2:655", Some(plaintext_pair()));

        let mut wire = (MAX_SEQNO + 1).to_be_bytes().to_vec();
        wire.extend_from_slice(&[0x22_u8; 64]);
        mesh.receive_udp_datagram(&host, &router, addr("10.0.0.2:655"), &wire);
        assert_eq!(*host.regenerations.lock(), 1);

        let mut wire2 = (MAX_SEQNO + 2).to_be_bytes().to_vec();
        wire2.extend_from_slice(&[0x22_u8; 64]);
        mesh.receive_udp_datagram(&host, &router, addr("10.0.0.2:655"), &wire2);
        assert_eq!(*host.regenerations.lock(), 1, "rekey is requested once until the key rolls");
    }
}
