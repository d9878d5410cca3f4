/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use tracing::{debug, error, trace, warn};

use crate::codec;
use crate::frame::{Frame, FRAME_CAPACITY, SEQNO_SIZE};
use crate::mesh::{InnerProtocol, Mesh, PeerId, SystemInterface};
use crate::protocol::{is_probe_frame, MAX_SEQNO};
use crate::replay::ReplayVerdict;

/// Largest digest tag we ever append.
const TAG_SIZE_MAX: usize = 64;

enum EgressGate {
    /// No usable outbound key; optionally fire a key request, then fall
    /// back to TCP via the forwarding hop.
    NoKey { request: bool },
    /// Path MTU discovery is required but has not concluded; IP traffic
    /// stays on TCP until it does.
    AwaitMtu,
    Clear,
}

impl Mesh {
    fn nexthop_connection(&self, id: PeerId) -> Option<crate::mesh::ConnectionId> {
        self.peer(id)
            .and_then(|p| p.nexthop)
            .and_then(|nh| self.peer(nh))
            .and_then(|nh| nh.connection)
    }

    /// Emit one frame to a peer over UDP: compress, stamp the sequence
    /// number, encrypt, authenticate, pick a socket, send.
    ///
    /// The caller's frame is not modified; each stage writes into one of two
    /// scratch buffers and the later stages read whichever buffer the
    /// previous stage produced.
    pub(crate) fn send_udp_packet<H: SystemInterface>(&mut self, host: &H, id: PeerId, frame: &Frame) {
        let gate = match self.peer(id) {
            Some(p) => {
                if !(p.valid_key && p.session_out.is_some()) {
                    EgressGate::NoKey { request: !p.waiting_for_key }
                } else if p.options.pmtu_discovery && p.pmtu.min_mtu == 0 && frame.ethertype() != 0 {
                    EgressGate::AwaitMtu
                } else {
                    EgressGate::Clear
                }
            }
            None => return,
        };
        match gate {
            EgressGate::NoKey { request } => {
                if request {
                    if let Some(p) = self.peer_entry_mut(id) {
                        debug!("no valid key known yet for {}, requesting one", p.name);
                        p.waiting_for_key = true;
                    }
                    host.request_key(id);
                }
                let connection = self.nexthop_connection(id);
                self.send_via_tcp(host, connection, frame);
                return;
            }
            EgressGate::AwaitMtu => {
                let connection = self.nexthop_connection(id);
                self.send_via_tcp(host, connection, frame);
                return;
            }
            EgressGate::Clear => {}
        }

        let origlen = frame.len();
        let origpriority = frame.priority();
        let compression = match self.peer(id).and_then(|p| p.session_out.as_ref()) {
            Some(s) => s.compression(),
            None => return,
        };

        let mut buf_a = Frame::new();
        let mut buf_b = Frame::new();

        // Compression stage, or a plain copy into the first scratch buffer.
        if compression > 0 {
            match codec::compress(compression, frame.payload(), buf_a.payload_full_mut()) {
                Some(n) => buf_a.set_len(n),
                None => {
                    error!("failed to compress packet ({} bytes, level {})", origlen, compression);
                    return;
                }
            }
        } else {
            buf_a.payload_full_mut()[..origlen].copy_from_slice(frame.payload());
            buf_a.set_len(origlen);
        }

        // Sequence stage. The counter only moves for packets that made it
        // past compression; every later stage is infallible short of a
        // cipher breakdown.
        let seqno = match self.peer_entry_mut(id) {
            Some(p) => {
                p.sent_seqno = p.sent_seqno.wrapping_add(1);
                p.sent_seqno
            }
            None => return,
        };
        buf_a.set_seqno(seqno);

        // Encrypt-then-MAC over seqno || payload.
        let mut encrypted = false;
        {
            let session = match self.peer(id).and_then(|p| p.session_out.as_ref()) {
                Some(s) => s,
                None => return,
            };
            if let Some(cipher) = session.cipher() {
                match cipher.encrypt(buf_a.wire(), buf_b.wire_full_mut()) {
                    Some(n) => {
                        buf_b.set_wire_len(n);
                        encrypted = true;
                    }
                    None => {
                        error!("failed to encrypt packet for node");
                        return;
                    }
                }
            }
            let out = if encrypted { &mut buf_b } else { &mut buf_a };
            if let Some(digest) = session.digest() {
                let mac_len = digest.mac_length();
                let mut tag = [0_u8; TAG_SIZE_MAX];
                if !digest.create(out.wire(), &mut tag[..mac_len]) || !out.append_to_wire(&tag[..mac_len]) {
                    error!("failed to authenticate packet for node");
                    return;
                }
            }
        }
        let out = if encrypted { &buf_b } else { &buf_a };

        // Socket selection: first listener matching the address family,
        // else the first one, best effort.
        let address = match self.peer(id).and_then(|p| p.address) {
            Some(a) => a,
            None => {
                debug!("no known address for node, dropping packet");
                return;
            }
        };
        if self.sockets.is_empty() {
            debug!("no listening sockets, dropping packet");
            return;
        }
        let sock = self.sockets.iter().position(|s| s.ipv6 == address.is_ipv6()).unwrap_or(0);

        // Mirror the frame's priority hint into the IPv4 TOS byte, touching
        // the sockopt only when this socket's last applied value differs.
        if self.config.priority_inheritance && !address.is_ipv6() && (0..=255).contains(&origpriority) {
            let tos = origpriority as u8;
            if self.sockets[sock].tos != tos {
                self.sockets[sock].tos = tos;
                host.set_tos(sock, tos);
            }
        }

        match host.send_udp(sock, &address, out.wire()) {
            Ok(()) => {
                let wire_len = out.wire().len() as u64;
                if let Some(p) = self.peer_entry_mut(id) {
                    p.packets_out += 1;
                    p.bytes_out += wire_len;
                }
            }
            Err(e) if e.raw_os_error() == Some(libc::EMSGSIZE) => {
                trace!("kernel refused {} byte send as oversize", origlen);
                if let Some(p) = self.peer_entry_mut(id) {
                    p.pmtu.clamp_oversize(origlen.min(u16::MAX as usize) as u16);
                }
            }
            Err(e) => {
                debug!("error sending {} byte packet: {}", origlen, e);
            }
        }
    }

    /// Process one authenticated-transport datagram already attributed to a
    /// peer: verify, decrypt, check the replay window, decompress, and hand
    /// the result to the probe handler or the router.
    pub(crate) fn receive_udp_packet<H: SystemInterface, R: InnerProtocol>(
        &mut self,
        host: &H,
        router: &R,
        id: PeerId,
        wire: &[u8],
    ) {
        let mut origlen = wire.len();
        let mut work = Frame::new();

        {
            let p = match self.peer(id) {
                Some(p) => p,
                None => return,
            };
            let session = match p.session_in.as_ref() {
                Some(s) => s,
                None => {
                    debug!("got packet from {} but no session key is active yet", p.name);
                    return;
                }
            };
            let mac_len = session.mac_length();
            if wire.len() < SEQNO_SIZE + mac_len {
                debug!("got too short packet from {}", p.name);
                return;
            }
            let (body, tag) = wire.split_at(wire.len() - mac_len);
            if let Some(digest) = session.digest() {
                if !digest.verify(body, tag) {
                    debug!("got unauthenticated packet from {}", p.name);
                    return;
                }
            }
            match session.cipher() {
                Some(cipher) => match cipher.decrypt(body, work.wire_full_mut()) {
                    Some(n) if n >= SEQNO_SIZE => work.set_wire_len(n),
                    _ => {
                        debug!("failed to decrypt packet from {}", p.name);
                        return;
                    }
                },
                None => {
                    if !work.set_wire(body) {
                        debug!("got malformed packet from {}", p.name);
                        return;
                    }
                }
            }
        }

        let seqno = work.seqno();
        let mut want_rekey = false;
        {
            let p = match self.peer_entry_mut(id) {
                Some(p) => p,
                None => return,
            };
            match p.replay.check(seqno) {
                ReplayVerdict::Accept { lost } => {
                    if lost > 0 {
                        warn!("lost {} packets from {}", lost, p.name);
                    }
                }
                ReplayVerdict::Reject(reason) => {
                    debug!(
                        "got late or replayed packet from {}, seqno {}, highest seqno {} ({:?})",
                        p.name,
                        seqno,
                        p.replay.received_seqno(),
                        reason
                    );
                    return;
                }
            }
            if p.replay.received_seqno() > MAX_SEQNO {
                want_rekey = true;
            }
            p.packets_in += 1;
            p.bytes_in += wire.len() as u64;
        }
        if want_rekey && !self.rekey_requested {
            self.rekey_requested = true;
            host.regenerate_key();
        }

        let compression = match self.peer(id).and_then(|p| p.session_in.as_ref()) {
            Some(s) => s.compression(),
            None => return,
        };
        let mut plain = Frame::new();
        let current: &mut Frame = if compression > 0 {
            match codec::decompress(compression, work.payload(), plain.payload_full_mut()) {
                Some(n) if n <= FRAME_CAPACITY => plain.set_len(n),
                _ => {
                    error!("failed to decompress packet (level {})", compression);
                    return;
                }
            }
            // Rough estimate of what this packet's pre-compression wire size
            // was; only the MTU probe accounting consumes it.
            origlen = origlen.saturating_sub(self.config.device_mtu as usize / 64 + 20);
            &mut plain
        } else {
            &mut work
        };

        current.set_priority(0);
        if is_probe_frame(current.payload()) {
            self.handle_mtu_probe(host, id, current, origlen);
        } else {
            self.receive_packet(router, id, current);
        }
    }
}
