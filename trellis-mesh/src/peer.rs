/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::net::SocketAddr;

use crate::mesh::{ConnectionId, PeerId};
use crate::mtu::PmtuState;
use crate::replay::ReplayWindow;
use crate::session::SessionState;

/// Per-peer behavior switches, set from configuration or learned during the
/// metadata exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerOptions {
    /// Force every packet to and from this peer onto the TCP control channel.
    pub tcp_only: bool,
    /// Hold UDP traffic until a usable path MTU has been discovered.
    pub pmtu_discovery: bool,
}

/// A remote daemon instance, reachable directly or via relay.
///
/// The datapath reads and mutates this record; creation and graph wiring
/// (nexthop, via, control connection) belong to the discovery and routing
/// collaborators, key material to the handshake collaborator.
pub struct Peer {
    pub name: String,
    pub hostname: String,

    pub(crate) session_in: Option<SessionState>,
    pub(crate) session_out: Option<SessionState>,
    pub(crate) valid_key: bool,
    pub(crate) waiting_for_key: bool,

    pub(crate) sent_seqno: u32,
    pub(crate) replay: ReplayWindow,

    pub(crate) address: Option<SocketAddr>,
    pub(crate) nexthop: Option<PeerId>,
    pub(crate) via: Option<PeerId>,
    pub(crate) connection: Option<ConnectionId>,

    pub(crate) pmtu: PmtuState,
    pub(crate) reachable: bool,
    pub(crate) options: PeerOptions,

    // Traffic totals for the diagnostics surface.
    pub(crate) packets_in: u64,
    pub(crate) packets_out: u64,
    pub(crate) bytes_in: u64,
    pub(crate) bytes_out: u64,
}

impl Peer {
    pub(crate) fn new(name: &str, hostname: &str, options: PeerOptions) -> Self {
        Self {
            name: name.to_owned(),
            hostname: hostname.to_owned(),
            session_in: None,
            session_out: None,
            valid_key: false,
            waiting_for_key: false,
            sent_seqno: 0,
            replay: ReplayWindow::new(),
            address: None,
            nexthop: None,
            via: None,
            connection: None,
            pmtu: PmtuState::new(),
            reachable: false,
            options,
            packets_in: 0,
            packets_out: 0,
            bytes_in: 0,
            bytes_out: 0,
        }
    }

    #[inline(always)]
    pub fn address(&self) -> Option<SocketAddr> {
        self.address
    }

    #[inline(always)]
    pub fn reachable(&self) -> bool {
        self.reachable
    }

    #[inline(always)]
    pub fn options(&self) -> PeerOptions {
        self.options
    }

    #[inline(always)]
    pub fn valid_key(&self) -> bool {
        self.valid_key
    }

    /// Count of UDP packets emitted since the outbound session was installed.
    #[inline(always)]
    pub fn sent_seqno(&self) -> u32 {
        self.sent_seqno
    }

    /// Inbound high-watermark; never decreases between rekeys.
    #[inline(always)]
    pub fn received_seqno(&self) -> u32 {
        self.replay.received_seqno()
    }

    #[inline(always)]
    pub fn pmtu(&self) -> &PmtuState {
        &self.pmtu
    }

    /// (packets in, packets out, bytes in, bytes out)
    pub fn traffic(&self) -> (u64, u64, u64, u64) {
        (self.packets_in, self.packets_out, self.bytes_in, self.bytes_out)
    }
}
