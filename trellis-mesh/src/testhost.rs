/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::net::SocketAddr;

use parking_lot::Mutex;

use crate::frame::Frame;
use crate::mesh::{ConnectionId, InnerProtocol, PeerId, SystemInterface};

/// Host environment mock shared by the pipeline and dispatch tests: every
/// callback records its arguments so tests can assert on exactly what left
/// the datapath.
pub(crate) struct TestHost {
    pub udp: Mutex<Vec<(usize, SocketAddr, Vec<u8>)>>,
    pub udp_error: Mutex<Option<i32>>,
    pub tcp: Mutex<Vec<(ConnectionId, Vec<u8>)>>,
    pub tcp_ok: Mutex<bool>,
    pub terminated: Mutex<Vec<ConnectionId>>,
    pub device: Mutex<Vec<Vec<u8>>>,
    pub key_requests: Mutex<Vec<PeerId>>,
    pub regenerations: Mutex<usize>,
    pub tos: Mutex<Vec<(usize, u8)>>,
    pub now: Mutex<i64>,
}

impl TestHost {
    pub fn new() -> Self {
        Self {
            udp: Mutex::new(Vec::new()),
            udp_error: Mutex::new(None),
            tcp: Mutex::new(Vec::new()),
            tcp_ok: Mutex::new(true),
            terminated: Mutex::new(Vec::new()),
            device: Mutex::new(Vec::new()),
            key_requests: Mutex::new(Vec::new()),
            regenerations: Mutex::new(0),
            tos: Mutex::new(Vec::new()),
            now: Mutex::new(1),
        }
    }

    pub fn advance(&self, ms: i64) {
        *self.now.lock() += ms;
    }
}

impl SystemInterface for TestHost {
    fn send_udp(&self, socket: usize, destination: &SocketAddr, datagram: &[u8]) -> std::io::Result<()> {
        if let Some(code) = *self.udp_error.lock() {
            return Err(std::io::Error::from_raw_os_error(code));
        }
        self.udp.lock().push((socket, *destination, datagram.to_vec()));
        Ok(())
    }

    fn set_tos(&self, socket: usize, tos: u8) {
        self.tos.lock().push((socket, tos));
    }

    fn send_tcp(&self, connection: ConnectionId, frame: &[u8]) -> bool {
        if *self.tcp_ok.lock() {
            self.tcp.lock().push((connection, frame.to_vec()));
            true
        } else {
            false
        }
    }

    fn terminate_connection(&self, connection: ConnectionId) {
        self.terminated.lock().push(connection);
    }

    fn write_frame(&self, frame: &[u8]) {
        self.device.lock().push(frame.to_vec());
    }

    fn request_key(&self, peer: PeerId) {
        self.key_requests.lock().push(peer);
    }

    fn regenerate_key(&self) {
        *self.regenerations.lock() += 1;
    }

    fn time_ticks(&self) -> i64 {
        *self.now.lock()
    }
}

/// An AES-256-CTR + truncated HMAC-SHA256 session with fixed test keys.
pub(crate) fn secured_session(compression: u8) -> crate::session::SessionState {
    use openssl::hash::MessageDigest;
    use openssl::symm::Cipher;

    crate::session::SessionState::new(
        Some(crate::session::FrameCipher::new(Cipher::aes_256_ctr(), &[0x5c_u8; 32], &[0x11_u8; 16]).unwrap()),
        Some(crate::session::FrameDigest::new(MessageDigest::sha256(), &[0x6a_u8; 32], 16).unwrap()),
        compression,
    )
    .unwrap()
}

pub(crate) fn plaintext_pair() -> (crate::session::SessionState, crate::session::SessionState) {
    (
        crate::session::SessionState::plaintext(0).unwrap(),
        crate::session::SessionState::plaintext(0).unwrap(),
    )
}

/// A mesh with one listening socket and one remote peer wired for direct
/// traffic at `peer_addr`.
pub(crate) fn mesh_with_peer(
    config: crate::mesh::Config,
    options: crate::peer::PeerOptions,
    peer_addr: &str,
    session: Option<(crate::session::SessionState, crate::session::SessionState)>,
) -> (crate::mesh::Mesh, PeerId) {
    let mut mesh = crate::mesh::Mesh::new(config);
    mesh.add_listen_socket(false);
    let id = mesh.add_peer("peer", "peer.example", options);
    mesh.set_peer_address(id, peer_addr.parse().unwrap());
    mesh.set_nexthop(id, Some(id));
    mesh.set_via(id, Some(id));
    mesh.set_reachable(id, true);
    if let Some((sin, sout)) = session {
        mesh.set_session_in(id, sin);
        mesh.set_session_out(id, sout);
    }
    (mesh, id)
}

/// Routing layer mock: records (source, payload, priority) per delivery.
pub(crate) struct TestRouter {
    pub routed: Mutex<Vec<(PeerId, Vec<u8>, i16)>>,
}

impl TestRouter {
    pub fn new() -> Self {
        Self { routed: Mutex::new(Vec::new()) }
    }
}

impl InnerProtocol for TestRouter {
    fn route(&self, source: PeerId, frame: &mut Frame) {
        self.routed.lock().push((source, frame.payload().to_vec(), frame.priority()));
    }
}
