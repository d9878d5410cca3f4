/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use tracing::debug;

use crate::frame::Frame;
use crate::mesh::{ConnectionId, InnerProtocol, Mesh};

impl Mesh {
    /// Accept a frame that arrived inline on a peer control channel.
    ///
    /// Unless the link is TCP-only by choice, the frame is pinned with
    /// priority -1: it must not leave the TCP path again before final
    /// delivery, or it could loop between transports on a path whose UDP
    /// leg is broken.
    pub fn receive_tcp_packet<R: InnerProtocol>(&mut self, router: &R, connection: ConnectionId, data: &[u8]) {
        let id = match self.connections.get(connection.0 as usize).and_then(|c| c.as_ref()) {
            Some(c) => c.peer,
            None => return,
        };
        let mut frame = match Frame::from_payload(data) {
            Ok(f) => f,
            Err(_) => {
                debug!("got oversize packet over control channel, dropping");
                return;
            }
        };
        let tcp_only = self.config.tcp_only || self.peer(id).map_or(false, |p| p.options.tcp_only);
        frame.set_priority(if tcp_only { 0 } else { -1 });
        if let Some(p) = self.peer_entry_mut(id) {
            p.packets_in += 1;
            p.bytes_in += data.len() as u64;
        }
        self.receive_packet(router, id, &mut frame);
    }
}
