/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub const VERSION_MAJOR: u8 = 0;
pub const VERSION_MINOR: u8 = 1;
pub const VERSION_REVISION: u8 = 0;

pub mod error;
pub mod util;

#[cfg(test)]
mod testhost;

mod codec;
mod frame;
mod mesh;
mod mtu;
mod peer;
mod protocol;
mod replay;
mod session;
mod tcp;
mod udp;

pub use codec::{COMPRESSION_LEVEL_MAX, compress, decompress};
pub use frame::{Frame, FRAME_CAPACITY, SEQNO_SIZE};
pub use mesh::{Config, ConnectionId, EdgeId, InnerProtocol, Mesh, PeerId, SystemInterface};
pub use mtu::PmtuState;
pub use peer::{Peer, PeerOptions};
pub use protocol::MAX_SEQNO;
pub use replay::{ReplayReject, ReplayVerdict, ReplayWindow};
pub use session::{FrameCipher, FrameDigest, SessionState};
