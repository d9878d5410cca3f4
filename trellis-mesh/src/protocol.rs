/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

/// Sequence number ceiling. Once the inbound high-watermark for any peer
/// passes this the handshake layer is asked to roll the keys, long before
/// the 32-bit counter could wrap.
pub const MAX_SEQNO: u32 = 1 << 30;

/// Size of an Ethernet header: destination MAC, source MAC, EtherType.
pub const ETHER_HEADER_SIZE: usize = 14;

/// Byte range of the source MAC within an Ethernet frame.
pub const ETHER_SOURCE_MAC: std::ops::Range<usize> = 6..12;

/// Offset of the big-endian EtherType field.
pub const ETHER_TYPE_OFFSET: usize = 12;

/// An all-zero EtherType marks a frame as an internal MTU probe rather than
/// routable traffic; no real protocol is assigned EtherType 0.
#[inline(always)]
pub fn is_probe_frame(payload: &[u8]) -> bool {
    payload.len() >= ETHER_HEADER_SIZE
        && payload[ETHER_TYPE_OFFSET] == 0
        && payload[ETHER_TYPE_OFFSET + 1] == 0
}

/// Cadence of the per-peer MTU probe timer in milliseconds.
pub const MTU_PROBE_INTERVAL: i64 = 1000;

/// Probe attempts tolerated without any reply before giving up on UDP.
pub const MTU_PROBE_MAX_NO_REPLY: u32 = 10;

/// Total probe attempts before the discovered MTU is fixed.
pub const MTU_PROBE_MAX_TOTAL: u32 = 30;

/// Probes per timer tick.
pub const MTU_PROBES_PER_TICK: usize = 3;

/// Smallest probe the timer will emit.
pub const MTU_PROBE_MIN_LEN: u16 = 64;
