/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::error::InvalidParameterError;
use crate::protocol::{ETHER_HEADER_SIZE, ETHER_TYPE_OFFSET};

/// Maximum payload a frame can carry. Larger than any sane device MTU so
/// that compression overshoot and cipher padding always fit.
pub const FRAME_CAPACITY: usize = 2048;

/// Size of the wire sequence number field.
pub const SEQNO_SIZE: usize = 4;

const WIRE_CAPACITY: usize = SEQNO_SIZE + FRAME_CAPACITY;

/// A packet moving through the datapath.
///
/// The 32-bit sequence number field and the payload are physically contiguous
/// so that the MAC and the cipher operate on `seqno || payload` as a single
/// byte range. `len` counts payload bytes only; the wire image of a packet is
/// `SEQNO_SIZE + len` bytes. The priority hint is carried out-of-band: it is
/// never serialized, and the value -1 pins a packet to the TCP path until
/// final delivery.
#[derive(Clone)]
pub struct Frame {
    priority: i16,
    len: usize,
    data: [u8; WIRE_CAPACITY],
}

impl Default for Frame {
    #[inline(always)]
    fn default() -> Self {
        Self::new()
    }
}

impl Frame {
    #[inline(always)]
    pub fn new() -> Self {
        Self { priority: 0, len: 0, data: [0_u8; WIRE_CAPACITY] }
    }

    pub fn from_payload(b: &[u8]) -> Result<Self, InvalidParameterError> {
        if b.len() > FRAME_CAPACITY {
            return Err(InvalidParameterError("payload exceeds frame capacity"));
        }
        let mut f = Self::new();
        f.len = b.len();
        f.data[SEQNO_SIZE..SEQNO_SIZE + b.len()].copy_from_slice(b);
        Ok(f)
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set the payload length. Panics if `len` exceeds the frame capacity.
    #[inline(always)]
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= FRAME_CAPACITY);
        self.len = len;
    }

    #[inline(always)]
    pub fn payload(&self) -> &[u8] {
        &self.data[SEQNO_SIZE..SEQNO_SIZE + self.len]
    }

    #[inline(always)]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[SEQNO_SIZE..SEQNO_SIZE + self.len]
    }

    /// The entire payload region regardless of the current length, for
    /// stages that produce output of a yet unknown size.
    #[inline(always)]
    pub(crate) fn payload_full_mut(&mut self) -> &mut [u8] {
        &mut self.data[SEQNO_SIZE..]
    }

    /// The wire image: sequence number field followed by the payload.
    #[inline(always)]
    pub(crate) fn wire(&self) -> &[u8] {
        &self.data[..SEQNO_SIZE + self.len]
    }

    #[inline(always)]
    pub(crate) fn wire_full_mut(&mut self) -> &mut [u8] {
        &mut self.data[..]
    }

    /// Set the length from a wire image size (which includes the seqno field).
    #[inline(always)]
    pub(crate) fn set_wire_len(&mut self, wire_len: usize) {
        assert!((SEQNO_SIZE..=WIRE_CAPACITY).contains(&wire_len));
        self.len = wire_len - SEQNO_SIZE;
    }

    /// Load a complete wire image (seqno field included).
    pub(crate) fn set_wire(&mut self, b: &[u8]) -> bool {
        if b.len() < SEQNO_SIZE || b.len() > WIRE_CAPACITY {
            return false;
        }
        self.data[..b.len()].copy_from_slice(b);
        self.len = b.len() - SEQNO_SIZE;
        true
    }

    /// Append bytes after the current wire image, extending the length.
    /// Used to attach the MAC tag.
    pub(crate) fn append_to_wire(&mut self, b: &[u8]) -> bool {
        let end = SEQNO_SIZE + self.len + b.len();
        if end > WIRE_CAPACITY {
            return false;
        }
        self.data[SEQNO_SIZE + self.len..end].copy_from_slice(b);
        self.len += b.len();
        true
    }

    #[inline(always)]
    pub(crate) fn set_seqno(&mut self, seqno: u32) {
        self.data[..SEQNO_SIZE].copy_from_slice(&seqno.to_be_bytes());
    }

    #[inline(always)]
    pub(crate) fn seqno(&self) -> u32 {
        u32::from_be_bytes(self.data[..SEQNO_SIZE].try_into().unwrap())
    }

    #[inline(always)]
    pub fn priority(&self) -> i16 {
        self.priority
    }

    #[inline(always)]
    pub fn set_priority(&mut self, priority: i16) {
        self.priority = priority;
    }

    /// EtherType of the carried frame, or 0 if it is too short to have one.
    #[inline(always)]
    pub fn ethertype(&self) -> u16 {
        if self.len >= ETHER_HEADER_SIZE {
            let at = SEQNO_SIZE + ETHER_TYPE_OFFSET;
            u16::from_be_bytes(self.data[at..at + 2].try_into().unwrap())
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seqno_is_contiguous_with_payload() {
        let mut f = Frame::from_payload(&[0xaa_u8; 16]).unwrap();
        f.set_seqno(0x01020304);
        assert_eq!(f.wire()[..4], [1, 2, 3, 4]);
        assert_eq!(f.wire()[4..], [0xaa_u8; 16]);
        assert_eq!(f.seqno(), 0x01020304);
        assert_eq!(f.len(), 16);
    }

    #[test]
    fn append_and_capacity() {
        let mut f = Frame::from_payload(&[1, 2, 3]).unwrap();
        assert!(f.append_to_wire(&[9, 9]));
        assert_eq!(f.len(), 5);
        assert_eq!(f.payload(), &[1, 2, 3, 9, 9]);
        assert!(Frame::from_payload(&[0_u8; FRAME_CAPACITY + 1]).is_err());
    }

    #[test]
    fn ethertype_of_short_frame_is_zero() {
        let f = Frame::from_payload(&[0_u8; 8]).unwrap();
        assert_eq!(f.ethertype(), 0);
        let mut p = [0_u8; 20];
        p[12] = 0x08;
        p[13] = 0x00;
        assert_eq!(Frame::from_payload(&p).unwrap().ethertype(), 0x0800);
    }
}
