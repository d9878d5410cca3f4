/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

/// Seam to the virtual network device.
///
/// The actual TUN/TAP driver lives outside this crate; whatever owns it
/// implements the egress half here and feeds ingress frames into the
/// reactor's device channel.
pub trait VirtualDevice {
    /// Enqueue a frame toward the host network stack.
    fn write_frame(&self, frame: &[u8]);
}

/// A device that discards everything, for nodes that only relay.
pub struct DummyDevice;

impl VirtualDevice for DummyDevice {
    fn write_frame(&self, _frame: &[u8]) {}
}
