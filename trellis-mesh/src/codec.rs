/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

/// Highest negotiable compression level.
///
/// Levels 1-9 are zlib deflate at that effort; 10 and 11 select the LZ4
/// block codec (11 is kept for negotiation compatibility and currently
/// compresses the same as 10). Level 0 is the identity transform.
pub const COMPRESSION_LEVEL_MAX: u8 = 11;

/// Compress `input` into `output` at the given level.
///
/// Returns the compressed size, or None on failure (unknown level, output
/// too small, or codec error), in which case the caller drops the packet.
pub fn compress(level: u8, input: &[u8], output: &mut [u8]) -> Option<usize> {
    match level {
        0 => {
            if output.len() < input.len() {
                return None;
            }
            output[..input.len()].copy_from_slice(input);
            Some(input.len())
        }
        1..=9 => {
            let mut c = Compress::new(Compression::new(level as u32), true);
            match c.compress(input, output, FlushCompress::Finish) {
                Ok(Status::StreamEnd) => Some(c.total_out() as usize),
                _ => None,
            }
        }
        10 | 11 => lz4_flex::block::compress_into(input, output).ok(),
        _ => None,
    }
}

/// Inverse of [compress]. Returns the decompressed size or None.
pub fn decompress(level: u8, input: &[u8], output: &mut [u8]) -> Option<usize> {
    match level {
        0 => {
            if output.len() < input.len() {
                return None;
            }
            output[..input.len()].copy_from_slice(input);
            Some(input.len())
        }
        1..=9 => {
            let mut d = Decompress::new(true);
            match d.decompress(input, output, FlushDecompress::Finish) {
                Ok(Status::StreamEnd) => Some(d.total_out() as usize),
                _ => None,
            }
        }
        10 | 11 => lz4_flex::block::decompress_into(input, output).ok(),
        _ => None,
    }
}
