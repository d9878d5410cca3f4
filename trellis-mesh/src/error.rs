/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::error::Error;
use std::fmt::{Debug, Display};

/// An invalid parameter was supplied to a constructor or configuration call.
///
/// Per-packet failures are never reported this way. A malformed, unauthenticated,
/// replayed, or otherwise undeliverable packet is logged and dropped where it is
/// detected; only misuse of the API surface itself produces an error value.
pub struct InvalidParameterError(pub &'static str);

impl Display for InvalidParameterError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

impl Debug for InvalidParameterError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

impl Error for InvalidParameterError {}
