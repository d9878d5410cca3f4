/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use std::net::SocketAddr;
use std::path::Path;

use openssl::hash::MessageDigest;
use openssl::symm::Cipher;
use serde::{Deserialize, Serialize};

use trellis_mesh::error::InvalidParameterError;
use trellis_mesh::{Config, FrameCipher, FrameDigest, PeerOptions, SessionState};

/// On-disk daemon configuration (JSON).
#[derive(Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    pub name: String,
    pub listen: Vec<SocketAddr>,
    pub priority_inheritance: bool,
    pub tunnel_server: bool,
    pub tcp_only: bool,
    pub overwrite_mac: Option<[u8; 6]>,
    pub key_lifetime_secs: i64,
    pub device_mtu: u16,
    pub peers: Vec<PeerSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            name: "trellis".to_owned(),
            listen: vec!["0.0.0.0:655".parse().unwrap()],
            priority_inheritance: false,
            tunnel_server: false,
            tcp_only: false,
            overwrite_mac: None,
            key_lifetime_secs: 3600,
            device_mtu: 1500,
            peers: Vec::new(),
        }
    }
}

/// A statically keyed peer entry. Session material is symmetric per
/// direction: `cipher_key`/`cipher_iv`/`digest_key` are hex strings shared
/// out of band, used for both inbound and outbound sessions until a
/// handshake layer replaces them.
#[derive(Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PeerSettings {
    pub name: String,
    pub hostname: String,
    pub address: Option<SocketAddr>,
    pub cipher: String,
    pub digest: String,
    pub mac_length: usize,
    pub compression: u8,
    pub cipher_key: String,
    pub cipher_iv: String,
    pub digest_key: String,
    pub tcp_only: bool,
    pub pmtu_discovery: bool,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            name: String::new(),
            hostname: String::new(),
            address: None,
            cipher: "aes-256-ctr".to_owned(),
            digest: "sha256".to_owned(),
            mac_length: 16,
            compression: 0,
            cipher_key: String::new(),
            cipher_iv: String::new(),
            digest_key: String::new(),
            tcp_only: false,
            pmtu_discovery: true,
        }
    }
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let data = std::fs::read(path)?;
        serde_json::from_slice(&data).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn mesh_config(&self) -> Config {
        Config {
            name: self.name.clone(),
            priority_inheritance: self.priority_inheritance,
            tunnel_server: self.tunnel_server,
            overwrite_mac: self.overwrite_mac,
            tcp_only: self.tcp_only,
            key_lifetime: self.key_lifetime_secs.saturating_mul(1000),
            device_mtu: self.device_mtu,
        }
    }
}

pub fn cipher_by_name(name: &str) -> Option<Cipher> {
    match name {
        "" | "none" => None,
        "aes-128-ctr" => Some(Cipher::aes_128_ctr()),
        "aes-192-ctr" => Some(Cipher::aes_192_ctr()),
        "aes-256-ctr" => Some(Cipher::aes_256_ctr()),
        "aes-128-cbc" => Some(Cipher::aes_128_cbc()),
        "aes-256-cbc" => Some(Cipher::aes_256_cbc()),
        "chacha20" => Some(Cipher::chacha20()),
        _ => None,
    }
}

pub fn digest_by_name(name: &str) -> Option<MessageDigest> {
    match name {
        "" | "none" => None,
        "sha1" => Some(MessageDigest::sha1()),
        "sha256" => Some(MessageDigest::sha256()),
        "sha384" => Some(MessageDigest::sha384()),
        "sha512" => Some(MessageDigest::sha512()),
        _ => None,
    }
}

impl PeerSettings {
    pub fn options(&self) -> PeerOptions {
        PeerOptions { tcp_only: self.tcp_only, pmtu_discovery: self.pmtu_discovery }
    }

    /// Build one direction of session state from the static material.
    pub fn session(&self) -> Result<SessionState, InvalidParameterError> {
        let cipher = match self.cipher.as_str() {
            "" | "none" => None,
            name => {
                let cipher = cipher_by_name(name).ok_or(InvalidParameterError("unknown cipher"))?;
                let key = hex::decode(&self.cipher_key).map_err(|_| InvalidParameterError("bad cipher key hex"))?;
                let iv = hex::decode(&self.cipher_iv).map_err(|_| InvalidParameterError("bad cipher IV hex"))?;
                Some(FrameCipher::new(cipher, &key, &iv)?)
            }
        };
        let digest = match self.digest.as_str() {
            "" | "none" => None,
            name => {
                let digest = digest_by_name(name).ok_or(InvalidParameterError("unknown digest"))?;
                let key = hex::decode(&self.digest_key).map_err(|_| InvalidParameterError("bad digest key hex"))?;
                Some(FrameDigest::new(digest, &key, self.mac_length)?)
            }
        };
        SessionState::new(cipher, digest, self.compression)
    }
}
