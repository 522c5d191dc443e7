//! Engine defaults and SSH algorithm profiles.
//!
//! Time-outs, polling intervals and well-known ports live here so that the
//! engines and protocol instantiations agree on them. The SSH lists feed the
//! two security profiles offered by [`crate::transport::SshOptions`].

use std::time::Duration;

use russh::keys::{Algorithm, EcdsaCurve, HashAlg};
use russh::{cipher, compression, kex, mac};

/// Default per-command timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval at which a blocked caller re-checks the completed-response table.
pub const POLL_INTERVAL: Duration = Duration::from_millis(40);

/// Stop joins the receiver with the command timeout multiplied by this margin.
pub const JOIN_MARGIN: f64 = 1.2;

/// Bounds of the receiver's read slice between stop-signal checks.
pub const RECEIVE_SLICE_MIN: Duration = Duration::from_millis(50);
pub const RECEIVE_SLICE_MAX: Duration = Duration::from_secs(2);

/// How long an expired identifier is remembered so that its late reply can
/// be dropped.
pub const EXPIRED_RETENTION: Duration = Duration::from_secs(600);

pub const TL1_PORT: u16 = 3082;
pub const TELNET_PORT: u16 = 23;
pub const SSH_PORT: u16 = 22;

/// Port of the OSPF API daemon (synchronous leg).
pub const OSPF_API_PORT: u16 = 2607;
/// Local port of the synchronous leg; the asynchronous leg listens on the
/// next port.
pub const OSPF_LOCAL_PORT: u16 = 4000;
/// Peer idle time after which an OSPF bulk transfer counts as complete.
pub const OSPF_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// The receiver blocks in `receive` for a third of the command timeout,
/// clamped so that it re-checks its stop signal promptly.
pub fn receive_slice(timeout: Duration) -> Duration {
    (timeout / 3).clamp(RECEIVE_SLICE_MIN, RECEIVE_SLICE_MAX)
}

/// Falls back to [`DEFAULT_TIMEOUT`] for a zero timeout.
pub fn effective_timeout(timeout: Duration) -> Duration {
    if timeout.is_zero() {
        DEFAULT_TIMEOUT
    } else {
        timeout
    }
}

/// Key exchange algorithms of the secure profile.
pub const SECURE_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::DH_G16_SHA512,
    kex::DH_G14_SHA256,
    kex::ECDH_SHA2_NISTP256,
    kex::ECDH_SHA2_NISTP384,
    kex::ECDH_SHA2_NISTP521,
];

/// Key exchange algorithms accepted from old element managers and routers.
pub const LEGACY_KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::DH_G14_SHA256,
    kex::ECDH_SHA2_NISTP256,
    kex::DH_GEX_SHA256,
    kex::DH_GEX_SHA1,
    kex::DH_G14_SHA1,
    kex::DH_G1_SHA1,
];

pub const SECURE_CIPHERS: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_256_CTR,
    cipher::AES_192_CTR,
    cipher::AES_128_CTR,
];

pub const LEGACY_CIPHERS: &[cipher::Name] = &[
    cipher::AES_256_CTR,
    cipher::AES_128_CTR,
    cipher::AES_256_CBC,
    cipher::AES_192_CBC,
    cipher::AES_128_CBC,
];

pub const SECURE_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA512_ETM,
    mac::HMAC_SHA256_ETM,
    mac::HMAC_SHA512,
    mac::HMAC_SHA256,
];

pub const LEGACY_MAC_ALGORITHMS: &[mac::Name] = &[
    mac::HMAC_SHA256,
    mac::HMAC_SHA512,
    mac::HMAC_SHA1,
    mac::HMAC_SHA1_ETM,
];

pub const COMPRESSION_ALGORITHMS: &[compression::Name] = &[
    compression::NONE,
    compression::ZLIB,
    compression::ZLIB_LEGACY,
];

pub const SECURE_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP384,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha512),
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
];

pub const LEGACY_KEY_TYPES: &[Algorithm] = &[
    Algorithm::Ed25519,
    Algorithm::Ecdsa {
        curve: EcdsaCurve::NistP256,
    },
    Algorithm::Rsa {
        hash: Some(HashAlg::Sha256),
    },
    Algorithm::Rsa { hash: None },
    Algorithm::Dsa,
];
