//! medusa-crypto: client-side envelope encryption for backup objects
//!
//! Every object is encrypted under a fresh random data key. The data key is
//! wrapped by a raw AES keyring built from the configured `cse_key`, and the
//! object's encryption context is authenticated in the message header.
//!
//! ```text
//! cse_key ──normalize──▶ wrapping key (AES-256-GCM keyring: namespace, name)
//!   └── data key (per object, random, wrapped into the header)
//!         ├── HKDF-SHA256(salt=message_id, "DERIVEKEY") → frame key
//!         └── HKDF-SHA256(salt=message_id, "COMMITKEY") → key commitment
//! ```
//!
//! Message layout is documented in [`header`] and [`frame`].

pub mod config;
pub mod context;
pub mod frame;
pub mod header;
pub mod keyring;
pub mod keys;
pub mod manager;
pub mod stream;

pub use config::{normalize_key, BackendAvailability, EncryptionConfig, KeyMaterial};
pub use context::EncryptionContext;
pub use keyring::{RawAesKeyring, WrappedKey};
pub use keys::{generate_key, SecretKey};
pub use manager::EncryptionManager;

/// Size of every AES-256 key handled here
pub const KEY_SIZE: usize = 32;

/// AES-GCM IV size
pub const IV_SIZE: usize = 12;

/// AES-GCM authentication tag size
pub const TAG_SIZE: usize = 16;

/// Random per-message identifier, also the HKDF salt
pub const MESSAGE_ID_SIZE: usize = 32;

/// Key commitment stored in the header
pub const COMMITMENT_SIZE: usize = 32;

/// AES-256-GCM, IV 12, tag 16, HKDF-SHA256 with key commitment
pub const ALGORITHM_AES256_GCM_HKDF_SHA256_COMMIT: u16 = 0x0478;

/// Plaintext bytes per regular frame
pub const DEFAULT_FRAME_LEN: u32 = 64 * 1024;

/// Largest frame length accepted when decrypting
pub const MAX_FRAME_LEN: u32 = 4 * 1024 * 1024;
