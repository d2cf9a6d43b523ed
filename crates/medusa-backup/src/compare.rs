//! Content comparison: decides whether a local file must be uploaded
//!
//! Pure functions with no shared state.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use medusa_core::config::ChecksConfig;
use medusa_core::ManifestObject;
use medusa_storage::Blob;
use std::fmt;

/// How strictly two file identities are compared
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComparePolicy {
    /// Size difference in bytes still treated as a match
    pub threshold: u64,
    /// Compare MD5 digests when sizes match
    pub check_digest: bool,
}

impl ComparePolicy {
    pub fn from_checks(checks: &ChecksConfig) -> Self {
        Self {
            threshold: checks.threshold,
            check_digest: checks.enable_md5_checks,
        }
    }
}

/// Size and (if computed) MD5 of a local file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalIdentity {
    pub size: u64,
    pub md5: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeReason {
    Missing,
    SizeMismatch,
    DigestMismatch,
    /// Digest checks are on but one side has no usable digest
    DigestUnknown,
}

impl fmt::Display for ChangeReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeReason::Missing => "not in storage",
            ChangeReason::SizeMismatch => "size changed",
            ChangeReason::DigestMismatch => "content changed (digest mismatch)",
            ChangeReason::DigestUnknown => "no comparable digest",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Unchanged,
    Changed(ChangeReason),
}

impl Verdict {
    pub fn must_upload(&self) -> bool {
        matches!(self, Verdict::Changed(_))
    }
}

/// Compare a local file against what storage already holds for it.
///
/// The existing entry's source identity is used when recorded, so encrypted
/// objects compare against their plaintext.
pub fn file_matches_storage(
    local: &LocalIdentity,
    existing: Option<&ManifestObject>,
    policy: &ComparePolicy,
) -> Verdict {
    let Some(existing) = existing else {
        return Verdict::Changed(ChangeReason::Missing);
    };
    let (remote_size, remote_md5) = existing.source_identity();

    if !size_within_threshold(local.size, remote_size, policy.threshold) {
        return Verdict::Changed(ChangeReason::SizeMismatch);
    }
    if !policy.check_digest {
        return Verdict::Unchanged;
    }
    match (local.md5.as_deref(), remote_md5) {
        (Some(local_md5), Some(remote_md5)) if is_content_digest(remote_md5) => {
            if digests_match(local_md5, remote_md5) {
                Verdict::Unchanged
            } else {
                Verdict::Changed(ChangeReason::DigestMismatch)
            }
        }
        _ => Verdict::Changed(ChangeReason::DigestUnknown),
    }
}

/// Does a listed blob still hold what the manifest recorded (stored identity)?
pub fn blob_matches_manifest(blob: &Blob, entry: &ManifestObject, check_digest: bool) -> bool {
    if blob.size != entry.size {
        return false;
    }
    if !check_digest {
        return true;
    }
    blob.md5
        .as_deref()
        .is_some_and(|md5| is_content_digest(md5) && digests_match(md5, &entry.md5))
}

pub fn size_within_threshold(a: u64, b: u64, threshold: u64) -> bool {
    a.abs_diff(b) <= threshold
}

/// Multipart ETags (`<hex>-<parts>`) and empty strings are not MD5s of the content.
pub fn is_content_digest(digest: &str) -> bool {
    !digest.is_empty() && !digest.contains('-')
}

/// MD5 equality across hex and base64 encodings.
pub fn digests_match(a: &str, b: &str) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a.eq_ignore_ascii_case(b) {
        return true;
    }
    match (decode_digest(a), decode_digest(b)) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn decode_digest(digest: &str) -> Option<[u8; 16]> {
    let digest = digest.trim_matches('"');
    if digest.len() == 32 && digest.bytes().all(|b| b.is_ascii_hexdigit()) {
        let mut out = [0u8; 16];
        for (i, pair) in digest.as_bytes().chunks(2).enumerate() {
            let hi = (pair[0] as char).to_digit(16)?;
            let lo = (pair[1] as char).to_digit(16)?;
            out[i] = (hi * 16 + lo) as u8;
        }
        return Some(out);
    }
    STANDARD.decode(digest).ok()?.try_into().ok()
}
