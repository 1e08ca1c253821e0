//! Per-entry issuance options.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::MountSettings;

const SUFFIX_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Options for creating one application credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueOptions {
    /// Unique, human-readable credential name.
    pub name: String,
    /// Fixed description label.
    pub description: String,
    /// Expiry, UTC with millisecond precision.
    pub expires_at: DateTime<Utc>,
}

impl IssueOptions {
    /// Derive options for the manifest entry at `index`, issued at `now`.
    pub fn for_entry(settings: &MountSettings, index: usize, now: DateTime<Utc>) -> Self {
        let nanos = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp_micros() * 1000);
        // Mixing in the index keeps entries issued within the same tick apart
        let seed = (nanos as u64) ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        let name = format!(
            "{}{}-{}",
            settings.name_prefix,
            nanos,
            random_suffix(settings.suffix_length, seed)
        );

        let ttl = Duration::from_std(settings.credential_ttl()).unwrap_or(Duration::MAX);
        let expires_at = now
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
            .trunc_subsecs(3);

        Self {
            name,
            description: settings.description.clone(),
            expires_at,
        }
    }
}

/// Random `[a-z0-9]` string of `length` characters.
///
/// Only used for readable uniqueness, so a seeded non-cryptographic RNG is
/// enough.
pub fn random_suffix(length: usize, seed: u64) -> String {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..length)
        .map(|_| SUFFIX_CHARSET[rng.gen_range(0..SUFFIX_CHARSET.len())] as char)
        .collect()
}
