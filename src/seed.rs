//! Deterministic trace seeds.
//!
//! A [`Seed`] is a timestamp rounded to the write interval plus a tenant id.
//! It is the sole input from which an expected trace is reconstructed, so it
//! is recomputed on every tick and never stored. All randomness used for
//! trace construction is drawn from [`Seed::rng`], keyed purely by the seed
//! contents; wall-clock or ambient random sources would break the agreement
//! between the write path and the validation path.

use std::num::ParseIntError;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use opentelemetry::trace::TraceId;
use rand::{rngs::StdRng, Rng, SeedableRng};
use thiserror::Error;

/// RNG stream used for span/attribute/event construction.
pub(crate) const PURPOSE_GENERATION: &[u8] = b"generate";
/// RNG stream used to pick the searchable attribute during validation.
pub(crate) const PURPOSE_SEARCH_ATTR: &[u8] = b"search-attr";
/// RNG stream used to derive the trace id.
const PURPOSE_TRACE_ID: &[u8] = b"trace-id";

/// Errors raised when a seed cannot be built from its inputs.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SeedError {
    /// The supplied timestamp predates the unix epoch.
    #[error("seed timestamp predates the unix epoch")]
    PreEpochTimestamp,

    /// The write interval used for rounding must be non-zero.
    #[error("write interval must be greater than zero")]
    ZeroInterval,
}

/// The deterministic input of a synthetic trace: a timestamp rounded to the
/// write interval, plus the tenant the trace belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Seed {
    unix_seconds: u64,
    tenant: String,
}

impl Seed {
    /// Build a seed for `now`, rounded to the nearest multiple of
    /// `write_interval` so independent processes land on the same bucket.
    pub fn new(
        now: SystemTime,
        write_interval: Duration,
        tenant: impl Into<String>,
    ) -> Result<Self, SeedError> {
        if write_interval.is_zero() {
            return Err(SeedError::ZeroInterval);
        }
        let secs = now
            .duration_since(UNIX_EPOCH)
            .map_err(|_| SeedError::PreEpochTimestamp)?
            .as_secs();

        Ok(Seed {
            unix_seconds: round_to_interval(secs, write_interval),
            tenant: tenant.into(),
        })
    }

    /// Reconstruct a seed from an already-rounded unix timestamp. Used when
    /// the read/search loops pick a past bucket to validate.
    pub fn at(unix_seconds: u64, tenant: impl Into<String>) -> Self {
        Seed {
            unix_seconds,
            tenant: tenant.into(),
        }
    }

    /// The rounded timestamp in unix seconds.
    pub fn unix_seconds(&self) -> u64 {
        self.unix_seconds
    }

    /// The rounded timestamp as a `SystemTime`.
    pub fn timestamp(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(self.unix_seconds)
    }

    /// The tenant this seed writes and validates under.
    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    /// The trace id derived from this seed. Stable across repeated
    /// derivations, never [`TraceId::INVALID`].
    pub fn trace_id(&self) -> TraceId {
        let mut rng = self.rng(PURPOSE_TRACE_ID);
        let mut id = rng.random::<u128>();
        while id == 0 {
            id = rng.random();
        }
        TraceId::from(id)
    }

    /// Lower-hex form of the trace id, as used in query API paths.
    pub fn hex_id(&self) -> String {
        format!("{:032x}", self.trace_id())
    }

    /// A deterministic RNG keyed by (timestamp, tenant, purpose). Distinct
    /// purpose tags yield independent streams, so the searchable-attribute
    /// pick cannot perturb trace construction.
    pub(crate) fn rng(&self, purpose: &[u8]) -> StdRng {
        let mut key = [0u8; 32];
        key[..8].copy_from_slice(&self.unix_seconds.to_le_bytes());
        for (i, b) in self.tenant.bytes().enumerate() {
            key[8 + (i % 16)] ^= b;
        }
        for (i, b) in purpose.iter().enumerate() {
            key[24 + (i % 8)] ^= b;
        }
        StdRng::from_seed(key)
    }
}

/// Round `secs` to the nearest multiple of `interval` (half rounds up),
/// matching the bucketing applied by the write loop.
pub fn round_to_interval(secs: u64, interval: Duration) -> u64 {
    let interval = interval.as_secs().max(1);
    let rem = secs % interval;
    if rem * 2 >= interval {
        secs - rem + interval
    } else {
        secs - rem
    }
}

/// Compare two hex trace ids by value rather than by string, tolerating
/// differences in case and zero padding between encoders.
pub fn equal_hex_trace_ids(a: &str, b: &str) -> Result<bool, ParseIntError> {
    let a = u128::from_str_radix(a.trim(), 16)?;
    let b = u128::from_str_radix(b.trim(), 16)?;
    Ok(a == b)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn rounds_to_nearest_interval() {
        let interval = Duration::from_secs(15);
        // below the midpoint rounds down, at or above rounds up
        assert_eq!(round_to_interval(1_000_000_007, interval), 1_000_000_005);
        assert_eq!(round_to_interval(1_000_000_013, interval), 1_000_000_020);
        assert_eq!(round_to_interval(1_000_000_005, interval), 1_000_000_005);
    }

    #[test]
    fn seed_buckets_align_across_processes() {
        let interval = Duration::from_secs(15);
        let a = Seed::new(at(1_700_000_008), interval, "tenant-a").unwrap();
        let b = Seed::new(at(1_700_000_012), interval, "tenant-a").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn trace_id_is_stable_and_valid() {
        let seed = Seed::at(1_700_000_100, "test-org");
        let again = Seed::at(1_700_000_100, "test-org");
        assert_eq!(seed.trace_id(), again.trace_id());
        assert_ne!(seed.trace_id(), TraceId::INVALID);
    }

    #[test]
    fn trace_id_depends_on_tenant_and_time() {
        let base = Seed::at(1_700_000_100, "test-org");
        assert_ne!(
            base.trace_id(),
            Seed::at(1_700_000_100, "other-org").trace_id()
        );
        assert_ne!(
            base.trace_id(),
            Seed::at(1_700_000_115, "test-org").trace_id()
        );
    }

    #[test]
    fn pre_epoch_timestamp_is_rejected() {
        let err = Seed::new(
            UNIX_EPOCH - Duration::from_secs(1),
            Duration::from_secs(15),
            "t",
        )
        .unwrap_err();
        assert_eq!(err, SeedError::PreEpochTimestamp);
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = Seed::new(at(10), Duration::ZERO, "t").unwrap_err();
        assert_eq!(err, SeedError::ZeroInterval);
    }

    #[test]
    fn hex_ids_compare_by_value() {
        assert!(equal_hex_trace_ids("00ab3f", "AB3F").unwrap());
        assert!(!equal_hex_trace_ids("ab3f", "ab40").unwrap());
        assert!(equal_hex_trace_ids("zzz", "ab3f").is_err());
    }

    #[test]
    fn hex_id_round_trips_through_display() {
        let seed = Seed::at(1_700_000_100, "test-org");
        let hex = seed.hex_id();
        assert_eq!(hex.len(), 32);
        assert_eq!(TraceId::from_hex(&hex).unwrap(), seed.trace_id());
    }

    #[test]
    fn purpose_streams_are_independent() {
        let seed = Seed::at(1_700_000_100, "test-org");
        let a: u64 = seed.rng(PURPOSE_GENERATION).random();
        let b: u64 = seed.rng(PURPOSE_SEARCH_ATTR).random();
        assert_ne!(a, b);
    }
}
