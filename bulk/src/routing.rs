use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Lowest key of the hashed key-space, owned by the first range.
pub const MINIMUM_INCLUSIVE_KEY: &str = "";
/// Exclusive upper bound of the key-space. Longer than any effective key so
/// every hash lands strictly below it.
pub const MAXIMUM_EXCLUSIVE_KEY: &str = "ffffffffffffffffff";

/// A caller-supplied partition key value.
///
/// `None` is the explicit "no partition key" sentinel and is distinct from
/// `Null`: documents written without a key route through the sentinel, while
/// `Null` is a real JSON null value at the key path.
#[derive(Clone, Debug, PartialEq)]
pub enum PartitionKeyValue {
    None,
    Null,
    String(String),
    Number(f64),
    Bool(bool),
}

impl PartitionKeyValue {
    pub(crate) fn to_wire(&self) -> serde_json::Value {
        match self {
            PartitionKeyValue::None => serde_json::json!({}),
            PartitionKeyValue::Null => serde_json::Value::Null,
            PartitionKeyValue::String(s) => serde_json::Value::String(s.clone()),
            PartitionKeyValue::Number(n) => serde_json::json!(n),
            PartitionKeyValue::Bool(b) => serde_json::Value::Bool(*b),
        }
    }
}

impl From<&str> for PartitionKeyValue {
    fn from(value: &str) -> Self {
        PartitionKeyValue::String(value.to_string())
    }
}

impl From<String> for PartitionKeyValue {
    fn from(value: String) -> Self {
        PartitionKeyValue::String(value)
    }
}

impl From<f64> for PartitionKeyValue {
    fn from(value: f64) -> Self {
        PartitionKeyValue::Number(value)
    }
}

impl From<bool> for PartitionKeyValue {
    fn from(value: bool) -> Self {
        PartitionKeyValue::Bool(value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionKeyKind {
    Hash,
}

/// Container-level partition key definition, fetched from the collaborator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionKeyDefinition {
    pub paths: Vec<String>,
    pub kind: PartitionKeyKind,
}

impl Default for PartitionKeyDefinition {
    fn default() -> Self {
        Self {
            paths: vec!["/id".to_string()],
            kind: PartitionKeyKind::Hash,
        }
    }
}

/// One contiguous slice of the hashed key-space.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PartitionKeyRange {
    pub id: String,
    pub min_inclusive: String,
    pub max_exclusive: String,
}

/// The set of ranges covering the key-space, ordered by `min_inclusive`.
#[derive(Clone, Debug, Default)]
pub struct RoutingMap {
    ranges: Vec<PartitionKeyRange>,
}

impl RoutingMap {
    pub fn new(mut ranges: Vec<PartitionKeyRange>) -> Self {
        ranges.sort_by(|a, b| a.min_inclusive.cmp(&b.min_inclusive));
        Self { ranges }
    }

    /// A map with one range owning the whole key-space.
    pub fn single(range_id: impl Into<String>) -> Self {
        Self::new(vec![PartitionKeyRange {
            id: range_id.into(),
            min_inclusive: MINIMUM_INCLUSIVE_KEY.to_string(),
            max_exclusive: MAXIMUM_EXCLUSIVE_KEY.to_string(),
        }])
    }

    pub fn ranges(&self) -> &[PartitionKeyRange] {
        &self.ranges
    }

    pub fn range_containing(&self, effective_key: &str) -> Option<&PartitionKeyRange> {
        self.ranges
            .iter()
            .find(|r| r.min_inclusive.as_str() <= effective_key && effective_key < r.max_exclusive.as_str())
    }
}

/// Computes the effective partition key: the position of the value in the
/// hashed key-space, as a fixed-width lowercase hex string.
pub fn effective_partition_key(
    partition_key: &PartitionKeyValue,
    _definition: &PartitionKeyDefinition,
) -> String {
    match partition_key {
        // the executor resolves keyless operations through the container's
        // none value first; a sentinel reaching this point hashes to the
        // lowest key
        PartitionKeyValue::None => MINIMUM_INCLUSIVE_KEY.to_string(),
        PartitionKeyValue::Null => format!("{:016x}", fnv1a64(&[0x01])),
        PartitionKeyValue::Bool(b) => format!("{:016x}", fnv1a64(&[0x02, *b as u8])),
        PartitionKeyValue::Number(n) => {
            let mut bytes = vec![0x03];
            bytes.extend_from_slice(&n.to_bits().to_be_bytes());
            format!("{:016x}", fnv1a64(&bytes))
        }
        PartitionKeyValue::String(s) => {
            let mut bytes = vec![0x04];
            bytes.extend_from_slice(s.as_bytes());
            format!("{:016x}", fnv1a64(&bytes))
        }
    }
}

/// Resolves the partition range id owning `partition_key`. Pure function of
/// its inputs; the caller supplies a current routing map.
pub fn range_id_of(
    partition_key: &PartitionKeyValue,
    definition: &PartitionKeyDefinition,
    map: &RoutingMap,
) -> Result<String, Error> {
    let effective_key = effective_partition_key(partition_key, definition);
    map.range_containing(&effective_key)
        .map(|r| r.id.clone())
        .ok_or_else(|| Error::Protocol(format!("no partition range owns key {effective_key}")))
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    let mut hash = OFFSET_BASIS;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
