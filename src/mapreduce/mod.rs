//! User-function surface of the engine.
//!
//! The engine moves string key/value records; user code supplies a mapper,
//! a reducer, and a resumable aggregate. Functions must be deterministic:
//! re-execution of an attempt on the same input has to produce identical
//! output, which is what makes at-most-once canonical outputs possible.

pub mod merge;
pub mod shard;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// `(K1, V1) → [(K2, V2)]`. `input_name` is the split URI, `contents` its
/// bytes decoded as UTF-8.
pub trait Mapper: Send + Sync {
    fn map(&self, input_name: &str, contents: &str) -> Vec<(String, String)>;
}

/// `(K2, [V2]) → [(K2, V3)]`, invoked once per key group in sort order.
pub trait Reducer: Send + Sync {
    fn reduce(&self, key: &str, values: &[String]) -> Vec<(String, String)>;
}

/// Resumable reducer-side state. The engine treats the serialized form as
/// opaque bytes; only user code can interpret it.
pub trait Aggregate: Send + Sync {
    /// Fold in the reducer's output for one key group.
    fn merge(&mut self, key: &str, outputs: &[(String, String)]);

    fn serialize(&self) -> Result<Vec<u8>>;

    /// Render the final output records, in emission order.
    fn finish(self: Box<Self>) -> Vec<(String, String)>;
}

/// A named mapper/reducer/aggregate triple, addressed by the job
/// manifest's `code_ref`.
pub trait JobFunctions: Send + Sync {
    fn mapper(&self) -> Box<dyn Mapper>;
    fn reducer(&self) -> Box<dyn Reducer>;
    fn new_aggregate(&self) -> Box<dyn Aggregate>;
    fn restore_aggregate(&self, bytes: &[u8]) -> Result<Box<dyn Aggregate>>;
}

/// Worker-side registry of runnable job functions.
#[derive(Default)]
pub struct FunctionRegistry {
    entries: BTreeMap<String, Arc<dyn JobFunctions>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in functions.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("wordcount", Arc::new(WordCount));
        registry
    }

    pub fn register(&mut self, code_ref: &str, functions: Arc<dyn JobFunctions>) {
        self.entries.insert(code_ref.to_string(), functions);
    }

    pub fn resolve(&self, code_ref: &str) -> Result<Arc<dyn JobFunctions>> {
        self.entries
            .get(code_ref)
            .cloned()
            .ok_or_else(|| EngineError::Config(format!("unknown code_ref: {code_ref}")))
    }
}

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// 64-bit FNV-1a over the key bytes.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Stable partition function: `fnv1a(key) mod R`. The hash is fixed by
/// this crate rather than borrowed from the standard library, so shard
/// placement is reproducible across runs, platforms, and re-executed
/// attempts.
pub fn partition_for(key: &str, reduce_count: u32) -> u32 {
    (fnv1a(key.as_bytes()) % u64::from(reduce_count)) as u32
}

// ── Built-in word count ──────────────────────────────────────────────────

/// The classic demo pair: tokenize on non-alphanumerics, count per word.
pub struct WordCount;

impl Mapper for WordCount {
    fn map(&self, _input_name: &str, contents: &str) -> Vec<(String, String)> {
        contents
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(|w| (w.to_lowercase(), "1".to_string()))
            .collect()
    }
}

impl Reducer for WordCount {
    fn reduce(&self, key: &str, values: &[String]) -> Vec<(String, String)> {
        let total: u64 = values.iter().filter_map(|v| v.parse::<u64>().ok()).sum();
        vec![(key.to_string(), total.to_string())]
    }
}

/// Word-count aggregate: the output records accumulated so far, kept in
/// emission (sorted-key) order.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct WordCountAggregate {
    records: Vec<(String, String)>,
}

impl Aggregate for WordCountAggregate {
    fn merge(&mut self, _key: &str, outputs: &[(String, String)]) {
        self.records.extend(outputs.iter().cloned());
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn finish(self: Box<Self>) -> Vec<(String, String)> {
        self.records
    }
}

impl JobFunctions for WordCount {
    fn mapper(&self) -> Box<dyn Mapper> {
        Box::new(WordCount)
    }

    fn reducer(&self) -> Box<dyn Reducer> {
        Box::new(WordCount)
    }

    fn new_aggregate(&self) -> Box<dyn Aggregate> {
        Box::new(WordCountAggregate::default())
    }

    fn restore_aggregate(&self, bytes: &[u8]) -> Result<Box<dyn Aggregate>> {
        let aggregate: WordCountAggregate = serde_json::from_slice(bytes)?;
        Ok(Box::new(aggregate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wordcount_map_tokenizes_and_lowercases() {
        let pairs = WordCount.map("in", "The quick, quick fox!");
        assert_eq!(
            pairs,
            vec![
                ("the".to_string(), "1".to_string()),
                ("quick".to_string(), "1".to_string()),
                ("quick".to_string(), "1".to_string()),
                ("fox".to_string(), "1".to_string()),
            ]
        );
    }

    #[test]
    fn wordcount_reduce_sums_counts() {
        let out = WordCount.reduce("fox", &["1".into(), "1".into(), "1".into()]);
        assert_eq!(out, vec![("fox".to_string(), "3".to_string())]);
    }

    #[test]
    fn fnv1a_matches_reference_vectors() {
        // Published FNV-1a 64-bit test vectors.
        assert_eq!(fnv1a(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn partition_is_stable_and_in_range() {
        for key in ["the", "quick", "brown", "fox", "dog", "lazy"] {
            let p = partition_for(key, 2);
            assert!(p < 2);
            assert_eq!(p, partition_for(key, 2));
        }
    }

    #[test]
    fn aggregate_round_trips_through_serialization() {
        let mut aggregate = WordCountAggregate::default();
        aggregate.merge("dog", &[("dog".into(), "2".into())]);
        aggregate.merge("fox", &[("fox".into(), "4".into())]);
        let bytes = Aggregate::serialize(&aggregate).unwrap();
        let restored = WordCount.restore_aggregate(&bytes).unwrap();
        assert_eq!(
            restored.finish(),
            vec![
                ("dog".to_string(), "2".to_string()),
                ("fox".to_string(), "4".to_string()),
            ]
        );
    }
}
