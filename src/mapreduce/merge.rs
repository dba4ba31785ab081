//! K-way sorted merge across the map shards of one reduce partition.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Merge pre-sorted record lists into one stream of key groups.
///
/// Yields `(key, values)` with keys strictly increasing; values preserve
/// source order (shard index, then position) so reducers see a
/// deterministic sequence regardless of which worker runs them.
pub struct GroupedMerge {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    shards: Vec<std::vec::IntoIter<(String, String)>>,
}

#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    key: String,
    shard: usize,
    value: String,
}

impl GroupedMerge {
    pub fn new(shards: Vec<Vec<(String, String)>>) -> Self {
        let mut iters: Vec<_> = shards.into_iter().map(|s| s.into_iter()).collect();
        let mut heap = BinaryHeap::new();
        for (shard, iter) in iters.iter_mut().enumerate() {
            if let Some((key, value)) = iter.next() {
                heap.push(Reverse(HeapEntry { key, shard, value }));
            }
        }
        Self {
            heap,
            shards: iters,
        }
    }

    fn pop_record(&mut self) -> Option<(String, String)> {
        let Reverse(entry) = self.heap.pop()?;
        if let Some((key, value)) = self.shards[entry.shard].next() {
            self.heap.push(Reverse(HeapEntry {
                key,
                shard: entry.shard,
                value,
            }));
        }
        Some((entry.key, entry.value))
    }
}

impl Iterator for GroupedMerge {
    type Item = (String, Vec<String>);

    fn next(&mut self) -> Option<Self::Item> {
        let (key, first) = self.pop_record()?;
        let mut values = vec![first];
        while let Some(Reverse(peek)) = self.heap.peek() {
            if peek.key != key {
                break;
            }
            let (_, value) = self.pop_record().expect("peeked entry exists");
            values.push(value);
        }
        Some((key, values))
    }
}
