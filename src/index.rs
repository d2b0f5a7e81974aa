//! Thread-safe in-memory vector index for cosine similarity search.
//!
//! All stored embeddings are assumed L2-normalized, so cosine similarity
//! equals the dot product. Two parallel arrays (ids, vectors) give better
//! cache locality than a vec of pairs when scoring the whole set. At 512
//! floats * 4 bytes per embedding, 100k images need about 200 MB and a
//! full scan stays in the low milliseconds.
//!
//! Concurrency: one `RwLock`; any number of concurrent `top_k`/`len`
//! readers, exclusive writers for `load_all`/`upsert`/`remove`.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use parking_lot::RwLock;

use crate::vecmath::{bytes_to_vector, dot};

/// A single search hit: image id and similarity score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    pub image_id: i64,
    pub score: f64,
}

#[derive(Default)]
struct Entries {
    ids: Vec<i64>,
    vectors: Vec<Vec<f32>>,
}

/// Append-mostly in-memory index of (image id, unit vector) pairs.
pub struct VectorIndex {
    entries: RwLock<Entries>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Entries::default()),
        }
    }

    /// Replaces the whole index from bulk (id, raw embedding bytes) rows.
    ///
    /// Called at startup and after a bulk reindex. Rows with empty
    /// embeddings are skipped.
    pub fn load_all(&self, rows: Vec<(i64, Vec<u8>)>) {
        let mut entries = self.entries.write();
        entries.ids = Vec::with_capacity(rows.len());
        entries.vectors = Vec::with_capacity(rows.len());
        for (id, bytes) in rows {
            let vec = bytes_to_vector(&bytes);
            if vec.is_empty() {
                continue;
            }
            entries.ids.push(id);
            entries.vectors.push(vec);
        }
        tracing::info!("Vector index loaded {} embeddings", entries.ids.len());
    }

    /// Adds a new entry or overwrites an existing one in place.
    pub fn upsert(&self, image_id: i64, vector: Vec<f32>) {
        let mut entries = self.entries.write();
        if let Some(first) = entries.vectors.first() {
            assert_eq!(
                first.len(),
                vector.len(),
                "vector dimension mismatch: index holds {}-d, got {}-d",
                first.len(),
                vector.len()
            );
        }
        if let Some(i) = entries.ids.iter().position(|&id| id == image_id) {
            entries.vectors[i] = vector;
        } else {
            entries.ids.push(image_id);
            entries.vectors.push(vector);
        }
    }

    /// Removes an entry by id (swap with last, shrink by one).
    pub fn remove(&self, image_id: i64) {
        let mut entries = self.entries.write();
        if let Some(i) = entries.ids.iter().position(|&id| id == image_id) {
            entries.ids.swap_remove(i);
            entries.vectors.swap_remove(i);
        }
    }

    /// Current number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Finds the top-K most similar entries to the query vector.
    ///
    /// Scores every stored vector with a dot product and keeps the best
    /// `k + offset` in a bounded min-heap, then returns the `[offset,
    /// offset+k)` slice sorted by descending score (ties broken by
    /// ascending id, so ordering is deterministic).
    pub fn top_k(&self, query: &[f32], k: usize, offset: usize) -> Vec<SearchHit> {
        let entries = self.entries.read();
        let needed = k + offset;
        if needed == 0 || entries.ids.is_empty() || offset >= entries.ids.len() {
            return Vec::new();
        }

        // Max-heap over HeapHit's "worst first" ordering = bounded min-heap.
        let mut heap: BinaryHeap<HeapHit> = BinaryHeap::with_capacity(needed + 1);
        for i in 0..entries.ids.len() {
            let hit = HeapHit {
                id: entries.ids[i],
                score: dot(query, &entries.vectors[i]),
            };
            if heap.len() < needed {
                heap.push(hit);
            } else if let Some(worst) = heap.peek() {
                if hit < *worst {
                    heap.pop();
                    heap.push(hit);
                }
            }
        }

        let mut hits: Vec<HeapHit> = heap.into_vec();
        hits.sort();
        hits.into_iter()
            .skip(offset)
            .take(k)
            .map(|h| SearchHit {
                image_id: h.id,
                score: h.score,
            })
            .collect()
    }
}

impl Default for VectorIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// Heap entry ordered worst-first: lower score is "greater", and among
/// equal scores the higher id is "greater" (evicted first), which keeps
/// the final ordering score-descending / id-ascending.
#[derive(Debug, Clone, Copy)]
struct HeapHit {
    id: i64,
    score: f64,
}

impl PartialEq for HeapHit {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapHit {}

impl PartialOrd for HeapHit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapHit {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .score
            .partial_cmp(&self.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.id.cmp(&other.id))
    }
}
