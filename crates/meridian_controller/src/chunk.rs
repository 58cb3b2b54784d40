//! The chunk map: ordered key ranges and the storage nodes hosting them.
//!
//! Only the primary mutates the map; non-primary replicas replace it
//! wholesale from `ChunkListUpdate` broadcasts. Every mutation and snapshot
//! goes through one async mutex, which chunk-list broadcasts keep held across
//! their serial sends so no peer ever observes a half-applied change.

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};

use crate::node::NodeDefinition;

/// Boundary of a chunk's half-open key range.
///
/// `Start` sorts below every concrete key and `End` above, so the derived
/// ordering is exactly the sentinel-extended key order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChunkMarker {
    Start,
    Value(String),
    End,
}

/// One half-open key range `[start, end)` and its owning storage node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDefinition {
    pub start: ChunkMarker,
    pub end: ChunkMarker,
    pub owner: NodeDefinition,
}

impl ChunkDefinition {
    pub fn new(start: ChunkMarker, end: ChunkMarker, owner: NodeDefinition) -> Self {
        Self { start, end, owner }
    }
}

/// Authoritative ordered chunk list, kept sorted by start marker.
#[derive(Debug, Default)]
pub struct ChunkMap {
    chunks: Mutex<Vec<ChunkDefinition>>,
}

impl ChunkMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<ChunkDefinition> {
        self.chunks.lock().await.clone()
    }

    /// Lock the list directly. Chunk-list broadcasts hold this guard across
    /// their sends; everything else should prefer the named operations.
    pub async fn lock(&self) -> MutexGuard<'_, Vec<ChunkDefinition>> {
        self.chunks.lock().await
    }

    pub async fn is_empty(&self) -> bool {
        self.chunks.lock().await.is_empty()
    }

    /// Wholesale replacement from a chunk-list broadcast.
    pub async fn replace(&self, mut chunks: Vec<ChunkDefinition>) {
        chunks.sort_by(|a, b| a.start.cmp(&b.start));
        *self.chunks.lock().await = chunks;
    }

    /// Install the single full-range chunk for a fresh database. Returns
    /// false when the map is no longer empty.
    pub async fn install_initial(&self, owner: NodeDefinition) -> bool {
        let mut chunks = self.chunks.lock().await;
        if !chunks.is_empty() {
            return false;
        }
        chunks.push(ChunkDefinition::new(ChunkMarker::Start, ChunkMarker::End, owner));
        true
    }

    pub async fn clear(&self) {
        self.chunks.lock().await.clear();
    }

    /// Replace the chunk starting at `start1` with the two halves reported by
    /// a storage node. Returns false without touching the map when the target
    /// chunk is absent or the reported boundaries are malformed; the caller
    /// still acknowledges and the next broadcast reconciles the stale view.
    pub async fn apply_split(
        &self,
        start1: &ChunkMarker,
        end1: &ChunkMarker,
        start2: &ChunkMarker,
        end2: &ChunkMarker,
        owner: NodeDefinition,
    ) -> bool {
        if start1 >= end1 || start2 >= end2 || end1 != start2 {
            return false;
        }
        let mut chunks = self.chunks.lock().await;
        let Some(pos) = chunks.iter().position(|c| c.start == *start1) else {
            return false;
        };
        chunks.remove(pos);
        insert_sorted(
            &mut chunks,
            ChunkDefinition::new(start1.clone(), end1.clone(), owner.clone()),
        );
        insert_sorted(
            &mut chunks,
            ChunkDefinition::new(start2.clone(), end2.clone(), owner),
        );
        true
    }

    /// Collapse the chunk starting at `start` and the chunk ending at `end`
    /// (located independently) into one chunk owned by the reporting node.
    /// A merge naming no existing chunk is a no-op.
    pub async fn apply_merge(
        &self,
        start: &ChunkMarker,
        end: &ChunkMarker,
        owner: NodeDefinition,
    ) -> bool {
        if start >= end {
            return false;
        }
        let mut chunks = self.chunks.lock().await;
        let by_start = chunks.iter().position(|c| c.start == *start);
        let by_end = chunks.iter().position(|c| c.end == *end);
        if by_start.is_none() && by_end.is_none() {
            return false;
        }
        let mut doomed: Vec<usize> = by_start.into_iter().chain(by_end).collect();
        doomed.sort_unstable();
        doomed.dedup();
        for pos in doomed.into_iter().rev() {
            chunks.remove(pos);
        }
        insert_sorted(
            &mut chunks,
            ChunkDefinition::new(start.clone(), end.clone(), owner),
        );
        true
    }

    /// Drop every chunk owned by a lost storage node. The resulting coverage
    /// hole stands until another storage node reports the range.
    pub async fn remove_owner(&self, owner: &NodeDefinition) -> usize {
        let mut chunks = self.chunks.lock().await;
        let before = chunks.len();
        chunks.retain(|c| c.owner != *owner);
        before - chunks.len()
    }
}

fn insert_sorted(chunks: &mut Vec<ChunkDefinition>, chunk: ChunkDefinition) {
    let pos = match chunks.binary_search_by(|c| c.start.cmp(&chunk.start)) {
        Ok(pos) | Err(pos) => pos,
    };
    chunks.insert(pos, chunk);
}

/// True when `chunks` covers `[Start, End)` with no gap or overlap.
pub fn is_contiguous_cover(chunks: &[ChunkDefinition]) -> bool {
    let Some(first) = chunks.first() else {
        return false;
    };
    let Some(last) = chunks.last() else {
        return false;
    };
    if first.start != ChunkMarker::Start || last.end != ChunkMarker::End {
        return false;
    }
    chunks.windows(2).all(|w| w[0].end == w[1].start)
}
