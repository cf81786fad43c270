use std::collections::{BTreeMap, HashMap};

use super::ResourceId;

/// Unique identifier of a chunk within a memory block. This is
/// in fact just the offset of the chunk within the block, since
/// two live chunks never start at the same offset.
type ChunkId = u64;

/// Portion of a memory block that is bound to one resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chunk {
    /// Offset of the chunk within the memory block.
    pub offset: u64,
    /// Size of the chunk in bytes.
    pub size: u64,
    /// Resource the chunk is bound to.
    pub owner: ResourceId,
}

impl Chunk {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Live chunks of a memory block, ordered by offset, along with
/// the index from each owner to its chunk.
#[derive(Default)]
pub(super) struct ChunkList {
    chunks: BTreeMap<ChunkId, Chunk>,
    owners: HashMap<ResourceId, ChunkId>,
    allocated: u64,
}

impl ChunkList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Number of bytes covered by live chunks.
    pub fn allocated(&self) -> u64 {
        self.allocated
    }

    pub fn iter(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    pub fn get(&self, owner: ResourceId) -> Option<&Chunk> {
        self.owners
            .get(&owner)
            .and_then(|offset| self.chunks.get(offset))
    }

    pub fn contains(&self, owner: ResourceId) -> bool {
        self.owners.contains_key(&owner)
    }

    /// First-fit search of an offset where `size` bytes aligned to
    /// `alignment` can be placed before `capacity`.
    pub fn find_fit(&self, size: u64, alignment: u64, capacity: u64) -> Option<u64> {
        // The candidate offset starts at the beginning of the
        // block, which is aligned to anything since offsets are
        // relative to the block.
        let mut cursor = 0;

        for chunk in self.chunks.values() {
            // If the gap between the cursor and the start of
            // this chunk is large enough, the new chunk goes
            // right before it. The cursor may have been aligned
            // past the start of the chunk, in which case there
            // is no gap at all.
            if chunk
                .offset
                .checked_sub(cursor)
                .is_some_and(|gap| gap >= size)
            {
                return Some(cursor);
            }

            // Else, skip past the chunk and align the cursor for
            // the next candidate gap.
            cursor = align_up(chunk.end(), alignment)?;
        }

        // No gap between chunks was large enough, so the only
        // space left is after the last chunk, up to the end of
        // the block.
        capacity
            .checked_sub(cursor)
            .filter(|&room| room >= size)
            .map(|_| cursor)
    }

    /// Size of the largest free range of the block, alignment
    /// aside.
    pub fn largest_gap(&self, capacity: u64) -> u64 {
        let mut largest = 0;
        let mut end = 0;

        for chunk in self.chunks.values() {
            largest = largest.max(chunk.offset - end);
            end = chunk.end();
        }

        largest.max(capacity.saturating_sub(end))
    }

    pub fn insert(&mut self, chunk: Chunk) {
        self.allocated += chunk.size;
        self.owners.insert(chunk.owner, chunk.offset);
        self.chunks.insert(chunk.offset, chunk);
    }

    pub fn remove(&mut self, owner: ResourceId) -> Option<Chunk> {
        let offset = self.owners.remove(&owner)?;
        let chunk = self.chunks.remove(&offset)?;
        self.allocated -= chunk.size;

        Some(chunk)
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.owners.clear();
        self.allocated = 0;
    }
}

fn align_up(value: u64, alignment: u64) -> Option<u64> {
    // Round the value up to the next multiple of the alignment,
    // unless it is already a multiple. Vulkan alignments are
    // powers of two, but the remainder form works for any
    // alignment. The result does not exist if it overflows.
    match value % alignment {
        0 => Some(value),
        remainder => value.checked_add(alignment - remainder),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(offset: u64, size: u64, owner: ResourceId) -> Chunk {
        Chunk { offset, size, owner }
    }

    #[test]
    fn empty_list_fits_at_start() {
        let list = ChunkList::new();

        assert_eq!(list.find_fit(100, 256, 1024), Some(0));
        assert_eq!(list.find_fit(1024, 1, 1024), Some(0));
        assert_eq!(list.find_fit(1025, 1, 1024), None);
    }

    #[test]
    fn aligns_after_existing_chunk() {
        let mut list = ChunkList::new();
        list.insert(chunk(0, 300, 1));

        assert_eq!(list.find_fit(300, 16, 1024), Some(304));
        assert_eq!(list.find_fit(300, 1, 1024), Some(300));
        assert_eq!(list.find_fit(300, 256, 1024), Some(512));
    }

    #[test]
    fn fills_gap_before_chunk() {
        let mut list = ChunkList::new();
        list.insert(chunk(0, 100, 1));
        list.insert(chunk(400, 100, 2));

        assert_eq!(list.find_fit(300, 4, 1024), Some(100));
        assert_eq!(list.find_fit(301, 4, 1024), Some(500));
    }

    #[test]
    fn exact_trailing_fit() {
        let mut list = ChunkList::new();
        list.insert(chunk(0, 512, 1));

        assert_eq!(list.find_fit(512, 512, 1024), Some(512));
        assert_eq!(list.find_fit(513, 1, 1024), None);
    }

    #[test]
    fn cursor_aligned_past_next_chunk_is_not_a_gap() {
        let mut list = ChunkList::new();
        list.insert(chunk(0, 10, 1));
        list.insert(chunk(12, 18, 2));

        // After the first chunk, the cursor is aligned to 16,
        // which is past the start of the second chunk: placing
        // the request there would overlap [12, 30).
        assert_eq!(list.find_fit(4, 16, 1024), Some(32));
    }

    #[test]
    fn cursor_aligned_past_capacity() {
        let mut list = ChunkList::new();
        list.insert(chunk(0, 1000, 1));

        assert_eq!(list.find_fit(1, 1024, 1020), None);
    }

    #[test]
    fn alignment_overflow_is_no_fit() {
        let mut list = ChunkList::new();
        list.insert(chunk(0, u64::MAX - 2, 1));

        assert_eq!(list.find_fit(1, 1 << 63, u64::MAX), None);
    }

    #[test]
    fn index_follows_inserts_and_removals() {
        let mut list = ChunkList::new();
        list.insert(chunk(0, 64, 7));
        list.insert(chunk(128, 64, 9));

        assert_eq!(list.len(), 2);
        assert_eq!(list.allocated(), 128);
        assert_eq!(list.get(9), Some(&chunk(128, 64, 9)));

        assert_eq!(list.remove(7), Some(chunk(0, 64, 7)));
        assert!(!list.contains(7));
        assert!(list.contains(9));
        assert_eq!(list.allocated(), 64);
        assert_eq!(list.remove(7), None);

        let offsets: Vec<_> = list.iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![128]);
    }

    #[test]
    fn largest_gap_includes_trailing_space() {
        let mut list = ChunkList::new();
        assert_eq!(list.largest_gap(1024), 1024);

        list.insert(chunk(100, 100, 1));
        list.insert(chunk(600, 100, 2));
        assert_eq!(list.largest_gap(1024), 400);

        list.insert(chunk(250, 300, 3));
        assert_eq!(list.largest_gap(1024), 324);
    }
}
