//! The `Chunk` type: a byte-range record with a parent/child tree and
//! progress counter (SPEC_FULL.md §3, §4.1).
//!
//! Chunks live in an arena (`Download::chunks: Vec<Chunk>`) and refer
//! to each other by index rather than by owning pointer, so the
//! parent -> children and child -> parent edges can coexist without
//! a reference cycle (SPEC_FULL.md §9).

/// Index into a `Download`'s chunk arena. `0` is always the root
/// chunk once a download has been resumed at least once.
pub type ChunkId = usize;

#[derive(Debug, Clone)]
pub struct Chunk {
    pub parent: Option<ChunkId>,
    pub children: Vec<ChunkId>,
    pub offset: u64,
    /// The length the chunk was created with. Never changes once
    /// absorbed into `length`, except when a chunk is fully absorbed
    /// by the root stream (see `Download::fix_chunk`), in which case
    /// both are set to zero together.
    pub original_length: Option<u64>,
    /// The effective length, possibly shortened by an overlapping
    /// parent range.
    pub length: Option<u64>,
    pub loaded: u64,
}

impl Chunk {
    pub fn root(filesize: Option<u64>) -> Self {
        Self {
            parent: None,
            children: Vec::new(),
            offset: 0,
            original_length: filesize,
            length: filesize,
            loaded: 0,
        }
    }

    pub fn child(parent: ChunkId, offset: u64, length: u64) -> Self {
        Self {
            parent: Some(parent),
            children: Vec::new(),
            offset,
            original_length: Some(length),
            length: Some(length),
            loaded: 0,
        }
    }

    /// A chunk is never finished while its length is unknown.
    pub fn is_finished(&self, slots_supported: bool) -> bool {
        match self.length {
            None => false,
            Some(length) => {
                if slots_supported {
                    self.loaded >= length
                } else {
                    self.loaded >= self.original_length.unwrap_or(u64::MAX)
                }
            }
        }
    }

    /// Bytes still needed to fully load this chunk, or `None` if the
    /// relevant length is unknown.
    pub fn bytes_left(&self, slots_supported: bool) -> Option<u64> {
        if self.length.is_none() && self.original_length.is_none() {
            return None;
        }
        if slots_supported {
            self.length.map(|length| length.saturating_sub(self.loaded))
        } else {
            self.original_length
                .map(|length| length.saturating_sub(self.loaded))
        }
    }

    /// Bytes loaded so far, clamped to `length` once slot mode is on
    /// (a root chunk may have overshot its shortened length while
    /// `slots_supported` was still false).
    pub fn bytes_loaded(&self, slots_supported: bool) -> u64 {
        match self.length {
            None => self.loaded,
            Some(length) if slots_supported && self.loaded > length => length,
            Some(_) => self.loaded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_with_known_size_is_not_finished_until_loaded() {
        let mut root = Chunk::root(Some(100));
        assert!(!root.is_finished(false));
        root.loaded = 100;
        assert!(root.is_finished(false));
    }

    #[test]
    fn root_with_unknown_size_is_never_finished() {
        let mut root = Chunk::root(None);
        root.loaded = 1_000_000;
        assert!(!root.is_finished(false));
        assert_eq!(root.bytes_left(false), None);
    }

    #[test]
    fn bytes_loaded_clamps_to_length_once_slots_supported() {
        let mut root = Chunk::root(Some(100));
        root.length = Some(40);
        root.loaded = 70; // overshoot while slots_supported was false
        assert_eq!(root.bytes_loaded(false), 70);
        assert_eq!(root.bytes_loaded(true), 40);
    }

    #[test]
    fn child_chunk_tracks_its_own_range() {
        let child = Chunk::child(0, 100, 50);
        assert_eq!(child.offset, 100);
        assert_eq!(child.length, Some(50));
        assert_eq!(child.bytes_left(true), Some(50));
        assert!(!child.is_finished(true));
    }
}
