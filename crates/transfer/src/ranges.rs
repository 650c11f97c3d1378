//! Tracks which byte ranges of a file the server has acknowledged.
//!
//! Parts complete out of order under concurrency, so the resume point is
//! not the highest acknowledged offset but the end of the gap-free prefix.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CompletedRange {
    offset: u64,
    length: u64,
    /// Number of parts merged into this range.
    parts: u64,
}

impl CompletedRange {
    fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// Sorted list of disjoint, merged `[offset, offset + length)` ranges.
///
/// The list always starts with a range at offset 0 (initially empty), so
/// the completed-through position is simply the end of the first range.
/// Not synchronised; callers lock around [`add`](Self::add).
#[derive(Debug, Clone)]
pub struct CompletedRangeTracker {
    ranges: Vec<CompletedRange>,
}

impl Default for CompletedRangeTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletedRangeTracker {
    pub fn new() -> Self {
        Self {
            ranges: vec![CompletedRange {
                offset: 0,
                length: 0,
                parts: 0,
            }],
        }
    }

    /// Creates a tracker whose first `prefix` bytes are already complete.
    ///
    /// Used when resuming: the prefix counts as zero parts.
    pub fn with_completed_prefix(prefix: u64) -> Self {
        Self {
            ranges: vec![CompletedRange {
                offset: 0,
                length: prefix,
                parts: 0,
            }],
        }
    }

    /// Records one completed part.
    ///
    /// Zero-length parts are ignored. Ranges must not overlap ones already
    /// recorded; each part is handed out exactly once by the part source.
    pub fn add(&mut self, offset: u64, length: u64) {
        if length == 0 {
            return;
        }

        // Last range starting at or before `offset`. The sentinel at 0 means
        // there always is one.
        let idx = self
            .ranges
            .iter()
            .rposition(|r| r.offset <= offset)
            .unwrap_or(0);

        let merged_idx = if self.ranges[idx].end() == offset {
            let prev = &mut self.ranges[idx];
            prev.length += length;
            prev.parts += 1;
            idx
        } else {
            self.ranges.insert(
                idx + 1,
                CompletedRange {
                    offset,
                    length,
                    parts: 1,
                },
            );
            idx + 1
        };

        // Merge with the following range if now contiguous.
        if let Some(next) = self.ranges.get(merged_idx + 1).copied()
            && self.ranges[merged_idx].end() == next.offset
        {
            let cur = &mut self.ranges[merged_idx];
            cur.length += next.length;
            cur.parts += next.parts;
            self.ranges.remove(merged_idx + 1);
        }
    }

    /// End of the longest gap-free prefix starting at byte 0.
    pub fn completed_through_position(&self) -> u64 {
        self.ranges[0].end()
    }

    /// Number of parts that make up the gap-free prefix.
    ///
    /// Parts are numbered consecutively in offset order, so this is also
    /// how far part numbering advanced past the starting index.
    pub fn completed_prefix_parts(&self) -> u64 {
        self.ranges[0].parts
    }

    /// Total bytes recorded, including ranges after a gap.
    pub fn total_completed(&self) -> u64 {
        self.ranges.iter().map(|r| r.length).sum()
    }

    /// Number of disjoint ranges (including the leading one).
    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }
}
