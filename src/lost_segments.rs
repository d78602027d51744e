//! Lost segment bookkeeping for the destination handler.
//!
//! The receiving entity detects reception gaps by comparing the offset of each incoming
//! file data PDU against the current progress. The resulting lost segments are tracked
//! here until the retransmitted data arrives, and they are drained into the segment
//! request lists of outgoing NAK PDUs.
use crate::pdu::nak::{SegmentRequest, SegmentRequests};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[non_exhaustive]
pub enum LostSegmentError {
    #[error("segment is empty")]
    EmptySegment,
    #[error("segment start {0} is larger than segment end {1}")]
    StartLargerThanEnd(u64, u64),
    #[error("invalid segment boundary detected for lost segment ({0}, {1})")]
    InvalidSegmentBoundary(u64, u64),
}

/// Sorted list of lost segments as `(start, end)` pairs with exclusive end offsets.
///
/// Segments are kept sorted by start offset and non-overlapping. Removal handles exact
/// matches and subsets, including splitting a tracked segment in two when retransmitted
/// data fills a hole in its middle.
#[derive(Debug, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct LostSegmentTracker {
    list: Vec<SegmentRequest>,
}

impl LostSegmentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> impl Iterator<Item = SegmentRequest> + '_ {
        self.list.iter().cloned()
    }

    #[inline]
    pub fn number_of_segments(&self) -> usize {
        self.list.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    #[inline]
    pub fn reset(&mut self) {
        self.list.clear();
    }

    /// Whether the given segment is fully covered by a tracked segment.
    pub fn segment_in_store(&self, segment: SegmentRequest) -> bool {
        self.list
            .iter()
            .any(|(start, end)| segment.0 >= *start && segment.1 <= *end)
    }

    pub fn add_lost_segment(&mut self, lost_seg: SegmentRequest) -> Result<(), LostSegmentError> {
        if lost_seg.1 == lost_seg.0 {
            return Err(LostSegmentError::EmptySegment);
        }
        if lost_seg.0 > lost_seg.1 {
            return Err(LostSegmentError::StartLargerThanEnd(lost_seg.0, lost_seg.1));
        }
        let insertion_idx = self
            .list
            .partition_point(|&(start, _)| start < lost_seg.0);
        self.list.insert(insertion_idx, lost_seg);
        Ok(())
    }

    /// Merge overlapping or adjacent segments in place.
    pub fn coalesce_lost_segments(&mut self) {
        self.list.retain(|&(start, end)| end > start);
        if self.list.len() <= 1 {
            return;
        }
        self.list.sort_unstable_by_key(|&(start, _)| start);
        let mut write_idx = 0;
        for read_idx in 0..self.list.len() {
            if write_idx == 0 {
                self.list[write_idx] = self.list[read_idx];
                write_idx = 1;
                continue;
            }
            let (prev_start, prev_end) = self.list[write_idx - 1];
            let (start, end) = self.list[read_idx];
            if start <= prev_end {
                if end > prev_end {
                    self.list[write_idx - 1] = (prev_start, end);
                }
            } else {
                self.list[write_idx] = (start, end);
                write_idx += 1;
            }
        }
        self.list.truncate(write_idx);
    }

    /// Remove a segment which was filled by retransmitted data.
    ///
    /// The removed segment must either match a tracked segment exactly or be a subset of
    /// one. A removal which fills the middle of a tracked segment splits it in two.
    /// Partial overlaps across tracked segment boundaries are rejected. Returns whether
    /// a tracked segment was modified.
    pub fn remove_lost_segment(
        &mut self,
        segment_to_remove: SegmentRequest,
    ) -> Result<bool, LostSegmentError> {
        if segment_to_remove.1 == segment_to_remove.0 {
            return Err(LostSegmentError::EmptySegment);
        }
        if segment_to_remove.0 > segment_to_remove.1 {
            return Err(LostSegmentError::StartLargerThanEnd(
                segment_to_remove.0,
                segment_to_remove.1,
            ));
        }
        let mut i = match self
            .list
            .binary_search_by_key(&segment_to_remove.0, |&(start, _)| start)
        {
            Ok(idx) => idx,
            Err(insertion) => insertion.saturating_sub(1),
        };
        while i < self.list.len() && self.list[i].0 <= segment_to_remove.1 {
            let seg = &mut self.list[i];
            if seg.1 < segment_to_remove.0 {
                i += 1;
                continue;
            }
            if *seg == segment_to_remove {
                self.list.remove(i);
                return Ok(true);
            }
            // Partial overlap across a tracked boundary is forbidden.
            if (segment_to_remove.0 < seg.0 && segment_to_remove.1 > seg.0)
                || (segment_to_remove.1 > seg.1 && segment_to_remove.0 < seg.1)
            {
                return Err(LostSegmentError::InvalidSegmentBoundary(
                    segment_to_remove.0,
                    segment_to_remove.1,
                ));
            }
            let mut changed = false;
            if segment_to_remove.1 == seg.1 {
                seg.1 = segment_to_remove.0;
                changed = true;
            }
            if segment_to_remove.0 == seg.0 {
                seg.0 = segment_to_remove.1;
                changed = true;
            }
            if segment_to_remove.0 > seg.0 && segment_to_remove.1 < seg.1 {
                let end_of_right_remainder = seg.1;
                seg.1 = segment_to_remove.0;
                self.list
                    .insert(i + 1, (segment_to_remove.1, end_of_right_remainder));
                changed = true;
            }
            if changed {
                return Ok(true);
            }
            i += 1;
        }
        Ok(false)
    }

    /// Drain up to `limit` segments into a NAK PDU segment request list, starting with
    /// the metadata request `(0, 0)` if requested. The drained segments stay tracked
    /// until their data arrives.
    pub fn segment_requests(
        &self,
        request_metadata: bool,
        limit: usize,
    ) -> SegmentRequests {
        let mut requests = SegmentRequests::new();
        if request_metadata {
            if limit == 0 {
                return requests;
            }
            requests.push((0, 0));
        }
        for segment in self.iter() {
            if requests.len() >= limit {
                break;
            }
            requests.push(segment);
        }
        requests
    }
}
