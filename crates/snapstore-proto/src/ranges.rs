//! Reply range accumulation
//!
//! Dispatch handlers answer chunk queries one chunk at a time; the
//! builder coalesces consecutive chunks into runs and seals a message
//! worth of ranges whenever the next chunk would push the encoded body
//! past [`MAX_BODY`]. One query can therefore produce several reply
//! messages of the same kind, each well-formed on its own.

use crate::message::{ExceptionRange, MAX_BODY, RANGE_SIZE};

/// Fixed part of every range-carrying reply body: id (4) + count (4).
const BODY_HEADER: usize = 8;

/// Coalescing builder for range-carrying replies.
pub struct RangeBuilder {
    with_exceptions: bool,
    body: usize,
    ranges: Vec<ExceptionRange>,
    sealed: Vec<Vec<ExceptionRange>>,
}

impl RangeBuilder {
    /// `with_exceptions` selects whether each chunk carries a
    /// snapshot-store address in the encoded reply.
    #[must_use]
    pub fn new(with_exceptions: bool) -> Self {
        Self {
            with_exceptions,
            body: BODY_HEADER,
            ranges: Vec::new(),
            sealed: Vec::new(),
        }
    }

    /// Append one chunk, coalescing with the previous run when the
    /// chunk is consecutive.
    pub fn push(&mut self, chunk: u64, exception: Option<u64>) {
        debug_assert_eq!(self.with_exceptions, exception.is_some());

        let per_chunk = if self.with_exceptions { 8 } else { 0 };
        let extends = self
            .ranges
            .last()
            .is_some_and(|r| r.chunk + u64::from(r.count) == chunk && r.count < u16::MAX);
        let cost = if extends { per_chunk } else { RANGE_SIZE + per_chunk };

        if self.body + cost > MAX_BODY {
            self.seal();
        }

        let extends = self
            .ranges
            .last()
            .is_some_and(|r| r.chunk + u64::from(r.count) == chunk && r.count < u16::MAX);
        if extends {
            let last = self.ranges.last_mut().unwrap();
            last.count += 1;
            if let Some(e) = exception {
                last.exceptions.push(e);
            }
            self.body += per_chunk;
        } else {
            self.ranges.push(ExceptionRange {
                chunk,
                count: 1,
                exceptions: exception.into_iter().collect(),
            });
            self.body += RANGE_SIZE + per_chunk;
        }
    }

    fn seal(&mut self) {
        let ranges = std::mem::take(&mut self.ranges);
        self.sealed.push(ranges);
        self.body = BODY_HEADER;
    }

    /// True if nothing was ever pushed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sealed.is_empty() && self.ranges.is_empty()
    }

    /// Consume the builder, yielding one range list per reply message.
    #[must_use]
    pub fn finish(mut self) -> Vec<Vec<ExceptionRange>> {
        if !self.ranges.is_empty() {
            self.seal();
        }
        self.sealed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_consecutive_chunks_coalesce() {
        let mut b = RangeBuilder::new(true);
        for c in 10..15 {
            b.push(c, Some(1000 + c));
        }
        b.push(99, Some(7));
        let groups = b.finish();
        assert_eq!(groups.len(), 1);
        let ranges = &groups[0];
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].chunk, 10);
        assert_eq!(ranges[0].count, 5);
        assert_eq!(ranges[0].exceptions, vec![1010, 1011, 1012, 1013, 1014]);
        assert_eq!(ranges[1].chunk, 99);
        assert_eq!(ranges[1].count, 1);
    }

    #[test]
    fn test_seals_at_body_cap() {
        // Each non-consecutive chunk with an exception costs 18 bytes;
        // 27 of them fit under the 500-byte cap, the 28th does not.
        let mut b = RangeBuilder::new(true);
        for i in 0..28u64 {
            b.push(i * 2, Some(i));
        }
        let groups = b.finish();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 27);
        assert_eq!(groups[1].len(), 1);
        assert_eq!(groups[1][0].chunk, 54);
    }

    #[test]
    fn test_plain_run_growth_is_free() {
        // Origin-backed runs only bump the count field, so a long
        // consecutive run never overflows a message.
        let mut b = RangeBuilder::new(false);
        for c in 0..10_000u64 {
            b.push(c, None);
        }
        let groups = b.finish();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 1);
        assert_eq!(groups[0][0].count, 10_000);
    }

    #[test]
    fn test_empty_builder() {
        let b = RangeBuilder::new(false);
        assert!(b.is_empty());
        assert!(b.finish().is_empty());
    }
}
