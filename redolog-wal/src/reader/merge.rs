//! K-way merge of record sources into one commit-ts ordered stream.

use super::segment_reader::RecordSource;
use crate::entry::RedoRecord;
use crate::error::{RedoError, Result};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// A buffered record waiting in the merge heap.
struct HeapEntry {
    record: RedoRecord,
    source: usize,
}

impl HeapEntry {
    fn key(&self) -> (u64, usize) {
        (self.record.commit_ts(), self.source)
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for min-heap behavior; ties go to the lower source index
        other.key().cmp(&self.key())
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceState {
    /// Needs a refill before the next pop.
    Pending,
    /// Has exactly one record in the heap.
    Buffered,
    /// Exhausted or past the window end.
    Done,
}

/// Merges sources that are each commit-ts ordered, yielding records with
/// `start_ts <= commit_ts < end_ts` in non-decreasing commit-ts order.
pub struct MergeReader {
    sources: Vec<Box<dyn RecordSource>>,
    states: Vec<SourceState>,
    heap: BinaryHeap<HeapEntry>,
    start_ts: u64,
    end_ts: u64,
    closed: bool,
}

impl MergeReader {
    pub fn new(sources: Vec<Box<dyn RecordSource>>, start_ts: u64, end_ts: u64) -> Result<Self> {
        if start_ts >= end_ts {
            return Err(RedoError::InvalidWindow { start_ts, end_ts });
        }
        let states = vec![SourceState::Pending; sources.len()];
        Ok(Self {
            sources,
            states,
            heap: BinaryHeap::new(),
            start_ts,
            end_ts,
            closed: false,
        })
    }

    pub fn source_count(&self) -> usize {
        self.sources.len()
    }

    /// Returns whether every source is exhausted and nothing is buffered.
    pub fn is_exhausted(&self) -> bool {
        self.closed
            || (self.heap.is_empty() && self.states.iter().all(|s| *s == SourceState::Done))
    }

    /// Pulls from `index` until a record inside the window is buffered or
    /// the source is done.
    fn refill(&mut self, index: usize) -> Result<()> {
        loop {
            match self.sources[index].next_record()? {
                None => {
                    self.states[index] = SourceState::Done;
                    return Ok(());
                }
                Some(record) if record.commit_ts() >= self.end_ts => {
                    self.states[index] = SourceState::Done;
                    return Ok(());
                }
                Some(record) if record.commit_ts() < self.start_ts => continue,
                Some(record) => {
                    self.heap.push(HeapEntry {
                        record,
                        source: index,
                    });
                    self.states[index] = SourceState::Buffered;
                    return Ok(());
                }
            }
        }
    }

    fn refill_pending(&mut self) -> Result<()> {
        for index in 0..self.sources.len() {
            if self.states[index] == SourceState::Pending {
                self.refill(index)?;
            }
        }
        Ok(())
    }

    /// Returns up to `max_count` records.
    ///
    /// A batch shorter than `max_count` means no more data in the window.
    /// On error the records gathered by this call are dropped.
    pub fn read_next(&mut self, max_count: usize) -> Result<Vec<RedoRecord>> {
        let mut batch = Vec::with_capacity(max_count.min(1024));
        if self.closed {
            return Ok(batch);
        }

        while batch.len() < max_count {
            self.refill_pending()?;
            let Some(entry) = self.heap.pop() else {
                break;
            };
            self.states[entry.source] = SourceState::Pending;
            batch.push(entry.record);
        }

        Ok(batch)
    }

    /// Closes every source, aggregating errors. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.heap.clear();

        let mut errors = Vec::new();
        for (source, state) in self.sources.iter_mut().zip(self.states.iter_mut()) {
            *state = SourceState::Done;
            if let Err(e) = source.close() {
                errors.push(e);
            }
        }
        RedoError::collect(errors)
    }
}
