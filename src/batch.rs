//! Merging of the two per-earbud streams and packaging into upload batches.

use std::time::Duration;

use serde::Serialize;

use crate::protocol::MERGED_CHANNELS;
use crate::types::{MergedRecord, RawSample, Side};

/// Pair left and right samples by their position within each side.
///
/// `samples` is the interleaved collection buffer in arrival order. The
/// `i`-th left sample is combined with the `i`-th right sample; whichever
/// side has more samples loses its excess tail. Nothing is carried over to
/// the next window.
pub fn merge_by_index(samples: &[RawSample]) -> Vec<MergedRecord> {
    let left = samples.iter().filter(|s| s.side == Side::Left);
    let right = samples.iter().filter(|s| s.side == Side::Right);
    left.zip(right)
        .filter_map(|(l, r)| MergedRecord::pair(l, r))
        .collect()
}

/// The unit of transmission: every merged record from one collection window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Lifetime index of `records[0]` within the current collection session.
    pub first_index: u64,
    pub records: Vec<MergedRecord>,
    /// Length of the window the records were collected over.
    pub duration: Duration,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// JSON body for the bulk ingestion endpoint.
    pub fn to_payload(&self) -> BatchPayload {
        let records = self
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| RecordPayload {
                sample_index: self.first_index + i as u64,
                timestamp: r.timestamp.clone(),
                eeg: r.channels,
            })
            .collect();
        BatchPayload {
            records,
            duration: format_seconds(self.duration),
        }
    }
}

/// Wire form of a [`Batch`].
#[derive(Debug, Clone, Serialize)]
pub struct BatchPayload {
    pub records: Vec<RecordPayload>,
    /// Window length in seconds, as a string (`"2"`, `"2.5"`).
    pub duration: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordPayload {
    pub sample_index: u64,
    pub timestamp: String,
    pub eeg: [i32; MERGED_CHANNELS],
}

/// `2000 ms` → `"2"`, `2500 ms` → `"2.5"`.
fn format_seconds(d: Duration) -> String {
    format!("{}", d.as_millis() as f64 / 1000.0)
}

/// Turns drained buffers into batches while keeping the record index
/// monotonic for the lifetime of one collection session.
#[derive(Debug)]
pub struct BatchBuilder {
    window: Duration,
    next_index: u64,
}

impl BatchBuilder {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            next_index: 0,
        }
    }

    /// Start a new collection session; indices restart at zero.
    pub fn reset(&mut self) {
        self.next_index = 0;
    }

    /// Merge a drained buffer. Returns `None` when no left/right pair could
    /// be formed, in which case the index does not advance.
    pub fn build(&mut self, drained: &[RawSample]) -> Option<Batch> {
        let records = merge_by_index(drained);
        if records.is_empty() {
            return None;
        }
        let batch = Batch {
            first_index: self.next_index,
            duration: self.window,
            records,
        };
        self.next_index += batch.len() as u64;
        Some(batch)
    }
}
