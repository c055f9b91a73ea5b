use crate::parse::{parse_stream, StreamRecord};
use serde::{Deserialize, Serialize};
use std::{fs, io::ErrorKind, path::PathBuf};
use tracing::{debug, trace, warn};

/// Derived view of indexing progress, safe to recompute at any time
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub num_indexed: usize,
    pub num_processed: usize,
    pub index_rate_percent: f64,
    pub fraction_done_percent: f64,
}

/// Per-event indexed peak counts derived from stream records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedPeaks {
    /// indexed peak count per event of the run, 0 when not indexed
    pub peaks: Vec<i64>,
    /// records that reached their `num_peaks` line
    pub processed: usize,
}

impl IndexedPeaks {
    /// Map records onto events through the run's event table.
    ///
    /// `Event: //k` refers to position `k` of the event table; only indexed
    /// records contribute their peak count.
    pub fn from_records<'a, I>(records: I, event_table: &[usize], total_events: usize) -> Self
    where
        I: IntoIterator<Item = &'a StreamRecord>,
    {
        let mut peaks = vec![0; total_events];
        let mut processed = 0;

        for record in records {
            processed += 1;

            if !record.is_indexed() {
                continue;
            }

            match event_table.get(record.event).copied() {
                Some(event) if event < total_events => {
                    peaks[event] = i64::try_from(record.num_peaks).unwrap_or(i64::MAX);
                }
                mapped => warn!(
                    record = record.event,
                    mapped = ?mapped,
                    "Stream references an event outside the run, ignoring it"
                ),
            }
        }

        Self { peaks, processed }
    }

    pub fn num_indexed(&self) -> usize {
        self.peaks.iter().filter(|&&peaks| peaks > 0).count()
    }

    pub fn snapshot(&self, expected_hits: usize) -> ProgressSnapshot {
        let num_indexed = self.num_indexed();
        let percent = |part: usize, whole: usize| {
            if whole == 0 {
                0.0
            } else {
                part as f64 * 100.0 / whole as f64
            }
        };

        ProgressSnapshot {
            num_indexed,
            num_processed: self.processed,
            index_rate_percent: percent(num_indexed, self.processed),
            fraction_done_percent: percent(self.processed, expected_hits),
        }
    }
}

/// Computes progress from whatever chunk streams exist right now
#[derive(Debug, Clone)]
pub struct ProgressAggregator {
    event_table: Vec<usize>,
    total_events: usize,
    /// hits known at run start, the denominator of the done fraction
    expected_hits: usize,
}

impl ProgressAggregator {
    pub fn new(event_table: Vec<usize>, total_events: usize, expected_hits: usize) -> Self {
        Self {
            event_table,
            total_events,
            expected_hits,
        }
    }

    pub fn expected_hits(&self) -> usize {
        self.expected_hits
    }

    pub fn indexed_peaks(&self, records: &[StreamRecord]) -> IndexedPeaks {
        IndexedPeaks::from_records(records, &self.event_table, self.total_events)
    }

    /// Read all chunk streams in order and summarize them.
    ///
    /// Missing streams and half written records are expected while jobs run
    /// and never fail the snapshot.
    pub fn snapshot(&self, streams: &[PathBuf]) -> ProgressSnapshot {
        let mut records = Vec::new();

        for stream in streams {
            match fs::read(stream) {
                Ok(bytes) => {
                    let parsed = parse_stream(&String::from_utf8_lossy(&bytes));
                    trace!(
                        stream = ?stream,
                        records = parsed.records.len(),
                        incomplete = parsed.incomplete,
                        "Read chunk stream"
                    );
                    records.extend(parsed.records);
                }
                Err(error) if error.kind() == ErrorKind::NotFound => {
                    trace!(stream = ?stream, "Chunk stream not written yet");
                }
                Err(error) => {
                    debug!(stream = ?stream, error = ?error, "Failed to read chunk stream");
                }
            }
        }

        self.indexed_peaks(&records).snapshot(self.expected_hits)
    }
}
