//! Line oriented parsing of scheduler logs and indexer streams.
//!
//! Both formats are free text. Lines are classified by their whole shape
//! instead of substring search, so a value that happens to contain a sentinel
//! phrase is never mistaken for the sentinel.

/// Printed by LSF once the job summary is appended to the log
pub const SUMMARY_SENTINEL: &str = "The output (if any) is above this job summary.";
/// Printed by LSF in the summary of a job that exited with status 0
pub const SUCCESS_SENTINEL: &str = "Successfully completed.";

const EVENT_PREFIX: &str = "Event: //";
const INDEXED_BY_KEY: &str = "indexed_by";
const NUM_PEAKS_KEY: &str = "num_peaks";

/// A scheduler log line the poller cares about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLine {
    SummaryLine,
    SuccessLine,
    Other,
}

impl LogLine {
    pub fn classify(line: &str) -> Self {
        match line.trim() {
            SUMMARY_SENTINEL => Self::SummaryLine,
            SUCCESS_SENTINEL => Self::SuccessLine,
            _ => Self::Other,
        }
    }
}

/// What a scheduler log says about its job so far
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogSummary {
    pub finished: bool,
    pub succeeded: bool,
}

pub fn summarize_log(content: &str) -> LogSummary {
    complete_lines(content).fold(LogSummary::default(), |mut summary, line| {
        match LogLine::classify(line) {
            LogLine::SummaryLine => summary.finished = true,
            LogLine::SuccessLine => summary.succeeded = true,
            LogLine::Other => {}
        }

        summary
    })
}

/// A stream line relevant for indexing statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamLine<'a> {
    /// `Event: //<index>`, index into the run's event table
    EventMarker(usize),
    /// `indexed_by = <method>`, `none` when nothing indexed
    IndexedBy(&'a str),
    /// `num_peaks = <count>`, closes a record
    NumPeaksLine(u64),
    Other,
}

fn key_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let (lhs, rhs) = line.split_once('=')?;

    (lhs.trim() == key).then(|| rhs.trim())
}

impl<'a> StreamLine<'a> {
    pub fn classify(line: &'a str) -> Self {
        let line = line.trim();

        if let Some(event) = line.strip_prefix(EVENT_PREFIX) {
            return event
                .trim()
                .parse()
                .map(Self::EventMarker)
                .unwrap_or(Self::Other);
        }

        if let Some(method) = key_value(line, INDEXED_BY_KEY) {
            return Self::IndexedBy(method);
        }

        if let Some(count) = key_value(line, NUM_PEAKS_KEY) {
            return count.parse().map(Self::NumPeaksLine).unwrap_or(Self::Other);
        }

        Self::Other
    }
}

/// One fully parsed per-event record of a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    pub event: usize,
    pub indexed_by: Option<String>,
    pub num_peaks: u64,
}

impl StreamRecord {
    pub fn is_indexed(&self) -> bool {
        self.indexed_by.is_some()
    }
}

/// Result of parsing a possibly unfinished stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedStream {
    pub records: Vec<StreamRecord>,
    /// an event marker was seen without its closing `num_peaks`
    pub incomplete: bool,
}

/// Lines of `content`, dropping a trailing line that lacks its newline.
///
/// Files are read while the writer is still appending, the last line may be
/// cut anywhere.
fn complete_lines(content: &str) -> impl Iterator<Item = &str> {
    let complete = match content.rfind('\n') {
        Some(end) => &content[..=end],
        None => "",
    };

    complete.lines()
}

pub fn parse_stream(content: &str) -> ParsedStream {
    let mut records = Vec::new();
    let mut open: Option<(usize, Option<String>)> = None;

    for line in complete_lines(content) {
        match StreamLine::classify(line) {
            StreamLine::EventMarker(event) => open = Some((event, None)),
            StreamLine::IndexedBy(method) => {
                if let Some((_, indexed_by)) = open.as_mut() {
                    *indexed_by = (method != "none").then(|| method.to_owned());
                }
            }
            StreamLine::NumPeaksLine(num_peaks) => {
                if let Some((event, indexed_by)) = open.take() {
                    records.push(StreamRecord {
                        event,
                        indexed_by,
                        num_peaks,
                    });
                }
            }
            StreamLine::Other => {}
        }
    }

    ParsedStream {
        records,
        incomplete: open.is_some(),
    }
}
