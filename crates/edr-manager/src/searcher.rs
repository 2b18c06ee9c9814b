// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time-range search over the event store.
//!
//! Events are not stored in timestamp order: a forwarder replaying its queue appends older
//! events after newer ones. A search first scans every segment once, keeping only where its
//! earliest matching event lies and how many complete bytes it holds. Segments then become
//! sorted runs, loaded lazily in the order of their earliest match and merged on timestamps
//! across segments and endpoints. Only runs that overlap the part of the result being produced
//! are held in memory.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use edr_protocol::Event;
use regex::Regex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::SearchError;
use crate::store::{parse_segment_name, COMPRESSED_EXTENSION};

#[derive(Debug, Clone)]
pub struct EventSearcher {
    root: PathBuf,
    basename: String,
    endpoint: Option<Uuid>,
}

impl EventSearcher {
    pub fn new(root: impl Into<PathBuf>, basename: impl Into<String>) -> Self {
        EventSearcher {
            root: root.into(),
            basename: basename.into(),
            endpoint: None,
        }
    }

    /// Restricts the search to a single endpoint
    #[must_use]
    pub fn for_endpoint(&self, uuid: Uuid) -> Self {
        EventSearcher {
            endpoint: Some(uuid),
            ..self.clone()
        }
    }

    /// Endpoints with a directory in the store
    pub fn endpoints(&self) -> Result<Vec<Uuid>, SearchError> {
        if let Some(uuid) = self.endpoint {
            return Ok(vec![uuid]);
        }
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut endpoints = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Ok(uuid) = Uuid::parse_str(&entry.file_name().to_string_lossy()) {
                endpoints.push(uuid);
            }
        }
        endpoints.sort();
        Ok(endpoints)
    }

    /// Events with `start <= timestamp <= end` whose serialized form matches `pattern`, in
    /// timestamp order. Events with equal timestamps keep their stored order.
    ///
    /// An empty pattern matches every event. The first `offset` matches are skipped and at most
    /// `limit` are returned. Each call reads the store from the start; events stored after the
    /// call are not part of the result.
    pub fn events(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        pattern: &str,
        limit: Option<usize>,
        offset: usize,
    ) -> Result<SearchIter, SearchError> {
        let pattern = if pattern.is_empty() {
            None
        } else {
            Some(Regex::new(pattern)?)
        };
        let filter = Filter {
            start,
            end,
            pattern,
        };

        let mut runs = Vec::new();
        for uuid in self.endpoints()? {
            for segment in self.segments(&uuid)? {
                match scan_segment(&segment, &filter, None, true) {
                    Ok(scan) => {
                        if let Some(first) = scan.events.first() {
                            runs.push(Run {
                                first: first.timestamp,
                                len: scan.len,
                                segment,
                            });
                        }
                    }
                    Err(e) => warn!(
                        "STORE | Skipping unreadable segment {}: {}",
                        segment.path.display(),
                        e
                    ),
                }
            }
        }

        Ok(SearchIter {
            merge: Merge::new(runs, filter),
            skip: offset,
            remaining: limit,
        })
    }

    /// Segments of an endpoint in sequence order. When a segment exists in both forms, the
    /// compressed one is complete and preferred.
    fn segments(&self, uuid: &Uuid) -> Result<Vec<Segment>, SearchError> {
        let dir = self.root.join(uuid.to_string());
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut segments: Vec<Segment> = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some((seq, compressed)) = parse_segment_name(&self.basename, &name.to_string_lossy())
            else {
                continue;
            };
            segments.push(Segment {
                seq,
                path: entry.path(),
                compressed,
            });
        }
        segments.sort_by_key(|s| (s.seq, !s.compressed));
        segments.dedup_by_key(|s| s.seq);
        Ok(segments)
    }
}

#[derive(Debug)]
struct Segment {
    seq: u32,
    path: PathBuf,
    compressed: bool,
}

fn open_segment(segment: &Segment) -> io::Result<Box<dyn BufRead + Send>> {
    if segment.compressed {
        return open_compressed(&segment.path);
    }
    match File::open(&segment.path) {
        Ok(file) => Ok(Box::new(BufReader::new(file))),
        // compressed between listing and opening
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let mut name = segment.path.as_os_str().to_os_string();
            name.push(".");
            name.push(COMPRESSED_EXTENSION);
            open_compressed(Path::new(&name))
        }
        Err(e) => Err(e),
    }
}

fn open_compressed(path: &Path) -> io::Result<Box<dyn BufRead + Send>> {
    let decoder = zstd::stream::read::Decoder::new(File::open(path)?)?;
    Ok(Box::new(BufReader::new(decoder)))
}

struct Filter {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    pattern: Option<Regex>,
}

impl Filter {
    fn matches(&self, line: &str, event: &Event) -> bool {
        event.timestamp >= self.start
            && event.timestamp <= self.end
            && self.pattern.as_ref().map_or(true, |p| p.is_match(line))
    }
}

struct SegmentScan {
    /// Matching events, sorted by timestamp
    events: Vec<Event>,
    /// Bytes of complete lines read
    len: u64,
}

/// Reads the matching events of a segment, at most `limit` bytes of it. A line without its
/// newline is the tail of a segment still being written and ends the scan. Problems are only
/// logged when `report` is set, so that a segment read twice warns once.
fn scan_segment(
    segment: &Segment,
    filter: &Filter,
    limit: Option<u64>,
    report: bool,
) -> io::Result<SegmentScan> {
    let reader = open_segment(segment)?;
    let mut reader: Box<dyn BufRead + Send> = match limit {
        Some(limit) => Box::new(reader.take(limit)),
        None => reader,
    };
    let path = segment.path.display();

    let mut scan = SegmentScan {
        events: Vec::new(),
        len: 0,
    };
    let mut buf = Vec::new();
    let mut line_number = 0usize;
    loop {
        buf.clear();
        let read = match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(e) => {
                if report {
                    warn!("STORE | Read error in {}: {}", path, e);
                }
                break;
            }
        };
        if buf.last() != Some(&b'\n') {
            if report {
                debug!("STORE | Ignoring partial line at the end of {}", path);
            }
            break;
        }
        scan.len += read as u64;
        line_number += 1;

        let Ok(line) = std::str::from_utf8(&buf) else {
            if report {
                warn!("STORE | Skipping non UTF-8 line {} in {}", line_number, path);
            }
            continue;
        };
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        match Event::from_line(line) {
            Ok(event) if filter.matches(line, &event) => scan.events.push(event),
            Ok(_) => {}
            Err(e) => {
                if report {
                    warn!(
                        "STORE | Skipping undecodable event on line {} of {}: {}",
                        line_number, path, e
                    );
                }
            }
        }
    }
    scan.events.sort_by_key(|event| event.timestamp);
    Ok(scan)
}

/// A segment with at least one match
struct Run {
    first: DateTime<Utc>,
    len: u64,
    segment: Segment,
}

enum RunState {
    Planned,
    Loaded(VecDeque<Event>),
    Done,
}

/// k-way merge of runs on event timestamps. A planned run sits in the heap under its earliest
/// match and is only read once that match is next in line.
struct Merge {
    runs: Vec<Run>,
    states: Vec<RunState>,
    heads: BinaryHeap<Reverse<(DateTime<Utc>, usize)>>,
    filter: Filter,
}

impl Merge {
    fn new(runs: Vec<Run>, filter: Filter) -> Self {
        let heads = runs
            .iter()
            .enumerate()
            .map(|(index, run)| Reverse((run.first, index)))
            .collect();
        let states = runs.iter().map(|_| RunState::Planned).collect();
        Merge {
            runs,
            states,
            heads,
            filter,
        }
    }

    fn load(&self, index: usize) -> VecDeque<Event> {
        let run = &self.runs[index];
        match scan_segment(&run.segment, &self.filter, Some(run.len), false) {
            Ok(scan) => scan.events.into(),
            Err(e) => {
                warn!(
                    "STORE | Segment {} became unreadable: {}",
                    run.segment.path.display(),
                    e
                );
                VecDeque::new()
            }
        }
    }
}

impl Iterator for Merge {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        loop {
            let Reverse((_, index)) = self.heads.pop()?;
            if let RunState::Planned = self.states[index] {
                let events = self.load(index);
                if let Some(event) = events.front() {
                    self.heads.push(Reverse((event.timestamp, index)));
                }
                self.states[index] = RunState::Loaded(events);
                continue;
            }

            let RunState::Loaded(events) = &mut self.states[index] else {
                continue;
            };
            let event = events.pop_front();
            match events.front() {
                Some(next) => self.heads.push(Reverse((next.timestamp, index))),
                None => self.states[index] = RunState::Done,
            }
            if event.is_some() {
                return event;
            }
        }
    }
}

/// Lazy iterator over search results
pub struct SearchIter {
    merge: Merge,
    skip: usize,
    remaining: Option<usize>,
}

impl Iterator for SearchIter {
    type Item = Event;

    fn next(&mut self) -> Option<Event> {
        if self.remaining == Some(0) {
            return None;
        }
        while self.skip > 0 {
            self.merge.next()?;
            self.skip -= 1;
        }
        let event = self.merge.next()?;
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::store::EventStore;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use serde_json::json;
    use std::time::Duration;
    use tracing_test::traced_test;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn store(root: &Path, segment_size: u64, compress: bool) -> EventStore {
        EventStore::open(StoreConfig {
            root: root.to_path_buf(),
            basename: "events".to_string(),
            rotation_interval: Duration::from_secs(3600),
            segment_size,
            compress,
        })
        .unwrap()
    }

    fn seconds(events: impl Iterator<Item = Event>) -> Vec<i64> {
        events
            .map(|e| (e.timestamp - at(0)).num_seconds())
            .collect()
    }

    #[test]
    fn test_range_is_inclusive() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path(), 1024 * 1024, false);
        let uuid = Uuid::new_v4();
        let events: Vec<Event> = (0..10)
            .map(|i| Event::new(json!({ "i": i })).with_timestamp(at(i)))
            .collect();
        store.append(uuid, &events).unwrap();

        let searcher = EventSearcher::new(root.path(), "events");
        let found = searcher.events(at(2), at(5), "", None, 0).unwrap();
        assert_eq!(seconds(found), vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_merges_endpoints_by_time() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path(), 256, true);
        let (even, odd) = (Uuid::new_v4(), Uuid::new_v4());
        for i in 0..20 {
            let uuid = if i % 2 == 0 { even } else { odd };
            store
                .append(uuid, &[Event::new(json!({ "i": i })).with_timestamp(at(i))])
                .unwrap();
        }

        let searcher = EventSearcher::new(root.path(), "events");
        let all = searcher.events(at(0), at(100), "", None, 0).unwrap();
        assert_eq!(seconds(all), (0..20).collect::<Vec<_>>());

        let only_odd = searcher
            .for_endpoint(odd)
            .events(at(0), at(100), "", None, 0)
            .unwrap();
        assert_eq!(seconds(only_odd), (1..20).step_by(2).collect::<Vec<_>>());
        store.close_all();

        // closed segments are compressed, results do not change
        let all = searcher.events(at(0), at(100), "", None, 0).unwrap();
        assert_eq!(all.count(), 20);
    }

    #[test]
    fn test_out_of_order_appends_come_back_sorted() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path(), 1024 * 1024, false);
        let (replayed, live) = (Uuid::new_v4(), Uuid::new_v4());
        let at_secs = |secs| Event::new(json!({ "t": secs })).with_timestamp(at(secs));
        store.append(replayed, &[at_secs(10)]).unwrap();
        store.append(replayed, &[at_secs(1)]).unwrap();
        store.append(live, &[at_secs(5)]).unwrap();

        let searcher = EventSearcher::new(root.path(), "events");
        let all = searcher.events(at(0), at(100), "", None, 0).unwrap();
        assert_eq!(seconds(all), vec![1, 5, 10]);

        let one = searcher
            .for_endpoint(replayed)
            .events(at(0), at(100), "", None, 0)
            .unwrap();
        assert_eq!(seconds(one), vec![1, 10]);
    }

    #[test]
    fn test_replay_in_later_segment_is_merged_in_time_order() {
        let root = tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4();
        let batch = |range: std::ops::Range<i64>| -> Vec<Event> {
            range
                .map(|i| Event::new(json!({ "i": i })).with_timestamp(at(i)))
                .collect()
        };

        // live events first, then the queue replayed by a restarted forwarder
        let first = store(root.path(), 1024 * 1024, true);
        first.append(uuid, &batch(20..30)).unwrap();
        first.close_all();
        let second = store(root.path(), 1024 * 1024, false);
        second.append(uuid, &batch(0..10)).unwrap();
        second.append(uuid, &batch(30..35)).unwrap();
        second.append(uuid, &batch(10..20)).unwrap();

        let searcher = EventSearcher::new(root.path(), "events");
        let all = searcher.events(at(0), at(100), "", None, 0).unwrap();
        assert_eq!(seconds(all), (0..35).collect::<Vec<_>>());

        let page = searcher.events(at(5), at(100), "", Some(4), 13).unwrap();
        assert_eq!(seconds(page), vec![18, 19, 20, 21]);
    }

    #[test]
    fn test_pattern_offset_limit() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path(), 1024 * 1024, false);
        let uuid = Uuid::new_v4();
        let events: Vec<Event> = (0..30)
            .map(|i| {
                let process = if i % 3 == 0 {
                    "powershell.exe"
                } else {
                    "explorer.exe"
                };
                Event::new(json!({ "process": process })).with_timestamp(at(i))
            })
            .collect();
        store.append(uuid, &events).unwrap();

        let searcher = EventSearcher::new(root.path(), "events");
        let powershell = searcher
            .events(at(0), at(100), "powershell", None, 0)
            .unwrap();
        assert_eq!(powershell.count(), 10);

        let page = searcher
            .events(at(0), at(100), r"power\w+\.exe", Some(3), 2)
            .unwrap();
        assert_eq!(seconds(page), vec![6, 9, 12]);

        let none = searcher.events(at(0), at(100), "", Some(0), 0).unwrap();
        assert_eq!(none.count(), 0);
    }

    #[test]
    fn test_invalid_pattern() {
        let root = tempfile::tempdir().unwrap();
        let searcher = EventSearcher::new(root.path(), "events");
        assert!(matches!(
            searcher.events(at(0), at(1), "(unclosed", None, 0),
            Err(SearchError::InvalidPattern(_))
        ));
    }

    #[test]
    fn test_missing_root_is_empty() {
        let root = tempfile::tempdir().unwrap();
        let searcher = EventSearcher::new(root.path().join("missing"), "events");
        let end = at(0) + ChronoDuration::days(1);
        assert_eq!(searcher.events(at(0), end, "", None, 0).unwrap().count(), 0);
    }

    #[test]
    fn test_prefers_compressed_copy_and_skips_partial_tail() {
        let root = tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4();
        let dir = root.path().join(uuid.to_string());
        fs::create_dir_all(&dir).unwrap();

        let line = |i: i64| {
            let mut line = Event::new(json!({ "i": i }))
                .with_timestamp(at(i))
                .to_line()
                .unwrap();
            line.push('\n');
            line
        };
        let plain = format!("{}{}", line(0), line(1));
        fs::write(dir.join("events.00000000.log"), &plain).unwrap();
        let compressed = zstd::stream::encode_all(plain.as_bytes(), 3).unwrap();
        fs::write(dir.join("events.00000000.log.zst"), compressed).unwrap();

        let active = format!("{}{{\"timestamp\":", line(2));
        fs::write(dir.join("events.00000001.log"), active).unwrap();

        let searcher = EventSearcher::new(root.path(), "events");
        let found = searcher.events(at(0), at(10), "", None, 0).unwrap();
        assert_eq!(seconds(found), vec![0, 1, 2]);
    }

    #[test]
    fn test_search_is_restartable() {
        let root = tempfile::tempdir().unwrap();
        let store = store(root.path(), 1024 * 1024, false);
        let uuid = Uuid::new_v4();
        store
            .append(uuid, &[Event::new(json!({})).with_timestamp(at(1))])
            .unwrap();
        let searcher = EventSearcher::new(root.path(), "events");
        assert_eq!(searcher.events(at(0), at(2), "", None, 0).unwrap().count(), 1);

        store
            .append(uuid, &[Event::new(json!({})).with_timestamp(at(2))])
            .unwrap();
        assert_eq!(searcher.events(at(0), at(2), "", None, 0).unwrap().count(), 2);
    }

    #[test]
    #[traced_test]
    fn test_skips_undecodable_lines() {
        let root = tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4();
        let dir = root.path().join(uuid.to_string());
        fs::create_dir_all(&dir).unwrap();
        let good = Event::new(json!({})).with_timestamp(at(3)).to_line().unwrap();
        fs::write(
            dir.join("events.00000000.log"),
            format!("garbage\n\n{good}\n"),
        )
        .unwrap();
        fs::write(dir.join("notes.txt"), "not a segment\n").unwrap();

        let searcher = EventSearcher::new(root.path(), "events");
        assert_eq!(seconds(searcher.events(at(0), at(10), "", None, 0).unwrap()), vec![3]);
        assert!(logs_contain("Skipping undecodable event"));
    }

    #[test]
    #[traced_test]
    fn test_skips_non_utf8_lines() {
        let root = tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4();
        let dir = root.path().join(uuid.to_string());
        fs::create_dir_all(&dir).unwrap();
        let good = Event::new(json!({})).with_timestamp(at(4)).to_line().unwrap();
        let mut content = vec![0xff, 0xfe, b'\n'];
        content.extend_from_slice(good.as_bytes());
        content.push(b'\n');
        fs::write(dir.join("events.00000000.log"), content).unwrap();

        let searcher = EventSearcher::new(root.path(), "events");
        assert_eq!(seconds(searcher.events(at(0), at(10), "", None, 0).unwrap()), vec![4]);
        assert!(logs_contain("Skipping non UTF-8 line 1"));
    }
}
