// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-endpoint append-only event log.
//!
//! Events of an endpoint are written to `<root>/<uuid>/<basename>.<seq>.log`, one JSON line
//! each. A segment is closed once it exceeds the segment size or the rotation interval, and
//! the next one takes the following sequence number. A new store always starts a new segment,
//! so segments never get appended to by two processes. Closed segments are optionally
//! compressed to `<basename>.<seq>.log.zst`.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use edr_protocol::Event;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::errors::StoreError;

pub(crate) const SEGMENT_EXTENSION: &str = "log";
pub(crate) const COMPRESSED_EXTENSION: &str = "zst";
const COMPRESSION_LEVEL: i32 = 3;

pub struct EventStore {
    config: Arc<StoreConfig>,
    writers: Mutex<HashMap<Uuid, Arc<Mutex<SegmentWriter>>>>,
    closed: AtomicBool,
}

impl EventStore {
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        fs::create_dir_all(&config.root)?;
        Ok(EventStore {
            config: Arc::new(config),
            writers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Appends events to the endpoint's current segment and flushes them before returning.
    ///
    /// Blocks on file I/O, and on compression when the segment rotates. Async callers run it on
    /// the blocking pool.
    pub fn append(&self, uuid: Uuid, events: &[Event]) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed);
        }
        let writer = self.writer(uuid);
        let mut writer = lock(&writer);
        if writer.closed {
            return Err(StoreError::Closed);
        }
        writer.append(events)
    }

    pub(crate) fn writer(&self, uuid: Uuid) -> Arc<Mutex<SegmentWriter>> {
        let mut writers = lock(&self.writers);
        Arc::clone(
            writers
                .entry(uuid)
                .or_insert_with(|| Arc::new(Mutex::new(SegmentWriter::new(&self.config, uuid)))),
        )
    }

    /// Flushes and closes every segment. Later appends fail with [`StoreError::Closed`].
    pub fn close_all(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let writers: Vec<_> = lock(&self.writers).drain().collect();
        for (uuid, writer) in writers {
            if let Err(e) = lock(&writer).close() {
                error!("STORE | Failed to close segment of endpoint {}: {}", uuid, e);
            }
        }
        debug!("STORE | Closed all segments");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Name of the segment `seq` of `basename`
pub(crate) fn segment_name(basename: &str, seq: u32) -> String {
    format!("{basename}.{seq:08}.{SEGMENT_EXTENSION}")
}

/// Parses a segment file name, returning its sequence and whether it is compressed
pub(crate) fn parse_segment_name(basename: &str, name: &str) -> Option<(u32, bool)> {
    let rest = name.strip_prefix(basename)?.strip_prefix('.')?;
    let (rest, compressed) = match rest.strip_suffix(COMPRESSED_EXTENSION) {
        Some(rest) => (rest.strip_suffix('.')?, true),
        None => (rest, false),
    };
    let seq = rest.strip_suffix(SEGMENT_EXTENSION)?.strip_suffix('.')?;
    if seq.len() != 8 {
        return None;
    }
    Some((seq.parse().ok()?, compressed))
}

fn compressed_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(COMPRESSED_EXTENSION);
    PathBuf::from(name)
}

/// Compresses a closed segment next to itself, then removes the plain file. The compressed
/// file only appears once complete.
fn compress_segment(path: &Path) -> Result<PathBuf, StoreError> {
    let target = compressed_path(path);
    let mut tmp = target.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    {
        let source = File::open(path)?;
        let mut output = BufWriter::new(File::create(&tmp)?);
        zstd::stream::copy_encode(source, &mut output, COMPRESSION_LEVEL)?;
        output.flush()?;
        output.get_ref().sync_all()?;
    }
    fs::rename(&tmp, &target)?;
    fs::remove_file(path)?;
    Ok(target)
}

pub(crate) struct SegmentWriter {
    config: Arc<StoreConfig>,
    uuid: Uuid,
    dir: PathBuf,
    current: Option<OpenSegment>,
    next_seq: Option<u32>,
    closed: bool,
}

struct OpenSegment {
    path: PathBuf,
    writer: BufWriter<File>,
    size: u64,
    opened_at: Instant,
}

impl SegmentWriter {
    fn new(config: &Arc<StoreConfig>, uuid: Uuid) -> Self {
        SegmentWriter {
            config: Arc::clone(config),
            uuid,
            dir: config.root.join(uuid.to_string()),
            current: None,
            next_seq: None,
            closed: false,
        }
    }

    /// First sequence number after every segment already on disk
    fn scan_next_seq(&self) -> Result<u32, StoreError> {
        let mut next = 0;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if let Some((seq, _)) = parse_segment_name(&self.config.basename, &name.to_string_lossy())
            {
                next = next.max(seq.saturating_add(1));
            }
        }
        Ok(next)
    }

    fn open_segment(&mut self) -> Result<&mut OpenSegment, StoreError> {
        if let Some(segment) = self.current.take() {
            return Ok(self.current.insert(segment));
        }

        fs::create_dir_all(&self.dir)?;
        let seq = match self.next_seq {
            Some(seq) => seq,
            None => self.scan_next_seq()?,
        };
        let path = self.dir.join(segment_name(&self.config.basename, seq));
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        self.next_seq = Some(seq.saturating_add(1));
        debug!("STORE | Endpoint {} writing to {}", self.uuid, path.display());

        Ok(self.current.insert(OpenSegment {
            path,
            writer: BufWriter::new(file),
            size: 0,
            opened_at: Instant::now(),
        }))
    }

    fn append(&mut self, events: &[Event]) -> Result<(), StoreError> {
        if let Some(segment) = &self.current {
            if segment.size >= self.config.segment_size
                || segment.opened_at.elapsed() >= self.config.rotation_interval
            {
                self.rotate()?;
            }
        }

        let mut buf = Vec::new();
        for event in events {
            serde_json::to_writer(&mut buf, event)?;
            buf.push(b'\n');
        }

        let segment = self.open_segment()?;
        segment.writer.write_all(&buf)?;
        segment.writer.flush()?;
        segment.size += buf.len() as u64;
        Ok(())
    }

    /// Closes the current segment, compressing it when enabled
    fn finish_segment(&mut self) -> Result<(), StoreError> {
        let Some(mut segment) = self.current.take() else {
            return Ok(());
        };
        segment.writer.flush()?;
        segment.writer.get_ref().sync_all()?;
        drop(segment.writer);

        if self.config.compress && segment.size > 0 {
            match compress_segment(&segment.path) {
                Ok(target) => debug!("STORE | Compressed {}", target.display()),
                // the plain segment stays readable
                Err(e) => error!(
                    "STORE | Failed to compress {}: {}",
                    segment.path.display(),
                    e
                ),
            }
        }
        Ok(())
    }

    fn rotate(&mut self) -> Result<(), StoreError> {
        self.finish_segment()?;
        info!("STORE | Rotated segment of endpoint {}", self.uuid);
        Ok(())
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.closed = true;
        self.finish_segment()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use std::io::{BufRead, BufReader};
    use std::time::Duration;

    fn config(root: &Path, segment_size: u64, compress: bool) -> StoreConfig {
        StoreConfig {
            root: root.to_path_buf(),
            basename: "events".to_string(),
            rotation_interval: Duration::from_secs(3600),
            segment_size,
            compress,
        }
    }

    fn event(i: i64) -> Event {
        Event::new(json!({ "i": i })).with_timestamp(Utc.timestamp_opt(1_700_000_000 + i, 0).unwrap())
    }

    fn segment_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn read_lines(path: &Path) -> Vec<Event> {
        let reader: Box<dyn BufRead> = if path.extension().is_some_and(|e| e == COMPRESSED_EXTENSION)
        {
            Box::new(BufReader::new(
                zstd::stream::read::Decoder::new(File::open(path).unwrap()).unwrap(),
            ))
        } else {
            Box::new(BufReader::new(File::open(path).unwrap()))
        };
        reader
            .lines()
            .map(|line| Event::from_line(&line.unwrap()).unwrap())
            .collect()
    }

    #[test]
    fn test_segment_names() {
        assert_eq!(segment_name("events", 7), "events.00000007.log");
        assert_eq!(parse_segment_name("events", "events.00000007.log"), Some((7, false)));
        assert_eq!(
            parse_segment_name("events", "events.00000012.log.zst"),
            Some((12, true))
        );
        assert_eq!(parse_segment_name("events", "events.7.log"), None);
        assert_eq!(parse_segment_name("events", "other.00000001.log"), None);
        assert_eq!(parse_segment_name("events", "events.00000001.log.zst.tmp"), None);
    }

    #[test]
    fn test_append_is_flushed() {
        let root = tempfile::tempdir().unwrap();
        let store = EventStore::open(config(root.path(), 1024 * 1024, false)).unwrap();
        let uuid = Uuid::new_v4();
        let events: Vec<Event> = (0..10).map(event).collect();
        store.append(uuid, &events).unwrap();

        let dir = root.path().join(uuid.to_string());
        assert_eq!(segment_names(&dir), vec!["events.00000000.log"]);
        assert_eq!(read_lines(&dir.join("events.00000000.log")), events);
    }

    #[test]
    fn test_rotation_and_compression() {
        let root = tempfile::tempdir().unwrap();
        let store = EventStore::open(config(root.path(), 256, true)).unwrap();
        let uuid = Uuid::new_v4();
        for i in 0..30 {
            store.append(uuid, &[event(i)]).unwrap();
        }
        store.close_all();

        let dir = root.path().join(uuid.to_string());
        let names = segment_names(&dir);
        assert!(names.len() > 1);
        assert!(names.iter().all(|n| n.ends_with(".log.zst")));

        let events: Vec<Event> = names.iter().flat_map(|n| read_lines(&dir.join(n))).collect();
        assert_eq!(events, (0..30).map(event).collect::<Vec<_>>());
    }

    #[test]
    fn test_new_store_starts_new_segment() {
        let root = tempfile::tempdir().unwrap();
        let uuid = Uuid::new_v4();
        for run in 0..3 {
            let store = EventStore::open(config(root.path(), 1024 * 1024, run % 2 == 0)).unwrap();
            store.append(uuid, &[event(run)]).unwrap();
            store.close_all();
        }
        let dir = root.path().join(uuid.to_string());
        assert_eq!(
            segment_names(&dir),
            vec![
                "events.00000000.log.zst",
                "events.00000001.log",
                "events.00000002.log.zst"
            ]
        );
    }

    #[test]
    fn test_append_after_close() {
        let root = tempfile::tempdir().unwrap();
        let store = EventStore::open(config(root.path(), 1024, false)).unwrap();
        store.close_all();
        assert!(matches!(
            store.append(Uuid::new_v4(), &[event(0)]),
            Err(StoreError::Closed)
        ));
    }

    #[test]
    fn test_endpoints_are_separated() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(EventStore::open(config(root.path(), 1024 * 1024, false)).unwrap());
        let uuids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();

        let handles: Vec<_> = uuids
            .iter()
            .map(|&uuid| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        store.append(uuid, &[event(i)]).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        for uuid in uuids {
            let path = root
                .path()
                .join(uuid.to_string())
                .join("events.00000000.log");
            assert_eq!(read_lines(&path).len(), 50);
        }
    }
}
