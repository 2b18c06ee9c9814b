// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Disk-backed queue of events the manager has not acknowledged yet.
//!
//! Events are appended as JSON lines to the active segment `queue.log`. When the next line would
//! take the active segment past the maximum segment size, or the segment is older than the
//! rotation interval, it is renamed to `queue.<seq>.log` and becomes inactive. A segment only
//! exceeds the maximum size when it holds a single oversized event. Inactive segments are replayed oldest first and
//! deleted once every event they hold has been acknowledged.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use edr_protocol::Event;
use tracing::{debug, error, warn};

use crate::config::QueueConfig;
use crate::errors::QueueError;

/// Name of the segment currently written to
pub const ACTIVE_SEGMENT: &str = "queue.log";
const SEGMENT_PREFIX: &str = "queue.";
const SEGMENT_SUFFIX: &str = ".log";

/// An inactive segment on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

pub struct EventQueue {
    config: QueueConfig,
    active_path: PathBuf,
    writer: Option<BufWriter<File>>,
    active_size: u64,
    opened_at: Instant,
    last_seq: u128,
}

impl EventQueue {
    /// Opens the queue in `config.dir`, creating the directory if needed. Segments left over by a
    /// previous run are kept and will be replayed.
    pub fn open(config: QueueConfig) -> Result<Self, QueueError> {
        fs::create_dir_all(&config.dir)?;
        let active_path = config.dir.join(ACTIVE_SEGMENT);
        let active_size = match fs::metadata(&active_path) {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        let mut last_seq = 0;
        for entry in fs::read_dir(&config.dir)? {
            let entry = entry?;
            if let Some(seq) = segment_seq(&entry.file_name().to_string_lossy()) {
                last_seq = last_seq.max(seq);
            }
        }

        debug!(
            "QUEUE | Opened queue in {} ({} bytes pending in active segment)",
            config.dir.display(),
            active_size
        );

        Ok(EventQueue {
            config,
            active_path,
            writer: None,
            active_size,
            opened_at: Instant::now(),
            last_seq,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.config.dir
    }

    /// Appends an event to the active segment, rotating it first if the event does not fit or
    /// the segment is too old.
    pub fn push(&mut self, event: &Event) -> Result<(), QueueError> {
        let mut line = event.to_line()?;
        line.push('\n');

        if self.active_size > 0
            && (self.active_size + line.len() as u64 > self.config.segment_size
                || self.opened_at.elapsed() >= self.config.rotation_interval)
        {
            self.rotate()?;
        }

        let writer = match self.writer.take() {
            Some(writer) => writer,
            None => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.active_path)?;
                if self.active_size == 0 {
                    self.opened_at = Instant::now();
                }
                BufWriter::new(file)
            }
        };
        let writer = self.writer.insert(writer);
        writer.write_all(line.as_bytes())?;
        self.active_size += line.len() as u64;
        Ok(())
    }

    /// Appends every event and flushes. An event that cannot be written is logged and dropped;
    /// returns how many were written.
    pub fn push_batch(&mut self, events: &[Event]) -> usize {
        let mut written = 0;
        for event in events {
            match self.push(event) {
                Ok(()) => written += 1,
                Err(e) => error!("QUEUE | Failed to queue event, dropping it: {}", e),
            }
        }
        if let Err(e) = self.flush() {
            error!("QUEUE | Failed to flush queue: {}", e);
        }
        written
    }

    pub fn flush(&mut self) -> Result<(), QueueError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }

    /// Closes the active segment and renames it to the next sequenced name. Returns the path
    /// of the rotated segment, or `None` when the active segment was empty.
    pub fn rotate(&mut self) -> Result<Option<PathBuf>, QueueError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        if self.active_size == 0 {
            return Ok(None);
        }

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let seq = now.max(self.last_seq + 1);
        let rotated = self
            .config
            .dir
            .join(format!("{SEGMENT_PREFIX}{seq:020}{SEGMENT_SUFFIX}"));
        fs::rename(&self.active_path, &rotated)?;

        self.last_seq = seq;
        self.active_size = 0;
        self.opened_at = Instant::now();
        debug!("QUEUE | Rotated active segment to {}", rotated.display());
        Ok(Some(rotated))
    }

    /// Lists every file of the queue directory but the active segment, oldest first.
    pub fn inactive_segments(&self) -> Result<Vec<SegmentInfo>, QueueError> {
        let mut segments = Vec::new();
        for entry in fs::read_dir(&self.config.dir)? {
            let entry = entry?;
            if entry.file_name() == ACTIVE_SEGMENT {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                // removed while listing
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if !metadata.is_file() {
                continue;
            }
            segments.push(SegmentInfo {
                path: entry.path(),
                size: metadata.len(),
                modified: metadata.modified().unwrap_or(UNIX_EPOCH),
            });
        }
        segments.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
        Ok(segments)
    }

    /// Total size of the inactive segments, in bytes
    pub fn queued_bytes(&self) -> Result<u64, QueueError> {
        Ok(self.inactive_segments()?.iter().map(|s| s.size).sum())
    }

    /// Whether nothing is waiting to be replayed, on disk or in the active segment
    pub fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.active_size == 0 && self.inactive_segments()?.is_empty())
    }

    /// Decodes the events of a segment. Lines that cannot be decoded are logged and skipped.
    pub fn read_segment(path: &Path) -> Result<Vec<Event>, QueueError> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut events = Vec::new();
        let mut buf = Vec::new();
        let mut line_number = 0usize;
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            line_number += 1;
            let Ok(line) = std::str::from_utf8(&buf) else {
                warn!(
                    "QUEUE | Skipping non UTF-8 line {} in {}",
                    line_number,
                    path.display()
                );
                continue;
            };
            if line.trim().is_empty() {
                continue;
            }
            match Event::from_line(line) {
                Ok(event) => events.push(event),
                Err(e) => warn!(
                    "QUEUE | Skipping undecodable line {} in {}: {}",
                    line_number,
                    path.display(),
                    e
                ),
            }
        }
        Ok(events)
    }

    pub fn remove_segment(path: &Path) -> Result<(), QueueError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn segment_seq(name: &str) -> Option<u128> {
    name.strip_prefix(SEGMENT_PREFIX)?
        .strip_suffix(SEGMENT_SUFFIX)?
        .parse()
        .ok()
}
