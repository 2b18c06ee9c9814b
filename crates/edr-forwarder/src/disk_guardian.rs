// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use tracing::{debug, error, warn};

use crate::config::QueueConfig;
use crate::errors::QueueError;
use crate::queue::EventQueue;

/// Outcome of a cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: usize,
    pub freed_bytes: u64,
    pub remaining_bytes: u64,
}

/// Keeps the inactive queue segments within the disk space threshold by deleting the oldest
/// ones. The active segment is never touched.
#[derive(Debug, Clone, Copy)]
pub struct DiskGuardian {
    threshold: u64,
    segment_size: u64,
}

impl DiskGuardian {
    pub fn new(config: &QueueConfig) -> Self {
        DiskGuardian {
            threshold: config.disk_space_threshold,
            segment_size: config.segment_size,
        }
    }

    /// Number of full inactive segments the threshold allows
    pub fn retained_segments(&self) -> u64 {
        self.threshold / self.segment_size.max(1)
    }

    pub fn cleanup(&self, queue: &EventQueue) -> Result<CleanupReport, QueueError> {
        let segments = queue.inactive_segments()?;
        let mut used: u64 = segments.iter().map(|s| s.size).sum();
        let mut report = CleanupReport::default();

        for segment in &segments {
            if used <= self.threshold {
                break;
            }
            match EventQueue::remove_segment(&segment.path) {
                Ok(()) => {
                    warn!(
                        "QUEUE | Disk space threshold of {} bytes exceeded, deleted {} ({} bytes of events lost)",
                        self.threshold,
                        segment.path.display(),
                        segment.size
                    );
                    used -= segment.size;
                    report.deleted += 1;
                    report.freed_bytes += segment.size;
                }
                Err(e) => error!(
                    "QUEUE | Failed to delete queue segment {}: {}",
                    segment.path.display(),
                    e
                ),
            }
        }

        report.remaining_bytes = used;
        if report.deleted == 0 {
            debug!(
                "QUEUE | Queue uses {} of {} bytes, nothing to clean up",
                used, self.threshold
            );
        }
        Ok(report)
    }
}
