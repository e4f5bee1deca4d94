//! Internal buffer pool sizing at start-of-capture.
//!
//! The sensor image queue needs headroom beyond what the application
//! provides, or a slow consumer turns straight into frame drops. The counts
//! here bound those drops while keeping allocations small for the queues that
//! run in lock-step with the scheduler.

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// How a queue acquires and recycles its buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRole {
    /// Capture queue filled by the device; may also carry external buffers.
    Capture,
    /// Queue that only imports buffers produced by a capture queue.
    Import,
    /// Metadata-only capture queue with no external buffers.
    MetadataOnly,
    /// ISP-internal queue running synchronously with the scheduler; at most
    /// one buffer is in flight at any time.
    Synchronous,
}

/// Buffer-count tunables, validated at configuration time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BufferTuning {
    /// Minimum internal working set per device queue.
    pub min_working_set: u32,
    /// Minimum combined (internal + external) buffer count.
    pub min_combined: u32,
}

impl Default for BufferTuning {
    fn default() -> Self {
        Self {
            min_working_set: 2,
            min_combined: 4,
        }
    }
}

impl BufferTuning {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_combined < self.min_working_set {
            return Err(ConfigError::InvalidTuning(
                "min_combined must be >= min_working_set",
            ));
        }
        if self.min_combined < 1 {
            return Err(ConfigError::InvalidTuning("min_combined must be >= 1"));
        }
        Ok(())
    }
}

/// Internal buffer count for one queue, given the number of
/// externally-requested buffers on the corresponding logical stream.
pub fn internal_buffer_count(role: QueueRole, external_count: u32, tuning: &BufferTuning) -> u32 {
    let top_up = tuning
        .min_working_set
        .max(tuning.min_combined.saturating_sub(external_count));

    match role {
        QueueRole::Capture => top_up,
        QueueRole::Import => external_count + top_up,
        QueueRole::MetadataOnly => tuning.min_combined,
        QueueRole::Synchronous => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_and_import_counts() {
        let tuning = BufferTuning {
            min_working_set: 2,
            min_combined: 4,
        };
        assert_eq!(internal_buffer_count(QueueRole::Capture, 1, &tuning), 3);
        assert_eq!(internal_buffer_count(QueueRole::Import, 1, &tuning), 4);
    }

    #[test]
    fn working_set_floor_applies_when_external_buffers_cover_demand() {
        let tuning = BufferTuning {
            min_working_set: 2,
            min_combined: 4,
        };
        // External buffers already exceed min_combined; keep the floor.
        assert_eq!(internal_buffer_count(QueueRole::Capture, 8, &tuning), 2);
        assert_eq!(internal_buffer_count(QueueRole::Import, 8, &tuning), 10);
    }

    #[test]
    fn metadata_and_synchronous_counts() {
        let tuning = BufferTuning::default();
        assert_eq!(
            internal_buffer_count(QueueRole::MetadataOnly, 0, &tuning),
            4
        );
        assert_eq!(internal_buffer_count(QueueRole::Synchronous, 5, &tuning), 1);
    }

    #[test]
    fn invalid_tunables_are_rejected() {
        let swapped = BufferTuning {
            min_working_set: 4,
            min_combined: 2,
        };
        assert!(swapped.validate().is_err());

        let zero = BufferTuning {
            min_working_set: 0,
            min_combined: 0,
        };
        assert!(zero.validate().is_err());

        assert!(BufferTuning::default().validate().is_ok());
    }
}
