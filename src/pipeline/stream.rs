//! Stream collaborator interface and the buffer handle model.
//!
//! A [`FrameBuffer`] is an opaque handle to hardware memory; it is always
//! moved between owners (device queue, scheduler, application), never copied.
//! Across the engine boundary buffers are referenced by [`BufferId`] only.

use std::os::fd::OwnedFd;

use thiserror::Error;

/// Hardware fill status recorded when a buffer is dequeued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Success,
    Error,
    Cancelled,
}

/// Opaque handle to one hardware buffer plus per-buffer metadata.
#[derive(Debug, PartialEq, Eq)]
pub struct FrameBuffer {
    /// Slot index within the owning queue's pool.
    pub index: u16,
    /// Hardware frame sequence number.
    pub sequence: u32,
    /// Capture timestamp in nanoseconds.
    pub timestamp_ns: u64,
    pub status: FrameStatus,
}

impl FrameBuffer {
    pub fn new(index: u16, sequence: u32, timestamp_ns: u64) -> Self {
        Self {
            index,
            sequence,
            timestamp_ns,
            status: FrameStatus::Success,
        }
    }
}

/// Pool tag distinguishing the buffer sets shared with the engine, so indices
/// never collide across pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferPool {
    Raw,
    Embedded,
    Stats,
}

const MASK_RAW: u32 = 0x0001_0000;
const MASK_EMBEDDED: u32 = 0x0002_0000;
const MASK_STATS: u32 = 0x0004_0000;
const MASK_INDEX: u32 = 0x0000_ffff;

/// Compact cross-boundary reference to a [`FrameBuffer`]: pool tag in the
/// high bits, pool index in the low 16.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferId {
    pub pool: BufferPool,
    pub index: u16,
}

impl BufferId {
    pub fn new(pool: BufferPool, index: u16) -> Self {
        Self { pool, index }
    }

    pub fn encode(self) -> u32 {
        let mask = match self.pool {
            BufferPool::Raw => MASK_RAW,
            BufferPool::Embedded => MASK_EMBEDDED,
            BufferPool::Stats => MASK_STATS,
        };
        mask | u32::from(self.index)
    }

    /// Decode a wire identity. `None` for an unknown pool tag; the caller
    /// treats that as a protocol error.
    pub fn decode(raw: u32) -> Option<Self> {
        let index = (raw & MASK_INDEX) as u16;
        let pool = match raw & !MASK_INDEX {
            MASK_RAW => BufferPool::Raw,
            MASK_EMBEDDED => BufferPool::Embedded,
            MASK_STATS => BufferPool::Stats,
            _ => return None,
        };
        Some(Self { pool, index })
    }
}

/// The hardware queues the scheduler routes buffers between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueueId {
    SensorImage,
    SensorMetadata,
    IspInput,
    IspOutput0,
    IspOutput1,
    IspStats,
}

impl QueueId {
    pub fn name(self) -> &'static str {
        match self {
            QueueId::SensorImage => "Sensor Image",
            QueueId::SensorMetadata => "Sensor Metadata",
            QueueId::IspInput => "ISP Input",
            QueueId::IspOutput0 => "ISP Output0",
            QueueId::IspOutput1 => "ISP Output1",
            QueueId::IspStats => "ISP Stats",
        }
    }
}

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("queue {queue} failed to prepare {count} buffers")]
    PrepareFailed { queue: &'static str, count: u32 },
    #[error("queue {queue} rejected buffer {index}")]
    QueueFailed { queue: &'static str, index: u16 },
}

/// One plane of a buffer exported to the engine boundary. The descriptor may
/// be absent for queues whose memory the engine never maps.
#[derive(Debug)]
pub struct ExportedPlane {
    pub fd: Option<OwnedFd>,
    pub length: usize,
}

/// A buffer exported to the engine boundary, identified by pool index.
#[derive(Debug)]
pub struct ExportedBuffer {
    pub index: u16,
    pub planes: Vec<ExportedPlane>,
}

/// One hardware video queue, owned by the external Stream collaborator.
/// Dequeue notifications arrive asynchronously as pipeline events, not
/// through this interface.
pub trait DeviceQueue: Send {
    fn name(&self) -> &'static str;

    /// Identity of a buffer owned by this queue, or `None` if the buffer is
    /// not one of ours.
    fn buffer_id(&self, buffer: &FrameBuffer) -> Option<u16>;

    /// Queue a buffer to the device for filling or processing.
    fn queue_buffer(&mut self, buffer: FrameBuffer) -> Result<(), StreamError>;

    /// Hand an internal buffer back to the queue without queuing it to the
    /// device (used for stale or cancelled buffers).
    fn return_buffer(&mut self, buffer: FrameBuffer);

    /// Allocate or import the internal working set at start-of-capture.
    fn prepare_buffers(&mut self, count: u32) -> Result<(), StreamError>;

    /// Apply controls to the underlying device. Meaningless for pure buffer
    /// queues, hence the default no-op.
    fn apply_controls(&mut self, controls: crate::controls::ControlList) -> Result<(), StreamError> {
        let _ = controls;
        Ok(())
    }

    /// Apply a crop selection on the underlying device.
    fn apply_crop(&mut self, crop: Rectangle) -> Result<(), StreamError> {
        let _ = crop;
        Ok(())
    }

    /// Buffers backing this queue, for handing identities (and mappable
    /// descriptors) to the engine.
    fn export_buffers(&self) -> Vec<ExportedBuffer>;
}

/// Crop rectangle on the ISP input, in sensor pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rectangle {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rectangle {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Clamp to at least `min` in both dimensions and to fit inside
    /// `bounds`, keeping the requested origin where possible.
    pub fn clamped(mut self, min: (u32, u32), bounds: (u32, u32)) -> Self {
        self.width = self.width.max(min.0).min(bounds.0);
        self.height = self.height.max(min.1).min(bounds.1);
        self.x = self.x.clamp(0, (bounds.0 - self.width) as i32);
        self.y = self.y.clamp(0, (bounds.1 - self.height) as i32);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_id_round_trips_across_pools() {
        for pool in [BufferPool::Raw, BufferPool::Embedded, BufferPool::Stats] {
            let id = BufferId::new(pool, 7);
            assert_eq!(BufferId::decode(id.encode()), Some(id));
        }
    }

    #[test]
    fn pool_indices_never_collide() {
        let raw = BufferId::new(BufferPool::Raw, 3).encode();
        let stats = BufferId::new(BufferPool::Stats, 3).encode();
        assert_ne!(raw, stats);
    }

    #[test]
    fn unknown_pool_tag_is_rejected() {
        assert_eq!(BufferId::decode(0x8000_0001), None);
        assert_eq!(BufferId::decode(0x0000_0001), None);
    }

    #[test]
    fn crop_clamps_to_isp_minimum_and_sensor_bounds() {
        let crop = Rectangle::new(100, 100, 8, 8).clamped((32, 32), (640, 480));
        assert_eq!(crop, Rectangle::new(100, 100, 32, 32));

        let crop = Rectangle::new(630, 470, 64, 64).clamped((32, 32), (640, 480));
        assert_eq!(crop, Rectangle::new(576, 416, 64, 64));
    }
}
