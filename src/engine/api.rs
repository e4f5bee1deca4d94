//! In-process interface of the tuning engine.
//!
//! The engine computes per-frame tuning decisions (exposure, gains, lens
//! shading, crop) out of band with the scheduler: calls into it return
//! immediately and results come back later through the frame-action sink.

use std::collections::BTreeMap;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use crate::controls::{ControlInfoMap, ControlList};
use crate::ConfigError;

/// Operation codes exchanged with the engine. The first group travels
/// caller to engine, the second engine to caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EngineOp {
    /// Run the per-frame prepare step for a matched raw frame.
    PrepareIsp = 1,
    /// Consume an ISP statistics buffer.
    ProcessStats = 2,

    /// Prepare step finished; the raw buffer may go to the ISP.
    PrepareComplete = 3,
    /// Statistics consumed; the stats buffer may be released.
    ProcessComplete = 4,
    /// Updated ISP controls to apply before the next frame.
    SetIspControls = 5,
    /// New maximum frame length, refreshing the capture stall timeout.
    SetCameraTimeout = 6,
}

impl EngineOp {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => EngineOp::PrepareIsp,
            2 => EngineOp::ProcessStats,
            3 => EngineOp::PrepareComplete,
            4 => EngineOp::ProcessComplete,
            5 => EngineOp::SetIspControls,
            6 => EngineOp::SetCameraTimeout,
            _ => return None,
        })
    }
}

/// One operation crossing the boundary: an inline scalar payload plus any
/// number of control lists.
#[derive(Debug, Clone)]
pub struct OperationData {
    pub operation: EngineOp,
    pub data: Vec<u32>,
    pub controls: Vec<ControlList>,
}

impl OperationData {
    pub fn new(operation: EngineOp) -> Self {
        Self {
            operation,
            data: Vec::new(),
            controls: Vec::new(),
        }
    }
}

/// One logical stream as the engine sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub id: u32,
    pub pixel_format: u32,
    pub width: u32,
    pub height: u32,
}

/// One plane of a buffer mapped into the engine. A plane without a
/// descriptor carries identity only.
#[derive(Debug)]
pub struct EnginePlane {
    pub fd: Option<OwnedFd>,
    pub length: usize,
}

/// A buffer mapped into the engine, identified by its encoded
/// [`crate::pipeline::BufferId`].
#[derive(Debug)]
pub struct EngineBuffer {
    pub id: u32,
    pub planes: Vec<EnginePlane>,
}

/// Sink through which the engine pushes `queue_frame_action` notifications
/// back to its caller. Set once at startup, read-only thereafter.
pub type FrameActionSink = Arc<dyn Fn(u32, OperationData) + Send + Sync>;

/// The algorithm engine proper. Exactly one implementation is selected at
/// runtime per camera session; it is only ever reached through
/// [`crate::engine::EngineShim`].
pub trait AlgorithmEngine: Send {
    /// One-time setup, before any other call.
    fn init(&mut self) -> Result<(), ConfigError>;

    /// Receive the frame-action sink. Called exactly once, by the shim, at
    /// construction.
    fn connect_frame_action(&mut self, sink: FrameActionSink);

    fn configure(
        &mut self,
        streams: Vec<StreamConfig>,
        control_maps: BTreeMap<u32, ControlInfoMap>,
    ) -> Result<(), ConfigError>;

    fn map_buffers(&mut self, buffers: Vec<EngineBuffer>);

    fn unmap_buffers(&mut self, ids: Vec<u32>);

    /// Handle one operation. Fire-and-forget: results arrive later through
    /// the frame-action sink.
    fn process_event(&mut self, event: OperationData);
}
