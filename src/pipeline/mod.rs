//! The frame pipeline: buffer routing and matching, pool sizing, the
//! per-frame state machine and the session event loop tying them together.

pub mod matcher;
pub mod scheduler;
pub mod session;
pub mod sizing;
pub mod stream;

pub use matcher::{find_matching_buffers, BayerFrame, MatchedFrame};
pub use scheduler::{
    DelayedControls, PipelineHooks, PipelineScheduler, PipelineState, Request, SchedulerConfig,
};
pub use session::{AppEvent, CameraSession, PipelineEvent, SessionError};
pub use sizing::{internal_buffer_count, BufferTuning, QueueRole};
pub use stream::{
    BufferId, BufferPool, DeviceQueue, ExportedBuffer, ExportedPlane, FrameBuffer, FrameStatus,
    QueueId, Rectangle, StreamError,
};
