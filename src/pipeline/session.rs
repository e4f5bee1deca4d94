//! Per-camera session: the single event context everything else runs on.
//!
//! All notifications (device dequeues, application requests, engine frame
//! actions) funnel into one flume channel and are handled in arrival order on
//! one task, so the scheduler needs no locking. A stall watchdog wraps the
//! channel wait; its timeout is refreshed by the engine through
//! `SetCameraTimeout` and swapped atomically so the running wait picks the new
//! value up on the next iteration.

use std::collections::BTreeMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::allocator::TableAllocator;
use crate::controls::{ControlInfoMap, ControlList};
use crate::engine::shim::{send_operation, FlatInfoMap, FlatOperation};
use crate::engine::{
    AlgorithmEngine, EngineBuffer, EngineCallbacks, EngineOp, EnginePlane, EngineShim,
    OperationData, StreamConfig,
};
use crate::wire::{self, ReadRegion, WireError};
use crate::ConfigError;

use super::scheduler::{PipelineHooks, PipelineScheduler, Request, SchedulerConfig};
use super::sizing::{internal_buffer_count, BufferTuning, QueueRole};
use super::stream::{BufferId, BufferPool, DeviceQueue, FrameBuffer, QueueId, Rectangle, StreamError};

/// Lens-shading table size shared with the engine.
const LS_TABLE_SIZE: usize = 32 << 10;

/// Watchdog timeout before the engine reports a frame length.
const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(1);

const ALL_QUEUES: [QueueId; 6] = [
    QueueId::SensorImage,
    QueueId::SensorMetadata,
    QueueId::IspInput,
    QueueId::IspOutput0,
    QueueId::IspOutput1,
    QueueId::IspStats,
];

/// Everything the session reacts to, in arrival order.
#[derive(Debug)]
pub enum PipelineEvent {
    /// Application queues a capture request.
    QueueRequest(ControlList),
    /// Raw frame dequeued from the sensor.
    SensorImage(FrameBuffer),
    /// Metadata buffer dequeued from the sensor.
    SensorMetadata(FrameBuffer),
    /// The ISP released its input buffer.
    IspInputReturned(FrameBuffer),
    /// An ISP output queue produced a buffer.
    IspOutput(QueueId, FrameBuffer),
    /// Decoded engine frame action.
    EngineAction { frame: u32, action: OperationData },
    /// Stop capture and exit the event loop.
    Stop,
}

/// Notifications delivered to the application.
#[derive(Debug)]
pub enum AppEvent {
    /// A filled buffer on one of the output streams.
    BufferReady(QueueId, FrameBuffer),
    /// A request retired with its accumulated result metadata.
    RequestComplete(Request),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("capture stalled: no pipeline event within {0:?}")]
    CaptureStalled(Duration),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Scheduler hooks bound to the session's collaborators. Rebuilt per event
/// from disjoint borrows of the session fields.
struct SessionHooks<'a> {
    queues: &'a mut BTreeMap<QueueId, Box<dyn DeviceQueue>>,
    shim: &'a mut EngineShim,
    app_tx: &'a flume::Sender<AppEvent>,
    stall_timeout: &'a ArcSwap<Duration>,
}

impl SessionHooks<'_> {
    fn queue(&mut self, id: QueueId) -> &mut Box<dyn DeviceQueue> {
        self.queues
            .get_mut(&id)
            .unwrap_or_else(|| panic!("no {} queue registered", id.name()))
    }
}

impl PipelineHooks for SessionHooks<'_> {
    fn queue_isp_input(&mut self, buffer: FrameBuffer) {
        if let Err(err) = self.queue(QueueId::IspInput).queue_buffer(buffer) {
            error!(error = %err, "failed to queue ISP input buffer");
        }
    }

    fn return_buffer(&mut self, queue: QueueId, buffer: FrameBuffer) {
        self.queue(queue).return_buffer(buffer);
    }

    fn deliver_buffer(&mut self, queue: QueueId, buffer: FrameBuffer) {
        if self.app_tx.send(AppEvent::BufferReady(queue, buffer)).is_err() {
            debug!(queue = queue.name(), "application receiver gone");
        }
    }

    fn engine_event(&mut self, action: OperationData) {
        if let Err(err) = send_operation(self.shim, &action) {
            error!(error = %err, operation = ?action.operation, "engine rejected operation");
        }
    }

    fn set_isp_crop(&mut self, crop: Rectangle) {
        if let Err(err) = self.queue(QueueId::IspInput).apply_crop(crop) {
            error!(error = %err, "failed to apply ISP crop");
        }
    }

    fn set_isp_controls(&mut self, controls: ControlList) {
        if let Err(err) = self.queue(QueueId::IspInput).apply_controls(controls) {
            error!(error = %err, "failed to apply ISP controls");
        }
    }

    fn set_sensor_controls(&mut self, controls: ControlList) {
        if let Err(err) = self.queue(QueueId::SensorImage).apply_controls(controls) {
            error!(error = %err, "failed to apply sensor controls");
        }
    }

    fn complete_request(&mut self, request: Request) {
        debug!(sequence = request.sequence, "request complete");
        if self.app_tx.send(AppEvent::RequestComplete(request)).is_err() {
            debug!("application receiver gone");
        }
    }

    fn set_dequeue_timeout(&mut self, timeout: Duration) {
        self.stall_timeout.store(Arc::new(timeout));
    }
}

/// Decode one flat frame action back into its rich shape. Borrowed payload
/// slices are only valid for the callback, so everything is copied out here.
fn decode_frame_action(flat: &FlatOperation<'_>) -> Result<OperationData, WireError> {
    let operation = EngineOp::from_u32(flat.operation)
        .ok_or(WireError::MalformedPayload("unknown operation"))?;

    let mut controls = Vec::with_capacity(flat.lists.len());
    for list in &flat.lists {
        let mut region = ReadRegion::new(list);
        controls.push(wire::deserialize(&mut region)?);
    }

    Ok(OperationData {
        operation,
        data: flat.data.to_vec(),
        controls,
    })
}

fn queue_role(queue: QueueId) -> QueueRole {
    match queue {
        QueueId::SensorImage => QueueRole::Capture,
        QueueId::SensorMetadata => QueueRole::MetadataOnly,
        QueueId::IspInput => QueueRole::Import,
        // The ISP runs synchronously with the scheduler; one internal set of
        // buffers per output is enough.
        QueueId::IspOutput0 | QueueId::IspOutput1 | QueueId::IspStats => QueueRole::Synchronous,
    }
}

pub struct CameraSession {
    scheduler: PipelineScheduler,
    shim: EngineShim,
    queues: BTreeMap<QueueId, Box<dyn DeviceQueue>>,
    tuning: BufferTuning,
    sensor_metadata: bool,

    event_tx: flume::Sender<PipelineEvent>,
    event_rx: flume::Receiver<PipelineEvent>,
    app_tx: flume::Sender<AppEvent>,
    app_rx: flume::Receiver<AppEvent>,

    stall_timeout: Arc<ArcSwap<Duration>>,
    ls_table: Option<OwnedFd>,
    mapped_ids: Vec<u32>,
}

impl CameraSession {
    pub fn new(
        engine: Box<dyn AlgorithmEngine>,
        queues: BTreeMap<QueueId, Box<dyn DeviceQueue>>,
        scheduler_config: SchedulerConfig,
        tuning: BufferTuning,
    ) -> Self {
        let shim = EngineShim::new(engine);
        let (event_tx, event_rx) = flume::bounded(64);
        let (app_tx, app_rx) = flume::bounded(64);

        // Frame actions re-enter the session as ordinary events, keeping a
        // single serialization context for all scheduler state.
        let tx = event_tx.clone();
        shim.register_callbacks(EngineCallbacks {
            queue_frame_action: Box::new(move |frame, flat| match decode_frame_action(flat) {
                Ok(action) => {
                    if tx.send(PipelineEvent::EngineAction { frame, action }).is_err() {
                        debug!(frame, "session gone, frame action dropped");
                    }
                }
                Err(err) => error!(error = %err, frame, "malformed frame action"),
            }),
        });

        Self {
            sensor_metadata: scheduler_config.sensor_metadata,
            scheduler: PipelineScheduler::new(scheduler_config),
            shim,
            queues,
            tuning,
            event_tx,
            event_rx,
            app_tx,
            app_rx,
            stall_timeout: Arc::new(ArcSwap::from_pointee(DEFAULT_STALL_TIMEOUT)),
            ls_table: None,
            mapped_ids: Vec::new(),
        }
    }

    /// Sender for device notifications and application requests.
    pub fn event_sender(&self) -> flume::Sender<PipelineEvent> {
        self.event_tx.clone()
    }

    /// Receiver for completed buffers and retired requests.
    pub fn app_events(&self) -> flume::Receiver<AppEvent> {
        self.app_rx.clone()
    }

    /// One-time engine bring-up: allocate the lens-shading table, initialize
    /// the engine and hand it the stream layout and control schemas.
    pub fn configure(
        &mut self,
        streams: &[StreamConfig],
        control_maps: &BTreeMap<u32, ControlInfoMap>,
        allocator: &dyn TableAllocator,
    ) -> Result<(), ConfigError> {
        self.tuning.validate()?;

        let table = allocator.alloc("ls-table", LS_TABLE_SIZE)?;
        self.scheduler.set_ls_table_handle(table.as_raw_fd());
        self.ls_table = Some(table);

        self.shim.init()?;

        let serialized: Vec<(u32, Vec<u8>)> = control_maps
            .iter()
            .map(|(id, map)| {
                let mut buf = vec![0u8; wire::info_map_binary_size(map)];
                let mut region = wire::WriteRegion::new(&mut buf);
                wire::serialize_info_map(map, &mut region)
                    .expect("region sized via info_map_binary_size");
                (*id, buf)
            })
            .collect();
        let flat: Vec<FlatInfoMap<'_>> = serialized
            .iter()
            .map(|(id, data)| FlatInfoMap { id: *id, data })
            .collect();

        self.shim.configure(streams, &flat)?;
        info!(streams = streams.len(), maps = flat.len(), "engine configured");
        Ok(())
    }

    /// Size and prepare every device queue, map the buffers the engine needs
    /// to see, and open the admission gate.
    pub fn start_capture(
        &mut self,
        external_counts: &BTreeMap<QueueId, u32>,
    ) -> Result<(), SessionError> {
        for id in ALL_QUEUES {
            // The ISP input imports the sensor image pool, so it sizes
            // against the same external count.
            let external = match id {
                QueueId::IspInput => external_counts.get(&QueueId::SensorImage),
                _ => external_counts.get(&id),
            }
            .copied()
            .unwrap_or(0);

            let count = internal_buffer_count(queue_role(id), external, &self.tuning);
            debug!(queue = id.name(), count, "preparing buffers");
            self.queue(id).prepare_buffers(count)?;
        }

        let mut engine_buffers = Vec::new();
        let mut pools = vec![(BufferPool::Stats, QueueId::IspStats)];
        if self.sensor_metadata {
            pools.push((BufferPool::Embedded, QueueId::SensorMetadata));
        }
        for (pool, id) in pools {
            for exported in self.queue(id).export_buffers() {
                let buffer_id = BufferId::new(pool, exported.index).encode();
                self.mapped_ids.push(buffer_id);
                engine_buffers.push(EngineBuffer {
                    id: buffer_id,
                    planes: exported
                        .planes
                        .into_iter()
                        .map(|plane| EnginePlane {
                            fd: plane.fd,
                            length: plane.length,
                        })
                        .collect(),
                });
            }
        }
        if !engine_buffers.is_empty() {
            self.shim.map_buffers(engine_buffers);
        }

        self.scheduler.start();
        info!("capture started");
        Ok(())
    }

    /// Run the event loop until a stop event, channel closure or a capture
    /// stall. A stall is reported upward rather than retried; the caller
    /// decides whether to restart.
    pub async fn run(mut self) -> Result<(), SessionError> {
        loop {
            let timeout = **self.stall_timeout.load();
            let event = match tokio::time::timeout(timeout, self.event_rx.recv_async()).await {
                Ok(Ok(event)) => event,
                Ok(Err(_)) => {
                    info!("event channel closed, shutting down");
                    self.stop();
                    return Ok(());
                }
                Err(_) => {
                    if self.scheduler.is_running() {
                        error!(?timeout, "capture stalled, no event from any device");
                        return Err(SessionError::CaptureStalled(timeout));
                    }
                    continue;
                }
            };

            if !self.dispatch(event) {
                return Ok(());
            }
        }
    }

    fn dispatch(&mut self, event: PipelineEvent) -> bool {
        let mut hooks = SessionHooks {
            queues: &mut self.queues,
            shim: &mut self.shim,
            app_tx: &self.app_tx,
            stall_timeout: &self.stall_timeout,
        };

        match event {
            PipelineEvent::QueueRequest(controls) => {
                self.scheduler.queue_request(controls, &mut hooks);
            }
            PipelineEvent::SensorImage(buffer) => {
                assert_tracked(hooks.queues, QueueId::SensorImage, &buffer);
                self.scheduler.sensor_image_ready(buffer, &mut hooks);
            }
            PipelineEvent::SensorMetadata(buffer) => {
                assert_tracked(hooks.queues, QueueId::SensorMetadata, &buffer);
                self.scheduler.sensor_metadata_ready(buffer, &mut hooks);
            }
            PipelineEvent::IspInputReturned(buffer) => {
                self.scheduler.isp_input_returned(buffer, &mut hooks);
            }
            PipelineEvent::IspOutput(queue, buffer) => {
                assert_tracked(hooks.queues, queue, &buffer);
                self.scheduler.isp_output_ready(queue, buffer, &mut hooks);
            }
            PipelineEvent::EngineAction { frame, action } => {
                self.handle_engine_action(frame, action);
            }
            PipelineEvent::Stop => {
                self.stop();
                return false;
            }
        }
        true
    }

    fn handle_engine_action(&mut self, frame: u32, action: OperationData) {
        let mut hooks = SessionHooks {
            queues: &mut self.queues,
            shim: &mut self.shim,
            app_tx: &self.app_tx,
            stall_timeout: &self.stall_timeout,
        };

        match action.operation {
            EngineOp::PrepareComplete => {
                let &[bayer_id, embedded_id] = action.data.as_slice() else {
                    error!(frame, "malformed prepare-complete payload");
                    return;
                };
                self.scheduler.prepare_complete(bayer_id, embedded_id, &mut hooks);
            }
            EngineOp::ProcessComplete => {
                let Some(&stats_id) = action.data.first() else {
                    error!(frame, "malformed process-complete payload");
                    return;
                };
                let metadata = action.controls.into_iter().next().unwrap_or_default();
                self.scheduler.process_complete(stats_id, metadata, &mut hooks);
            }
            EngineOp::SetIspControls => {
                let Some(controls) = action.controls.into_iter().next() else {
                    error!(frame, "set-isp-controls action without a control list");
                    return;
                };
                self.scheduler.apply_isp_controls(controls, &mut hooks);
            }
            EngineOp::SetCameraTimeout => {
                let Some(&max_frame_len_ms) = action.data.first() else {
                    error!(frame, "malformed camera-timeout payload");
                    return;
                };
                self.scheduler.set_camera_timeout(max_frame_len_ms, &mut hooks);
            }
            EngineOp::PrepareIsp | EngineOp::ProcessStats => {
                error!(frame, operation = ?action.operation, "caller-direction operation from engine");
            }
        }
    }

    fn stop(&mut self) {
        let mut hooks = SessionHooks {
            queues: &mut self.queues,
            shim: &mut self.shim,
            app_tx: &self.app_tx,
            stall_timeout: &self.stall_timeout,
        };
        self.scheduler.stop(&mut hooks);

        if !self.mapped_ids.is_empty() {
            self.shim.unmap_buffers(&self.mapped_ids);
            self.mapped_ids.clear();
        }
        info!("capture stopped");
    }

    fn queue(&mut self, id: QueueId) -> &mut Box<dyn DeviceQueue> {
        self.queues
            .get_mut(&id)
            .unwrap_or_else(|| panic!("no {} queue registered", id.name()))
    }
}

fn assert_tracked(
    queues: &BTreeMap<QueueId, Box<dyn DeviceQueue>>,
    queue: QueueId,
    buffer: &FrameBuffer,
) {
    let tracked = queues
        .get(&queue)
        .and_then(|q| q.buffer_id(buffer))
        .is_some();
    if !tracked {
        panic!(
            "buffer {} does not belong to the {} queue",
            buffer.index,
            queue.name()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::MemfdAllocator;
    use crate::controls::ControlValue;
    use crate::engine::FrameActionSink;
    use crate::pipeline::stream::{ExportedBuffer, ExportedPlane};
    use crate::wire::WriteRegion;
    use std::sync::Mutex;

    struct MockQueue {
        name: &'static str,
        pool_size: u16,
        prepared: Arc<Mutex<Vec<(&'static str, u32)>>>,
    }

    impl DeviceQueue for MockQueue {
        fn name(&self) -> &'static str {
            self.name
        }

        fn buffer_id(&self, buffer: &FrameBuffer) -> Option<u16> {
            (buffer.index < self.pool_size).then_some(buffer.index)
        }

        fn queue_buffer(&mut self, _buffer: FrameBuffer) -> Result<(), StreamError> {
            Ok(())
        }

        fn return_buffer(&mut self, _buffer: FrameBuffer) {}

        fn prepare_buffers(&mut self, count: u32) -> Result<(), StreamError> {
            self.prepared.lock().unwrap().push((self.name, count));
            Ok(())
        }

        fn export_buffers(&self) -> Vec<ExportedBuffer> {
            (0..self.pool_size)
                .map(|index| ExportedBuffer {
                    index,
                    planes: vec![ExportedPlane { fd: None, length: 0 }],
                })
                .collect()
        }
    }

    /// Engine stub that does nothing; frame actions are driven by tests.
    struct InertEngine;

    impl AlgorithmEngine for InertEngine {
        fn init(&mut self) -> Result<(), ConfigError> {
            Ok(())
        }
        fn connect_frame_action(&mut self, _sink: FrameActionSink) {}
        fn configure(
            &mut self,
            _streams: Vec<StreamConfig>,
            _control_maps: BTreeMap<u32, ControlInfoMap>,
        ) -> Result<(), ConfigError> {
            Ok(())
        }
        fn map_buffers(&mut self, _buffers: Vec<EngineBuffer>) {}
        fn unmap_buffers(&mut self, _ids: Vec<u32>) {}
        fn process_event(&mut self, _event: OperationData) {}
    }

    fn session() -> (CameraSession, Arc<Mutex<Vec<(&'static str, u32)>>>) {
        let prepared = Arc::new(Mutex::new(Vec::new()));
        let mut queues: BTreeMap<QueueId, Box<dyn DeviceQueue>> = BTreeMap::new();
        for id in ALL_QUEUES {
            queues.insert(
                id,
                Box::new(MockQueue {
                    name: id.name(),
                    pool_size: 4,
                    prepared: Arc::clone(&prepared),
                }),
            );
        }
        let session = CameraSession::new(
            Box::new(InertEngine),
            queues,
            SchedulerConfig::default(),
            BufferTuning::default(),
        );
        (session, prepared)
    }

    #[test]
    fn frame_action_decodes_back_to_rich_shape() {
        let mut metadata = ControlList::new();
        metadata.set(0x0106, ControlValue::Int32(1200));
        let mut buf = vec![0u8; wire::binary_size(&metadata)];
        wire::serialize(&metadata, &mut WriteRegion::new(&mut buf)).unwrap();

        let flat = FlatOperation {
            operation: EngineOp::ProcessComplete as u32,
            data: &[0x0004_0001],
            lists: vec![&buf],
        };

        let action = decode_frame_action(&flat).unwrap();
        assert_eq!(action.operation, EngineOp::ProcessComplete);
        assert_eq!(action.data, vec![0x0004_0001]);
        assert_eq!(action.controls, vec![metadata]);
    }

    #[test]
    fn unknown_frame_action_is_rejected() {
        let flat = FlatOperation {
            operation: 99,
            data: &[],
            lists: vec![],
        };
        assert!(matches!(
            decode_frame_action(&flat),
            Err(WireError::MalformedPayload(_))
        ));
    }

    #[test]
    fn start_capture_sizes_each_queue_by_role() {
        let (mut session, prepared) = session();
        session
            .configure(&[], &BTreeMap::new(), &MemfdAllocator)
            .unwrap();

        let external: BTreeMap<QueueId, u32> = [(QueueId::SensorImage, 1)].into();
        session.start_capture(&external).unwrap();

        let prepared = prepared.lock().unwrap();
        let count = |name: &str| {
            prepared
                .iter()
                .find(|(n, _)| *n == name)
                .map(|(_, c)| *c)
                .unwrap()
        };
        assert_eq!(count("Sensor Image"), 3);
        assert_eq!(count("Sensor Metadata"), 4);
        assert_eq!(count("ISP Input"), 4);
        assert_eq!(count("ISP Output0"), 1);
        assert_eq!(count("ISP Output1"), 1);
        assert_eq!(count("ISP Stats"), 1);
    }

    #[tokio::test]
    async fn watchdog_reports_a_stall_while_running() {
        let (mut session, _) = session();
        session
            .configure(&[], &BTreeMap::new(), &MemfdAllocator)
            .unwrap();
        session.start_capture(&BTreeMap::new()).unwrap();
        session
            .stall_timeout
            .store(Arc::new(Duration::from_millis(20)));

        let result = session.run().await;
        assert!(matches!(result, Err(SessionError::CaptureStalled(_))));
    }

    #[tokio::test]
    async fn stop_event_exits_cleanly() {
        let (session, _) = session();
        let tx = session.event_sender();
        tx.send(PipelineEvent::Stop).unwrap();
        assert!(session.run().await.is_ok());
    }

    #[test]
    #[should_panic(expected = "does not belong")]
    fn untracked_buffer_is_a_consistency_violation() {
        let (mut session, _) = session();
        // Pool size is 4; index 9 belongs to nothing.
        session.dispatch(PipelineEvent::SensorImage(FrameBuffer::new(9, 0, 100)));
    }
}
