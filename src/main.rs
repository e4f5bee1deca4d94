//! Prism demo: the full pipeline running against a synthetic sensor, a
//! loopback ISP and a stub tuning engine.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use once_cell::sync::OnceCell;
use tracing::{error, info};

use prism::allocator::MemfdAllocator;
use prism::controls::{ids, ControlInfo, ControlInfoMap, ControlList, ControlValue};
use prism::engine::{
    AlgorithmEngine, EngineBuffer, EngineOp, FrameActionSink, OperationData, StreamConfig,
};
use prism::pipeline::stream::{DeviceQueue, ExportedBuffer, ExportedPlane, StreamError};
use prism::pipeline::{
    AppEvent, CameraSession, FrameBuffer, PipelineEvent, QueueId, SchedulerConfig,
};
use prism::{Config, ConfigError};

const FRAME_INTERVAL: Duration = Duration::from_millis(33);
const FRAMES: u32 = 60;

/// Sensor control-map identity handed to the engine.
const SENSOR_ENTITY: u32 = 1;

type EventSlot = Arc<OnceCell<flume::Sender<PipelineEvent>>>;

/// In-memory device queue. The ISP input queue loops buffers straight back
/// as completed outputs, standing in for real hardware.
struct SimQueue {
    id: QueueId,
    pool_size: u16,
    events: EventSlot,
    next_output: u16,
}

impl SimQueue {
    fn new(id: QueueId, pool_size: u16, events: EventSlot) -> Self {
        Self {
            id,
            pool_size,
            events,
            next_output: 0,
        }
    }

    fn send(&self, event: PipelineEvent) {
        if let Some(tx) = self.events.get() {
            let _ = tx.send(event);
        }
    }
}

impl DeviceQueue for SimQueue {
    fn name(&self) -> &'static str {
        self.id.name()
    }

    fn buffer_id(&self, buffer: &FrameBuffer) -> Option<u16> {
        (buffer.index < self.pool_size).then_some(buffer.index)
    }

    fn queue_buffer(&mut self, buffer: FrameBuffer) -> Result<(), StreamError> {
        if self.id != QueueId::IspInput {
            return Ok(());
        }

        // "Process" the frame instantly: release the input and produce one
        // buffer on each output queue.
        let index = self.next_output % self.pool_size;
        self.next_output = self.next_output.wrapping_add(1);
        let ts = buffer.timestamp_ns;
        let seq = buffer.sequence;

        self.send(PipelineEvent::IspInputReturned(buffer));
        for queue in [QueueId::IspOutput0, QueueId::IspOutput1, QueueId::IspStats] {
            self.send(PipelineEvent::IspOutput(
                queue,
                FrameBuffer::new(index, seq, ts),
            ));
        }
        Ok(())
    }

    fn return_buffer(&mut self, _buffer: FrameBuffer) {}

    fn prepare_buffers(&mut self, count: u32) -> Result<(), StreamError> {
        info!(queue = self.id.name(), count, "prepared buffers");
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

/// Stub tuning engine: acknowledges every prepare, reports fixed metadata
/// for every statistics buffer, and pushes a lens-shading update now and
/// then.
struct SimEngine {
    sink: Option<FrameActionSink>,
    frames: u32,
}

impl SimEngine {
    fn emit(&self, frame: u32, action: OperationData) {
        if let Some(sink) = &self.sink {
            let f: &(dyn Fn(u32, OperationData) + Send + Sync) = sink.as_ref();
            f(frame, action);
        }
    }
}

impl AlgorithmEngine for SimEngine {
    fn init(&mut self) -> Result<(), ConfigError> {
        Ok(())
    }

    fn connect_frame_action(&mut self, sink: FrameActionSink) {
        self.sink = Some(sink);
    }

    fn configure(
        &mut self,
        streams: Vec<StreamConfig>,
        control_maps: BTreeMap<u32, ControlInfoMap>,
    ) -> Result<(), ConfigError> {
        info!(
            streams = streams.len(),
            maps = control_maps.len(),
            "sim engine configured"
        );

        let mut action = OperationData::new(EngineOp::SetCameraTimeout);
        action.data = vec![FRAME_INTERVAL.as_millis() as u32];
        self.emit(0, action);
        Ok(())
    }

    fn map_buffers(&mut self, buffers: Vec<EngineBuffer>) {
        info!(count = buffers.len(), "sim engine mapped buffers");
    }

    fn unmap_buffers(&mut self, ids: Vec<u32>) {
        info!(count = ids.len(), "sim engine unmapped buffers");
    }

    fn process_event(&mut self, event: OperationData) {
        match event.operation {
            EngineOp::PrepareIsp => {
                let frame = event.data[2];
                let mut action = OperationData::new(EngineOp::PrepareComplete);
                action.data = vec![event.data[0], event.data[1]];
                self.emit(frame, action);
            }
            EngineOp::ProcessStats => {
                let frame = event.data[1];
                self.frames += 1;

                if self.frames % 8 == 0 {
                    let mut controls = ControlList::new();
                    controls.set(ids::LENS_SHADING, ControlValue::Int32Array(vec![-1, 8, 8]));
                    let mut action = OperationData::new(EngineOp::SetIspControls);
                    action.controls = vec![controls];
                    self.emit(frame, action);
                }

                let mut metadata = ControlList::new();
                metadata.set(ids::EXPOSURE_TIME, ControlValue::Int32(1200));
                metadata.set(
                    ids::COLOUR_GAINS,
                    ControlValue::FloatArray(vec![1.8, 1.4]),
                );
                let mut action = OperationData::new(EngineOp::ProcessComplete);
                action.data = vec![event.data[0]];
                action.controls = vec![metadata];
                self.emit(frame, action);
            }
            _ => error!(operation = ?event.operation, "unexpected operation in sim engine"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "prism=debug".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Prism launching...");

    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(Path::new(&path))?,
        None => Config::default(),
    };

    let events: EventSlot = Arc::new(OnceCell::new());
    let mut queues: BTreeMap<QueueId, Box<dyn DeviceQueue>> = BTreeMap::new();
    for id in [
        QueueId::SensorImage,
        QueueId::SensorMetadata,
        QueueId::IspInput,
        QueueId::IspOutput0,
        QueueId::IspOutput1,
        QueueId::IspStats,
    ] {
        queues.insert(id, Box::new(SimQueue::new(id, 8, Arc::clone(&events))));
    }

    let engine = SimEngine {
        sink: None,
        frames: 0,
    };
    let scheduler_config = SchedulerConfig {
        notify_gains_unity: Some(256),
        ..SchedulerConfig::default()
    };
    let mut session = CameraSession::new(
        Box::new(engine),
        queues,
        scheduler_config,
        config.buffers,
    );

    events
        .set(session.event_sender())
        .map_err(|_| color_eyre::eyre::eyre!("event slot already wired"))?;

    let streams = [
        StreamConfig {
            id: 0,
            pixel_format: u32::from_le_bytes(*b"YU12"),
            width: 1920,
            height: 1080,
        },
        StreamConfig {
            id: 1,
            pixel_format: u32::from_le_bytes(*b"BG12"),
            width: 1920,
            height: 1080,
        },
    ];
    let mut sensor_map = ControlInfoMap::new();
    sensor_map.insert(
        ids::EXPOSURE_TIME,
        ControlInfo {
            min: ControlValue::Int32(14),
            max: ControlValue::Int32(65535),
            def: ControlValue::Int32(1200),
        },
    );
    sensor_map.insert(
        ids::ANALOGUE_GAIN,
        ControlInfo {
            min: ControlValue::Int32(0),
            max: ControlValue::Int32(978),
            def: ControlValue::Int32(0),
        },
    );
    let control_maps: BTreeMap<u32, ControlInfoMap> = [(SENSOR_ENTITY, sensor_map)].into();

    session.configure(&streams, &control_maps, &MemfdAllocator)?;

    let external: BTreeMap<QueueId, u32> =
        [(QueueId::IspOutput0, 4), (QueueId::IspOutput1, 2)].into();
    session.start_capture(&external)?;

    let tx = session.event_sender();
    let app_rx = session.app_events();
    let session_handle = tokio::spawn(session.run());

    // Synthetic sensor: a raw frame plus a metadata buffer at the same
    // timestamp, every frame interval.
    let sensor_tx = tx.clone();
    tokio::spawn(async move {
        for seq in 0..FRAMES {
            let index = (seq % 4) as u16;
            let ts = u64::from(seq) * FRAME_INTERVAL.as_nanos() as u64;
            if sensor_tx
                .send_async(PipelineEvent::SensorImage(FrameBuffer::new(index, seq, ts)))
                .await
                .is_err()
            {
                break;
            }
            let _ = sensor_tx
                .send_async(PipelineEvent::SensorMetadata(FrameBuffer::new(
                    index, seq, ts,
                )))
                .await;
            tokio::time::sleep(FRAME_INTERVAL).await;
        }
    });

    // One request per frame.
    let request_tx = tx.clone();
    tokio::spawn(async move {
        for _ in 0..FRAMES {
            if request_tx
                .send_async(PipelineEvent::QueueRequest(ControlList::new()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let mut completed = 0u32;
    while completed < FRAMES {
        match app_rx.recv_async().await {
            Ok(AppEvent::RequestComplete(request)) => {
                completed += 1;
                if completed % 10 == 0 {
                    info!(
                        sequence = request.sequence,
                        completed,
                        exposure = request.metadata.get_i32(ids::EXPOSURE_TIME),
                        "progress"
                    );
                }
            }
            Ok(AppEvent::BufferReady(..)) => {}
            Err(_) => break,
        }
    }

    tx.send_async(PipelineEvent::Stop).await?;
    session_handle.await??;

    info!(completed, "Prism shutting down");
    Ok(())
}
