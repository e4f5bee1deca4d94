//! Per-frame pipeline state machine.
//!
//! One cycle at a time: the scheduler refuses to start a new cycle unless it
//! is Idle, which is the sole admission-control mechanism. That trades
//! throughput for bounded memory and a deterministic per-frame latency. All
//! methods run on the session's single event context, so there is no locking
//! here.

use std::collections::VecDeque;
use std::time::Duration;

use tracing::{debug, info};

use crate::controls::{ids, ControlList, ControlValue};
use crate::engine::{EngineOp, OperationData};

use super::matcher::{find_matching_buffers, BayerFrame, MatchedFrame};
use super::stream::{BufferId, BufferPool, FrameBuffer, QueueId, Rectangle};

/// One user-visible capture request. The sequence number doubles as the
/// correlation context for engine signals.
#[derive(Debug)]
pub struct Request {
    pub sequence: u32,
    pub controls: ControlList,
    pub metadata: ControlList,
}

impl Request {
    fn new(sequence: u32, controls: ControlList) -> Self {
        Self {
            sequence,
            controls,
            metadata: ControlList::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Busy,
    AlgorithmComplete,
}

/// Outward effects of the scheduler: device queues, the engine boundary and
/// application completions. The session wires these to the real
/// collaborators; tests record them.
pub trait PipelineHooks {
    /// Queue a raw buffer to the ISP input for processing.
    fn queue_isp_input(&mut self, buffer: FrameBuffer);
    /// Hand an internal buffer back to its device queue.
    fn return_buffer(&mut self, queue: QueueId, buffer: FrameBuffer);
    /// Deliver a filled buffer to the application.
    fn deliver_buffer(&mut self, queue: QueueId, buffer: FrameBuffer);
    /// Fire-and-forget operation into the engine boundary.
    fn engine_event(&mut self, action: OperationData);
    /// Apply a crop rectangle on the ISP input.
    fn set_isp_crop(&mut self, crop: Rectangle);
    /// Apply controls to the ISP input device.
    fn set_isp_controls(&mut self, controls: ControlList);
    /// Apply controls to the capture sensor.
    fn set_sensor_controls(&mut self, controls: ControlList);
    /// Signal completion of a retired request.
    fn complete_request(&mut self, request: Request);
    /// Refresh the capture stall timeout.
    fn set_dequeue_timeout(&mut self, timeout: Duration);
}

/// Sensor settings take effect a few frames after they are applied. This
/// records what was pushed to the sensor so a dequeued frame can be paired
/// with the settings actually in effect when it was exposed.
#[derive(Debug, Default)]
pub struct DelayedControls {
    applied: VecDeque<(u32, ControlList)>,
}

/// Frames between applying a sensor control and it taking effect.
const CONTROL_DELAY: u32 = 3;
/// Delay-context ring size shared with the engine.
const DELAY_RING: u32 = 16;

impl DelayedControls {
    /// Record controls applied now, effective from `sequence + CONTROL_DELAY`.
    pub fn push(&mut self, sequence: u32, controls: ControlList) {
        self.applied.push_back((sequence + CONTROL_DELAY, controls));
        while self.applied.len() > DELAY_RING as usize {
            self.applied.pop_front();
        }
    }

    /// Controls in effect for frame `sequence`, plus the delay-context index
    /// identifying that alignment to the engine.
    pub fn get(&self, sequence: u32) -> (ControlList, u32) {
        let controls = self
            .applied
            .iter()
            .rev()
            .find(|(effective, _)| *effective <= sequence)
            .map(|(_, controls)| controls.clone())
            .unwrap_or_default();
        (controls, sequence % DELAY_RING)
    }
}

/// Static parameters fixed at configure time.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Whether the sensor produces a metadata stream alongside raw frames.
    pub sensor_metadata: bool,
    /// ISP output buffers expected per cycle, statistics included.
    pub isp_output_total: u32,
    /// Active sensor array size, bounding the crop.
    pub sensor_size: (u32, u32),
    /// Smallest crop the ISP accepts.
    pub isp_min_crop: (u32, u32),
    /// Unity value for sensors taking notify-gains, None otherwise.
    pub notify_gains_unity: Option<i32>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sensor_metadata: true,
            isp_output_total: 3,
            sensor_size: (1920, 1080),
            isp_min_crop: (32, 32),
            notify_gains_unity: None,
        }
    }
}

struct InFlight {
    bayer: FrameBuffer,
    metadata: Option<FrameBuffer>,
}

pub struct PipelineScheduler {
    config: SchedulerConfig,
    state: PipelineState,
    running: bool,

    requests: VecDeque<Request>,
    next_sequence: u32,

    bayer_queue: VecDeque<BayerFrame>,
    metadata_queue: VecDeque<FrameBuffer>,
    delayed: DelayedControls,
    /// Sequence of the most recently dequeued raw frame, keying push-back
    /// sensor controls into the sensor's sequence space.
    sensor_sequence: u32,

    /// Buffers owned by the scheduler while the engine prepares the frame.
    in_flight: Option<InFlight>,
    /// Statistics buffer held until the engine signals process completion.
    stats_held: Option<FrameBuffer>,

    isp_output_count: u32,
    crop: Rectangle,
    /// Lens-shading table handle patched into ISP control payloads.
    ls_table_handle: Option<i32>,
}

impl PipelineScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        let crop = Rectangle::new(0, 0, config.sensor_size.0, config.sensor_size.1);
        Self {
            config,
            state: PipelineState::Idle,
            running: false,
            requests: VecDeque::new(),
            next_sequence: 0,
            bayer_queue: VecDeque::new(),
            metadata_queue: VecDeque::new(),
            delayed: DelayedControls::default(),
            sensor_sequence: 0,
            in_flight: None,
            stats_held: None,
            isp_output_count: 0,
            crop,
            ls_table_handle: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    pub fn set_ls_table_handle(&mut self, handle: i32) {
        self.ls_table_handle = Some(handle);
    }

    pub fn start(&mut self) {
        self.running = true;
        self.state = PipelineState::Idle;
        self.isp_output_count = 0;
    }

    /// Stop capture: clear both pending-buffer queues and discard any
    /// in-flight cycle's results rather than matching them against a now
    /// stale request queue.
    pub fn stop(&mut self, hooks: &mut dyn PipelineHooks) {
        self.running = false;

        for frame in self.bayer_queue.drain(..) {
            hooks.return_buffer(QueueId::SensorImage, frame.buffer);
        }
        for buffer in self.metadata_queue.drain(..) {
            hooks.return_buffer(QueueId::SensorMetadata, buffer);
        }
        if let Some(in_flight) = self.in_flight.take() {
            hooks.return_buffer(QueueId::SensorImage, in_flight.bayer);
            if let Some(buffer) = in_flight.metadata {
                hooks.return_buffer(QueueId::SensorMetadata, buffer);
            }
        }
        if let Some(buffer) = self.stats_held.take() {
            hooks.return_buffer(QueueId::IspStats, buffer);
        }

        if !self.requests.is_empty() {
            info!(
                pending = self.requests.len(),
                "discarding requests on stop"
            );
            self.requests.clear();
        }

        self.state = PipelineState::Idle;
    }

    /// Queue one capture request. Returns the sequence number used as the
    /// correlation context with the engine.
    pub fn queue_request(&mut self, controls: ControlList, hooks: &mut dyn PipelineHooks) -> u32 {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.requests.push_back(Request::new(sequence, controls));
        self.try_run_pipeline(hooks);
        sequence
    }

    /// Record controls pushed to the sensor so later frames can be aligned
    /// with them, then apply them.
    pub fn push_sensor_controls(
        &mut self,
        sequence: u32,
        controls: ControlList,
        hooks: &mut dyn PipelineHooks,
    ) {
        self.delayed.push(sequence, controls.clone());
        hooks.set_sensor_controls(controls);
    }

    /// A raw frame buffer was dequeued from the sensor.
    pub fn sensor_image_ready(&mut self, buffer: FrameBuffer, hooks: &mut dyn PipelineHooks) {
        if !self.running {
            hooks.return_buffer(QueueId::SensorImage, buffer);
            return;
        }

        debug!(
            index = buffer.index,
            timestamp_ns = buffer.timestamp_ns,
            "sensor image dequeued"
        );

        self.sensor_sequence = buffer.sequence;
        let (mut controls, delay_context) = self.delayed.get(buffer.sequence);
        // The engine never sees the FrameBuffer itself, so carry the capture
        // timestamp in the control list.
        controls.set(
            ids::SENSOR_TIMESTAMP,
            ControlValue::Int64(buffer.timestamp_ns as i64),
        );
        self.bayer_queue.push_back(BayerFrame {
            buffer,
            controls,
            delay_context,
        });

        self.try_run_pipeline(hooks);
    }

    /// A metadata buffer was dequeued from the sensor.
    pub fn sensor_metadata_ready(&mut self, buffer: FrameBuffer, hooks: &mut dyn PipelineHooks) {
        if !self.running {
            hooks.return_buffer(QueueId::SensorMetadata, buffer);
            return;
        }

        debug!(
            index = buffer.index,
            timestamp_ns = buffer.timestamp_ns,
            "sensor metadata dequeued"
        );
        self.metadata_queue.push_back(buffer);
        self.try_run_pipeline(hooks);
    }

    /// The ISP finished reading its input buffer; it goes back to the sensor
    /// queue for refilling.
    pub fn isp_input_returned(&mut self, buffer: FrameBuffer, hooks: &mut dyn PipelineHooks) {
        if !self.running {
            hooks.return_buffer(QueueId::SensorImage, buffer);
            return;
        }

        debug!(index = buffer.index, "ISP input complete");
        hooks.return_buffer(QueueId::SensorImage, buffer);
        self.try_run_pipeline(hooks);
    }

    /// An ISP output buffer was dequeued. Everything except statistics goes
    /// straight to the application; the statistics buffer is forwarded to
    /// the engine and held until it signals process completion.
    pub fn isp_output_ready(
        &mut self,
        queue: QueueId,
        buffer: FrameBuffer,
        hooks: &mut dyn PipelineHooks,
    ) {
        if !self.running {
            hooks.return_buffer(queue, buffer);
            return;
        }

        debug!(
            queue = queue.name(),
            index = buffer.index,
            "ISP output dequeued"
        );
        self.isp_output_count += 1;

        if queue == QueueId::IspStats {
            let request = self
                .requests
                .front()
                .expect("statistics buffer dequeued with no request in flight");

            let mut action = OperationData::new(EngineOp::ProcessStats);
            action.data = vec![
                BufferId::new(BufferPool::Stats, buffer.index).encode(),
                request.sequence,
            ];
            self.stats_held = Some(buffer);
            hooks.engine_event(action);
        } else {
            hooks.deliver_buffer(queue, buffer);
        }
    }

    /// Engine signal: the prepare step finished; buffers may move.
    pub fn prepare_complete(
        &mut self,
        bayer_id: u32,
        embedded_id: u32,
        hooks: &mut dyn PipelineHooks,
    ) {
        let Some(in_flight) = self.in_flight.take() else {
            // Cancelled cycle or a duplicate signal; nothing is held.
            debug!("discarding prepare-complete signal with no cycle in flight");
            return;
        };
        if !self.running {
            hooks.return_buffer(QueueId::SensorImage, in_flight.bayer);
            if let Some(buffer) = in_flight.metadata {
                hooks.return_buffer(QueueId::SensorMetadata, buffer);
            }
            return;
        }

        debug!(bayer_id, embedded_id, "prepare complete, input to ISP");
        hooks.queue_isp_input(in_flight.bayer);
        self.isp_output_count = 0;

        if let Some(buffer) = in_flight.metadata {
            hooks.return_buffer(QueueId::SensorMetadata, buffer);
        }

        self.try_run_pipeline(hooks);
    }

    /// Engine signal: statistics consumed, metadata reported. Retires the
    /// front request and immediately re-attempts the next cycle.
    pub fn process_complete(
        &mut self,
        stats_id: u32,
        metadata: ControlList,
        hooks: &mut dyn PipelineHooks,
    ) {
        let Some(stats) = self.stats_held.take() else {
            debug!("discarding process-complete signal with no statistics buffer held");
            return;
        };
        if !self.running {
            hooks.return_buffer(QueueId::IspStats, stats);
            return;
        }

        debug!(stats_id, "process complete, releasing statistics buffer");
        hooks.return_buffer(QueueId::IspStats, stats);

        let request = self
            .requests
            .front_mut()
            .expect("process-complete signal with no request in flight");
        request.metadata.merge(&metadata);

        self.notify_sensor_gains(&metadata, hooks);

        self.state = PipelineState::AlgorithmComplete;
        self.complete_front_request(hooks);
        self.try_run_pipeline(hooks);
    }

    /// Engine signal: updated ISP controls for the next frame. The
    /// lens-shading payload references the table by handle; patch in ours.
    pub fn apply_isp_controls(&mut self, controls: ControlList, hooks: &mut dyn PipelineHooks) {
        let mut controls = controls;
        if let (Some(table), Some(handle)) =
            (controls.get_i32_array(ids::LENS_SHADING), self.ls_table_handle)
        {
            let mut patched = table.to_vec();
            if !patched.is_empty() {
                patched[0] = handle;
            }
            controls.set(ids::LENS_SHADING, ControlValue::Int32Array(patched));
        }

        hooks.set_isp_controls(controls);
        self.try_run_pipeline(hooks);
    }

    /// Engine signal: new maximum frame length. The capture watchdog allows
    /// five of those, with a floor of one second.
    pub fn set_camera_timeout(&mut self, max_frame_len_ms: u32, hooks: &mut dyn PipelineHooks) {
        let timeout = Duration::from_secs(1).max(Duration::from_millis(5 * u64::from(max_frame_len_ms)));
        debug!(?timeout, "refreshing capture stall timeout");
        hooks.set_dequeue_timeout(timeout);
    }

    fn notify_sensor_gains(&mut self, metadata: &ControlList, hooks: &mut dyn PipelineHooks) {
        let Some(unity) = self.config.notify_gains_unity else {
            return;
        };
        let Some(gains) = metadata.get_float_array(ids::COLOUR_GAINS) else {
            return;
        };
        if gains.len() < 2 {
            return;
        }

        // Linear gains in B, Gb, Gr, R order.
        let unity_f = unity as f32;
        let mut controls = ControlList::new();
        controls.set(
            ids::NOTIFY_GAINS,
            ControlValue::Int32Array(vec![
                (gains[1] * unity_f) as i32,
                unity,
                unity,
                (gains[0] * unity_f) as i32,
            ]),
        );

        let sequence = self.sensor_sequence;
        self.push_sensor_controls(sequence, controls, hooks);
    }

    fn complete_front_request(&mut self, hooks: &mut dyn PipelineHooks) {
        let request = self
            .requests
            .pop_front()
            .expect("completing with an empty request queue");

        if self.isp_output_count < self.config.isp_output_total {
            debug!(
                sequence = request.sequence,
                got = self.isp_output_count,
                expected = self.config.isp_output_total,
                "request completed with missing ISP outputs"
            );
            metrics::counter!("prism_frames_dropped_total").increment(1);
        }
        metrics::counter!("prism_frames_completed_total").increment(1);

        hooks.complete_request(request);
        self.state = PipelineState::Idle;
    }

    /// Start a cycle if every precondition holds: Idle, a request queued and
    /// a matched raw frame available.
    fn try_run_pipeline(&mut self, hooks: &mut dyn PipelineHooks) {
        if !self.running || self.state != PipelineState::Idle || self.requests.is_empty() {
            return;
        }

        let mut dropped = Vec::new();
        let matched = find_matching_buffers(
            &mut self.bayer_queue,
            &mut self.metadata_queue,
            self.config.sensor_metadata,
            &mut dropped,
        );
        for buffer in dropped {
            hooks.return_buffer(QueueId::SensorMetadata, buffer);
        }
        let Some(matched) = matched else {
            return;
        };

        self.start_cycle(matched, hooks);
    }

    fn start_cycle(&mut self, matched: MatchedFrame, hooks: &mut dyn PipelineHooks) {
        assert_eq!(
            self.state,
            PipelineState::Idle,
            "cycle started while one is in flight"
        );

        self.apply_scaler_crop(hooks);

        let request = self.requests.front_mut().expect("checked by caller");

        // The previous frame may have populated this request's metadata
        // before being dropped; start clean, then add the fields only the
        // pipeline knows.
        request.metadata.clear();
        if let Some(ts) = matched.bayer.controls.get_i64(ids::SENSOR_TIMESTAMP) {
            request.metadata.set(ids::SENSOR_TIMESTAMP, ControlValue::Int64(ts));
        }

        self.state = PipelineState::Busy;

        let bayer_id = BufferId::new(BufferPool::Raw, matched.bayer.buffer.index).encode();
        let embedded_id = matched
            .metadata
            .as_ref()
            .map(|buffer| BufferId::new(BufferPool::Embedded, buffer.index).encode())
            .unwrap_or(0);

        debug!(
            sequence = request.sequence,
            bayer_id, embedded_id, "signalling ISP prepare"
        );

        let mut action = OperationData::new(EngineOp::PrepareIsp);
        action.data = vec![
            bayer_id,
            embedded_id,
            request.sequence,
            matched.bayer.delay_context,
        ];
        action.controls = vec![matched.bayer.controls.clone(), request.controls.clone()];

        self.in_flight = Some(InFlight {
            bayer: matched.bayer.buffer,
            metadata: matched.metadata,
        });

        hooks.engine_event(action);
    }

    fn apply_scaler_crop(&mut self, hooks: &mut dyn PipelineHooks) {
        let request = self.requests.front().expect("checked by caller");
        let Some(raw) = request.controls.get_i32_array(ids::SCALER_CROP) else {
            return;
        };
        if raw.len() != 4 {
            return;
        }

        let crop = Rectangle::new(raw[0], raw[1], raw[2] as u32, raw[3] as u32)
            .clamped(self.config.isp_min_crop, self.config.sensor_size);
        if crop != self.crop {
            self.crop = crop;
            hooks.set_isp_crop(crop);
        }
    }
}
