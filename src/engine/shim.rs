//! Flat call-table boundary in front of the algorithm engine.
//!
//! The shim presents the engine as a fixed set of entry points taking only
//! flat data: scalar arrays, serialized control lists and buffer identities.
//! Inbound calls are deserialized once and dispatched to the rich
//! [`AlgorithmEngine`] interface; outbound frame actions are serialized into
//! one contiguous buffer and handed to the callback table registered by the
//! caller. The registered callbacks are set once at startup and read-only
//! afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::BytesMut;
use once_cell::sync::OnceCell;
use tracing::debug;

use crate::wire::{self, ReadRegion, WireError, WriteRegion};
use crate::ConfigError;

use super::api::{
    AlgorithmEngine, EngineBuffer, EngineOp, EnginePlane, OperationData, StreamConfig,
};

/// A serialized control schema for one controllable entity.
pub struct FlatInfoMap<'a> {
    pub id: u32,
    pub data: &'a [u8],
}

/// One plane handed across the boundary. A present descriptor transfers
/// ownership to the shim for the duration of the call.
pub type FlatPlane = EnginePlane;

/// A buffer handed across the boundary by identity.
pub type FlatBuffer = EngineBuffer;

/// Flat shape of one outbound frame action. The borrowed slices point into a
/// buffer owned by the shim and are valid only for the duration of the
/// callback.
pub struct FlatOperation<'a> {
    pub operation: u32,
    pub data: &'a [u32],
    pub lists: Vec<&'a [u8]>,
}

/// Callback table registered by the scheduler side of the boundary.
pub struct EngineCallbacks {
    pub queue_frame_action: Box<dyn Fn(u32, &FlatOperation<'_>) + Send + Sync>,
}

struct ShimShared {
    callbacks: OnceCell<EngineCallbacks>,
}

impl ShimShared {
    fn queue_frame_action(&self, frame: u32, action: &OperationData) {
        let Some(callbacks) = self.callbacks.get() else {
            // Nothing registered yet: outbound notifications are dropped
            // silently, by contract.
            debug!(frame, "frame action dropped, no callbacks registered");
            return;
        };

        // One contiguous allocation for every list, carved into one
        // sub-region per list.
        let sizes: Vec<usize> = action.controls.iter().map(wire::binary_size).collect();
        let total: usize = sizes.iter().sum();
        let mut backing = BytesMut::zeroed(total);

        let mut out = WriteRegion::new(&mut backing);
        for (list, size) in action.controls.iter().zip(&sizes) {
            let mut sub = out.carve_out(*size).expect("region sized via binary_size");
            wire::serialize(list, &mut sub).expect("region sized via binary_size");
        }

        let mut lists = Vec::with_capacity(sizes.len());
        let mut offset = 0;
        for size in &sizes {
            lists.push(&backing[offset..offset + size]);
            offset += size;
        }

        let flat = FlatOperation {
            operation: action.operation as u32,
            data: &action.data,
            lists,
        };
        (callbacks.queue_frame_action)(frame, &flat);
    }
}

/// The boundary shim. Dropping it releases the wrapped engine and any
/// outstanding resources.
pub struct EngineShim {
    engine: Box<dyn AlgorithmEngine>,
    shared: Arc<ShimShared>,
}

impl EngineShim {
    /// Wrap `engine` and wire its frame-action signal to the (not yet
    /// registered) callback table.
    pub fn new(mut engine: Box<dyn AlgorithmEngine>) -> Self {
        let shared = Arc::new(ShimShared {
            callbacks: OnceCell::new(),
        });

        let sink = Arc::clone(&shared);
        engine.connect_frame_action(Arc::new(move |frame, action| {
            sink.queue_frame_action(frame, &action);
        }));

        Self { engine, shared }
    }

    /// Register the callback table. Registering twice is a programming
    /// error.
    pub fn register_callbacks(&self, callbacks: EngineCallbacks) {
        if self.shared.callbacks.set(callbacks).is_err() {
            panic!("engine callbacks registered twice");
        }
    }

    pub fn init(&mut self) -> Result<(), ConfigError> {
        self.engine.init()
    }

    /// Deserialize each control schema once and configure the engine. A
    /// malformed map is a fatal configuration error, not retried.
    pub fn configure(
        &mut self,
        streams: &[StreamConfig],
        maps: &[FlatInfoMap<'_>],
    ) -> Result<(), ConfigError> {
        let mut control_maps = BTreeMap::new();
        for map in maps {
            let mut region = ReadRegion::new(map.data);
            let decoded = wire::deserialize_info_map(&mut region)
                .map_err(|source| ConfigError::MalformedInfoMap { id: map.id, source })?;
            control_maps.insert(map.id, decoded);
        }

        self.engine.configure(streams.to_vec(), control_maps)
    }

    /// Hand buffers to the engine. Every supplied descriptor is owned by the
    /// shim for the duration of the call; ownership of a descriptor moves to
    /// the engine exactly once, and descriptors not handed onward are closed
    /// here on every exit path.
    pub fn map_buffers(&mut self, buffers: Vec<FlatBuffer>) {
        self.engine.map_buffers(buffers);
    }

    pub fn unmap_buffers(&mut self, ids: &[u32]) {
        self.engine.unmap_buffers(ids.to_vec());
    }

    /// Deserialize the packed control lists and dispatch one operation to
    /// the engine.
    pub fn process_event(
        &mut self,
        operation: u32,
        data: &[u32],
        lists: &[&[u8]],
    ) -> Result<(), WireError> {
        let operation =
            EngineOp::from_u32(operation).ok_or(WireError::MalformedPayload("unknown operation"))?;

        let mut controls = Vec::with_capacity(lists.len());
        for list in lists {
            let mut region = ReadRegion::new(list);
            controls.push(wire::deserialize(&mut region)?);
        }

        self.engine.process_event(OperationData {
            operation,
            data: data.to_vec(),
            controls,
        });
        Ok(())
    }
}

/// Serialize an operation's control lists back-to-back and push it through a
/// shim's flat `process_event` entry point.
pub fn send_operation(shim: &mut EngineShim, action: &OperationData) -> Result<(), WireError> {
    let sizes: Vec<usize> = action.controls.iter().map(wire::binary_size).collect();
    let total: usize = sizes.iter().sum();
    let mut backing = BytesMut::zeroed(total);

    let mut out = WriteRegion::new(&mut backing);
    for (list, size) in action.controls.iter().zip(&sizes) {
        let mut sub = out.carve_out(*size).expect("region sized via binary_size");
        wire::serialize(list, &mut sub).expect("region sized via binary_size");
    }

    let mut lists = Vec::with_capacity(sizes.len());
    let mut offset = 0;
    for size in &sizes {
        lists.push(&backing[offset..offset + size]);
        offset += size;
    }

    shim.process_event(action.operation as u32, &action.data, &lists)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controls::{ControlInfo, ControlInfoMap, ControlValue};
    use crate::engine::FrameActionSink;
    use std::os::fd::{AsRawFd, OwnedFd};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorded {
        initialized: bool,
        streams: Vec<StreamConfig>,
        control_maps: BTreeMap<u32, ControlInfoMap>,
        mapped: Vec<(u32, usize)>,
        unmapped: Vec<u32>,
        events: Vec<OperationData>,
        held_fds: Vec<OwnedFd>,
    }

    /// Engine stub that records every call and exposes the frame-action sink
    /// so tests can drive outbound notifications.
    struct RecordingEngine {
        recorded: Arc<Mutex<Recorded>>,
        sink_probe: Arc<Mutex<Option<FrameActionSink>>>,
    }

    impl AlgorithmEngine for RecordingEngine {
        fn init(&mut self) -> Result<(), ConfigError> {
            self.recorded.lock().unwrap().initialized = true;
            Ok(())
        }

        fn connect_frame_action(&mut self, sink: FrameActionSink) {
            *self.sink_probe.lock().unwrap() = Some(sink);
        }

        fn configure(
            &mut self,
            streams: Vec<StreamConfig>,
            control_maps: BTreeMap<u32, ControlInfoMap>,
        ) -> Result<(), ConfigError> {
            let mut recorded = self.recorded.lock().unwrap();
            recorded.streams = streams;
            recorded.control_maps = control_maps;
            Ok(())
        }

        fn map_buffers(&mut self, buffers: Vec<EngineBuffer>) {
            let mut recorded = self.recorded.lock().unwrap();
            for buffer in buffers {
                recorded.mapped.push((buffer.id, buffer.planes.len()));
                for plane in buffer.planes {
                    if let Some(fd) = plane.fd {
                        recorded.held_fds.push(fd);
                    }
                }
            }
        }

        fn unmap_buffers(&mut self, ids: Vec<u32>) {
            self.recorded.lock().unwrap().unmapped.extend(ids);
        }

        fn process_event(&mut self, event: OperationData) {
            self.recorded.lock().unwrap().events.push(event);
        }
    }

    fn probed_shim() -> (EngineShim, Arc<Mutex<Recorded>>, FrameActionSink) {
        let recorded = Arc::new(Mutex::new(Recorded::default()));
        let sink_probe = Arc::new(Mutex::new(None));
        let shim = EngineShim::new(Box::new(RecordingEngine {
            recorded: Arc::clone(&recorded),
            sink_probe: Arc::clone(&sink_probe),
        }));
        let sink = sink_probe.lock().unwrap().take().expect("sink connected");
        (shim, recorded, sink)
    }

    fn emit(sink: &FrameActionSink, frame: u32, action: OperationData) {
        let f: &(dyn Fn(u32, OperationData) + Send + Sync) = sink.as_ref();
        f(frame, action);
    }

    fn serialized_info_map() -> Vec<u8> {
        let mut map = ControlInfoMap::new();
        map.insert(
            1,
            ControlInfo {
                min: ControlValue::Int32(0),
                max: ControlValue::Int32(100),
                def: ControlValue::Int32(50),
            },
        );
        let mut buf = vec![0u8; wire::info_map_binary_size(&map)];
        wire::serialize_info_map(&map, &mut WriteRegion::new(&mut buf)).unwrap();
        buf
    }

    #[test]
    fn init_reaches_the_engine() {
        let (mut shim, recorded, _sink) = probed_shim();
        shim.init().unwrap();
        assert!(recorded.lock().unwrap().initialized);
    }

    #[test]
    fn configure_deserializes_each_map_once() {
        let (mut shim, recorded, _sink) = probed_shim();
        let data = serialized_info_map();
        let streams = [StreamConfig {
            id: 0,
            pixel_format: 0x3138_4142, // BA81
            width: 640,
            height: 480,
        }];

        shim.configure(&streams, &[FlatInfoMap { id: 9, data: &data }])
            .unwrap();

        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.streams.len(), 1);
        let map = recorded.control_maps.get(&9).expect("map forwarded");
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn malformed_info_map_is_fatal() {
        let (mut shim, _, _sink) = probed_shim();
        let data = serialized_info_map();

        let err = shim
            .configure(
                &[],
                &[FlatInfoMap {
                    id: 9,
                    data: &data[..data.len() - 2],
                }],
            )
            .unwrap_err();
        assert!(matches!(err, ConfigError::MalformedInfoMap { id: 9, .. }));
    }

    #[test]
    fn process_event_unpacks_control_lists() {
        let (mut shim, recorded, _sink) = probed_shim();

        let mut list = crate::controls::ControlList::new();
        list.set(3, ControlValue::Int32(30));
        let action = OperationData {
            operation: EngineOp::PrepareIsp,
            data: vec![0x0001_0002, 0, 7, 1],
            controls: vec![list.clone(), crate::controls::ControlList::new()],
        };

        send_operation(&mut shim, &action).unwrap();

        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.events.len(), 1);
        let event = &recorded.events[0];
        assert_eq!(event.operation, EngineOp::PrepareIsp);
        assert_eq!(event.data, action.data);
        assert_eq!(
            event.controls,
            vec![list, crate::controls::ControlList::new()]
        );
    }

    #[test]
    fn unknown_operation_is_a_protocol_error() {
        let (mut shim, _, _sink) = probed_shim();
        let err = shim.process_event(0xdead, &[], &[]).unwrap_err();
        assert!(matches!(err, WireError::MalformedPayload(_)));
    }

    #[test]
    fn map_buffers_transfers_descriptor_ownership_once() {
        let (mut shim, recorded, _sink) = probed_shim();

        let file = tempfile::tempfile().unwrap();
        let fd: OwnedFd = file.into();
        let raw = fd.as_raw_fd();

        shim.map_buffers(vec![FlatBuffer {
            id: 0x0004_0000,
            planes: vec![
                FlatPlane {
                    fd: Some(fd),
                    length: 4096,
                },
                FlatPlane { fd: None, length: 0 },
            ],
        }]);

        let recorded = recorded.lock().unwrap();
        assert_eq!(recorded.mapped, vec![(0x0004_0000, 2)]);
        assert_eq!(recorded.held_fds.len(), 1);
        // The engine now owns the descriptor and it is still open.
        assert_eq!(recorded.held_fds[0].as_raw_fd(), raw);
        assert!(nix::sys::stat::fstat(&recorded.held_fds[0]).is_ok());
    }

    #[test]
    fn unmap_is_by_id_only() {
        let (mut shim, recorded, _sink) = probed_shim();
        shim.unmap_buffers(&[0x0004_0000, 0x0002_0001]);
        assert_eq!(
            recorded.lock().unwrap().unmapped,
            vec![0x0004_0000, 0x0002_0001]
        );
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn double_registration_panics() {
        let (shim, _, _sink) = probed_shim();
        shim.register_callbacks(EngineCallbacks {
            queue_frame_action: Box::new(|_, _| {}),
        });
        shim.register_callbacks(EngineCallbacks {
            queue_frame_action: Box::new(|_, _| {}),
        });
    }

    #[test]
    fn outbound_action_before_registration_is_silently_dropped() {
        let (shim, _, sink) = probed_shim();

        // No callbacks registered: must not panic, must not deliver.
        emit(&sink, 7, OperationData::new(EngineOp::ProcessComplete));

        let delivered = Arc::new(Mutex::new(Vec::new()));
        let probe = Arc::clone(&delivered);
        shim.register_callbacks(EngineCallbacks {
            queue_frame_action: Box::new(move |frame, flat| {
                probe.lock().unwrap().push((frame, flat.operation));
            }),
        });

        emit(&sink, 8, OperationData::new(EngineOp::ProcessComplete));
        assert_eq!(
            *delivered.lock().unwrap(),
            vec![(8, EngineOp::ProcessComplete as u32)]
        );
    }

    #[test]
    fn outbound_lists_are_packed_contiguously() {
        let (shim, _, sink) = probed_shim();

        let decoded = Arc::new(Mutex::new(Vec::new()));
        let probe = Arc::clone(&decoded);
        shim.register_callbacks(EngineCallbacks {
            queue_frame_action: Box::new(move |frame, flat| {
                // Deserialize inside the callback; the slices are only valid
                // for its duration.
                let mut lists = Vec::new();
                for list in &flat.lists {
                    let mut region = ReadRegion::new(list);
                    lists.push(wire::deserialize(&mut region).unwrap());
                }
                probe
                    .lock()
                    .unwrap()
                    .push((frame, flat.data.to_vec(), lists));
            }),
        });

        let mut metadata = crate::controls::ControlList::new();
        metadata.set(0x0103, ControlValue::FloatArray(vec![1.5, 2.0]));
        let mut extra = crate::controls::ControlList::new();
        extra.set(0x0106, ControlValue::Int32(1200));

        let mut action = OperationData::new(EngineOp::ProcessComplete);
        action.data = vec![0x0004_0001];
        action.controls = vec![metadata.clone(), extra.clone()];
        emit(&sink, 42, action);

        let decoded = decoded.lock().unwrap();
        assert_eq!(decoded.len(), 1);
        let (frame, data, lists) = &decoded[0];
        assert_eq!(*frame, 42);
        assert_eq!(*data, vec![0x0004_0001]);
        assert_eq!(*lists, vec![metadata, extra]);
    }
}
