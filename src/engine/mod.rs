//! The tuning-engine boundary: the rich in-process interface and the flat
//! shim that carries it across the module boundary.

pub mod api;
pub mod shim;

pub use api::{
    AlgorithmEngine, EngineBuffer, EngineOp, EnginePlane, FrameActionSink, OperationData,
    StreamConfig,
};
pub use shim::{EngineCallbacks, EngineShim, FlatBuffer, FlatInfoMap, FlatOperation, FlatPlane};
