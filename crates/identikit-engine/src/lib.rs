//! identikit-engine: the face enrollment and recognition service core.
//!
//! [`spawn_engine`] recovers persisted state and returns an [`EngineHandle`]:
//! inference runs on the caller's thread against an immutable snapshot,
//! while enrollment, retraining, deletion and metadata updates are
//! serialized through one writer thread.

pub mod config;
pub mod engine;
pub mod error;
pub mod orchestrator;
pub mod responses;

pub use config::{Config, ConfigError};
pub use engine::{open_engine, spawn_engine, EngineHandle, Stores};
pub use error::EngineError;
pub use orchestrator::{
    tally, CropVoting, Inference, Orchestrator, Outcome, PreparedFace, Verdict, Vote,
};
pub use responses::{
    DeleteResponse, EnrollResponse, HealthResponse, InferResponse, LabelsResponse,
    RebuildResponse, UNKNOWN_LABEL,
};
