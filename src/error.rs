use std::{fmt, time::Duration};

use roadcam_engine::EngineError;

use crate::state::{State, TransitionError};

/// Errors surfaced by the public `Recorder` operations.
///
/// Worker threads never unwind across this boundary: a panicking or vanished worker shows up
/// as `WorkerGone`, an initialization failure as `Init`.
#[derive(Debug)]
pub enum RecorderError {
    /// The operation is not legal in the current state.
    InvalidState { op: &'static str, state: State },
    /// The render thread did not finish initialization in time.
    InitTimeout(Duration),
    /// Encoder, GPU or muxer setup failed on the render thread.
    Init(anyhow::Error),
    /// A render-thread request failed after initialization.
    Pipeline(anyhow::Error),
    /// A worker thread exited (or panicked) while a reply was pending.
    WorkerGone(&'static str),
    /// Spawning a worker thread failed.
    Spawn(std::io::Error),
    /// Configuration could not be loaded.
    Config(EngineError),
}

impl RecorderError {
    pub(crate) fn from_transition(op: &'static str, e: TransitionError) -> Self {
        RecorderError::InvalidState { op, state: e.from }
    }
}

impl fmt::Display for RecorderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecorderError::InvalidState { op, state } => {
                write!(f, "{op} is not allowed while the recorder is {state}")
            }
            RecorderError::InitTimeout(d) => {
                write!(f, "render thread did not initialize within {} ms", d.as_millis())
            }
            RecorderError::Init(e) => write!(f, "initialization failed: {e:#}"),
            RecorderError::Pipeline(e) => write!(f, "pipeline error: {e:#}"),
            RecorderError::WorkerGone(which) => write!(f, "{which} thread exited unexpectedly"),
            RecorderError::Spawn(e) => write!(f, "cannot spawn worker thread: {e}"),
            RecorderError::Config(e) => write!(f, "config error: {e}"),
        }
    }
}

impl std::error::Error for RecorderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RecorderError::Init(e) | RecorderError::Pipeline(e) => Some(&**e),
            RecorderError::Spawn(e) => Some(e),
            RecorderError::Config(e) => Some(e),
            _ => None,
        }
    }
}

impl From<EngineError> for RecorderError {
    fn from(e: EngineError) -> Self {
        RecorderError::Config(e)
    }
}
