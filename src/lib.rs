//! roadcam: a segmented dashcam recorder.
//!
//! Camera frames are composited on the GPU (optionally with a timestamp watermark), encoded to
//! H.264 and written as a sequence of independently playable MP4 segments of fixed duration.
//! [`Recorder`] is the entry point; [`backend::MediaBackend`] decides where encoders and
//! renderers come from.

#[macro_use]
pub mod logging;

pub mod backend;
pub mod camera;
pub mod compositor;
pub mod config;
pub mod encoder;
pub mod error;
pub mod events;
pub mod frame_ring;
pub mod hotreload;
pub mod muxer;
pub mod recorder;
pub mod state;
pub mod validate;
pub mod watermark;

pub use backend::{DesktopBackend, FrameRenderer, MediaBackend};
pub use camera::CameraSurface;
pub use compositor::PreviewTarget;
pub use config::RecorderConfig;
pub use error::RecorderError;
pub use events::{ChannelCallback, NoopCallback, RecordCallback, RecorderEvent};
pub use recorder::{Recorder, RecorderStats};
pub use state::State;
