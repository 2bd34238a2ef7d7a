//! Configuration plumbing shared by the recorder library and its tools.
//!
//! The engine crate owns *discovery + reading + JSON parsing* of the files under `assets/`.
//! Clients deserialize the parsed value into their own typed structs, which keeps this crate free
//! of recorder internals.

pub mod assets;
pub mod config;
pub mod error;

pub use assets::AssetsRoot;
pub use config::{ConfigMode, LoadedJson};
pub use error::EngineError;
