//! # cadenza-core
//!
//! Streaming core of a real-time generative music session client.
//!
//! ## Architecture
//!
//! ```text
//! caller threads ──► SessionController ──(command queue)──► session worker thread
//!                                                            │  (current-thread tokio)
//!                                                            ├─ StreamSender  ──► service
//!                                                            └─ receive loop ◄── service
//!                                                                   │
//!                                          ┌────────────────────────┴──────────┐
//!                                          ▼                                   ▼
//!                                  ChunkWriter ═ SPSC ring ═ FrameReader   RecordingAccumulator
//!                                                                │                 │
//!                                                       output callback       WAV export
//! ```
//!
//! The output callback is wait-free and allocation-free. Every control
//! operation runs on the session worker, one at a time, in submission order.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod config;
pub mod error;
pub mod events;
pub mod export;
pub mod generation;
pub mod remote;
pub mod session;

// Convenience re-exports for downstream crates
pub use audio::{device::list_output_devices, AudioOutput, CpalOutput, NullOutput};
pub use config::{Credentials, PcmFormat, SessionConfig};
pub use error::{CadenzaError, Result};
pub use events::{SessionState, SessionStatusEvent};
pub use generation::{GenerationConfig, GenerationMode, Scale, WeightedPrompt};
pub use remote::{StreamConnector, ToneConnector};
pub use session::{DiagnosticsSnapshot, SessionController};
