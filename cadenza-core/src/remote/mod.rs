//! Remote generation stream abstraction.
//!
//! The service's wire schema and authentication are owned by the connector
//! implementation. The session core only sees the message enums below and the
//! split sender/receiver halves of an open stream: the receive loop owns the
//! receiver, the session worker owns the sender, so inbound audio never waits
//! behind an outbound control call.

pub mod tone;

pub use tone::ToneConnector;

use async_trait::async_trait;

use crate::buffering::chunk::AudioChunk;
use crate::config::Credentials;
use crate::error::Result;
use crate::generation::{GenerationConfig, WeightedPrompt};

/// Control messages sent to the service.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    SetPrompts(Vec<WeightedPrompt>),
    SetConfig(GenerationConfig),
    Play,
    Stop,
    ResetContext,
}

/// Messages received from the service.
#[derive(Debug, Clone)]
pub enum InboundMessage {
    /// One or more PCM chunks, in playback order.
    Audio(Vec<AudioChunk>),
    /// Anything else (setup acks, filtered-prompt notices, ...), by kind.
    Other(String),
}

/// Opens streams to the generation service.
#[async_trait]
pub trait StreamConnector: Send + Sync + 'static {
    async fn open(&self, model_id: &str, credentials: &Credentials) -> Result<RemoteStream>;
}

/// Outbound half of an open stream.
#[async_trait]
pub trait StreamSender: Send + 'static {
    async fn send(&mut self, message: OutboundMessage) -> Result<()>;

    /// Graceful teardown of the whole stream.
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of an open stream.
#[async_trait]
pub trait StreamReceiver: Send + 'static {
    /// Next inbound message; `None` once the stream has ended.
    ///
    /// Must be cancel safe: the receive loop polls it inside `select!`.
    async fn recv(&mut self) -> Option<Result<InboundMessage>>;
}

/// An open bidirectional stream, split into its two halves.
pub struct RemoteStream {
    pub sender: Box<dyn StreamSender>,
    pub receiver: Box<dyn StreamReceiver>,
}

impl std::fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStream").finish_non_exhaustive()
    }
}
