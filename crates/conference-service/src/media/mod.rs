//! Media side of a live session.
//!
//! - [`engine`] - the primitives an SFU engine must provide
//! - [`local`] - in-process engine used for development and tests
//! - [`router`] - one routing context per meeting, reference-counted
//! - [`session`] - transports, producers and consumers per connection

pub mod codecs;
pub mod engine;
pub mod local;
pub mod router;
pub mod session;

pub use codecs::default_media_codecs;
pub use engine::{
    ConsumerDescriptor, DtlsParameters, EngineError, EngineEvent, MediaEngine, MediaKind,
    RtpCapabilities, RtpParameters, TransportDirection, TransportOptions, TransportParams,
};
pub use local::LocalMediaEngine;
pub use router::{RouterContext, RouterRegistry};
pub use session::{spawn_engine_event_loop, MediaSessionManager};
