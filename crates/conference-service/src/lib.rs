//! Conference Service Library
//!
//! The live session core of a conferencing server: it tracks who is in which
//! meeting, brokers media routing resources for each participant and relays
//! in-room events over a persistent signaling connection.
//!
//! # Architecture
//!
//! ```text
//! WebSocket /ws
//!   └── SignalingSession (one per connection, requests in arrival order)
//!         ├── RoomService          membership, mute/video state, chat
//!         │     └── PresenceStore  in-memory or Redis
//!         └── MediaSessionManager  transports, producers, consumers
//!               ├── RouterRegistry one router per meeting, single-flight
//!               └── MediaEngine    routing primitives
//! ConnectionHub (EventSink) fans events out to each connection's queue
//! ```
//!
//! # Key Design Decisions
//!
//! - **Presence is authoritative**: broadcast recipients are always read from
//!   the presence store, never from a cached member list
//! - **Single ownership**: every engine resource belongs to exactly one
//!   connection and is closed when that connection goes away
//! - **Re-join supersedes**: a user joining a meeting they are already in
//!   replaces the older connection
//!
//! # Modules
//!
//! - [`config`] - Service configuration from environment
//! - [`errors`] - Error types with wire error codes
//! - [`events`] - Server-pushed events and the delivery seam
//! - [`gateway`] - WebSocket signaling
//! - [`media`] - Media engine boundary and per-connection media state
//! - [`observability`] - Health probes and metrics
//! - [`presence`] - Participant registry backends
//! - [`room`] - Room membership and in-room state

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod media;
pub mod observability;
pub mod presence;
pub mod room;
