//! # Conference Test Utilities
//!
//! Shared test utilities for the conference service.
//!
//! ## Modules
//!
//! - `scripted_engine` - Media engine with injectable delays and failures
//! - `capturing_sink` - Event sink that records every delivery
//! - `stack` - Room and media services wired over in-memory backends
//! - `fixtures` - Meetings, participants and media parameters
//!
//! ## Usage
//!
//! ```rust,ignore
//! use conference_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let stack = TestStack::new();
//!     let meeting = TestMeeting::random();
//!
//!     let (alice, _) = stack.join(&meeting.id, &TestParticipant::alice()).await;
//!     let (bob, _) = stack.join(&meeting.id, &TestParticipant::bob()).await;
//!
//!     assert_eq!(stack.sink.event_names_for(alice), vec!["participant-joined"]);
//! }
//! ```

pub mod capturing_sink;
pub mod fixtures;
pub mod scripted_engine;
pub mod stack;

pub use capturing_sink::CapturingSink;
pub use fixtures::*;
pub use scripted_engine::ScriptedEngine;
pub use stack::TestStack;
