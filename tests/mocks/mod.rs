//! Test doubles for executor-level tests

pub mod recording_observer;
pub mod scripted_component;

pub use recording_observer::RecordingObserver;
pub use scripted_component::{Journal, ScriptedComponent};
