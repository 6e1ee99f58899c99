//! Voice call cascade

pub mod controller;
pub mod hangup;

pub use controller::{CallController, CallEvent, DigitsOutcome, InitiateOutcome, SharedCallController};
pub use hangup::classify_hangup;
