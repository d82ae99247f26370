//! Camera device implementations

mod scripted;

pub use scripted::{ScriptHandle, ScriptedDevice};
