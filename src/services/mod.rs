//! Upload engine: transport and auth seams, planning, per-segment state
//! machine, scheduling and manifest assembly.

pub mod auth;
pub mod manifest_builder;
pub mod planner;
pub mod retry;
pub mod scheduler;
pub mod segment_uploader;
pub mod source;
pub mod transport;
pub mod uploader;
