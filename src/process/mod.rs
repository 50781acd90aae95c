//! C3 — ProcessRegistry.

pub mod registry;

pub use registry::{LiveOutputRing, ProcessHandle, ProcessInfo, ProcessRegistry, RunId};
