//! ROCm HIP backend

pub mod bindings;
mod runtime;

pub use runtime::HipRuntime;
