//! Sandboxed execution of model-supplied code snippets.
//!
//! The runtime is built from three pieces: globals marshaling (host
//! functions become registry entries plus payload sentinels), the V8
//! executor with its op bridge and resource caps, and the budgeted result
//! serializer used by the gateway surface.

pub mod globals;
pub mod runtime;
pub mod serialize;

pub use globals::{FunctionRegistry, GlobalValue, Globals, HostFunction};
pub use runtime::{SandboxLimits, SandboxRuntime};
pub use serialize::serialize_with_limit;
