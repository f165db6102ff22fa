//! The Node Runtime contract (§4.C): the interface a node type implements,
//! the capability object (`Platform`) handed to it at execution time, and
//! the process-wide registry that dispatches a `node_type` string to an
//! implementation. A small set of built-in node types (`builtin`) ships so
//! the engine is runnable and testable end to end without a node library.

pub mod builtin;
pub mod context;
pub mod definition;
pub mod platform;
pub mod registry;

pub use context::{CancellationHandle, ExecutionContext, HttpRequest, HttpResponse, Platform, PlatformError, ScopedPlatform};
pub use definition::{NodeError, NodeMeta, NodeOutput, NodeRuntime};
pub use platform::DefaultPlatform;
pub use registry::{NodeRegistry, NodeRegistryBuilder, RegistryError};
