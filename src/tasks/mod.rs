//! Task invocation model: signatures, headers, results and workflows.

pub mod headers;
pub mod result;
pub mod signature;
pub mod workflow;

pub use headers::{HeaderValue, Headers};
pub use result::{TaskResult, TaskState, TaskStatus};
pub use signature::{Arg, Signature, copy_signature, copy_signatures};
pub use workflow::{Chain, Chord, Group};
