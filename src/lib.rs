//! # chordq
//!
//! A distributed task queue for Rust applications.
//!
//! ## Features
//!
//! - **Signatures**: Serializable task invocations with routing, ETA, priority and retry metadata
//! - **Workflows**: Chains, groups and chords composed from signatures
//! - **Pluggable Brokers**: In-memory out of the box, Redis behind the `redis` feature
//! - **Retries**: Configurable backoff with explicit retry-later requests from tasks
//! - **Graceful Shutdown**: Workers drain in-flight tasks before stopping
//!
//! ## Quick Start
//!
//! ```rust
//! use chordq::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> ChordqResult<()> {
//!     let server = Server::new(Config::default()).await?;
//!
//!     server
//!         .register_task(
//!             "add",
//!             task_fn(|args: Vec<Arg>| async move {
//!                 let mut sum = 0i64;
//!                 for arg in &args {
//!                     sum += arg.decode::<i64>()?;
//!                 }
//!                 Ok(vec![TaskResult::new("int64", sum)])
//!             }),
//!         )
//!         .await;
//!
//!     // add(1, 2) then add(<result>, 10)
//!     let chain = Chain::new(vec![
//!         Signature::new("add", vec![Arg::new("int64", 1), Arg::new("int64", 2)]),
//!         Signature::new("add", vec![Arg::new("int64", 10)]),
//!     ])?;
//!     let result = server.send_chain(chain).await?;
//!
//!     let worker = server.new_worker("quickstart", 2);
//!     let handle = tokio::spawn({
//!         let worker = worker.clone();
//!         async move { worker.launch().await }
//!     });
//!
//!     let results = result
//!         .get_with_timeout(
//!             std::time::Duration::from_secs(5),
//!             std::time::Duration::from_millis(10),
//!         )
//!         .await?;
//!     assert_eq!(results[0].value, serde_json::json!(13));
//!
//!     worker.quit();
//!     let _ = handle.await;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod broker;
pub mod config;
pub mod core;
pub mod error;
pub mod tasks;
pub mod telemetry;
pub mod utils;

pub mod prelude {
    pub use crate::backend::{AsyncResult, InMemoryBackend, ResultBackend};
    pub use crate::broker::{Broker, InMemoryBroker, TaskProcessor};
    pub use crate::config::*;
    pub use crate::core::{Server, TaskHandler, TaskRegistry, Worker, WorkerStats, task_fn};
    pub use crate::error::{ChordqError, ChordqResult, TaskError};
    pub use crate::tasks::{
        Arg, Chain, Chord, Group, Headers, Signature, TaskResult, TaskState, TaskStatus,
    };
    pub use async_trait::async_trait;
    pub use tokio_util::sync::CancellationToken;

    #[cfg(feature = "redis")]
    #[cfg_attr(docsrs, doc(cfg(feature = "redis")))]
    pub use crate::{backend::RedisBackend, broker::RedisBroker};
}

pub use crate::config::*;
pub use crate::core::Server;
pub use crate::error::{ChordqError, ChordqResult, TaskError};
pub use async_trait::async_trait;
