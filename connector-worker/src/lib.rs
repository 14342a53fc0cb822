//! Pipeline worker: executes the events published by elba-connect.
//!
//! ```text
//! NATS JetStream / QueuePublisher
//!          ↓
//! ┌─────────────────────────────────────────┐
//! │       JobQueue                           │
//! │  - per-organisation concurrency lanes    │
//! │  - delays, retries with backoff          │
//! │  - lifecycle cancellation                │
//! └─────────────────────────────────────────┘
//!          ↓
//! ┌─────────────────────────────────────────┐
//! │       Pipeline functions                 │
//! │  - sync, delete, install, uninstall      │
//! │  - token refresh, sync scheduling        │
//! └─────────────────────────────────────────┘
//!          ↓
//!    vendor API  →  elba API
//! ```

pub mod functions;
pub mod intake;
pub mod queue;

pub use functions::{FunctionError, Pipeline};
pub use queue::{JobEnd, JobHandler, JobQueue, JobReceipt, QueuePublisher, RetryPolicy};
