//! Worker-process internals: task queue, dispatcher, and handlers.
//!
//! The worker is deliberately synchronous: plain OS threads around a
//! condvar-guarded queue, with the process's main thread doubling as channel
//! reader and executor for main-thread-only jobs. Every task kind shares the
//! queue's round-robin cursor; the split is only in who pops what: pool
//! threads take everything except probes, the dispatcher takes probes, and
//! each side waits out the other's cursor turns.
//!
//! ```text
//!             inbound frames
//!                  │
//!          ┌───────▼────────┐      ┌──────────────────┐
//!          │   Dispatcher   │─────▶│    TaskQueue     │
//!          │  (main thread) │      │ 20 ▸ feed        │
//!          │   pops probes  │◀─────│ 10 ▸ tag ⇄ probe │
//!          └───────┬────────┘      └────────┬─────────┘
//!                  │ status pings,          │ worker threads pop
//!                  │ probe replies          │ the rest + reply
//!                  ▼                        ▼
//!             outbound frames (serialized per send)
//! ```

pub mod dispatcher;
pub mod handlers;
pub mod queue;

pub use dispatcher::{DEFAULT_TAG_DEADLINE, Dispatcher, DispatcherOptions};
pub use handlers::{StockHandlers, TaskHandlers};
pub use queue::{QueuedTask, TaskQueue};
