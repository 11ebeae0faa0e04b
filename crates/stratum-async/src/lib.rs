//! # stratum-async: the async kernel
//!
//! A callback-driven async runtime for building replication and storage
//! engines. The kernel is deliberately small:
//!
//! - [`AsyncRuntime`]: a worker pool plus a timer wheel; everything else
//!   dispatches through it.
//! - [`ContextCore`] / [`AsyncOp`]: the lifecycle state machine every async
//!   operation embeds (`Initialized → Operating → CompletionPending →
//!   Completed`), with activity counting, parent/child completion ordering
//!   and idempotent cancel.
//! - [`ServiceCore`] / [`AsyncService`]: open/close lifecycle layered on the
//!   context kernel, with an optional deferred-close mode gated by a packed
//!   lock-free activity word.
//! - [`AsyncEvent`]: manual/auto-reset event whose waiters are cancellable
//!   contexts.
//! - [`QuotaGate`]: counted semaphore with FIFO quanta acquisition.
//! - [`CancellationTokenSource`] and [`CompletionSource`]: the small task
//!   primitives the upper layers compose with.
//!
//! # Concurrency model
//!
//! Parallel worker threads with cooperative async composition. Async
//! operations never block their caller: they return immediately and invoke a
//! completion callback on a runtime worker thread. Blocking waits exist only
//! at the edges ([`CompletionSource::wait`], used by tests and drains).

pub mod cancel;
pub mod completion;
pub mod context;
pub mod event;
pub mod gate;
pub mod pool;
pub mod runtime;
pub mod service;
pub mod timer;

pub use cancel::{CancellationToken, CancellationTokenSource};
pub use completion::CompletionSource;
pub use context::{
    ActivityGuard, AsyncOp, CompletionCallback, ContextCore, ContextState, GlobalContext,
    cancel_op, reuse_op, start_op, start_op_with_global,
};
pub use event::{AsyncEvent, WaitContext};
pub use gate::{AcquireContext, QuotaGate};
pub use pool::WorkPool;
pub use runtime::AsyncRuntime;
pub use service::{
    AsyncService, ServiceActivityGuard, ServiceCore, ServicePhase, complete_close, complete_open,
    start_close, start_open,
};
pub use stratum_types::{Completion, Status};
pub use timer::{DelayContext, TimerHandle, TimerService};

#[cfg(test)]
mod tests;
