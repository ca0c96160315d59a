//! Execution contexts.
//!
//! A [`Context`] is an affinity token bound to one worker thread. Tasks
//! submitted against the same context run one at a time, in order, on that
//! worker; different contexts run concurrently across the pool. Sessions and
//! datagram services each own a context so their hooks and deliveries are
//! serialized without locks.
//!
//! Timers set with [`Context::set_timer`] and [`Context::set_periodic`] wait
//! on the worker runtime and queue their callback on the owning context when
//! they fire, so a callback never overlaps other work on that context.

mod timer;
mod unit;
mod worker;

pub use timer::TimerId;
pub use unit::{current_context, Context, ContextClosed, ContextId, ContextPool, Task};
pub use worker::{Worker, WorkerConfig, WorkerPool};
