//! Task-local trace context.
//!
//! Each unit of asynchronous work carries its own [`Context`]: the event that
//! is currently active for that logical request plus the stack of events it
//! entered. Work scheduled from inside a traced request must capture the
//! context at scheduling time ([`propagate`], [`spawn`], [`bind_fn`]) so the
//! continuation sees the request's position, not whatever happens to run
//! around it. The captured context is owned by the wrapped future or closure
//! and dropped with it.

use std::cell::RefCell;
use std::future::Future;

use tokio::task::JoinHandle;
use tokio::task::futures::TaskLocalFuture;

use crate::error::{Result, TraceError};
use crate::event::EventHandle;
use crate::id::{OpId, TraceIdentifier};

tokio::task_local! {
    static CURRENT_CONTEXT: RefCell<Context>;
}

/// One entered event and the most recent event reported beneath it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Frame {
    handle: EventHandle,
    latest: Option<OpId>,
}

impl Frame {
    fn new(handle: EventHandle) -> Self {
        Self {
            handle,
            latest: None,
        }
    }
}

/// The active position of one logical request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    current: Option<Frame>,
    stack: Vec<Option<Frame>>,
}

impl Context {
    /// An unset context.
    pub fn new() -> Self {
        Self::default()
    }

    /// A context positioned at `handle`, e.g. for a continued inbound trace.
    pub fn at(handle: EventHandle) -> Self {
        Self {
            current: Some(Frame::new(handle)),
            stack: Vec::new(),
        }
    }

    /// Make `handle` the current event, remembering the previous one.
    pub fn enter(&mut self, handle: EventHandle) {
        tracing::trace!(op_id = %handle.id.op_id(), depth = self.stack.len(), "Context enter");
        self.stack.push(self.current.replace(Frame::new(handle)));
    }

    /// Return to the event that was current before `id` was entered.
    ///
    /// On a nesting violation the context is reset to unset and
    /// `ContextMismatch` is returned.
    pub fn exit(&mut self, id: &TraceIdentifier) -> Result<()> {
        let entered = match (&self.current, self.stack.is_empty()) {
            (Some(current), false) if current.handle.id == *id => true,
            _ => false,
        };

        if !entered {
            let err = TraceError::ContextMismatch {
                expected: self
                    .current
                    .map(|c| c.handle.id.to_string())
                    .unwrap_or_else(|| "unset".to_string()),
                found: id.to_string(),
            };
            tracing::warn!(error = %err, depth = self.stack.len(), "Resetting trace context");
            self.reset();
            return Err(err);
        }

        self.current = self.stack.pop().flatten();
        tracing::trace!(op_id = %id.op_id(), depth = self.stack.len(), "Context exit");
        Ok(())
    }

    /// The current event, if any.
    pub fn current(&self) -> Option<EventHandle> {
        self.current.map(|frame| frame.handle)
    }

    /// Note `op_id` as the latest event reported under the current event.
    pub fn record(&mut self, op_id: OpId) {
        if let Some(frame) = &mut self.current {
            frame.latest = Some(op_id);
        }
    }

    /// The latest event recorded under `id`, if `id` is current.
    pub fn latest(&self, id: &TraceIdentifier) -> Option<OpId> {
        self.current
            .filter(|frame| frame.handle.id == *id)
            .and_then(|frame| frame.latest)
    }

    /// Number of entered, not yet exited, events.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn is_unset(&self) -> bool {
        self.current.is_none() && self.stack.is_empty()
    }

    /// Drop everything and return to the unset baseline.
    pub fn reset(&mut self) {
        self.current = None;
        self.stack.clear();
    }
}

/// Run `fut` as a new logical request with an unset context.
pub fn scope<F: Future>(fut: F) -> TaskLocalFuture<RefCell<Context>, F> {
    bind(Context::new(), fut)
}

/// Run `fut` with `ctx` as its context.
pub fn bind<F: Future>(ctx: Context, fut: F) -> TaskLocalFuture<RefCell<Context>, F> {
    CURRENT_CONTEXT.scope(RefCell::new(ctx), fut)
}

/// Capture the current context now and restore it whenever `fut` is polled.
pub fn propagate<F: Future>(fut: F) -> TaskLocalFuture<RefCell<Context>, F> {
    bind(capture(), fut)
}

/// Spawn `fut` on the runtime, carrying the current context with it.
pub fn spawn<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(propagate(fut))
}

/// Run the synchronous `f` with `ctx` as its context.
pub fn run_with<R>(ctx: Context, f: impl FnOnce() -> R) -> R {
    CURRENT_CONTEXT.sync_scope(RefCell::new(ctx), f)
}

/// Wrap a callback so it runs with the context captured now.
pub fn bind_fn<R>(f: impl FnOnce() -> R) -> impl FnOnce() -> R {
    let ctx = capture();
    move || run_with(ctx, f)
}

/// Snapshot of the current context (unset outside any scope).
pub fn capture() -> Context {
    CURRENT_CONTEXT
        .try_with(|ctx| ctx.borrow().clone())
        .unwrap_or_default()
}

/// Check if a context scope is active in the current task.
pub fn is_active() -> bool {
    CURRENT_CONTEXT.try_with(|_| ()).is_ok()
}

/// The current event of the running continuation (None if unset or outside a scope).
pub fn current() -> Option<EventHandle> {
    CURRENT_CONTEXT
        .try_with(|ctx| ctx.borrow().current())
        .ok()
        .flatten()
}

/// Enter `handle` in the running continuation (no-op outside a scope).
pub fn enter(handle: EventHandle) {
    let _ = CURRENT_CONTEXT.try_with(|ctx| ctx.borrow_mut().enter(handle));
}

/// Exit `id` in the running continuation (no-op outside a scope).
pub fn exit(id: &TraceIdentifier) -> Result<()> {
    CURRENT_CONTEXT
        .try_with(|ctx| ctx.borrow_mut().exit(id))
        .unwrap_or(Ok(()))
}

/// Note `op_id` as the latest event reported under the current event (no-op outside a scope).
pub fn record(op_id: OpId) {
    let _ = CURRENT_CONTEXT.try_with(|ctx| ctx.borrow_mut().record(op_id));
}

/// The latest event recorded under `id` in the running continuation.
pub fn latest(id: &TraceIdentifier) -> Option<OpId> {
    CURRENT_CONTEXT
        .try_with(|ctx| ctx.borrow().latest(id))
        .ok()
        .flatten()
}

/// Reset the running continuation's context to unset (no-op outside a scope).
pub fn reset() {
    let _ = CURRENT_CONTEXT.try_with(|ctx| ctx.borrow_mut().reset());
}
