//! Scoped execution contexts for thread-based task concurrency.
//!
//! Every task spawned through [`run`] gets a context record of its own.
//! Child tasks inherit the parent's variable store, panic handler slot, and
//! close-handler list by reference until [`separate`] detaches them, panics
//! escaping a routine travel through a chain of user-installed handlers
//! instead of tearing the task down silently, and [`wait`] blocks until the
//! caller's whole subtree of tasks (close handlers included) has finished.
//!
//! Calls made from threads the library did not spawn are routed to a
//! process-wide root context, so the API is safe to use from anywhere.
//!
//! ```
//! taskctx::set("greeting", String::from("hello")).wait();
//!
//! taskctx::run(|| {
//!     // The child shares the parent's variables.
//!     let greeting = taskctx::get("greeting").unwrap();
//!     assert_eq!(greeting.downcast_ref::<String>().unwrap(), "hello");
//! });
//!
//! // Blocks until the spawned task (and anything it spawned) is done.
//! taskctx::wait().recv();
//! ```
//!
//! Trapped panics still run the process panic hook before the handler chain
//! sees them, so the usual `thread '...' panicked` line keeps showing up on
//! stderr unless the hook is replaced.

use std::any::Any;
use std::panic::Location;
use std::sync::Arc;

use thiserror::Error;

mod emitter;
mod exec;
mod panic;
mod task;

pub use crate::emitter::{Delivery, Done, Emitter, Event, Subscription};
pub use crate::panic::{Panic, PanicHandler};

/// A value stored in a context's variable store. Values are shared, so
/// reads hand back another reference to the same allocation.
pub type Value = Arc<dyn Any + Send + Sync + 'static>;

/// A close handler. Handlers are compared by allocation identity, so keep
/// the value returned by [`close_handler`] around to remove it later.
pub type CloseHandler = Arc<dyn Fn() + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum Error {
    /// The calling thread has no context registered.
    #[error("context not running")]
    NotRunning,
}

/// Reads a variable from the current context. Returns `None` for absent
/// keys. Routes to the root context when called from an unmanaged thread.
pub fn get(name: &str) -> Option<Value> {
    exec::current_context().get_var(name)
}

/// Writes a variable to the current context, then publishes a `SET:<name>`
/// event carrying the stored value. The returned handle resolves once
/// every live [`on_set`] subscriber has been served.
pub fn set(name: &str, value: impl Any + Send + Sync) -> Done {
    exec::current_context().set_var(name, Arc::new(value))
}

/// Subscribes to `SET:<name>` events on the current context's store.
pub fn on_set(name: &str) -> Subscription {
    exec::current_context().on_set(name)
}

/// Drops a subscription taken out with [`on_set`].
pub fn off_set(sub: &Subscription) {
    exec::current_context().off_set(sub)
}

/// Spawns `routine` as a child task of the current context.
///
/// The child inherits the parent's shared state, participates in the
/// parent's [`wait`], and any panic escaping the routine is routed through
/// the panic handler chain rather than unwinding the thread silently.
#[track_caller]
pub fn run(routine: impl FnOnce() + Send + 'static) {
    exec::current_context().run(Box::new(routine), Location::caller())
}

/// Returns a one-shot subscription that resolves once every task spawned
/// under the current context, transitively and including close handlers,
/// has finished. Resolves immediately when nothing is running.
pub fn wait() -> Subscription {
    exec::current_context().wait()
}

/// Wraps a closure as a [`PanicHandler`].
pub fn panic_handler(f: impl Fn(&Panic) + Send + Sync + 'static) -> PanicHandler {
    Arc::new(f)
}

/// Replaces the handler value in the current shared slot and returns the
/// previous one. The change is visible to every context sharing the slot,
/// ancestors included, up to the nearest separation or local install.
pub fn set_global_panic_handler(handler: PanicHandler) -> PanicHandler {
    exec::current_context().set_panic_handler(handler, false)
}

/// Installs `handler` in a fresh slot bound to the current context only.
/// Ancestors keep their slot; tasks spawned after this call inherit the new
/// one. Returns the previous handler.
pub fn set_local_panic_handler(handler: PanicHandler) -> PanicHandler {
    exec::current_context().set_panic_handler(handler, true)
}

/// Wraps a closure as a [`CloseHandler`].
pub fn close_handler(f: impl Fn() + Send + Sync + 'static) -> CloseHandler {
    Arc::new(f)
}

/// Appends `handler` to the close-handler list the current context shares
/// with its ancestors. Adding the same handler twice is a no-op.
///
/// Close handlers run as the owning context shuts down, each spawned as a
/// child task, in reverse insertion order, strictly after every task run
/// under that context has finished. Note that tasks spawned under the root
/// always get a list of their own, so handlers added at the root itself
/// belong to the root and the root never shuts down.
#[track_caller]
pub fn add_close_handler(handler: &CloseHandler) {
    exec::current_context().add_close_handler(handler, false, Location::caller())
}

/// Like [`add_close_handler`], but detaches a fresh list for the current
/// context first if it still shares one with its parent, so the handler
/// runs when this context ends rather than when the ancestor does.
#[track_caller]
pub fn add_local_close_handler(handler: &CloseHandler) {
    exec::current_context().add_close_handler(handler, true, Location::caller())
}

/// Removes a previously added close handler (matched by identity).
pub fn remove_close_handler(handler: &CloseHandler) {
    exec::current_context().remove_close_handler(handler)
}

/// Detaches the current context from its parent's shared state: fresh
/// variable store, fresh change emitter, fresh close-handler list, and a
/// panic slot of its own seeded with the current handler. A separated
/// context also stops panic-handler walks from climbing past it.
///
/// Call this before spawning children that should see the detached state;
/// children spawned earlier keep the old shared handles.
///
/// # Panics
///
/// Panics with [`Error::NotRunning`] when the calling thread has no
/// registered context. Use [`try_separate`] for the fallible form.
pub fn separate() {
    if let Err(err) = try_separate() {
        panic!("{err}");
    }
}

/// Fallible form of [`separate`].
pub fn try_separate() -> Result<(), Error> {
    match exec::lookup(exec::current_task_id()) {
        Some(ctx) => {
            ctx.separate();
            Ok(())
        }
        None => Err(Error::NotRunning),
    }
}

/// Renders the tree of live tasks under the current context, one line per
/// descendant: a `▸` marker while the routine is still running, the dotted
/// task-ID path, and the source location the task was spawned from. Lines
/// are ordered depth first with siblings sorted by task ID.
pub fn get_running() -> String {
    let mut lines = Vec::new();
    exec::current_context().running_lines("", false, &mut lines);
    lines.join("\n")
}

// Source paths in thread names and in the running-tree dump are shown
// relative to the crate root where possible.
pub(crate) fn trim_source_path(file: &str) -> &str {
    file.strip_prefix(concat!(env!("CARGO_MANIFEST_DIR"), "/"))
        .unwrap_or(file)
}
