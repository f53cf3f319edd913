//! The process-wide execution environment: task identity, the registry
//! mapping task IDs to their context records, and the root context that
//! backs calls made from unmanaged threads.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{self, AtomicU64};
use std::sync::{Arc, RwLock};

use log::debug;
use once_cell::sync::Lazy;

use crate::task::Context;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

// Per-thread task ID storage. Zero means the thread has not been assigned
// an ID yet; the first lookup on a thread claims the next free one.
thread_local!(static TASK_ID: Cell<u64> = Cell::new(0));

/// Returns the calling thread's task ID, assigning one on first use.
/// Successive calls on the same thread return the same value and two
/// concurrently live threads never share one.
pub(crate) fn current_task_id() -> u64 {
    TASK_ID.with(|slot| {
        let id = slot.get();
        if id != 0 {
            return id;
        }
        let id = NEXT_TASK_ID.fetch_add(1, atomic::Ordering::Relaxed);
        slot.set(id);
        id
    })
}

static CONTEXTS: Lazy<RwLock<HashMap<u64, Arc<Context>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

// The root context is created on first library use and registered under the
// task ID of whichever thread got there first. It is never removed.
static ROOT: Lazy<Arc<Context>> = Lazy::new(|| {
    let id = current_task_id();
    let root = Context::root(id);
    CONTEXTS.write().unwrap().insert(id, Arc::clone(&root));
    debug!("root context installed under task {id}");
    root
});

pub(crate) fn root_context() -> Arc<Context> {
    Arc::clone(&ROOT)
}

pub(crate) fn install(id: u64, ctx: Arc<Context>) {
    CONTEXTS.write().unwrap().insert(id, ctx);
}

pub(crate) fn remove(id: u64) {
    CONTEXTS.write().unwrap().remove(&id);
}

pub(crate) fn lookup(id: u64) -> Option<Arc<Context>> {
    CONTEXTS.read().unwrap().get(&id).cloned()
}

/// The calling thread's context, falling back to the root so that library
/// calls from unmanaged threads behave sensibly.
pub(crate) fn current_context() -> Arc<Context> {
    lookup(current_task_id()).unwrap_or_else(root_context)
}
