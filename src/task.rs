//! Per-task context records and the lifecycle engine that drives them.
//!
//! A context is created when a task is spawned and lives until the task's
//! whole subtree has drained. Child contexts share the parent's variable
//! store, panic handler slot, and close-handler list until the task
//! separates or installs local state of its own.

use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe, Location};
use std::sync::atomic::{self, AtomicI64, AtomicU8};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use dashmap::DashMap;
use log::trace;

use crate::emitter::{Done, Emitter, Subscription};
use crate::exec;
use crate::panic::{default_handler, new_slot, Panic, PanicSlot};
use crate::{CloseHandler, Value};

/// Topic on a context's own emitter carrying "all child runs finished".
pub(crate) const RUNS_DONE: &str = "runs.done";
/// Topic prefix for variable change events on the shared emitter.
pub(crate) const SET_PREFIX: &str = "SET:";

// A context starts out CLOSED, is RUNNING while the user routine executes,
// and is ENDED from the routine's return until the subtree drains and the
// state swings back to CLOSED for good.
pub(crate) const STATE_CLOSED: u8 = 0;
pub(crate) const STATE_RUNNING: u8 = 1;
pub(crate) const STATE_ENDED: u8 = 2;

pub(crate) struct CloseEntry {
    handler: CloseHandler,
    site: &'static Location<'static>,
}

/// The shared, swappable part of a context. Children copy these handles at
/// spawn time; `separate` and the local installers replace individual
/// handles without disturbing whoever else holds the old ones.
pub(crate) struct Slots {
    pub(crate) panic: PanicSlot,
    vars: Arc<DashMap<String, Value>>,
    vars_emitter: Arc<Emitter>,
    close_handlers: Arc<Mutex<Vec<CloseEntry>>>,
    // True iff this context allocated the list it currently points at.
    // Only the owner drains it during termination.
    owns_close_handlers: bool,
    separated: bool,
}

pub(crate) struct Context {
    id: u64,
    parent: Option<Arc<Context>>,
    site: Option<&'static Location<'static>>,
    children: Mutex<BTreeMap<u64, Arc<Context>>>,
    state: AtomicU8,
    runs: AtomicI64,
    slots: Mutex<Slots>,
    emitter: Emitter,
}

impl Context {
    /// Builds the root context. It is permanently RUNNING and is the only
    /// context without a parent.
    pub(crate) fn root(id: u64) -> Arc<Context> {
        Arc::new(Context {
            id,
            parent: None,
            site: None,
            children: Mutex::new(BTreeMap::new()),
            state: AtomicU8::new(STATE_RUNNING),
            runs: AtomicI64::new(0),
            slots: Mutex::new(Slots {
                panic: new_slot(default_handler()),
                vars: Arc::new(DashMap::new()),
                vars_emitter: Arc::new(Emitter::new()),
                close_handlers: Arc::new(Mutex::new(Vec::new())),
                owns_close_handlers: true,
                separated: false,
            }),
            emitter: Emitter::new(),
        })
    }

    /// Builds the context for a freshly spawned task. Shared handles are
    /// copied from the parent, except that children of the root always get
    /// a fresh close-handler list so tasks cannot append to the root's.
    fn spawned(
        id: u64,
        parent: &Arc<Context>,
        site: &'static Location<'static>,
    ) -> Arc<Context> {
        let inherited = {
            let slots = parent.slots();
            let (close_handlers, owns) = if parent.parent.is_none() {
                (Arc::new(Mutex::new(Vec::new())), true)
            } else {
                (Arc::clone(&slots.close_handlers), false)
            };
            Slots {
                panic: Arc::clone(&slots.panic),
                vars: Arc::clone(&slots.vars),
                vars_emitter: Arc::clone(&slots.vars_emitter),
                close_handlers,
                owns_close_handlers: owns,
                separated: false,
            }
        };
        Arc::new(Context {
            id,
            parent: Some(Arc::clone(parent)),
            site: Some(site),
            children: Mutex::new(BTreeMap::new()),
            state: AtomicU8::new(STATE_CLOSED),
            runs: AtomicI64::new(0),
            slots: Mutex::new(inherited),
            emitter: Emitter::new(),
        })
    }

    pub(crate) fn parent(&self) -> Option<&Arc<Context>> {
        self.parent.as_ref()
    }

    pub(crate) fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap()
    }

    pub(crate) fn panic_slot(&self) -> PanicSlot {
        Arc::clone(&self.slots().panic)
    }

    pub(crate) fn is_separated(&self) -> bool {
        self.slots().separated
    }

    // ---- variables ----

    pub(crate) fn get_var(&self, name: &str) -> Option<Value> {
        let vars = Arc::clone(&self.slots().vars);
        let value = vars.get(name).map(|entry| Arc::clone(entry.value()));
        value
    }

    /// Stores the value, then publishes `SET:<name>` so subscribers that
    /// read the store back observe the post-write value.
    pub(crate) fn set_var(&self, name: &str, value: Value) -> Done {
        let (vars, emitter) = {
            let slots = self.slots();
            (Arc::clone(&slots.vars), Arc::clone(&slots.vars_emitter))
        };
        vars.insert(name.to_owned(), Arc::clone(&value));
        emitter.publish(&format!("{SET_PREFIX}{name}"), value)
    }

    pub(crate) fn on_set(&self, name: &str) -> Subscription {
        let emitter = Arc::clone(&self.slots().vars_emitter);
        emitter.subscribe(&format!("{SET_PREFIX}{name}"))
    }

    pub(crate) fn off_set(&self, sub: &Subscription) {
        let emitter = Arc::clone(&self.slots().vars_emitter);
        emitter.unsubscribe(sub);
    }

    // ---- close handlers ----

    /// Appends `handler` unless an identical one (same allocation) is
    /// already listed. A local add first detaches a fresh list if the
    /// current one is still shared with an ancestor.
    pub(crate) fn add_close_handler(
        &self,
        handler: &CloseHandler,
        local: bool,
        site: &'static Location<'static>,
    ) {
        let list = {
            let mut slots = self.slots();
            if local && !slots.owns_close_handlers {
                slots.close_handlers = Arc::new(Mutex::new(Vec::new()));
                slots.owns_close_handlers = true;
            }
            Arc::clone(&slots.close_handlers)
        };
        let mut list = list.lock().unwrap();
        if list.iter().any(|e| Arc::ptr_eq(&e.handler, handler)) {
            return;
        }
        list.push(CloseEntry {
            handler: Arc::clone(handler),
            site,
        });
    }

    pub(crate) fn remove_close_handler(&self, handler: &CloseHandler) {
        let list = Arc::clone(&self.slots().close_handlers);
        let mut list = list.lock().unwrap();
        if let Some(pos) = list.iter().position(|e| Arc::ptr_eq(&e.handler, handler)) {
            list.remove(pos);
        }
    }

    // ---- lifecycle ----

    /// Spawns `routine` as a child task of this context. The child counts
    /// toward `runs` until its whole subtree has drained.
    pub(crate) fn run(
        self: &Arc<Self>,
        routine: Box<dyn FnOnce() + Send + 'static>,
        site: &'static Location<'static>,
    ) {
        self.runs.fetch_add(1, atomic::Ordering::SeqCst);
        let parent = Arc::clone(self);
        let name = format!(
            "task@{}:{}",
            crate::trim_source_path(site.file()),
            site.line()
        );
        thread::Builder::new()
            .name(name)
            .spawn(move || {
                let id = exec::current_task_id();
                let ctx = Context::spawned(id, &parent, site);
                exec::install(id, Arc::clone(&ctx));
                parent
                    .children
                    .lock()
                    .unwrap()
                    .insert(id, Arc::clone(&ctx));
                trace!("task {} spawned at {} under {}", id, site, parent.id);

                ctx.state.store(STATE_RUNNING, atomic::Ordering::SeqCst);
                if let Err(payload) = catch_unwind(AssertUnwindSafe(routine)) {
                    ctx.handle_panic(Panic::new(payload));
                }
                ctx.state.store(STATE_ENDED, atomic::Ordering::SeqCst);
                ctx.end();
                exec::remove(id);
            })
            .unwrap_or_else(|err| panic!("failed to spawn task thread at {site}: {err}"));
    }

    /// Drives termination once the routine has returned. Runs again every
    /// time a child's completion might have unblocked this context.
    pub(crate) fn end(self: &Arc<Self>) {
        if self.runs.load(atomic::Ordering::SeqCst) != 0 {
            // A live child will re-enter end() when it closes.
            return;
        }
        if self.close() {
            return;
        }
        if self
            .state
            .compare_exchange(
                STATE_ENDED,
                STATE_CLOSED,
                atomic::Ordering::SeqCst,
                atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        let parent = match &self.parent {
            Some(parent) => parent,
            None => return,
        };
        let runs = parent.runs.fetch_sub(1, atomic::Ordering::SeqCst) - 1;
        parent.children.lock().unwrap().remove(&self.id);
        trace!("task {} closed, parent {} has {} live runs", self.id, parent.id, runs);
        if runs < 0 {
            panic!("BUG: runs counter of task {} went negative", parent.id);
        }
        if runs == 0 {
            if parent.state.load(atomic::Ordering::SeqCst) == STATE_ENDED {
                parent.end();
            } else {
                let _ = parent
                    .emitter
                    .publish(RUNS_DONE, Arc::new(()) as Value)
                    .wait();
            }
        }
    }

    /// Pops the most recently added close handler off the owned list and
    /// spawns it as a child task, which keeps the LIFO order and lets close
    /// handlers spawn children that must drain before the next one fires.
    /// Returns false when there is nothing (left) to drain here.
    fn close(self: &Arc<Self>) -> bool {
        let list = {
            let slots = self.slots();
            if !slots.owns_close_handlers {
                return false;
            }
            Arc::clone(&slots.close_handlers)
        };
        let entry = list.lock().unwrap().pop();
        match entry {
            Some(entry) => {
                trace!("task {} draining close handler added at {}", self.id, entry.site);
                let handler = entry.handler;
                self.run(Box::new(move || handler()), entry.site);
                true
            }
            None => false,
        }
    }

    /// One-shot subscription that resolves when this context's subtree has
    /// drained. Settled immediately if nothing is running; a spurious
    /// delivery while children are still live is tolerated by re-checkers.
    pub(crate) fn wait(&self) -> Subscription {
        let sub = self.emitter.subscribe_once(RUNS_DONE);
        if self.runs.load(atomic::Ordering::SeqCst) == 0 {
            self.emitter.settle(&sub, Arc::new(()) as Value);
        }
        sub
    }

    /// Detaches this context from every shared handle: fresh variable
    /// store, fresh emitter, fresh owned close-handler list, and a new
    /// panic slot seeded with the current handler value. Children spawned
    /// before this call keep the old handles.
    pub(crate) fn separate(&self) {
        let mut slots = self.slots();
        slots.separated = true;
        slots.vars = Arc::new(DashMap::new());
        slots.vars_emitter = Arc::new(Emitter::new());
        let current = slots.panic.read().unwrap().clone();
        slots.panic = new_slot(current);
        slots.close_handlers = Arc::new(Mutex::new(Vec::new()));
        slots.owns_close_handlers = true;
    }

    // ---- diagnostics ----

    /// Appends one line per descendant, depth first, children in ascending
    /// task-ID order. The calling context itself is skipped (it has no
    /// line of its own in the dump).
    pub(crate) fn running_lines(&self, parent_path: &str, include_self: bool, out: &mut Vec<String>) {
        let path = format!("{parent_path}.{}", self.id);
        if include_self {
            let marker = if self.state.load(atomic::Ordering::SeqCst) == STATE_RUNNING {
                "▸"
            } else {
                " "
            };
            let (file, line) = match self.site {
                Some(site) => (crate::trim_source_path(site.file()), site.line()),
                None => ("<root>", 0),
            };
            out.push(format!("{marker} {path}  {file}:{line}"));
        }
        let children: Vec<Arc<Context>> =
            self.children.lock().unwrap().values().map(Arc::clone).collect();
        for child in children {
            child.running_lines(&path, true, out);
        }
    }
}
