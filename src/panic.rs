//! Panic trapping and the handler chain.
//!
//! Every context points at a handler through a two-level cell: the outer
//! handle identifies the slot, the inner value is the handler itself.
//! Global installs overwrite the value so every context sharing the slot
//! sees the change; local installs rebind the current context to a freshly
//! allocated slot and leave ancestors alone.

use std::any::Any;
use std::backtrace::Backtrace;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use crate::task::Context;

/// A panic payload caught from a task routine, a close handler, or a panic
/// handler.
pub struct Panic(Box<dyn Any + Send + 'static>);

impl Panic {
    pub(crate) fn new(payload: Box<dyn Any + Send>) -> Panic {
        Panic(payload)
    }

    /// The raw payload, for downcasting to caller-defined types.
    pub fn payload(&self) -> &(dyn Any + Send) {
        &*self.0
    }

    /// The panic message, when the payload is a string (which is what
    /// `panic!` produces).
    pub fn message(&self) -> Option<&str> {
        self.0
            .downcast_ref::<&'static str>()
            .copied()
            .or_else(|| self.0.downcast_ref::<String>().map(String::as_str))
    }
}

impl fmt::Display for Panic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => f.write_str(msg),
            None => f.write_str("<non-string panic payload>"),
        }
    }
}

impl fmt::Debug for Panic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Panic({self})")
    }
}

/// A panic handler. Handlers are shared values; the one returned by an
/// installer can be reinstalled later to restore the previous behavior.
pub type PanicHandler = Arc<dyn Fn(&Panic) + Send + Sync + 'static>;

pub(crate) type PanicSlot = Arc<RwLock<PanicHandler>>;

pub(crate) fn new_slot(handler: PanicHandler) -> PanicSlot {
    Arc::new(RwLock::new(handler))
}

fn print_uncaught(panic: &Panic) {
    eprintln!("UNCAUGHT PANIC: {panic}\n{}", Backtrace::force_capture());
}

/// The handler of last resort, also the initial value of the root slot.
pub(crate) fn default_handler() -> PanicHandler {
    Arc::new(print_uncaught)
}

impl Context {
    /// Installs `handler` and returns the previous one. A global install
    /// mutates the value behind the current slot; a local install rebinds
    /// this context to a new slot holding `handler`.
    pub(crate) fn set_panic_handler(&self, handler: PanicHandler, local: bool) -> PanicHandler {
        let mut slots = self.slots();
        let prev = slots.panic.read().unwrap().clone();
        if local {
            slots.panic = new_slot(handler);
        } else {
            *slots.panic.write().unwrap() = handler;
        }
        prev
    }

    /// Routes a caught payload through the handler chain.
    ///
    /// The current slot's handler runs first. If it panics itself, the walk
    /// climbs toward the root, skipping contexts that still share the slot
    /// that just failed, and hands the new payload to the first context
    /// holding a different slot. A separated context bounds the walk so a
    /// detached subtree keeps its own failure policy. When nothing suitable
    /// remains the default handler prints the payload and a backtrace to
    /// stderr.
    pub(crate) fn handle_panic(self: &Arc<Self>, panic: Panic) {
        let slot = self.panic_slot();
        let handler = slot.read().unwrap().clone();
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (*handler)(&panic))) {
            let next = Panic::new(payload);
            let mut cursor = Some(Arc::clone(self));
            loop {
                let up = match &cursor {
                    Some(ctx) if Arc::ptr_eq(&slot, &ctx.panic_slot()) && !ctx.is_separated() => {
                        ctx.parent().cloned()
                    }
                    _ => break,
                };
                cursor = up;
            }
            match cursor {
                Some(ctx) if !Arc::ptr_eq(&slot, &ctx.panic_slot()) => ctx.handle_panic(next),
                _ => print_uncaught(&next),
            }
        }
    }
}
