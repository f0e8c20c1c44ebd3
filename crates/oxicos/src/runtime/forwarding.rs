// Unrecognized Messages and Forwarding
//
// When no method applies to a call, the runtime looks for an
// unrecognized-message hook: first along the class precedence list of the
// first argument, then the global hook. A hook is an ordinary method body;
// a proxy's hook typically forwards the call to the object it wraps with
// `Call::forward`.
//
// Forwarding re-dispatches the same generic and arguments with the first
// argument replaced. Loops are caught two ways: forwarding an object to
// itself is rejected immediately, and a thread-local depth counter bounds
// chains of proxies at `Config::max_forward_depth`.

use crate::error::Error;
use crate::runtime::exception::{Location, Throws, raise};
use crate::runtime::generic::MethodBody;
use crate::runtime::registry::Runtime;
use crate::runtime::{Call, Object, Value};
use oxicos_log::trace;
use std::cell::Cell;

// ============================================================================
// Forwarding Depth Tracking (Loop Detection)
// ============================================================================

thread_local! {
    static FORWARD_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Current forwarding nesting on this thread.
#[must_use]
pub fn forward_depth() -> u32 {
    FORWARD_DEPTH.with(Cell::get)
}

/// Holds one level of forwarding depth; released on drop, including when the
/// forwarded call returns an exception.
struct DepthGuard;

impl DepthGuard {
    fn enter(limit: u32) -> Result<DepthGuard, u32> {
        FORWARD_DEPTH.with(|depth| {
            let current = depth.get();
            if current >= limit {
                Err(current)
            } else {
                depth.set(current + 1);
                Ok(DepthGuard)
            }
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        FORWARD_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

// ============================================================================
// Hook Resolution
// ============================================================================

impl Runtime {
    fn unrecognized_hook(&self, call: &Call<'_>) -> Option<&MethodBody> {
        self.class_info(call.arg(0).class_id())
            .cpl
            .iter()
            .find_map(|&class| self.class_info(class).unrecognized.as_ref())
            .or(self.global_unrecognized.as_ref())
    }

    /// Runs the unrecognized-message hook for `call`, or raises
    /// `ExBadMessage` when there is none.
    pub(crate) fn unrecognized(&'static self, call: &Call<'_>) -> Throws<Value> {
        match self.unrecognized_hook(call) {
            Some(hook) => {
                trace!(
                    "{}({}) unrecognized, running hook",
                    call.generic().name(),
                    call.class_names().join(", ")
                );
                hook(call)
            }
            None => Err(raise(
                self,
                Error::NoApplicableMethod {
                    generic: call.generic().name().to_string(),
                    classes: call.class_names(),
                },
                call.location,
            )),
        }
    }
}

// ============================================================================
// Forwarding
// ============================================================================

impl Call<'_> {
    /// Re-dispatches this call with the first argument replaced by `target`.
    ///
    /// The forwarded dispatch reports the original `send` location.
    ///
    /// # Errors
    ///
    /// Raises `ExBadMessage` (forwarding loop) if `target` is the current
    /// receiver or the thread's forwarding depth limit is reached; otherwise
    /// whatever the forwarded dispatch raises.
    #[track_caller]
    pub fn forward(&self, target: &Object) -> Throws<Value> {
        let location = Location::caller();
        let loop_error = |depth| Error::ForwardingLoop {
            generic: self.generic().name().to_string(),
            depth,
        };

        if target == self.arg(0) {
            return Err(raise(self.runtime, loop_error(forward_depth()), location));
        }

        let _guard = match DepthGuard::enter(self.runtime.config.max_forward_depth) {
            Ok(guard) => guard,
            Err(depth) => return Err(raise(self.runtime, loop_error(depth), location)),
        };

        let mut args: Vec<&Object> = self.args.to_vec();
        args[0] = target;
        trace!(
            "forwarding {} from {} to {}",
            self.generic().name(),
            self.arg(0).class_name(),
            target.class_name()
        );
        self.runtime.dispatch(self.generic, &args, self.extra, self.location)
    }
}
