//! A per-thread stack of scoped handlers that survives callback scheduling.
//!
//! When a callback is deferred — scheduled on the loop to run later, from a
//! different call stack than the one that scheduled it — any
//! [`StackContext`] or [`ExceptionContext`] active at scheduling time would
//! otherwise be lost by the time the callback actually runs. [`wrap`]
//! captures the active stack at scheduling time and restores a pruned copy
//! of it around the callback's eventual invocation, so an error raised deep
//! inside routes to the handler that was in scope when the work was
//! scheduled, not to whatever happens to be on the loop's own call stack.
//!
//! This is a single-threaded design: the stack lives in a `thread_local!`
//! and its nodes are reference-counted with `Rc`, not `Arc` — the event
//! loop that drives all of this never shares a context stack across
//! threads.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::error::StackInconsistentError;
use crate::{CallbackError, CallbackResult};

/// Produced by entering a [`StackContext`]; called once to release
/// whatever resource the context acquired.
pub type ExitFn = Box<dyn FnOnce(Option<&CallbackError>) -> CallbackResult>;

/// Entering a [`StackContext`] runs this to acquire its resource and
/// obtain the matching [`ExitFn`].
pub type ScopeFactory = Box<dyn Fn() -> ExitFn>;

/// A zero-argument callback, invoked through [`invoke`](Callback::invoke)
/// rather than the bare `FnMut` call operator so that [`wrap`]'s output can
/// carry the extra bit of state (`is_wrapped`) needed to make it
/// idempotent.
///
/// Any `F: FnMut() -> CallbackResult` implements this automatically; callers
/// never need to think about it except when invoking a stored callback.
pub trait Callback {
    fn invoke(&mut self) -> CallbackResult;

    /// Whether this callback is already the product of [`wrap`] — checked
    /// by `wrap` itself so that wrapping an already-wrapped callback is a
    /// no-op instead of nesting the scope re-entry machinery twice.
    fn is_wrapped(&self) -> bool {
        false
    }
}

impl<F> Callback for F
where
    F: FnMut() -> CallbackResult,
{
    fn invoke(&mut self) -> CallbackResult {
        self()
    }
}

/// The callback type every deferred unit of work in this crate is stored
/// as: a handler dispatch, a timer firing, or a queued `add_callback`.
pub type BoxedCallback = Box<dyn Callback>;

struct WrappedCallback(BoxedCallback);

impl Callback for WrappedCallback {
    fn invoke(&mut self) -> CallbackResult {
        self.0.invoke()
    }

    fn is_wrapped(&self) -> bool {
        true
    }
}

enum NodeKind {
    Scope {
        factory: ScopeFactory,
        // A stack, not a single slot: `wrap` may re-enter the same
        // context for nested deferred calls before the outer one exits.
        open: RefCell<Vec<ExitFn>>,
    },
    Exception {
        handler: Box<dyn Fn(&CallbackError) -> bool>,
    },
}

struct Node {
    active: Cell<bool>,
    // Fixed at construction to whatever exception-chain head was active
    // at the time, then only ever spliced (never replaced) by pruning.
    parent: RefCell<Option<Rc<Node>>>,
    kind: NodeKind,
}

enum ExitOutcome {
    Continue,
    Handled,
    Replaced(CallbackError),
}

impl Node {
    fn enter_low(&self) -> CallbackResult {
        match &self.kind {
            NodeKind::Scope { factory, open } => {
                open.borrow_mut().push(factory());
                Ok(())
            }
            NodeKind::Exception { .. } => Ok(()),
        }
    }

    fn exit_low(&self, error: Option<&CallbackError>) -> ExitOutcome {
        match &self.kind {
            NodeKind::Scope { open, .. } => match open.borrow_mut().pop() {
                Some(exit) => match exit(error) {
                    Ok(()) => ExitOutcome::Continue,
                    Err(e) => ExitOutcome::Replaced(e),
                },
                None => ExitOutcome::Continue,
            },
            NodeKind::Exception { handler } => match error {
                Some(e) if handler(e) => ExitOutcome::Handled,
                _ => ExitOutcome::Continue,
            },
        }
    }
}

#[derive(Clone)]
struct Frame {
    scopes: Rc<Vec<Rc<Node>>>,
    head: Option<Rc<Node>>,
}

impl Frame {
    fn empty() -> Frame {
        Frame {
            scopes: Rc::new(Vec::new()),
            head: None,
        }
    }

    fn is_empty(&self) -> bool {
        self.scopes.is_empty() && self.head.is_none()
    }
}

fn same_frame(a: &Frame, b: &Frame) -> bool {
    Rc::ptr_eq(&a.scopes, &b.scopes)
        && match (&a.head, &b.head) {
            (Some(x), Some(y)) => Rc::ptr_eq(x, y),
            (None, None) => true,
            _ => false,
        }
}

thread_local! {
    static STACK: RefCell<Frame> = RefCell::new(Frame::empty());
}

fn current_frame() -> Frame {
    STACK.with(|s| s.borrow().clone())
}

fn set_frame(frame: Frame) {
    STACK.with(|s| *s.borrow_mut() = frame);
}

/// Drop inactive nodes from `frame`'s scope list and splice them out of its
/// exception-chain head, without disturbing still-active nodes' own
/// parent links.
fn prune_inactive(frame: &Frame) -> Frame {
    let scopes: Vec<Rc<Node>> = frame
        .scopes
        .iter()
        .filter(|n| n.active.get())
        .cloned()
        .collect();

    let mut head = frame.head.clone();
    while let Some(n) = head.clone() {
        if n.active.get() {
            break;
        }
        head = n.parent.borrow().clone();
    }

    let mut active_head = head.clone();
    while let Some(ah) = active_head {
        let mut parent = ah.parent.borrow().clone();
        while let Some(p) = parent.clone() {
            if p.active.get() {
                break;
            }
            parent = p.parent.borrow().clone();
            *ah.parent.borrow_mut() = parent.clone();
        }
        active_head = parent;
    }

    Frame {
        scopes: Rc::new(scopes),
        head,
    }
}

/// Walk the exception-chain starting at `top`, offering `error` to each
/// active [`ExceptionContext`] (or business-exit of a [`StackContext`]) in
/// turn until one suppresses it, one replaces it with a new error, or the
/// chain runs out.
fn route(top: Option<Rc<Node>>, error: CallbackError) -> Option<CallbackError> {
    let mut node = top;
    let mut error = error;
    while let Some(n) = node {
        if n.active.get() {
            match n.exit_low(Some(&error)) {
                ExitOutcome::Handled => return None,
                ExitOutcome::Replaced(e) => error = e,
                ExitOutcome::Continue => {}
            }
        }
        node = n.parent.borrow().clone();
    }
    Some(error)
}

/// A handle returned by entering a [`StackContext`] or [`ExceptionContext`]
/// that can deactivate it later — from outside the scope that entered it,
/// possibly long after that scope has exited.
///
/// A deactivated context is pruned out of any future [`wrap`]-captured
/// stack and skipped during exception routing; it stays structurally in
/// place (so sibling parent links remain valid) until the next prune.
#[derive(Clone)]
pub struct Deactivator(Rc<Node>);

impl Deactivator {
    pub fn deactivate(&self) {
        self.0.active.set(false);
    }
}

/// A live entry into a [`StackContext`] or [`ExceptionContext`].
///
/// Must be exited with [`exit`](ActiveScope::exit) to observe cleanup
/// errors and a consistency check; dropping it without exiting runs the
/// same cleanup with no in-flight error and discards the result, which is
/// a safety net, not the intended path.
pub struct ActiveScope {
    node: Rc<Node>,
    old: Frame,
    new: Frame,
    exited: Cell<bool>,
}

impl ActiveScope {
    fn finish(&self, error: Option<&CallbackError>) -> CallbackResult {
        if self.exited.replace(true) {
            return Ok(());
        }

        let result = match self.node.exit_low(error) {
            ExitOutcome::Replaced(e) => Err(e),
            ExitOutcome::Handled | ExitOutcome::Continue => Ok(()),
        };

        let current = current_frame();
        set_frame(self.old.clone());
        if !same_frame(&current, &self.new) {
            return Err(Box::new(StackInconsistentError(
                "a scope was exited out of order".to_string(),
            )));
        }
        result
    }

    /// Exit this scope, passing along an in-flight callback error if one
    /// triggered the exit.
    pub fn exit(self, error: Option<&CallbackError>) -> CallbackResult {
        self.finish(error)
    }
}

impl Drop for ActiveScope {
    fn drop(&mut self) {
        if !self.exited.get() {
            let _ = self.finish(None);
        }
    }
}

/// A scoped handler for asynchronous code.
///
/// Entering a `StackContext` runs a factory to acquire some resource and
/// pushes itself onto the per-thread context stack; any callback scheduled
/// while it's active (and wrapped with [`wrap`]) re-enters it automatically
/// when that callback eventually runs, even on a fully unwound call stack.
#[derive(Clone)]
pub struct StackContext {
    node: Rc<Node>,
}

impl StackContext {
    /// Build a context around `factory`. Entering calls `factory` to
    /// acquire the resource; exiting calls the [`ExitFn`] it returned.
    pub fn new<F>(factory: F) -> StackContext
    where
        F: Fn() -> ExitFn + 'static,
    {
        let parent = current_frame().head;
        StackContext {
            node: Rc::new(Node {
                active: Cell::new(true),
                parent: RefCell::new(parent),
                kind: NodeKind::Scope {
                    factory: Box::new(factory),
                    open: RefCell::new(Vec::new()),
                },
            }),
        }
    }

    /// Enter this context now, pushing it onto the stack any callback
    /// scheduled from here on will see.
    pub fn enter(&self) -> Result<(ActiveScope, Deactivator), CallbackError> {
        let old = current_frame();
        let mut scopes = (*old.scopes).clone();
        scopes.push(self.node.clone());
        let new = Frame {
            scopes: Rc::new(scopes),
            head: Some(self.node.clone()),
        };
        set_frame(new.clone());

        if let Err(e) = self.node.enter_low() {
            set_frame(old);
            return Err(e);
        }

        Ok((
            ActiveScope {
                node: self.node.clone(),
                old,
                new,
                exited: Cell::new(false),
            },
            Deactivator(self.node.clone()),
        ))
    }
}

/// An exception handler scoped to asynchronous code.
///
/// Unlike [`StackContext`], entering an `ExceptionContext` does not push
/// onto the scope list that [`wrap`] re-enters around each callback
/// invocation — it only becomes the new head of the exception chain.
/// Errors that escape a wrapped callback (or escape entering/exiting a
/// `StackContext` along the way) are offered to the nearest active
/// `ExceptionContext` up that chain.
#[derive(Clone)]
pub struct ExceptionContext {
    node: Rc<Node>,
}

impl ExceptionContext {
    /// Build a context whose `handler` is offered every escaping error.
    /// Returning `true` suppresses the error; `false` lets it continue up
    /// the chain.
    pub fn new<F>(handler: F) -> ExceptionContext
    where
        F: Fn(&CallbackError) -> bool + 'static,
    {
        let parent = current_frame().head;
        ExceptionContext {
            node: Rc::new(Node {
                active: Cell::new(true),
                parent: RefCell::new(parent),
                kind: NodeKind::Exception {
                    handler: Box::new(handler),
                },
            }),
        }
    }

    /// Enter this context now.
    pub fn enter(&self) -> (ActiveScope, Deactivator) {
        let old = current_frame();
        let new = Frame {
            scopes: old.scopes.clone(),
            head: Some(self.node.clone()),
        };
        set_frame(new.clone());
        (
            ActiveScope {
                node: self.node.clone(),
                old,
                new,
                exited: Cell::new(false),
            },
            Deactivator(self.node.clone()),
        )
    }
}

/// Temporarily clears the context stack, so code run inside sees no
/// inherited scopes or exception handlers at all.
pub struct NullStackContext;

impl NullStackContext {
    /// Clear the stack now; restore it when the returned guard exits.
    pub fn enter() -> ActiveNullScope {
        let old = current_frame();
        set_frame(Frame::empty());
        ActiveNullScope {
            old,
            exited: Cell::new(false),
        }
    }
}

/// A live [`NullStackContext`] entry.
pub struct ActiveNullScope {
    old: Frame,
    exited: Cell<bool>,
}

impl ActiveNullScope {
    fn finish(&self) {
        if !self.exited.replace(true) {
            set_frame(self.old.clone());
        }
    }

    pub fn exit(self) {
        self.finish();
    }
}

impl Drop for ActiveNullScope {
    fn drop(&mut self) {
        self.finish();
    }
}

/// Capture the currently active context stack and return a closure that
/// re-enters a pruned copy of it around every call to `func`.
///
/// If nothing was active when `wrap` was called, the returned closure
/// still saves and restores whatever stack happens to be live when it's
/// eventually called (so a wrapped callback never leaks context into its
/// caller), but skips the scope re-entry machinery entirely.
pub fn wrap(mut func: BoxedCallback) -> BoxedCallback {
    if func.is_wrapped() {
        return func;
    }

    let captured = current_frame();

    if captured.is_empty() {
        // Deliberately don't capture `captured` itself here: a `Frame`
        // holds an `Rc`, and the returned closure may be boxed into a
        // queue that crosses threads (see `reactor::schedule`). A fresh
        // `Frame::empty()` built by whichever thread actually invokes the
        // closure is behaviorally identical and keeps this path free of
        // any `Rc`.
        return Box::new(WrappedCallback(Box::new(move || {
            let caller_frame = current_frame();
            set_frame(Frame::empty());
            let result = func.invoke();
            set_frame(caller_frame);
            result
        })));
    }

    Box::new(WrappedCallback(Box::new(move || {
        let caller_frame = current_frame();
        let pruned = prune_inactive(&captured);
        set_frame(pruned.clone());

        let mut entered = 0usize;
        let mut failure: Option<(Option<Rc<Node>>, CallbackError)> = None;

        for node in pruned.scopes.iter() {
            match node.enter_low() {
                Ok(()) => entered += 1,
                Err(e) => {
                    failure = Some((node.parent.borrow().clone(), e));
                    break;
                }
            }
        }

        if failure.is_none() {
            if let Err(e) = func.invoke() {
                failure = Some((pruned.head.clone(), e));
            }
        }

        let outcome = if let Some((top, e)) = failure {
            route(top, e)
        } else {
            let mut outcome = None;
            while entered > 0 {
                entered -= 1;
                let node = &pruned.scopes[entered];
                match node.exit_low(None) {
                    ExitOutcome::Continue | ExitOutcome::Handled => {}
                    ExitOutcome::Replaced(e) => {
                        outcome = route(node.parent.borrow().clone(), e);
                        break;
                    }
                }
            }
            outcome
        };

        set_frame(caller_frame);
        match outcome {
            Some(e) => Err(e),
            None => Ok(()),
        }
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell as StdRefCell;
    use std::rc::Rc as StdRc;

    fn boxed_err(msg: &str) -> CallbackError {
        #[derive(Debug)]
        struct E(String);
        impl std::fmt::Display for E {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
        impl std::error::Error for E {}
        Box::new(E(msg.to_string()))
    }

    #[test]
    fn null_wrapper_runs_with_no_context() {
        let ran = StdRc::new(Cell::new(false));
        let ran2 = ran.clone();
        let mut wrapped = wrap(Box::new(move || {
            ran2.set(true);
            Ok(())
        }));
        assert!(wrapped.invoke().is_ok());
        assert!(ran.get());
    }

    #[test]
    fn exception_context_suppresses_errors() {
        let seen: StdRc<StdRefCell<Vec<String>>> = StdRc::new(StdRefCell::new(Vec::new()));
        let seen2 = seen.clone();
        let ctx = ExceptionContext::new(move |e| {
            seen2.borrow_mut().push(e.to_string());
            true
        });
        let (scope, _deactivate) = ctx.enter();

        let mut wrapped = wrap(Box::new(|| Err(boxed_err("boom"))));
        assert!(wrapped.invoke().is_ok());
        scope.exit(None).unwrap();

        assert_eq!(seen.borrow().as_slice(), ["boom"]);
    }

    #[test]
    fn exception_context_propagates_when_not_handled() {
        let ctx = ExceptionContext::new(|_| false);
        let (scope, _deactivate) = ctx.enter();

        let mut wrapped = wrap(Box::new(|| Err(boxed_err("unhandled"))));
        let result = wrapped.invoke();
        assert!(result.is_err());
        scope.exit(None).unwrap();
    }

    #[test]
    fn deactivated_scope_is_pruned_from_capture() {
        let entered = StdRc::new(Cell::new(0));
        let entered2 = entered.clone();
        let ctx = StackContext::new(move || {
            entered2.set(entered2.get() + 1);
            let c = entered2.clone();
            Box::new(move |_: Option<&CallbackError>| {
                c.set(c.get() - 1);
                Ok(())
            }) as ExitFn
        });
        let (scope, deactivate) = ctx.enter().unwrap();
        deactivate.deactivate();

        let mut wrapped = wrap(Box::new(|| Ok(())));
        assert!(wrapped.invoke().is_ok());
        // The factory only ran once, at `enter()`; wrap's capture of an
        // already-deactivated context never re-enters it.
        assert_eq!(entered.get(), 1);

        scope.exit(None).unwrap();
        assert_eq!(entered.get(), 0);
    }
}
