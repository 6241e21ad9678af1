//! Non-local control transfer over an explicit per-thread frame stack.
//!
//! A non-local exit is an ordinary `Err(Unwind::Exit(..))` travelling up the
//! Rust call stack. Every frame that establishes a scope (`push_frame`,
//! `unwind_protect`, `bind`) inspects the result of its body on the way out:
//! catch frames stop the exit aimed at them, protect frames run their cleanup
//! and binding frames restore the previous binding. The values carried by
//! the exit wait in the thread's control stack, where the collector sees
//! them, until the target frame picks them up.

use std::marker::PhantomData;

use crate::{
    gc::mark::Marker,
    runtime::{
        error::{contract_violation, fatal, Error, FatalKind, Result},
        object::{self, word, Field},
        value::{Kind, Value},
    },
};

use super::thread::Thread;

/// Native entry point of a closure: receives the running thread, the
/// closure itself and the arguments.
pub type ClosureEntry = fn(&Thread, Value, &[Value]) -> Result<Value, Unwind>;

/// A pending transfer to the catch frame it was created for. Only the
/// thread that owns that frame can consume it.
#[derive(Debug)]
pub struct Exit {
    target: u64,
    marker: PhantomData<*const ()>,
}

impl Exit {
    /// Serial number of the frame this exit is aimed at.
    pub fn target(&self) -> u64 {
        self.target
    }
}

/// Why a body did not return normally.
#[must_use]
#[derive(Debug)]
pub enum Unwind {
    Exit(Exit),
    Error(Error),
}

impl From<Error> for Unwind {
    fn from(error: Error) -> Self {
        Unwind::Error(error)
    }
}

#[derive(Debug, Clone, Copy)]
enum FrameKind {
    Catch { tag: Value },
    Protect,
    Binding {
        symbol: Value,
        index: usize,
        previous: Value,
    },
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    serial: u64,
    kind: FrameKind,
}

#[derive(Debug)]
struct PendingExit {
    target: u64,
    values: Vec<Value>,
}

/// State set aside while a cleanup runs.
#[derive(Debug)]
struct Suspended {
    exit: Option<PendingExit>,
    values: Vec<Value>,
}

pub struct ControlStack {
    frames: Vec<Frame>,
    next_serial: u64,
    pending: Option<PendingExit>,
    suspended: Vec<Suspended>,
    /// Thread-local symbol values, indexed by binding index. `EMPTY` means
    /// the symbol's global value is visible.
    bindings: Vec<Value>,
    values: Vec<Value>,
    history: Vec<Value>,
    frame_limit: usize,
    invocation_limit: usize,
}

impl ControlStack {
    pub(crate) fn new(frame_limit: usize, invocation_limit: usize) -> Self {
        Self {
            frames: Vec::with_capacity(64),
            next_serial: 1,
            pending: None,
            suspended: vec![],
            bindings: vec![],
            values: vec![],
            history: vec![],
            frame_limit,
            invocation_limit,
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    fn push(&mut self, kind: FrameKind) -> Result<u64> {
        if self.frames.len() >= self.frame_limit {
            return Err(Error::FrameStackOverflow {
                limit: self.frame_limit,
            });
        }
        let serial = self.next_serial;
        self.next_serial += 1;
        self.frames.push(Frame { serial, kind });
        Ok(serial)
    }

    fn pop(&mut self, serial: u64) {
        match self.frames.last() {
            Some(frame) if frame.serial == serial => {}
            Some(frame) => fatal(
                FatalKind::ControlIntegrity,
                format!(
                    "frame #{} popped while #{} is on top of the stack",
                    serial, frame.serial
                ),
            ),
            None => fatal(
                FatalKind::ControlIntegrity,
                format!("frame #{} popped from an empty stack", serial),
            ),
        }
        if let Some(Frame {
            kind: FrameKind::Binding {
                index, previous, ..
            },
            ..
        }) = self.frames.pop()
        {
            self.bindings[index] = previous;
        }
    }

    /// Drops every frame above `depth`, undoing their bindings.
    fn truncate(&mut self, depth: usize, history: usize) {
        while self.frames.len() > depth {
            if let Some(Frame {
                kind: FrameKind::Binding {
                    index, previous, ..
                },
                ..
            }) = self.frames.pop()
            {
                self.bindings[index] = previous;
            }
        }
        self.history.truncate(history);
    }

    fn find_catch(&self, tag: Value) -> Option<u64> {
        self.frames.iter().rev().find_map(|frame| match frame.kind {
            FrameKind::Catch { tag: t } if t == tag => Some(frame.serial),
            _ => None,
        })
    }

    fn binding_slot(&mut self, index: usize) -> &mut Value {
        if index >= self.bindings.len() {
            self.bindings.resize(index + 1, Value::EMPTY);
        }
        &mut self.bindings[index]
    }

    /// Marks everything the frame stack keeps alive.
    pub(crate) fn trace(&self, marker: &mut Marker) {
        for frame in self.frames.iter() {
            match frame.kind {
                FrameKind::Catch { tag } => marker.mark_value(tag),
                FrameKind::Protect => {}
                FrameKind::Binding {
                    symbol, previous, ..
                } => {
                    marker.mark_value(symbol);
                    marker.mark_value(previous);
                }
            }
        }
        if let Some(exit) = &self.pending {
            exit.values.iter().for_each(|v| marker.mark_value(*v));
        }
        for suspended in self.suspended.iter() {
            if let Some(exit) = &suspended.exit {
                exit.values.iter().for_each(|v| marker.mark_value(*v));
            }
            suspended.values.iter().for_each(|v| marker.mark_value(*v));
        }
        self.bindings.iter().for_each(|v| marker.mark_value(*v));
        self.values.iter().for_each(|v| marker.mark_value(*v));
        self.history.iter().for_each(|v| marker.mark_value(*v));
    }
}

/// Restores the frame stack when a fatal error unwinds through a scope.
struct PanicGuard<'a> {
    thread: &'a Thread,
    depth: usize,
    history: usize,
    suspended: usize,
}

impl<'a> PanicGuard<'a> {
    fn new(thread: &'a Thread, depth: usize) -> Self {
        let control = thread.control();
        Self {
            thread,
            depth,
            history: control.history.len(),
            suspended: control.suspended.len(),
        }
    }
}

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let control = self.thread.control();
            control.truncate(self.depth, self.history);
            control.suspended.truncate(self.suspended);
            control.pending = None;
        }
    }
}

impl Thread {
    /// Establishes a catch frame identified by `tag` around `body`.
    ///
    /// Returns the body's value, or the first value carried by an exit to
    /// this frame (`nil` if it carried none). Either way the values register
    /// holds all of them afterwards.
    pub fn push_frame(
        &self,
        tag: Value,
        body: impl FnOnce(&Thread) -> Result<Value, Unwind>,
    ) -> Result<Value, Unwind> {
        let depth = self.control().depth();
        let serial = self.control().push(FrameKind::Catch { tag })?;
        let guard = PanicGuard::new(self, depth);
        let result = body(self);
        std::mem::forget(guard);

        let control = self.control();
        control.pop(serial);
        match result {
            Ok(value) => {
                if let Some(exit) = &control.pending {
                    fatal(
                        FatalKind::ControlIntegrity,
                        format!("frame #{} returned normally while an exit to #{} was pending", serial, exit.target),
                    );
                }
                control.values.clear();
                control.values.push(value);
                Ok(value)
            }
            Err(Unwind::Exit(exit)) if exit.target == serial => {
                let values = match control.pending.take() {
                    Some(pending) if pending.target == serial => pending.values,
                    _ => fatal(
                        FatalKind::ControlIntegrity,
                        format!("exit to frame #{} lost its values", serial),
                    ),
                };
                let first = values.first().copied().unwrap_or(Value::NIL);
                control.values = values;
                Ok(first)
            }
            Err(Unwind::Error(error)) => {
                if let Some(exit) = &control.pending {
                    fatal(
                        FatalKind::ControlIntegrity,
                        format!("error raised while an exit to #{} was pending: {}", exit.target, error),
                    );
                }
                Err(Unwind::Error(error))
            }
            Err(exit) => Err(exit),
        }
    }

    /// Number of frames currently established on this thread.
    pub fn frame_depth(&self) -> usize {
        self.control().depth()
    }

    /// Starts a transfer to the innermost catch frame identified by `tag`.
    /// The caller returns the result as `Err` from its body.
    ///
    /// There being no such frame on this thread is fatal.
    pub fn exit_to(&self, tag: Value, value: Value) -> Unwind {
        self.exit_with_values(tag, &[value])
    }

    pub fn exit_with_values(&self, tag: Value, values: &[Value]) -> Unwind {
        let control = self.control();
        let target = match control.find_catch(tag) {
            Some(serial) => serial,
            None => fatal(
                FatalKind::ControlIntegrity,
                format!("no catch frame for tag {:?} on thread {}", tag, self.id()),
            ),
        };
        if let Some(exit) = &control.pending {
            fatal(
                FatalKind::ControlIntegrity,
                format!("exit to #{} started while an exit to #{} was pending", target, exit.target),
            );
        }
        log::trace!(target: "control", "thread {}: exit to frame #{}", self.id(), target);
        control.pending = Some(PendingExit {
            target,
            values: values.to_vec(),
        });
        Unwind::Exit(Exit {
            target,
            marker: PhantomData,
        })
    }

    /// Runs `body`, then `cleanup` on every way out of it. An exit or error
    /// raised by the cleanup replaces the one in progress.
    pub fn unwind_protect(
        &self,
        body: impl FnOnce(&Thread) -> Result<Value, Unwind>,
        cleanup: impl FnOnce(&Thread) -> Result<Value, Unwind>,
    ) -> Result<Value, Unwind> {
        let depth = self.control().depth();
        let serial = self.control().push(FrameKind::Protect)?;
        let guard = PanicGuard::new(self, depth);
        let result = body(self);
        std::mem::forget(guard);

        {
            let control = self.control();
            control.pop(serial);
            let suspended = Suspended {
                exit: control.pending.take(),
                values: std::mem::take(&mut control.values),
            };
            control.suspended.push(suspended);
        }

        let suspended_depth = self.control().suspended.len();
        let cleanup_result = cleanup(self);

        let control = self.control();
        if control.suspended.len() != suspended_depth {
            fatal(
                FatalKind::ControlIntegrity,
                "suspended exits out of order after a cleanup",
            );
        }
        let saved = control.suspended.pop();
        match cleanup_result {
            Ok(_) => {
                if let Some(saved) = saved {
                    control.pending = saved.exit;
                    control.values = saved.values;
                }
                result
            }
            Err(unwind) => {
                if let Some(Suspended { exit: Some(exit), .. }) = saved {
                    log::trace!(target: "control", "cleanup superseded exit to #{}", exit.target);
                }
                Err(unwind)
            }
        }
    }

    /// Runs `body` with `symbol` bound to `value` on this thread.
    pub fn bind(
        &self,
        symbol: Value,
        value: Value,
        body: impl FnOnce(&Thread) -> Result<Value, Unwind>,
    ) -> Result<Value, Unwind> {
        if !symbol.is_symbol() {
            contract_violation(|| format!("binding a non-symbol {:?}", symbol));
            return body(self);
        }
        let index = object::symbol_binding_index(symbol);
        let depth = self.control().depth();
        let serial = {
            let control = self.control();
            let previous = *control.binding_slot(index);
            let serial = control.push(FrameKind::Binding {
                symbol,
                index,
                previous,
            })?;
            control.bindings[index] = value;
            serial
        };
        let guard = PanicGuard::new(self, depth);
        let result = body(self);
        std::mem::forget(guard);

        self.control().pop(serial);
        result
    }

    /// Catch frame with a fresh tag, handed to `body`.
    pub fn block(
        &self,
        body: impl FnOnce(&Thread, Value) -> Result<Value, Unwind>,
    ) -> Result<Value, Unwind> {
        let tag = self.cons(Value::NIL, Value::NIL);
        self.push_frame(tag, |thread| body(thread, tag))
    }

    /// Current value of `symbol`: the innermost binding on this thread, or
    /// its global value. `UNBOUND` if it has neither.
    pub fn symbol_value(&self, symbol: Value) -> Value {
        let index = object::symbol_binding_index(symbol);
        match self.control().bindings.get(index) {
            Some(value) if !value.is_empty() => *value,
            _ => object::field_get(symbol, Field::SymbolValue),
        }
    }

    pub fn set_symbol_value(&self, symbol: Value, value: Value) {
        let index = object::symbol_binding_index(symbol);
        match self.control().bindings.get_mut(index) {
            Some(slot) if !slot.is_empty() => *slot = value,
            _ => object::field_set(symbol, Field::SymbolValue, value),
        }
    }

    pub fn boundp(&self, symbol: Value) -> bool {
        self.symbol_value(symbol) != Value::UNBOUND
    }

    /// The values register: what the last completed frame produced.
    pub fn values(&self) -> Vec<Value> {
        self.control().values.clone()
    }

    pub fn set_values(&self, values: &[Value]) {
        let control = self.control();
        control.values.clear();
        control.values.extend_from_slice(values);
    }

    /// Calls a closure, recording it in the invocation history while it runs.
    pub fn funcall(&self, closure: Value, args: &[Value]) -> Result<Value, Unwind> {
        if !closure.is_closure() {
            contract_violation(|| format!("funcall of non-closure {:?}", closure));
            return Ok(Value::NIL);
        }
        let entry = object::raw_word(closure, Kind::Closure, word::CLOSURE_ENTRY);
        if entry == 0 {
            contract_violation(|| format!("closure {:?} has no entry point", closure));
            return Ok(Value::NIL);
        }
        let entry: ClosureEntry = unsafe { std::mem::transmute::<usize, ClosureEntry>(entry) };

        let history = {
            let control = self.control();
            if control.history.len() >= control.invocation_limit {
                return Err(Unwind::Error(Error::InvocationOverflow {
                    limit: control.invocation_limit,
                }));
            }
            control.history.push(closure);
            control.history.len()
        };

        let result = entry(self, closure, args);

        let control = self.control();
        if control.history.len() != history {
            fatal(
                FatalKind::ControlIntegrity,
                "invocation history changed across a call",
            );
        }
        control.history.pop();
        result
    }

    /// Closures currently being invoked, innermost first.
    pub fn backtrace(&self) -> Vec<Value> {
        self.control().history.iter().rev().copied().collect()
    }

    /// Runs `body` as the outermost scope of a computation. An exit cannot
    /// escape it; errors come back as `Err`.
    pub fn toplevel(&self, body: impl FnOnce(&Thread) -> Result<Value, Unwind>) -> Result<Value> {
        match body(self) {
            Ok(value) => Ok(value),
            Err(Unwind::Error(error)) => Err(error),
            Err(Unwind::Exit(exit)) => fatal(
                FatalKind::ControlIntegrity,
                format!("exit to frame #{} escaped to the top level", exit.target),
            ),
        }
    }
}
