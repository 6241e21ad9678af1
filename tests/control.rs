use std::{
    cell::RefCell,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use lisprt::prelude::*;

fn vm_with(frame_limit: usize, invocation_limit: usize) -> Arc<VirtualMachine> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut options = VMOptions::default();
    options.set_frame_limit(frame_limit);
    options.invocation_limit = invocation_limit;
    VirtualMachine::new(options).unwrap()
}

fn vm() -> Arc<VirtualMachine> {
    vm_with(1024, 1024)
}

fn fatal_kind(payload: &(dyn std::any::Any + Send)) -> FatalKind {
    FatalError::from_panic(payload)
        .expect("panic was not a fatal error")
        .kind
}

#[test]
fn exit_runs_cleanups_innermost_first() {
    let vm = vm();
    let thread = vm.attach_current_thread().unwrap();
    let tag = thread.intern("done");
    let log = RefCell::new(Vec::new());

    let result = thread.toplevel(|t| {
        t.push_frame(tag, |t| {
            t.unwind_protect(
                |t| {
                    t.unwind_protect(
                        |t| Err(t.exit_to(tag, Value::fixnum(42))),
                        |_| {
                            log.borrow_mut().push("inner");
                            Ok(Value::NIL)
                        },
                    )
                },
                |_| {
                    log.borrow_mut().push("outer");
                    Ok(Value::NIL)
                },
            )
        })
    });

    assert_eq!(result.unwrap(), Value::fixnum(42));
    assert_eq!(*log.borrow(), vec!["inner", "outer"]);
    assert_eq!(thread.frame_depth(), 0);
}

#[test]
fn cleanup_runs_once_on_normal_exit() {
    let vm = vm();
    let thread = vm.attach_current_thread().unwrap();
    let runs = RefCell::new(0);

    let result = thread.toplevel(|t| {
        t.unwind_protect(
            |t| {
                t.set_values(&[Value::fixnum(1), Value::fixnum(2)]);
                Ok(Value::fixnum(1))
            },
            |t| {
                *runs.borrow_mut() += 1;
                t.set_values(&[]);
                Ok(Value::T)
            },
        )
    });

    assert_eq!(result.unwrap(), Value::fixnum(1));
    assert_eq!(*runs.borrow(), 1);
    // The cleanup's values do not leak out of the protected form.
    assert_eq!(thread.values(), vec![Value::fixnum(1), Value::fixnum(2)]);
}

#[test]
fn exits_deliver_multiple_values() {
    let vm = vm();
    let thread = vm.attach_current_thread().unwrap();

    let first = thread
        .toplevel(|t| {
            t.block(|t, tag| {
                Err(t.exit_with_values(tag, &[Value::fixnum(1), Value::T, Value::NIL]))
            })
        })
        .unwrap();
    assert_eq!(first, Value::fixnum(1));
    assert_eq!(thread.values(), vec![Value::fixnum(1), Value::T, Value::NIL]);

    let none = thread
        .toplevel(|t| t.block(|t, tag| Err(t.exit_with_values(tag, &[]))))
        .unwrap();
    assert_eq!(none, Value::NIL);
    assert!(thread.values().is_empty());
}

#[test]
fn innermost_frame_with_a_tag_wins() {
    let vm = vm();
    let thread = vm.attach_current_thread().unwrap();
    let tag = Value::fixnum(7);

    let result = thread.toplevel(|t| {
        t.push_frame(tag, |t| {
            let inner = t.push_frame(tag, |t| Err(t.exit_to(tag, Value::fixnum(1))))?;
            assert_eq!(inner, Value::fixnum(1));
            Ok(Value::fixnum(2))
        })
    });
    assert_eq!(result.unwrap(), Value::fixnum(2));
}

#[test]
fn cleanup_exit_supersedes_the_one_in_progress() {
    let vm = vm();
    let thread = vm.attach_current_thread().unwrap();
    let outer = thread.intern("outer");
    let inner = thread.intern("inner");

    let result = thread.toplevel(|t| {
        t.push_frame(outer, |t| {
            t.push_frame(inner, |t| {
                t.unwind_protect(
                    |t| Err(t.exit_to(inner, Value::fixnum(1))),
                    |t| Err(t.exit_to(outer, Value::fixnum(2))),
                )
            })?;
            panic!("inner frame should have been skipped");
        })
    });
    assert_eq!(result.unwrap(), Value::fixnum(2));
    assert_eq!(thread.frame_depth(), 0);
}

#[test]
fn exit_without_frame_is_fatal() {
    let vm = vm();
    let thread = vm.attach_current_thread().unwrap();
    let tag = thread.intern("nowhere");

    let payload = catch_unwind(AssertUnwindSafe(|| {
        thread.toplevel(|t| t.unwind_protect(|t| Err(t.exit_to(tag, Value::T)), |_| Ok(Value::NIL)))
    }))
    .unwrap_err();
    assert_eq!(fatal_kind(&*payload), FatalKind::ControlIntegrity);

    // The frame stack was restored while unwinding.
    assert_eq!(thread.frame_depth(), 0);
    let value = thread.toplevel(|t| t.block(|_, _| Ok(Value::T))).unwrap();
    assert_eq!(value, Value::T);
}

#[test]
fn swallowing_an_exit_is_fatal() {
    let vm = vm();
    let thread = vm.attach_current_thread().unwrap();
    let outer = thread.intern("outer");
    let inner = thread.intern("inner");

    let payload = catch_unwind(AssertUnwindSafe(|| {
        thread.toplevel(|t| {
            t.push_frame(outer, |t| {
                t.push_frame(inner, |t| {
                    let _lost = t.exit_to(outer, Value::NIL);
                    Ok(Value::NIL)
                })
            })
        })
    }))
    .unwrap_err();
    assert_eq!(fatal_kind(&*payload), FatalKind::ControlIntegrity);
    assert_eq!(thread.frame_depth(), 0);

    // No stale exit is left behind.
    let value = thread.toplevel(|t| t.push_frame(outer, |_| Ok(Value::T)));
    assert_eq!(value.unwrap(), Value::T);
}

#[test]
fn bindings_are_restored_on_every_way_out() {
    let vm = vm();
    let thread = vm.attach_current_thread().unwrap();
    let symbol = thread.intern("*depth*");
    let tag = thread.intern("out");

    assert!(!thread.boundp(symbol));
    thread.set_symbol_value(symbol, Value::fixnum(1));
    assert!(thread.boundp(symbol));

    thread
        .toplevel(|t| {
            t.bind(symbol, Value::fixnum(2), |t| {
                assert_eq!(t.symbol_value(symbol), Value::fixnum(2));
                t.bind(symbol, Value::fixnum(3), |t| {
                    assert_eq!(t.symbol_value(symbol), Value::fixnum(3));
                    Ok(Value::NIL)
                })?;
                assert_eq!(t.symbol_value(symbol), Value::fixnum(2));
                t.set_symbol_value(symbol, Value::fixnum(20));
                Ok(Value::NIL)
            })
        })
        .unwrap();
    assert_eq!(thread.symbol_value(symbol), Value::fixnum(1));

    thread
        .toplevel(|t| {
            t.push_frame(tag, |t| {
                t.bind(symbol, Value::fixnum(4), |t| Err(t.exit_to(tag, Value::NIL)))
            })
        })
        .unwrap();
    assert_eq!(thread.symbol_value(symbol), Value::fixnum(1));

    let error = thread.toplevel(|t| {
        t.bind(symbol, Value::fixnum(5), |_| {
            Err(Unwind::Error(Error::Signal("boom".to_string())))
        })
    });
    assert!(matches!(error, Err(Error::Signal(_))));
    assert_eq!(thread.symbol_value(symbol), Value::fixnum(1));
}

#[test]
fn bindings_are_per_thread() {
    let vm = vm();
    let thread = vm.attach_current_thread().unwrap();
    let symbol = thread.intern("*mode*");
    thread.set_symbol_value(symbol, Value::fixnum(0));

    thread
        .toplevel(|t| {
            t.bind(symbol, Value::fixnum(1), |t| {
                let handle = spawn_thread(t.vm(), move |other| other.symbol_value(symbol)).unwrap();
                let seen = handle.join().unwrap();
                assert_eq!(seen, Value::fixnum(0));
                Ok(Value::NIL)
            })
        })
        .unwrap();
}

#[test]
fn exits_cannot_cross_threads() {
    let vm = vm();
    let thread = vm.attach_current_thread().unwrap();
    let tag = thread.intern("mine");

    let joined = thread
        .toplevel(|t| {
            t.push_frame(tag, |t| {
                let handle = spawn_thread(t.vm(), move |other| {
                    other.toplevel(|o| Err(o.exit_to(tag, Value::T)))
                })
                .unwrap();
                let joined = handle.join();
                let payload = joined.unwrap_err();
                assert_eq!(fatal_kind(&*payload), FatalKind::ControlIntegrity);
                Ok(Value::fixnum(1))
            })
        })
        .unwrap();
    assert_eq!(joined, Value::fixnum(1));
}

#[test]
fn foreign_threads_cannot_reach_a_control_stack() {
    let vm = vm();
    let thread = vm.attach_current_thread().unwrap();
    let tag = thread.intern("owned");
    let shared = thread.thread().clone();

    let result = thread.toplevel(|t| {
        t.push_frame(tag, |_| {
            let kinds = std::thread::scope(|scope| {
                scope
                    .spawn(|| {
                        let exit = catch_unwind(AssertUnwindSafe(|| {
                            let _exit = shared.exit_to(tag, Value::fixnum(42));
                        }))
                        .unwrap_err();
                        let values = catch_unwind(AssertUnwindSafe(|| {
                            shared.set_values(&[Value::T]);
                        }))
                        .unwrap_err();
                        (fatal_kind(&*exit), fatal_kind(&*values))
                    })
                    .join()
                    .unwrap()
            });
            assert_eq!(kinds, (FatalKind::ControlIntegrity, FatalKind::ControlIntegrity));
            Ok(Value::fixnum(1))
        })
    });

    // The owner's frame was neither targeted nor disturbed.
    assert_eq!(result.unwrap(), Value::fixnum(1));
    assert_eq!(thread.frame_depth(), 0);
    assert!(thread.is_owner());
}

#[test]
fn frame_overflow_is_recoverable() {
    let vm = vm_with(8, 1024);
    let thread = vm.attach_current_thread().unwrap();

    fn nest(thread: &Thread, n: isize) -> Result<Value, Unwind> {
        thread.push_frame(Value::fixnum(n), |t| nest(t, n + 1))
    }

    let result = thread.toplevel(|t| nest(t, 0));
    assert!(matches!(result, Err(Error::FrameStackOverflow { limit: 8 })));
    assert_eq!(thread.frame_depth(), 0);

    let value = thread.toplevel(|t| t.push_frame(Value::T, |_| Ok(Value::T)));
    assert_eq!(value.unwrap(), Value::T);
}

fn backtrace_entry(thread: &Thread, _: Value, _: &[Value]) -> Result<Value, Unwind> {
    let backtrace = thread.backtrace();
    thread.set_values(&backtrace);
    Ok(Value::fixnum(backtrace.len() as isize))
}

fn calls_env(thread: &Thread, closure: Value, args: &[Value]) -> Result<Value, Unwind> {
    let callee = object::field_get(closure, object::Field::ClosureEnv);
    thread.funcall(callee, args)
}

fn recurse(thread: &Thread, closure: Value, args: &[Value]) -> Result<Value, Unwind> {
    thread.funcall(closure, args)
}

#[test]
fn funcall_tracks_invocations() {
    let vm = vm();
    let thread = vm.attach_current_thread().unwrap();

    let inner = thread.make_closure(backtrace_entry, Value::NIL, thread.intern("inner"));
    let outer = thread.make_closure(calls_env, inner, thread.intern("outer"));

    let depth = thread.toplevel(|t| t.funcall(outer, &[])).unwrap();
    assert_eq!(depth, Value::fixnum(2));
    assert_eq!(thread.values(), vec![inner, outer]);
    assert!(thread.backtrace().is_empty());
}

#[test]
fn runaway_recursion_overflows_invocations() {
    let vm = vm_with(1024, 16);
    let thread = vm.attach_current_thread().unwrap();
    let closure = thread.make_closure(recurse, Value::NIL, Value::NIL);

    let result = thread.toplevel(|t| t.funcall(closure, &[Value::T]));
    assert!(matches!(result, Err(Error::InvocationOverflow { limit: 16 })));
    assert!(thread.backtrace().is_empty());
}

#[test]
fn pending_exit_values_survive_collection() {
    let vm = vm();
    let thread = vm.attach_current_thread().unwrap();
    let tag = thread.intern("gc");

    let result = thread.toplevel(|t| {
        t.push_frame(tag, |t| {
            t.unwind_protect(
                |t| {
                    let payload = t.make_string("carried");
                    Err(t.exit_to(tag, payload))
                },
                |t| {
                    t.vm().collect();
                    Ok(Value::NIL)
                },
            )
        })
    });
    let value = result.unwrap();
    assert!(vm.is_live_object(value));
    assert_eq!(object::string_to_string(value), "carried");
}
