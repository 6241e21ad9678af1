use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use lisprt::{
    prelude::*,
    sync::{thread::spawn_with, Condvar, JoinHandle, Monitor, Mutex, Parking, Platform, ThreadSystem},
};

fn contended_counter<P: ThreadSystem>() {
    let counter = Arc::new(Mutex::<usize, P>::new(0).unwrap());
    let handles = (0..4)
        .map(|_| {
            let counter = counter.clone();
            spawn_with::<P, _, _>(None, move || {
                for _ in 0..1000 {
                    *counter.lock(false) += 1;
                }
            })
            .unwrap()
        })
        .collect::<Vec<JoinHandle<(), P>>>();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(*counter.lock(false), 4000);
}

fn condvar_handoff<P: ThreadSystem>() {
    let state = Arc::new((Mutex::<Option<u32>, P>::new(None).unwrap(), Condvar::<P>::new().unwrap()));
    let producer = {
        let state = state.clone();
        spawn_with::<P, _, _>(None, move || {
            let (mutex, cv) = &*state;
            *mutex.lock(false) = Some(7);
            cv.notify_all();
        })
        .unwrap()
    };

    let (mutex, cv) = &*state;
    let mut guard = mutex.lock(false);
    cv.wait_while(&mut guard, |value| value.is_none());
    assert_eq!(*guard, Some(7));
    drop(guard);
    producer.join().unwrap();
}

fn monitor_wait_while<P: ThreadSystem>() {
    let monitor = Arc::new(Monitor::<Vec<u32>, P>::new(Vec::new()).unwrap());
    let handles = (0..3)
        .map(|i| {
            let monitor = monitor.clone();
            spawn_with::<P, _, _>(None, move || {
                // The locker notifies every waiter when it is dropped.
                monitor.lock(false).push(i);
            })
            .unwrap()
        })
        .collect::<Vec<JoinHandle<(), P>>>();

    {
        let mut locker = monitor.lock(false);
        locker.wait_while(|items| items.len() < 3);
        let mut items: Vec<u32> = (**locker).clone();
        items.sort_unstable();
        assert_eq!(items, vec![0, 1, 2]);
    }
    for handle in handles {
        handle.join().unwrap();
    }
}

fn timed_wait_expires<P: ThreadSystem>() {
    let monitor = Monitor::<(), P>::new(()).unwrap();
    let mut locker = monitor.lock(false);
    let start = Instant::now();
    let result = locker.wait_for(Duration::from_millis(20));
    assert!(result.timed_out());
    assert!(start.elapsed() >= Duration::from_millis(15));

    let result = locker.wait_until(Instant::now());
    assert!(result.timed_out());
}

fn panics_surface_on_join<P: ThreadSystem>() {
    let handle = spawn_with::<P, _, ()>(None, || panic!("boom")).unwrap();
    let payload = handle.join().unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));

    let handle = spawn_with::<P, _, _>(None, || 6 * 7).unwrap();
    assert_eq!(handle.join().unwrap(), 42);
}

fn dropped_handles_detach<P: ThreadSystem>() {
    let done = Arc::new(Monitor::<bool, P>::new(false).unwrap());
    let handle = {
        let done = done.clone();
        spawn_with::<P, _, _>(None, move || {
            **done.lock(false) = true;
        })
        .unwrap()
    };
    drop(handle);

    let mut locker = done.lock(false);
    locker.wait_while(|done| !*done);
    assert!(**locker);
}

macro_rules! backend_tests {
    ($name:ident, $backend:ty) => {
        mod $name {
            use super::*;

            #[test]
            fn contended_counter() {
                super::contended_counter::<$backend>();
            }

            #[test]
            fn condvar_handoff() {
                super::condvar_handoff::<$backend>();
            }

            #[test]
            fn monitor_wait_while() {
                super::monitor_wait_while::<$backend>();
            }

            #[test]
            fn timed_wait_expires() {
                super::timed_wait_expires::<$backend>();
            }

            #[test]
            fn panics_surface_on_join() {
                super::panics_surface_on_join::<$backend>();
            }

            #[test]
            fn dropped_handles_detach() {
                super::dropped_handles_detach::<$backend>();
            }
        }
    };
}

backend_tests!(native, Platform);
backend_tests!(parking, Parking);

#[test]
fn blocked_lockers_do_not_stall_collection() {
    let _ = env_logger::builder().is_test(true).try_init();
    let vm = VirtualMachine::new(VMOptions::default()).unwrap();
    let thread = vm.attach_current_thread().unwrap();
    let lock = Arc::new(Mutex::<u32>::new(0).unwrap());
    let started = Arc::new(AtomicBool::new(false));

    let guard = lock.lock(true);
    let handle = {
        let lock = lock.clone();
        let started = started.clone();
        spawn_thread(&vm, move |t| {
            started.store(true, Ordering::SeqCst);
            let mut value = lock.lock(true);
            *value += 1;
            t.cons(Value::T, Value::NIL);
        })
        .unwrap()
    };

    while !started.load(Ordering::SeqCst) {
        thread.safe_region(std::thread::yield_now);
    }
    // The other thread is (or soon will be) blocked on the lock in a safe
    // region, so the collection can proceed.
    let stats = vm.collect();
    assert_eq!(stats.collections, 1);

    drop(guard);
    handle.join().unwrap();
    assert_eq!(*lock.lock(true), 1);
}

#[test]
fn mutators_park_at_safepoints() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut options = VMOptions::default();
    options.set_gc_min_heap_size(128 * 1024);
    let vm = VirtualMachine::new(options).unwrap();
    let stop = Arc::new(AtomicBool::new(false));

    let handles = (0..3)
        .map(|_| {
            let stop = stop.clone();
            spawn_thread(&vm, move |t| {
                let mut root = GlobalRoot::new(t.vm(), Value::NIL);
                let mut conses = 0usize;
                while conses < 1000 || !stop.load(Ordering::Relaxed) {
                    let cons = t.cons(Value::fixnum(conses as isize), Value::NIL);
                    root.set(cons);
                    conses += 1;
                }
                assert_eq!(object::car(root.get()), Value::fixnum(conses as isize - 1));
                conses
            })
            .unwrap()
        })
        .collect::<Vec<_>>();

    for _ in 0..10 {
        vm.collect();
    }
    stop.store(true, Ordering::Relaxed);

    let total: usize = handles.into_iter().map(|handle| handle.join().unwrap()).sum();
    assert!(total > 0);
    assert!(vm.stats().collections >= 10);
}
