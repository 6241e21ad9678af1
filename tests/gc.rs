use std::{
    collections::HashSet,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use lisprt::{gc::memory_region::MemoryRegion, prelude::*};

/// A machine that only sees explicit roots, so reclamation is predictable.
fn precise_vm() -> Arc<VirtualMachine> {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut options = VMOptions::default();
    options.set_conservative_stack_scan(false);
    VirtualMachine::new(options).unwrap()
}

#[test]
fn registered_roots_keep_objects_alive() {
    let vm = precise_vm();
    let thread = vm.attach_current_thread().unwrap();

    let object = thread.cons(Value::T, Value::NIL);
    let slot = Box::new(object);
    unsafe { vm.register_root(&*slot) };

    vm.collect();
    assert!(vm.is_live_object(object));
    assert_eq!(object::car(object), Value::T);

    vm.unregister_root(&*slot);
    vm.collect();
    assert!(!vm.is_live_object(object));
}

#[test]
fn global_roots_trace_through_objects() {
    let vm = precise_vm();
    let thread = vm.attach_current_thread().unwrap();

    let inner = thread.make_string("inner");
    let outer = thread.make_vector(3, inner);
    let root = GlobalRoot::new(&vm, outer);

    let stats = vm.collect();
    assert!(vm.is_live_object(outer));
    assert!(vm.is_live_object(inner));
    assert_eq!(object::string_to_string(object::vector_ref(root.get(), 2)), "inner");
    assert_eq!(stats.collections, 1);

    drop(root);
    let stats = vm.collect();
    assert!(!vm.is_live_object(outer));
    assert!(!vm.is_live_object(inner));
    assert!(stats.objects_reclaimed >= 2);
}

#[test]
fn stack_references_keep_objects_alive() {
    let _ = env_logger::builder().is_test(true).try_init();
    let vm = VirtualMachine::new(VMOptions::default()).unwrap();
    let thread = vm.attach_current_thread().unwrap();

    let list = std::hint::black_box(thread.list(&[Value::fixnum(1), Value::fixnum(2)]));
    vm.collect();
    assert!(vm.is_live_object(list));
    assert!(vm.is_live_object(object::cdr(list)));
    assert_eq!(object::list_to_vec(list), vec![Value::fixnum(1), Value::fixnum(2)]);
    std::hint::black_box(list);
}

#[test]
fn root_regions_are_scanned_unless_excluded() {
    let vm = precise_vm();
    let thread = vm.attach_current_thread().unwrap();

    let object = thread.cons(Value::NIL, Value::NIL);
    let buffer: Box<[usize]> = vec![0, object.raw(), 0, 0].into_boxed_slice();
    let start = buffer.as_ptr() as usize;
    let end = start + std::mem::size_of_val(&*buffer);

    unsafe { vm.add_root_region(start, end) };
    vm.collect();
    assert!(vm.is_live_object(object));

    vm.exclude_region(start, end);
    vm.collect();
    assert!(!vm.is_live_object(object));

    assert!(vm.include_region(start, end));
    assert!(!vm.include_region(start, end));
    assert!(vm.remove_root_region(start, end));
    assert!(!vm.remove_root_region(start, end));
}

#[test]
fn foreign_segments_are_never_scanned() {
    let vm = precise_vm();
    let thread = vm.attach_current_thread().unwrap();

    let kept = thread.cons(Value::T, Value::NIL);
    let hidden = thread.cons(Value::NIL, Value::NIL);
    let buffer: Box<[usize]> = vec![kept.raw(), 0, hidden.raw(), 0].into_boxed_slice();
    let start = buffer.as_ptr() as usize;
    let word = std::mem::size_of::<usize>();
    let end = start + 4 * word;

    unsafe { vm.add_root_region(start, end) };
    vm.register_foreign_segments(
        "libdata",
        vec![MemoryRegion::from_range(start + 2 * word, end)],
    );
    vm.collect();
    assert!(vm.is_live_object(kept));
    assert!(!vm.is_live_object(hidden));

    assert!(vm.unregister_foreign_segments("libdata"));
    assert!(!vm.unregister_foreign_segments("libdata"));
    vm.remove_root_region(start, end);
}

#[test]
fn finalizers_run_exactly_once() {
    let vm = precise_vm();
    let thread = vm.attach_current_thread().unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let object = thread.make_vector(2, Value::NIL);
    {
        let runs = runs.clone();
        vm.register_finalizer(
            object,
            Box::new(move |value| {
                assert_eq!(object::vector_len(value), 2);
                runs.fetch_add(1, Ordering::SeqCst);
            }),
        );
    }

    vm.collect();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    // Finalized objects survive the collection that found them dead.
    assert!(vm.is_live_object(object));

    vm.collect();
    vm.collect();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(!vm.is_live_object(object));
}

#[test]
fn threshold_triggers_collections() {
    let vm = precise_vm();
    let thread = vm.attach_current_thread().unwrap();

    let root = GlobalRoot::new(&vm, thread.make_string("survivor"));
    let min_heap = vm.options().gc_min_heap_size;
    let mut garbage = 0;
    while garbage < 4 * min_heap {
        thread.make_vector(64, Value::NIL);
        garbage += 65 * std::mem::size_of::<usize>();
    }
    let stats = vm.stats();
    assert!(stats.collections >= 1);
    assert!(stats.objects_reclaimed > 0);
    assert!(stats.footprint <= vm.options().gc_max_heap_size);
    assert_eq!(object::string_to_string(root.get()), "survivor");
}

#[test]
fn exhausting_the_heap_is_fatal() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut options = VMOptions::default();
    options
        .set_gc_min_heap_size(256 * 1024)
        .set_gc_max_heap_size(1024 * 1024);
    let vm = VirtualMachine::new(options).unwrap();
    let thread = vm.attach_current_thread().unwrap();

    let payload = catch_unwind(AssertUnwindSafe(|| {
        thread.make_vector(1 << 20, Value::NIL);
    }))
    .unwrap_err();
    let fatal = FatalError::from_panic(&*payload).unwrap();
    assert_eq!(fatal.kind, FatalKind::HeapExhausted);

    // The heap is still usable for requests that fit.
    let small = thread.cons(Value::T, Value::T);
    assert_eq!(object::cdr(small), Value::T);
}

#[test]
fn concurrent_allocations_are_distinct() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut options = VMOptions::default();
    options.set_gc_min_heap_size(256 * 1024);
    let vm = VirtualMachine::new(options).unwrap();

    const THREADS: usize = 4;
    const LENGTH: usize = 5000;

    let handles = (0..THREADS)
        .map(|n| {
            spawn_thread(&vm, move |thread| {
                let mut list = GlobalRoot::new(thread.vm(), Value::NIL);
                for i in 0..LENGTH {
                    let cons = thread.cons(Value::fixnum((n * LENGTH + i) as isize), list.get());
                    list.set(cons);
                    // Garbage to force collections while others allocate.
                    thread.make_vector(16, Value::NIL);
                }
                list
            })
            .unwrap()
        })
        .collect::<Vec<_>>();

    let lists = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect::<Vec<_>>();

    let mut addresses = HashSet::new();
    let mut contents = HashSet::new();
    for list in lists.iter() {
        let mut cell = list.get();
        while !cell.is_nil() {
            assert!(addresses.insert(cell.raw()), "cons allocated twice");
            assert!(contents.insert(object::car(cell).get_fixnum()));
            cell = object::cdr(cell);
        }
    }
    assert_eq!(addresses.len(), THREADS * LENGTH);
    assert_eq!(contents.len(), THREADS * LENGTH);
    assert!(vm.stats().collections >= 1);
    assert_eq!(vm.thread_count(), 0);
}
