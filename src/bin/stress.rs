use std::time::Instant;

use lisprt::{prelude::*, utils::formatted_size};

fn usage() {
    println!("Usage: lisprt-stress [options]");
    println!("Options:");
    println!("  -h, --help: Print this help message");
    println!("  --threads <n>: Number of mutator threads (default: 4)");
    println!("  --iterations <n>: Lists built per thread (default: 200)");
    println!("  --list-length <n>: Conses per list (default: 10000)");
    println!("  --gc-min-heap-size <size>: Heap size that triggers the first collection");
    println!("  --gc-max-heap-size <size>: Largest heap footprint allowed");
    println!("  --gc-growth <factor>: Heap growth after a collection");
    println!("  --frame-limit <n>: Control frames per thread");
    println!("  --thread-stack-size <size>: Stack size of mutator threads");
    println!("  --no-stack-scan: Do not scan native stacks");
    println!("  --no-interior-pointers: Ignore pointers into the middle of objects");
    println!("  --abort-on-fatal: Abort instead of unwinding on fatal errors");
}

/// Builds a list of `length` fixnums, escaping from the innermost frame
/// with its sum, and checks the sum against the list.
fn churn(thread: &Thread, depth: GlobalRoot, length: usize) -> Result<isize> {
    let mut list = GlobalRoot::new(thread.vm(), Value::NIL);
    for i in 0..length {
        let cons = thread.cons(Value::fixnum(i as isize), list.get());
        list.set(cons);
    }

    let level = thread.intern("*level*");
    let sum = thread.toplevel(|thread| {
        thread.bind(level, depth.get(), |thread| {
            thread.block(|thread, tag| {
                let sum = object::list_to_vec(list.get())
                    .iter()
                    .map(|v| v.get_fixnum())
                    .sum::<isize>();
                Err(thread.exit_to(tag, Value::fixnum(sum)))
            })
        })
    })?;

    let expected = (length * length.saturating_sub(1) / 2) as isize;
    if sum.get_fixnum() != expected {
        eprintln!(
            "thread {}: list sum {} != {}",
            thread.id(),
            sum.get_fixnum(),
            expected
        );
        std::process::exit(2);
    }
    Ok(sum.get_fixnum())
}

fn main() {
    env_logger::init();

    let mut args = pico_args::Arguments::from_env();
    if args.contains(["-h", "--help"]) {
        usage();
        return;
    }

    let count = |args: &mut pico_args::Arguments, flag: &'static str, default: usize| {
        match args.opt_value_from_str::<_, usize>(flag) {
            Ok(value) => value.unwrap_or(default),
            Err(err) => {
                eprintln!("Error: {}", err);
                std::process::exit(1);
            }
        }
    };
    let threads = count(&mut args, "--threads", 4);
    let iterations = count(&mut args, "--iterations", 200);
    let length = count(&mut args, "--list-length", 10_000);

    let options = match VMOptions::parse(&mut args) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("Error: {}", err);
            std::process::exit(1);
        }
    };
    let rest = args.finish();
    if !rest.is_empty() {
        eprintln!("Error: unexpected arguments {:?}", rest);
        std::process::exit(1);
    }

    let vm = match VirtualMachine::new(options) {
        Ok(vm) => vm,
        Err(err) => {
            eprintln!("Error: {}", err);
            std::process::exit(1);
        }
    };

    let start = Instant::now();
    let mut handles = Vec::with_capacity(threads);
    for _ in 0..threads {
        let handle = spawn_thread(&vm, move |thread| -> Result<usize> {
            for i in 0..iterations {
                let depth = GlobalRoot::new(thread.vm(), Value::fixnum(i as isize));
                churn(thread, depth, length)?;
            }
            Ok(iterations)
        });
        match handle {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                eprintln!("Error: {}", err);
                std::process::exit(1);
            }
        }
    }

    let mut lists = 0;
    for handle in handles {
        match handle.join() {
            Ok(Ok(n)) => lists += n,
            Ok(Err(err)) => {
                eprintln!("Error: {}", err);
                std::process::exit(1);
            }
            Err(payload) => {
                match FatalError::from_panic(&*payload) {
                    Some(fatal) => eprintln!("{}", fatal),
                    None => eprintln!("mutator thread panicked"),
                }
                std::process::exit(1);
            }
        }
    }

    let stats = vm.collect();
    println!(
        "{} lists of {} conses on {} threads in {:.3}s",
        lists,
        length,
        threads,
        start.elapsed().as_secs_f64()
    );
    println!(
        "allocated {} in {} objects, {} collections, reclaimed {} in {} objects",
        formatted_size(stats.bytes_allocated),
        stats.objects_allocated,
        stats.collections,
        formatted_size(stats.bytes_reclaimed),
        stats.objects_reclaimed
    );
    println!(
        "live {}, footprint {}, last pause {:.3}ms",
        formatted_size(stats.live_bytes),
        formatted_size(stats.footprint),
        stats.last_pause.as_secs_f64() * 1000.0
    );
}
