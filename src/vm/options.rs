use crate::{
    runtime::error::{Error, Result},
    utils::env::{read_bool_from_env, read_float_from_env, read_uint_from_env, read_uint_from_str},
};

pub const DEFAULT_MIN_HEAP_SIZE: usize = 4 * 1024 * 1024;
pub const DEFAULT_MAX_HEAP_SIZE: usize = 1024 * 1024 * 1024;
pub const DEFAULT_FRAME_LIMIT: usize = 16 * 1024;
pub const DEFAULT_INVOCATION_LIMIT: usize = 64 * 1024;

/// Tunables of a [`VirtualMachine`](crate::vm::VirtualMachine).
#[derive(Debug, Clone)]
pub struct VMOptions {
    /// Bytes allocated before the first collection, and the floor for later thresholds.
    pub gc_min_heap_size: usize,
    /// Hard ceiling for the heap footprint. Exceeding it is fatal.
    pub gc_max_heap_size: usize,
    /// Next threshold = live bytes * growth factor.
    pub gc_growth_factor: f64,
    /// Scan native stacks and registers of attached threads.
    pub conservative_stack_scan: bool,
    /// Treat pointers into the middle of an object as references when scanning conservatively.
    pub interior_pointers: bool,
    /// Maximum number of control frames per thread.
    pub frame_limit: usize,
    /// Maximum depth of the invocation history per thread.
    pub invocation_limit: usize,
    /// Stack size of threads created through `spawn_thread`.
    pub thread_stack_size: Option<usize>,
    /// Abort the process instead of panicking on fatal errors.
    pub abort_on_fatal: bool,
}

impl Default for VMOptions {
    fn default() -> Self {
        Self {
            gc_min_heap_size: DEFAULT_MIN_HEAP_SIZE,
            gc_max_heap_size: DEFAULT_MAX_HEAP_SIZE,
            gc_growth_factor: 2.0,
            conservative_stack_scan: true,
            interior_pointers: true,
            frame_limit: DEFAULT_FRAME_LIMIT,
            invocation_limit: DEFAULT_INVOCATION_LIMIT,
            thread_stack_size: None,
            abort_on_fatal: false,
        }
    }
}

impl VMOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `LISPRT_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut options = Self::default();

        if let Some(size) = read_uint_from_env("LISPRT_GC_MIN_HEAP") {
            options.gc_min_heap_size = size;
        }
        if let Some(size) = read_uint_from_env("LISPRT_GC_MAX_HEAP") {
            options.gc_max_heap_size = size;
        }
        if let Some(factor) = read_float_from_env("LISPRT_GC_GROWTH") {
            options.gc_growth_factor = factor;
        }
        if let Some(limit) = read_uint_from_env("LISPRT_FRAME_LIMIT") {
            options.frame_limit = limit;
        }
        if let Some(scan) = read_bool_from_env("LISPRT_STACK_SCAN") {
            options.conservative_stack_scan = scan;
        }
        if let Some(interior) = read_bool_from_env("LISPRT_INTERIOR_POINTERS") {
            options.interior_pointers = interior;
        }
        if let Some(abort) = read_bool_from_env("LISPRT_ABORT_ON_FATAL") {
            options.abort_on_fatal = abort;
        }

        options.validate()?;
        Ok(options)
    }

    /// Environment defaults overridden by command-line flags. Flags this
    /// function does not know are left in `args`.
    pub fn parse(args: &mut pico_args::Arguments) -> Result<Self> {
        let mut options = Self::from_env()?;

        if let Some(size) = size_arg(args, "--gc-min-heap-size")? {
            options.gc_min_heap_size = size;
        }
        if let Some(size) = size_arg(args, "--gc-max-heap-size")? {
            options.gc_max_heap_size = size;
        }
        if let Some(factor) = args
            .opt_value_from_str::<_, f64>("--gc-growth")
            .map_err(|e| invalid("gc_growth_factor", e))?
        {
            options.gc_growth_factor = factor;
        }
        if let Some(limit) = args
            .opt_value_from_str::<_, usize>("--frame-limit")
            .map_err(|e| invalid("frame_limit", e))?
        {
            options.frame_limit = limit;
        }
        if let Some(size) = size_arg(args, "--thread-stack-size")? {
            options.thread_stack_size = Some(size);
        }
        if args.contains("--no-stack-scan") {
            options.conservative_stack_scan = false;
        }
        if args.contains("--no-interior-pointers") {
            options.interior_pointers = false;
        }
        if args.contains("--abort-on-fatal") {
            options.abort_on_fatal = true;
        }

        options.validate()?;
        Ok(options)
    }

    pub fn set_gc_min_heap_size(&mut self, size: usize) -> &mut Self {
        self.gc_min_heap_size = size;
        self
    }

    pub fn set_gc_max_heap_size(&mut self, size: usize) -> &mut Self {
        self.gc_max_heap_size = size;
        self
    }

    pub fn set_conservative_stack_scan(&mut self, scan: bool) -> &mut Self {
        self.conservative_stack_scan = scan;
        self
    }

    pub fn set_frame_limit(&mut self, limit: usize) -> &mut Self {
        self.frame_limit = limit;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.gc_min_heap_size == 0 {
            return Err(Error::InvalidOption {
                name: "gc_min_heap_size",
                value: self.gc_min_heap_size.to_string(),
            });
        }
        if self.gc_max_heap_size < self.gc_min_heap_size {
            return Err(Error::InvalidOption {
                name: "gc_max_heap_size",
                value: format!(
                    "{} (smaller than minimum heap size {})",
                    self.gc_max_heap_size, self.gc_min_heap_size
                ),
            });
        }
        if !(self.gc_growth_factor >= 1.0) {
            return Err(Error::InvalidOption {
                name: "gc_growth_factor",
                value: self.gc_growth_factor.to_string(),
            });
        }
        if self.frame_limit == 0 {
            return Err(Error::InvalidOption {
                name: "frame_limit",
                value: "0".to_string(),
            });
        }
        Ok(())
    }
}

fn invalid(name: &'static str, error: pico_args::Error) -> Error {
    Error::InvalidOption {
        name,
        value: error.to_string(),
    }
}

fn size_arg(args: &mut pico_args::Arguments, flag: &'static str) -> Result<Option<usize>> {
    match args
        .opt_value_from_str::<_, String>(flag)
        .map_err(|e| invalid(flag, e))?
    {
        Some(value) => match read_uint_from_str(&value) {
            Some(size) => Ok(Some(size)),
            None => Err(Error::InvalidOption { name: flag, value }),
        },
        None => Ok(None),
    }
}
