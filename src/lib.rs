//! Substrate of a managed-language runtime: tagged values, a conservative
//! mark-sweep collector, non-local control transfer over an explicit frame
//! stack, and portable threads and locks that cooperate with the collector.

pub mod gc;
pub mod runtime;
pub mod sync;
pub mod utils;
pub mod vm;

pub mod prelude {
    pub use crate::{
        gc::{roots::GlobalRoot, HeapStats},
        runtime::{
            error::{Error, FatalError, FatalKind, Result},
            object::{self, Field},
            value::{tag_immediate, Kind, Value},
        },
        vm::{
            control::{ClosureEntry, Unwind},
            options::VMOptions,
            thread::{spawn_thread, AttachedThread, Thread},
            VirtualMachine,
        },
    };
}
