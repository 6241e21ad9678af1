//! Runtime values: tagging, heap object layouts, symbols and allocation.

pub mod error;
pub mod factory;
pub mod object;
pub mod symbol;
pub mod value;
