pub mod output_store;
pub mod plan_compiler;
pub mod reduce;
pub mod scheduler;

pub use output_store::*;
pub use plan_compiler::*;
pub use reduce::aggregate;
pub use scheduler::*;
