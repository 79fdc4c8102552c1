pub mod agent_runtime;
pub mod cancellation;
pub mod config;
pub mod event_bus;
pub mod interrupt_registry;
pub mod thread_store;

pub use agent_runtime::*;
pub use cancellation::*;
pub use config::*;
pub use event_bus::*;
pub use interrupt_registry::*;
pub use thread_store::*;
