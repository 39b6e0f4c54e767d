//! Process-level plumbing shared by the sandbox binaries: layered
//! configuration, logging bootstrap, and the shutdown signal waiter.

pub mod config;
pub mod logging;
pub mod shutdown;

pub use config::{
    AppConfig, ChaosSettings, CliOverrides, FileStoreSettings, LoggingSettings,
    MemoryStoreSettings, NetworkStoreSettings, ResponsesMode, ServerConfig, StoreSettings,
    ValidateSettings,
};
pub use logging::init_logging;
pub use shutdown::wait_for_shutdown;
