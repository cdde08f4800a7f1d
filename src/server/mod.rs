//! Server module for TimeLedger
//!
//! # Module Structure
//!
//! - `config`: Configuration structures
//! - `loader`: Configuration loading from files and environment
//! - `logging`: Tracing subscriber setup
//! - `app`: Storage and service wiring
//! - `init`: Main run loop

mod app;
pub mod config;
mod init;
mod loader;
mod logging;

// Re-export public API
pub use app::App;
pub use init::run;
pub use loader::load_config;
pub use logging::init_logging;
