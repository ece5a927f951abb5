pub mod logger;

pub use logger::{init_logging, StartupLogger};
