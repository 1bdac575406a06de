pub mod config;
pub mod error;
pub mod fleet;
pub mod live;
pub mod naming;
pub mod signal;
pub mod target;

pub use config::Config;
pub use error::*;
pub use fleet::*;
pub use live::*;
pub use target::*;
