pub mod config;
pub mod disk;
pub mod format;
pub mod logging;

pub use config::Config;
pub use disk::{FsSpaceQuery, SpaceQuery};
