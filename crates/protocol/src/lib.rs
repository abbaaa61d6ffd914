pub mod config;
pub mod messages;
pub mod universe;

pub use config::*;
pub use messages::*;
pub use universe::*;
