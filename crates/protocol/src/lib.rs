pub mod codec;
pub mod config;
pub mod messages;
pub mod presets;

pub use codec::*;
pub use config::*;
pub use messages::*;
pub use presets::*;
