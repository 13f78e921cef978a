pub mod events;
pub mod filters;
pub mod opcodes;
pub mod stats;
pub mod tracks;

pub use events::*;
pub use filters::Filters;
pub use opcodes::*;
pub use stats::*;
pub use tracks::*;
