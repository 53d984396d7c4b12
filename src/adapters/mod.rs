// Adapters - Source and encoder implementations

pub mod mock;

#[cfg(feature = "libav")]
pub mod libav;

// Re-export adapters
pub use mock::{
    MockEncoder, MockEncoderConfig, MockMedia, MockSource, MockSourceConfig, MockStats,
};

#[cfg(feature = "libav")]
pub use libav::{LibavEncoder, LibavSource};
