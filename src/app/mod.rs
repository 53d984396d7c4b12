// Application layer - Wiring adapters into a pipeline

pub mod container;

pub use container::{AppContainer, MockAppContainer};

#[cfg(feature = "libav")]
pub use container::LibavAppContainer;
