//! vidshrink
//!
//! Shrinks a video by re-encoding it at a bitrate picked from three quality
//! presets. A run plays the source, feeds the live frames to an encoder,
//! reports progress with an estimate of the time left, and hands back the
//! encoded artifact in memory.

pub mod adapters;
pub mod app;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod ports;
pub mod utils;

// Re-export commonly used types
pub use config::{load_configuration, PipelineConfig};
pub use domain::model::{
    Artifact, MediaInput, PipelineState, ProgressEvent, QualityPreset, RemainingTime,
    ResultEvent, RunEvent, RunId,
};
pub use domain::rules::BitratePolicy;
pub use engine::{Pipeline, RunEvents};
pub use error::{ErrorKind, ErrorReport, PipelineError, PipelineResult};

/// Install logging as configured; `false` if a subscriber was already set
pub fn init(config: &PipelineConfig) -> bool {
    let installed = utils::init_logging(&config.logging);
    if installed {
        utils::LoggingSystem::new(config.logging.clone()).log_system_info();
    }
    installed
}
