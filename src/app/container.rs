use std::sync::Arc;

use crate::adapters::{MockEncoder, MockEncoderConfig, MockSource, MockSourceConfig, MockStats};
use crate::config::PipelineConfig;
use crate::engine::Pipeline;
use crate::error::PipelineResult;
use crate::ports::{EncoderBackend, MediaSource};

/// Composition root: owns a wired [`Pipeline`]
pub trait AppContainer: Send + Sync {
    fn pipeline(&self) -> Pipeline;
}

/// Pipeline over the in-process mock adapters
pub struct MockAppContainer {
    pipeline: Pipeline,
    stats: Arc<MockStats>,
}

impl MockAppContainer {
    pub fn new(config: PipelineConfig) -> PipelineResult<Self> {
        Self::with_adapters(config, MockSourceConfig::default(), MockEncoderConfig::default())
    }

    /// Custom adapter behaviour; pacing still comes from `config`
    pub fn with_adapters(
        config: PipelineConfig,
        source: MockSourceConfig,
        encoder: MockEncoderConfig,
    ) -> PipelineResult<Self> {
        let stats = MockStats::new();
        let source_port = Arc::new(MockSource::with_stats(
            MockSourceConfig {
                pacing: config.pacing,
                ..source
            },
            Arc::clone(&stats),
        ));
        let encoder_port = Arc::new(MockEncoder::with_stats(encoder, Arc::clone(&stats)));

        let pipeline = Pipeline::new(
            config,
            source_port as Arc<dyn MediaSource>,
            encoder_port as Arc<dyn EncoderBackend>,
        )?;
        Ok(Self { pipeline, stats })
    }

    /// Live handle counters shared by both mock adapters
    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }
}

impl AppContainer for MockAppContainer {
    fn pipeline(&self) -> Pipeline {
        self.pipeline.clone()
    }
}

/// Pipeline over FFmpeg
#[cfg(feature = "libav")]
pub struct LibavAppContainer {
    pipeline: Pipeline,
}

#[cfg(feature = "libav")]
impl LibavAppContainer {
    pub fn new(config: PipelineConfig) -> PipelineResult<Self> {
        use crate::adapters::{LibavEncoder, LibavSource};

        let source_port = Arc::new(LibavSource::new(config.pacing)?);
        let encoder_port = Arc::new(LibavEncoder::new()?);
        let pipeline = Pipeline::new(
            config,
            source_port as Arc<dyn MediaSource>,
            encoder_port as Arc<dyn EncoderBackend>,
        )?;
        Ok(Self { pipeline })
    }
}

#[cfg(feature = "libav")]
impl AppContainer for LibavAppContainer {
    fn pipeline(&self) -> Pipeline {
        self.pipeline.clone()
    }
}
