// Unit tests for domain models

use super::*;

#[test]
fn test_media_input_clones_share_identity() {
    let input = MediaInput::from_bytes(vec![1u8, 2, 3]);
    let clone = input.clone();
    assert_eq!(input.id(), clone.id());
    assert_eq!(clone.size_bytes(), 3);
    assert_eq!(clone.bytes(), &[1, 2, 3]);

    let other = MediaInput::from_bytes(vec![1u8, 2, 3]);
    assert_ne!(input.id(), other.id());
}

#[test]
fn test_media_input_keeps_declared_size() {
    let input = MediaInput::new(vec![0u8; 16], 4096);
    assert_eq!(input.size_bytes(), 4096);
    assert_eq!(input.bytes().len(), 16);
}

#[test]
fn test_quality_preset_parse_and_display() {
    assert_eq!("HIGH".parse::<QualityPreset>().unwrap(), QualityPreset::High);
    assert_eq!(" medium ".parse::<QualityPreset>().unwrap(), QualityPreset::Medium);
    assert_eq!(QualityPreset::Low.to_string(), "low");
    assert!("ultra".parse::<QualityPreset>().is_err());
}

#[test]
fn test_quality_preset_ordering() {
    assert!(QualityPreset::Low < QualityPreset::Medium);
    assert!(QualityPreset::Medium < QualityPreset::High);
}

#[test]
fn test_bitrate_target_rejects_zero() {
    assert!(BitrateTarget::from_bps(0).is_none());
    assert_eq!(BitrateTarget::from_bps(1).unwrap().bits_per_second(), 1);
}

#[test]
fn test_bitrate_target_bytes_for_duration() {
    let bitrate = BitrateTarget::from_bps(400_000).unwrap();
    assert_eq!(bitrate.bytes_for(10.0), 500_000);
    assert_eq!(bitrate.bytes_for(0.0), 0);
    assert_eq!(bitrate.bytes_for(f64::NAN), 0);
    assert_eq!(bitrate.to_string(), "400 kbps");
}

#[test]
fn test_container_properties() {
    assert_eq!(ContainerFormat::WebM.media_type(), "video/webm");
    assert_eq!(ContainerFormat::WebM.extension(), "webm");
    assert_eq!(ContainerFormat::Matroska.extension(), "mkv");
    assert_eq!("mkv".parse::<ContainerFormat>().unwrap(), ContainerFormat::Matroska);
    assert!("avi".parse::<ContainerFormat>().is_err());
}

#[test]
fn test_encoder_settings_file_name() {
    let settings = EncoderSettings {
        bitrate: BitrateTarget::from_bps(600_000).unwrap(),
        container: ContainerFormat::WebM,
        video_codec: VideoCodec::Vp9,
        include_audio: false,
        timeslice: Duration::from_secs(1),
        output_basename: "compressed".to_string(),
    };
    assert_eq!(settings.file_name(), "compressed.webm");
    assert_eq!(settings.mime_with_codecs(), "video/webm; codecs=vp9");
}

#[test]
fn test_artifact_concatenates_in_order() {
    let chunks = vec![
        EncodedChunk::new(vec![1, 2]),
        EncodedChunk::new(vec![3]),
        EncodedChunk::new(vec![4, 5, 6]),
    ];
    let artifact = Artifact::assemble(chunks, "compressed.webm", "video/webm").unwrap();
    assert_eq!(artifact.bytes(), &[1, 2, 3, 4, 5, 6]);
    assert_eq!(artifact.size_bytes(), 6);
    assert_eq!(artifact.chunk_count(), 3);
    assert_eq!(artifact.file_name(), "compressed.webm");
    assert_eq!(artifact.media_type(), "video/webm");
}

#[test]
fn test_artifact_from_no_chunks_is_empty() {
    let artifact = Artifact::assemble(Vec::new(), "compressed.webm", "video/webm").unwrap();
    assert_eq!(artifact.size_bytes(), 0);
    assert_eq!(artifact.chunk_count(), 0);
}

#[test]
fn test_artifact_size_comparisons() {
    let artifact =
        Artifact::assemble(vec![EncodedChunk::new(vec![0; 250])], "out.webm", "video/webm").unwrap();
    assert_eq!(artifact.compression_ratio(1000), Some(0.25));
    assert_eq!(artifact.compression_ratio(0), None);
    assert_eq!(artifact.size_saved(1000), 750);
    assert_eq!(artifact.size_saved(100), -150);
}

#[test]
fn test_pipeline_state_terminal() {
    assert!(PipelineState::Completed.is_terminal());
    assert!(PipelineState::Errored.is_terminal());
    assert!(!PipelineState::Encoding.is_terminal());
    assert!(!PipelineState::Idle.is_terminal());
    assert_eq!(PipelineState::Loaded.to_string(), "loaded");
}

#[test]
fn test_run_event_json_shape() {
    let event = RunEvent::Progress(ProgressEvent {
        percent: Some(42),
        remaining: RemainingTime::Seconds(5.8),
        position_secs: 4.2,
        elapsed_secs: 4.3,
    });
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["event"], "progress");
    assert_eq!(json["percent"], 42);
    assert_eq!(json["remaining"]["seconds"], 5.8);

    let unknown = RunEvent::Progress(ProgressEvent {
        percent: None,
        remaining: RemainingTime::Unknown,
        position_secs: 1.0,
        elapsed_secs: 1.0,
    });
    let json = serde_json::to_value(&unknown).unwrap();
    assert!(json["percent"].is_null());
    assert_eq!(json["remaining"], "unknown");
}

#[test]
fn test_completed_event_omits_artifact_bytes() {
    let artifact =
        Artifact::assemble(vec![EncodedChunk::new(vec![7; 8])], "compressed.webm", "video/webm")
            .unwrap();
    let event = RunEvent::Result(ResultEvent::Completed {
        artifact: Arc::new(artifact),
    });
    let json = serde_json::to_value(&event).unwrap();
    assert_eq!(json["event"], "result");
    assert_eq!(json["status"], "completed");
    assert_eq!(json["artifact"]["size_bytes"], 8);
    assert!(json["artifact"].get("bytes").is_none());
}
