//! End-to-end ffmpeg exercises for the media processor.
//!
//! These spawn the real `ffmpeg` binary against a synthesized WAV fixture,
//! so they are `#[ignore]`d by default (no `ffmpeg` guarantee on a generic
//! test runner) and meant to be run explicitly where it's installed:
//!
//!   cargo test --test media_processor_integration -- --ignored --nocapture

use std::f32::consts::PI;

use hound::{SampleFormat, WavSpec, WavWriter};

use dropcrate::model::{AudioFormat, LoudnessTarget};
use dropcrate::services::media_processor::MediaProcessor;

fn write_sine_wav(path: &std::path::Path, duration_secs: f32, sample_rate: u32) {
    let spec = WavSpec {
        channels: 2,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec).expect("failed to create WAV writer");
    let num_samples = (duration_secs * sample_rate as f32) as usize;
    for i in 0..num_samples {
        let t = i as f32 / sample_rate as f32;
        let sample = ((2.0 * PI * 440.0 * t).sin() * 0.5 * i16::MAX as f32) as i16;
        writer.write_sample(sample).expect("write sample");
        writer.write_sample(sample).expect("write sample");
    }
    writer.finalize().expect("finalize WAV file");
}

#[tokio::test]
#[ignore]
async fn normalize_produces_aiff_at_target_sample_rate() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("fixture.wav");
    write_sine_wav(&input, 2.0, 48_000);

    let output = dir.path().join("out.aiff");
    let processor = MediaProcessor::new("ffmpeg".to_string());
    processor
        .normalize(&input, &output, AudioFormat::Aiff, LoudnessTarget::default(), &|| false)
        .await
        .expect("normalize should succeed with ffmpeg installed");

    assert!(output.exists());
    assert!(std::fs::metadata(&output).unwrap().len() > 0);
}

#[tokio::test]
#[ignore]
async fn transcode_produces_flac_output() {
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("fixture.wav");
    write_sine_wav(&input, 1.0, 44_100);

    let output = dir.path().join("out.flac");
    let processor = MediaProcessor::new("ffmpeg".to_string());
    processor
        .transcode(&input, &output, AudioFormat::Flac, &|| false)
        .await
        .expect("transcode should succeed with ffmpeg installed");

    assert!(output.exists());
}
