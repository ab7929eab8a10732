//! E2E tests for persistent configuration
//!
//! Tests config round-trip, defaults, backward compatibility, and that a
//! loaded config configures tasks on the simulated device.

use daqstream::config::AppConfig;
use daqstream::signal::waveform::{SineWaveform, WaveformSource};
use daqstream::{
    Direction, SampleFrame, SimulatedDriver, StreamClockConfig, StreamContext, TaskState,
};
use std::sync::Arc;

/// Test that a saved config loads back unchanged
#[test]
fn test_config_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("daqstream").join("config.json");

    let config = AppConfig {
        device: "Dev3".to_string(),
        sample_rate: 2000.0,
        buffer_frames: 160,
        callback_threshold: Some(40),
        regeneration: false,
        input_channels: vec!["ai0".into(), "ai1".into()],
        ..AppConfig::default()
    };
    config.save(&path).unwrap();

    assert!(path.exists(), "Save must create parent directories");
    assert_eq!(AppConfig::load_from(&path), config);
}

/// Test that a missing file gives the defaults
#[test]
fn test_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = AppConfig::load_from(&dir.path().join("absent.json"));
    assert_eq!(config, AppConfig::default());
}

/// Test that a file written before a field existed still loads
#[test]
fn test_old_config_backward_compatible() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{"device": "PXI1Slot2", "sample_rate": 10000.0}"#).unwrap();

    let config = AppConfig::load_from(&path);
    assert_eq!(config.device, "PXI1Slot2");
    assert_eq!(config.sample_rate, 10000.0);
    assert_eq!(
        config.buffer_frames,
        daqstream::DEFAULT_BUFFER_FRAMES,
        "Absent fields fall back to their defaults"
    );
    assert_eq!(config.callback_threshold, None);
}

/// Test that the saved file is readable JSON with named fields
#[test]
fn test_saved_file_is_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    AppConfig::default().save(&path).unwrap();

    let value: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(value["device"], "Dev1");
    assert_eq!(value["wave_length"], 500);
}

/// Test that config values drive task configuration
#[test]
fn test_config_configures_task() {
    let config = AppConfig {
        buffer_frames: 100,
        callback_threshold: Some(25),
        ..AppConfig::default()
    };
    let sim = Arc::new(SimulatedDriver::new(&config.device));
    let ctx = StreamContext::new(sim.clone());

    let mut task = ctx.create_task("ai", Direction::Input);
    if let Some(n) = config.callback_threshold {
        task.set_callback_threshold(n).unwrap();
    }
    task.configure(
        config.input_set(),
        StreamClockConfig::continuous(config.sample_rate),
        config.buffer_frames,
        false,
    )
    .unwrap();

    assert_eq!(task.state(), TaskState::Configured);
    assert_eq!(task.callback_threshold(), Some(25));
    assert_eq!(
        task.channels().map(|c| c.names().to_vec()),
        Some(vec!["Dev1/ai0".to_string()])
    );
    assert_eq!(sim.open_handles(), 1);
}

/// Test that the `regeneration` setting decides how an output is fed
#[test]
fn test_regeneration_setting_drives_output() {
    let table: Vec<SampleFrame> = (0..8).map(|i| SampleFrame::analog(&[i as f64])).collect();

    for regeneration in [true, false] {
        let config = AppConfig {
            regeneration,
            ..AppConfig::default()
        };
        let sim = Arc::new(SimulatedDriver::new(&config.device));
        let ctx = StreamContext::new(sim.clone());
        let plan = config.output_plan(table.len(), config.regeneration);

        let mut task = ctx.create_task("ao", Direction::Output);
        if let Some(n) = plan.threshold {
            task.set_callback_threshold(n).unwrap();
        }
        task.configure(
            config.output_set(),
            StreamClockConfig::continuous(config.sample_rate),
            plan.buffer_frames,
            plan.regeneration,
        )
        .unwrap();
        task.set_source(WaveformSource::new(table.clone())).unwrap();
        task.start().unwrap();
        sim.advance(100);

        let emitted: Vec<f64> = sim
            .emitted(task.handle().unwrap())
            .iter()
            .filter_map(|f| f.value(0))
            .collect();
        let expected: Vec<f64> = (0..100).map(|i| (i % 8) as f64).collect();
        assert_eq!(emitted, expected, "regeneration={}", regeneration);
        assert_eq!(task.state(), TaskState::Running);
        assert_eq!(
            task.stats().notifications > 0,
            !regeneration,
            "Only a refilled output is called back"
        );
    }
}

/// Test that a config with a zero-length waveform never reaches the demos
#[test]
fn test_zero_wave_length_falls_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{"wave_length": 0, "wave_amplitude": 2.0}"#).unwrap();

    let config = AppConfig::load_from(&path);
    assert_eq!(config.wave_length, 500);
    assert!(config.validate().is_ok());
    assert_eq!(SineWaveform::new(config.wave_length, 1.0).points(), 500);
}
