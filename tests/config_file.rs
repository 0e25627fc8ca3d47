//! Configuration files as the CLI loads them.

use rust_seq::seq_core::config::{InstrumentConfig, LogFormat, TriggerSource, ENDPOINTS};
use rust_seq::SeqError;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn sample_config_loads_with_every_port() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/instrument.toml");
    let config = InstrumentConfig::load_from(path).unwrap();

    assert!(config.missing_ports().is_empty());
    assert_eq!(config.ports.len(), ENDPOINTS.len());
    assert_eq!(config.imaging.trigger_source, TriggerSource::HardwareTick);
    assert_eq!(config.fluidics.temperature_timeout, Duration::from_secs(600));
    assert_eq!(config.devices.pump.retry.max_retries, 2);
}

#[test]
fn partial_file_keeps_defaults() {
    let file = write(
        r#"
[logging]
format = "json"

[ports]
camera = { path = "/dev/ttyACM0" }

[imaging]
trigger_source = "software_timer"
jitter_tolerance = "5ms"
"#,
    );
    let config = InstrumentConfig::load_from(file.path()).unwrap();

    assert_eq!(config.logging.format, LogFormat::Json);
    assert_eq!(config.port("camera").unwrap().baud, 9600);
    assert_eq!(config.imaging.trigger_source, TriggerSource::SoftwareTimer);
    assert_eq!(config.imaging.jitter_tolerance, Duration::from_millis(5));
    assert_eq!(config.imaging.units_per_line, 10.0);
    assert_eq!(config.missing_ports().len(), ENDPOINTS.len() - 1);
}

#[test]
fn unknown_endpoint_is_rejected() {
    let file = write("[ports]\nturret = { path = \"/dev/ttyS0\" }\n");
    let err = InstrumentConfig::load_from(file.path()).unwrap_err();
    assert!(matches!(err, SeqError::Configuration(ref msg) if msg.contains("turret")), "{:?}", err);
}

#[test]
fn missing_file_is_a_configuration_error() {
    let err = InstrumentConfig::load_from("/nonexistent/instrument.toml").unwrap_err();
    assert!(matches!(err, SeqError::Configuration(_)));
}
