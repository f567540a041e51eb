//! Integration tests for the logging helpers

use bridge_traits::LogLevel;
use core_runtime::logging::{init_logging, redact_if_sensitive, strip_path, LogFormat, LoggingConfig};

#[test]
fn test_init_logging_only_once() {
    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_level(LogLevel::Debug);

    assert!(init_logging(config.clone()).is_ok());
    assert!(init_logging(config).is_err());

    tracing::debug!(target: "core_download::store", "visible after init");
}

#[test]
fn test_signed_urls_lose_their_query() {
    let redacted = redact_if_sensitive(
        "stream_url",
        "https://media.example/Audio/7/stream.mp3?static=true&api_key=abc",
    );
    assert_eq!(redacted, "https://media.example/Audio/7/stream.mp3?[REDACTED]");
    assert_eq!(
        redact_if_sensitive("url", "https://media.example/Items/7/Download"),
        "https://media.example/Items/7/Download"
    );
}

#[test]
fn test_download_paths_reduce_to_file_name() {
    assert_eq!(strip_path("/home/me/.local/share/app/downloads/srv/7.mp3"), "7.mp3");
    assert_eq!(strip_path("srv\\7.mp3.part"), "7.mp3.part");
    assert_eq!(strip_path(""), "");
}
