mod common;

use std::fs;

use common::{service_fixture, LogCapture};
use resilience_runtime::config::{ConfigError, LogFormat, ServiceConfig};
use resilience_runtime::context::ExecutionContext;
use resilience_runtime::logging::{init_tracing_with_writer, LoggingError};

#[test]
fn load_reads_file_then_validates() {
    let dir = std::env::temp_dir().join(format!("resilience-config-{}", std::process::id()));
    fs::create_dir_all(&dir).unwrap();

    let good = dir.join("good.toml");
    fs::write(
        &good,
        r#"
service_name = "checkout-resilience"

[server]
port = 7443

[cache]
capacity = 64
ttl_ms = 0

[logging]
level = "debug"
format = "text"
"#,
    )
    .unwrap();
    let config = ServiceConfig::load(&good).unwrap();
    assert_eq!(config.service_name, "checkout-resilience");
    assert_eq!(config.server.address(), "0.0.0.0:7443");
    assert_eq!(config.cache_config().ttl, None);
    assert_eq!(config.cache_config().capacity, 64);
    assert_eq!(config.logging.format, LogFormat::Text);
    assert!(config.watch.enabled);

    let bad = dir.join("bad.toml");
    fs::write(&bad, "[server]\nport = 0\n[watch]\nbuffer = 0\n").unwrap();
    match ServiceConfig::load(&bad).unwrap_err() {
        ConfigError::Invalid(violations) => {
            let fields: Vec<_> = violations.iter().map(|v| v.field.as_str()).collect();
            assert!(fields.contains(&"server.port"), "{fields:?}");
            assert!(fields.contains(&"watch.buffer"), "{fields:?}");
        }
        other => panic!("expected validation failure, got {other:?}"),
    }

    let missing = ServiceConfig::load(dir.join("missing.toml")).unwrap_err();
    assert!(matches!(missing, ConfigError::Io { .. }), "{missing}");

    fs::remove_dir_all(&dir).unwrap();
}

// Installs the global subscriber, so it is the only logging test in this binary.
#[tokio::test]
async fn json_logs_capture_service_activity() {
    let mut config = ServiceConfig::default();
    config.apply_env_overrides([("RESILIENCE_LOGGING_LEVEL", "INFO")]).unwrap();
    let capture = LogCapture::default();
    init_tracing_with_writer(&config.logging, capture.clone()).unwrap();

    let fx = service_fixture();
    fx.service.create_policy(&ExecutionContext::background(), "checkout").await.unwrap();

    if std::env::var_os("RUST_LOG").is_none() {
        let line = capture
            .contents()
            .lines()
            .find(|line| line.contains("policy created"))
            .map(str::to_owned)
            .expect("policy creation was logged");
        let record: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(record["level"], "INFO");
        assert_eq!(record["message"], "policy created");
        assert_eq!(record["policy"], "checkout");
        assert_eq!(record["version"], 1);
    }

    let again = init_tracing_with_writer(&config.logging, capture.clone()).unwrap_err();
    assert!(matches!(again, LoggingError::AlreadyInitialized));
}
