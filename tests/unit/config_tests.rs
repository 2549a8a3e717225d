use std::io::Write;

use agent_conduit::config::{GlobalConfig, HOST_COMMAND_ENV};
use agent_conduit::AppError;

fn sample_toml() -> &'static str {
    r#"
[client]
host_command = "node dist/host.js --stdio"
request_timeout_seconds = 12
stream_capacity = 64
max_line_bytes = 1048576

[host]
name = "demo-host"
max_rounds = 4

[host.retry]
max_retries = 2
base_delay_ms = 50

[[host.agents]]
name = "Echo"
system_prompt = "Repeat after me."
toolkits = ["utility"]

[[host.agents]]
name = "Writer"
model = "echo"
toolkits = ["text"]

[[host.triggers]]
name = "build-finished"
agent = "Writer"
description = "CI webhook"
"#
}

#[test]
fn parses_valid_config() {
    let config = GlobalConfig::from_toml_str(sample_toml()).expect("config parses");

    assert_eq!(config.client.host_command, "node dist/host.js --stdio");
    assert_eq!(config.client.request_timeout_seconds, 12);
    assert_eq!(config.client.stream_capacity, 64);
    assert_eq!(config.client.unsolicited_capacity, 100, "unset fields keep defaults");
    assert_eq!(config.client.max_line_bytes, Some(1_048_576));
    assert_eq!(config.host.name, "demo-host");
    assert_eq!(config.host.retry.max_retries, 2);
    assert_eq!(config.host.agents.len(), 2);
    assert_eq!(config.host.agents[0].model, "echo", "model defaults to echo");
    assert_eq!(config.host.triggers[0].trigger_type, "webhook");
}

#[test]
fn empty_file_uses_defaults() {
    let config = GlobalConfig::from_toml_str("").expect("empty config parses");

    assert_eq!(config.client.host_command, "conduit-host");
    assert_eq!(config.client.request_timeout_seconds, 30);
    assert_eq!(config.client.stop_grace_seconds, 5);
    assert!(config.client.max_line_bytes.is_none());
    assert_eq!(config.host.max_rounds, 16);
    assert_eq!(config.host.retry.max_retries, 3);
    assert_eq!(config.host.agents[0].name, "Echo");
    assert_eq!(config.host.triggers.len(), 1);
}

/// A `[host]` table without triggers does not inherit the default trigger.
#[test]
fn host_table_without_triggers_has_none() {
    let config = GlobalConfig::from_toml_str(
        r#"
[host]
name = "bare"
"#,
    )
    .expect("config parses");
    assert!(config.host.triggers.is_empty());
}

#[test]
fn rejects_zero_capacity() {
    let result = GlobalConfig::from_toml_str("[client]\nstream_capacity = 0\n");
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn rejects_zero_max_rounds() {
    let result = GlobalConfig::from_toml_str("[host]\nmax_rounds = 0\n");
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn rejects_duplicate_agent_names() {
    let toml = r#"
[[host.agents]]
name = "Echo"

[[host.agents]]
name = "Echo"
"#;
    let err = GlobalConfig::from_toml_str(toml).expect_err("duplicate agents rejected");
    assert!(err.to_string().contains("duplicate agent name"));
}

#[test]
fn rejects_trigger_for_unknown_agent() {
    let toml = r#"
[[host.agents]]
name = "Echo"

[[host.triggers]]
name = "hook"
agent = "Ghost"
"#;
    let err = GlobalConfig::from_toml_str(toml).expect_err("unknown agent rejected");
    assert!(err.to_string().contains("Ghost"));
}

#[test]
fn invalid_toml_is_config_error() {
    let result = GlobalConfig::from_toml_str("[client\nhost_command = ");
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(sample_toml().as_bytes()).expect("write config");

    let config = GlobalConfig::load_from_path(file.path()).expect("config loads");
    assert_eq!(config.host.name, "demo-host");
}

#[test]
fn missing_file_is_config_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let result = GlobalConfig::load_from_path(dir.path().join("absent.toml"));
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn toolkit_references_are_checked() {
    let config = GlobalConfig::from_toml_str(sample_toml()).expect("config parses");
    assert!(config.host.validate_toolkits(&["utility", "text"]).is_ok());
    assert!(matches!(
        config.host.validate_toolkits(&["utility"]),
        Err(AppError::Config(msg)) if msg.contains("text")
    ));
}

// ── Environment override ─────────────────────────────────────────────────────

#[test]
#[serial_test::serial]
fn env_overrides_host_command() {
    std::env::set_var(HOST_COMMAND_ENV, "python -m host");
    let config = GlobalConfig::load(None);
    std::env::remove_var(HOST_COMMAND_ENV);

    let config = config.expect("config loads");
    assert_eq!(config.client.host_command, "python -m host");
}

#[test]
#[serial_test::serial]
fn blank_env_value_is_ignored() {
    std::env::set_var(HOST_COMMAND_ENV, "   ");
    let config = GlobalConfig::load(None);
    std::env::remove_var(HOST_COMMAND_ENV);

    assert_eq!(config.expect("config loads").client.host_command, "conduit-host");
}
