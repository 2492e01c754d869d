use std::time::Duration;

use kmsproxy::config::{LogLevel, toml};

#[test]
pub fn parse_full_config() {
    let input = r#"
    domains = ["kms.example.com", "kms-alt.example.com"]
    email = "ops@example.com"
    staging = true
    workdir = "/var/lib/kmsproxy"
    listen = "127.0.0.1:4443"
    log_level = "debug"

    [challenge]
    create_url = "https://dns.example.com/records"
    delete_url = "https://dns.example.com/records/{record_id}"
    propagation_secs = 5

    [challenge.headers]
    Authorization = "Bearer token"

    [kms]
    endpoint = "https://keys.example.com"
    key_id = "alias/talos"

    [timeouts]
    handoff_secs = 30
    "#;

    let config = toml::parse(input).expect("Failed to parse TOML config");
    config.validate().expect("Config should be valid");

    assert_eq!(config.primary_domain(), Some("kms.example.com"));
    assert_eq!(config.domains.len(), 2);
    assert!(config.staging);
    assert_eq!(config.workdir.to_string_lossy(), "/var/lib/kmsproxy");
    assert_eq!(config.listen.to_string(), "127.0.0.1:4443");
    assert_eq!(config.log_level, Some(LogLevel::Debug));
    assert_eq!(config.challenge.propagation_delay(), Duration::from_secs(5));
    assert_eq!(
        config.challenge.headers.get("Authorization").map(String::as_str),
        Some("Bearer token")
    );
    assert_eq!(config.kms.key_id, "alias/talos");
    assert_eq!(config.timeouts.handoff(), Duration::from_secs(30));
    // Untouched timeouts keep their defaults
    assert_eq!(config.timeouts.authority(), Duration::from_secs(300));
}

#[test]
pub fn parse_empty_config() {
    let config = toml::parse("").expect("Failed to parse empty TOML config");

    assert!(config.domains.is_empty());
    assert!(!config.staging);
    assert_eq!(config.workdir.to_string_lossy(), ".kmsproxy");
    assert_eq!(config.listen.to_string(), "0.0.0.0:4050");
    assert_eq!(config.kms.timeout(), Duration::from_secs(10));
    assert_eq!(config.timeouts.handshake(), Duration::from_secs(10));

    // Parsing succeeds, running does not
    assert!(config.validate().is_err());
}

#[test]
pub fn parse_invalid_config() {
    assert!(toml::parse("domains = \"not-a-list\"").is_err());
    assert!(toml::parse("listen = \"nowhere\"").is_err());
}

#[test]
pub fn load_missing_file() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    assert!(toml::load(&temp_dir.path().join("missing.toml")).is_err());
}
