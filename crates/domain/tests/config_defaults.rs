use cf_domain::config::RuntimeConfig;

#[test]
fn default_lease_ttl_is_thirty_seconds() {
    let config = RuntimeConfig::default();
    assert_eq!(config.lease.ttl_secs, 30);
    assert_eq!(
        config.lease.renew_interval(),
        std::time::Duration::from_secs(10)
    );
}

#[test]
fn partial_toml_overrides_leave_other_sections_default() {
    let toml_str = r#"
[lease]
ttl_secs = 120

[entity_extraction]
enabled = true
similarity_threshold = 0.9
"#;
    let config: RuntimeConfig = toml::from_str(toml_str).unwrap();
    assert_eq!(config.lease.ttl_secs, 120);
    assert!(config.entity_extraction.enabled);
    assert!((config.entity_extraction.similarity_threshold - 0.9).abs() < 1e-6);
    // Untouched sections keep their defaults.
    assert_eq!(config.rag.chunk_size, 1_000);
    assert_eq!(config.max_chain_depth, 25);
    assert!(config.assets.resolve_in_llm);
}

#[test]
fn serialized_default_config_round_trips() {
    let config = RuntimeConfig::default();
    let serialized = toml::to_string(&config).unwrap();
    let parsed: RuntimeConfig = toml::from_str(&serialized).unwrap();
    assert_eq!(parsed.lease.ttl_secs, config.lease.ttl_secs);
    assert_eq!(parsed.rag.top_k, config.rag.top_k);
    assert_eq!(parsed.stream.buffer, config.stream.buffer);
}
