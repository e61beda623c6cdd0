use super::*;

#[test]
fn defaults_match_documented_values() {
    let config = SessionConfig::local("alpha");

    assert_eq!(config.persistence, Persistence::Local);
    assert_eq!(config.ready_timeout, Duration::from_secs(120));
    assert_eq!(config.settle_delay, Some(Duration::from_secs(3)));
    assert_eq!(config.pairing_window, Duration::from_secs(300));
    assert!(config.takeover_on_conflict);
    assert_eq!(config.qr_max_retries, 1);
    assert!(config.browser.headless);
    assert!(config.browser.args.is_empty());
    assert_eq!(
        EngineConfig::default().dispatch.send_interval,
        Duration::from_millis(1000)
    );
}

#[test]
fn remote_sessions_get_store_and_sandbox_free_browser_args() {
    let config = SessionConfig::remote("alpha", "sqlite://sessions.db");

    assert_eq!(
        config.persistence,
        Persistence::Remote {
            store_uri: "sqlite://sessions.db".to_string(),
            backup_sync_interval: Duration::from_secs(300),
        }
    );
    assert!(config.persistence.is_remote());
    assert!(config.browser.args.iter().any(|arg| arg == "--no-sandbox"));
    assert_eq!(config.session_id.as_str(), "alpha");
}
