//! Settings persistence through the config-dir override

use eipc_core::config::toml_config::{config_exists, load_settings, save_settings};
use eipc_core::config::ProviderEntry;
use eipc_core::provider::Service;
use tempfile::tempdir;

#[test]
fn settings_roundtrip_and_autostart_flag() {
    let dir = tempdir().unwrap();
    std::env::set_var("EIPC_CONFIG_DIR", dir.path());

    // Nothing persisted yet; defaults come back
    assert!(!config_exists().unwrap());
    let mut config = load_settings().unwrap();
    assert!(!config.settings.autostart());
    assert!(config.settings.pick_provider().is_none());

    // Configure a provider and flip autostart, the way the CLI does
    config.settings.providers.push(ProviderEntry {
        domain: "example.org".to_string(),
        services: [Service::Tunnel, Service::Mail].into_iter().collect(),
    });
    config.settings.default_provider = Some("example.org".to_string());
    config.settings.set_autostart(true);
    save_settings(&config).unwrap();
    assert!(config_exists().unwrap());

    let loaded = load_settings().unwrap();
    assert!(loaded.settings.autostart());
    assert_eq!(
        loaded.settings.pick_provider(),
        Some("example.org".to_string())
    );
    assert!(loaded.settings.tunnel_enabled("example.org"));
    assert!(loaded
        .settings
        .enabled_services("example.org")
        .contains(&Service::Mail));

    // Autostart off persists too
    let mut config = loaded;
    config.settings.set_autostart(false);
    save_settings(&config).unwrap();
    assert!(!load_settings().unwrap().settings.autostart());

    std::env::remove_var("EIPC_CONFIG_DIR");
}
