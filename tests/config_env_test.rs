use lookout::Settings;
use std::env;
use tempfile::TempDir;

#[test]
fn test_env_override() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("settings.toml");
    std::fs::write(&config_path, "version = 1\n").unwrap();

    unsafe {
        // Double underscore separates nested levels, so
        // LOOKOUT_WATCH__GRACE_PERIOD_MS maps to watch.grace_period_ms
        env::set_var("LOOKOUT_WATCH__GRACE_PERIOD_MS", "1234");
    }

    let settings = Settings::load_from(&config_path).unwrap_or_default();

    println!("Grace period: {}", settings.watch.grace_period_ms);
    assert_eq!(
        settings.watch.grace_period_ms, 1234,
        "grace period should be overridden"
    );

    unsafe {
        env::remove_var("LOOKOUT_WATCH__GRACE_PERIOD_MS");
    }
}

#[test]
fn test_env_overrides_config_file() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("settings.toml");

    let toml_content = r#"
[watch]
reuse_linger_ms = 5000

[server]
separate_process = true
"#;
    std::fs::write(&config_path, toml_content).unwrap();

    unsafe {
        env::set_var("LOOKOUT_WATCH__REUSE_LINGER_MS", "250");
        env::set_var("LOOKOUT_SERVER__SEPARATE_PROCESS", "false");
    }

    let settings = Settings::load_from(&config_path).unwrap_or_default();

    println!("Reuse linger: {}", settings.watch.reuse_linger_ms);
    println!("Separate process: {}", settings.server.separate_process);

    // Env vars win over the config file
    assert_eq!(settings.watch.reuse_linger_ms, 250);
    assert!(!settings.server.separate_process);

    unsafe {
        env::remove_var("LOOKOUT_WATCH__REUSE_LINGER_MS");
        env::remove_var("LOOKOUT_SERVER__SEPARATE_PROCESS");
    }
}
