use super::*;

use std::{
    collections::HashMap,
    env,
    time::{SystemTime, UNIX_EPOCH},
};

fn no_env(_: &str) -> Option<String> {
    None
}

fn temp_settings_file(contents: &str) -> std::path::PathBuf {
    let suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir = env::temp_dir().join(format!("chat_sync_config_test_{suffix}"));
    fs::create_dir_all(&dir).expect("temp dir");
    let path = dir.join("sync.toml");
    fs::write(&path, contents).expect("write settings");
    path
}

#[test]
fn missing_file_yields_defaults() {
    let settings = load_settings_from(Path::new("/definitely/not/here/sync.toml"), no_env);
    assert_eq!(settings, SyncSettings::default());
    assert_eq!(settings.first_page_size, 50);
    assert_eq!(settings.older_page_size, 10);
}

#[test]
fn file_values_override_defaults() {
    let path = temp_settings_file(
        r#"
server_base_url = "https://chat.example.com/api"
first_page_size = 40
max_attachment_bytes = 1024
"#,
    );

    let settings = load_settings_from(&path, no_env);
    assert_eq!(settings.server_base_url, "https://chat.example.com/api");
    assert_eq!(settings.first_page_size, 40);
    assert_eq!(settings.max_attachment_bytes, 1024);
    assert_eq!(settings.older_page_size, 10);

    fs::remove_dir_all(path.parent().expect("parent")).expect("cleanup");
}

#[test]
fn env_overrides_win_and_invalid_values_are_ignored() {
    let path = temp_settings_file("older_page_size = 20\n");
    let vars: HashMap<&str, &str> = HashMap::from([
        ("APP__OLDER_PAGE_SIZE", "15"),
        ("APP__MAX_RECONNECT_ATTEMPTS", "not-a-number"),
        ("APP__PUSH_URL", "wss://push.example.com/ws"),
    ]);

    let settings = load_settings_from(&path, |key| vars.get(key).map(|v| v.to_string()));
    assert_eq!(settings.older_page_size, 15);
    assert_eq!(settings.max_reconnect_attempts, 5);
    assert_eq!(
        settings.push_ws_url().expect("push url"),
        "wss://push.example.com/ws"
    );

    fs::remove_dir_all(path.parent().expect("parent")).expect("cleanup");
}

#[test]
fn push_url_is_derived_from_rest_base() {
    let settings = SyncSettings {
        server_base_url: "https://chat.example.com/api/".into(),
        ..SyncSettings::default()
    };
    assert_eq!(
        settings.push_ws_url().expect("push url"),
        "wss://chat.example.com/ws"
    );

    let bad = SyncSettings {
        server_base_url: "chat.example.com".into(),
        ..SyncSettings::default()
    };
    assert!(bad.push_ws_url().is_err());
}

#[test]
fn reconnect_delay_is_capped_exponential() {
    let settings = SyncSettings {
        reconnect_base_delay_ms: 1_000,
        reconnect_max_delay_ms: 5_000,
        ..SyncSettings::default()
    };
    assert_eq!(settings.reconnect_delay(1), Duration::from_millis(1_000));
    assert_eq!(settings.reconnect_delay(2), Duration::from_millis(2_000));
    assert_eq!(settings.reconnect_delay(3), Duration::from_millis(4_000));
    assert_eq!(settings.reconnect_delay(4), Duration::from_millis(5_000));
    assert_eq!(settings.reconnect_delay(40), Duration::from_millis(5_000));
}
