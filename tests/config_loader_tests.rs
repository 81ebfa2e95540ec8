use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};

use tempfile::TempDir;
use trainwatch::config::{ConfigError, ConfigLoader};

const KEYS: &[&str] = &[
    "TRAINWATCH_PROFILE",
    "TRAINWATCH_API_BIND_ADDR",
    "TRAINWATCH_LOG_LEVEL",
    "TRAINWATCH_MQTT_BROKER_URL",
    "TRAINWATCH_MQTT_TOPIC",
    "TRAINWATCH_MQTT_QOS",
    "TRAINWATCH_MQTT_PASSWORD",
    "TRAINWATCH_MQTT_USERNAME",
    "TRAINWATCH_MQTT_AUTOMATIC_RECONNECT",
    "TRAINWATCH_RELAY_COLLECTOR_BASE_URL",
    "TRAINWATCH_RELAY_MAX_ATTEMPTS",
];

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn env_guard() -> MutexGuard<'static, ()> {
    env_lock()
        .lock()
        .unwrap_or_else(|poison| poison.into_inner())
}

fn clear_env() {
    for key in KEYS {
        unsafe {
            env::remove_var(key);
        }
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    fs::write(dir.path().join(name), contents).unwrap();
}

fn loader(dir: &TempDir) -> ConfigLoader {
    ConfigLoader::with_base_dir(PathBuf::from(dir.path()))
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();
    let temp_dir = TempDir::new().unwrap();

    let cfg = loader(&temp_dir).load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:8080");
    assert_eq!(cfg.mqtt.topic, "train/detection");
    assert_eq!(cfg.mqtt.qos, 1);
    assert!(cfg.mqtt.automatic_reconnect);
    assert_eq!(cfg.relay.max_attempts, 5);
    cfg.bind_addr().expect("default bind addr parses");
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "TRAINWATCH_MQTT_TOPIC=base/topic\n");
    write_env_file(
        &temp_dir,
        ".env.local",
        "TRAINWATCH_PROFILE=test\nTRAINWATCH_MQTT_TOPIC=local/topic\n",
    );
    write_env_file(&temp_dir, ".env.test", "TRAINWATCH_MQTT_TOPIC=test/topic\n");
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "TRAINWATCH_MQTT_TOPIC=test-local/topic\nTRAINWATCH_RELAY_MAX_ATTEMPTS=2\n",
    );

    let cfg = loader(&temp_dir).load().expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.mqtt.topic, "test-local/topic");
    assert_eq!(cfg.relay.max_attempts, 2);
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "TRAINWATCH_MQTT_BROKER_URL=tcp://file-broker:1883\nTRAINWATCH_MQTT_AUTOMATIC_RECONNECT=true\n",
    );

    unsafe {
        env::set_var("TRAINWATCH_MQTT_BROKER_URL", "mqtt://env-broker:1884");
        env::set_var("TRAINWATCH_MQTT_AUTOMATIC_RECONNECT", "false");
    }

    let cfg = loader(&temp_dir).load().expect("config loads with env override");
    assert_eq!(cfg.mqtt.broker_url, "mqtt://env-broker:1884");
    assert!(!cfg.mqtt.automatic_reconnect);
    assert_eq!(cfg.mqtt.endpoint().unwrap().port, 1884);

    clear_env();
}

#[test]
fn unparseable_broker_url_aborts_load() {
    let _guard = env_guard();
    clear_env();
    let temp_dir = TempDir::new().unwrap();

    unsafe {
        env::set_var("TRAINWATCH_MQTT_BROKER_URL", "broker without scheme");
    }

    let result = loader(&temp_dir).load();
    assert!(matches!(result, Err(ConfigError::InvalidBrokerUrl { .. })));

    clear_env();
}

#[test]
fn non_numeric_values_are_rejected() {
    let _guard = env_guard();
    clear_env();
    let temp_dir = TempDir::new().unwrap();

    unsafe {
        env::set_var("TRAINWATCH_RELAY_MAX_ATTEMPTS", "many");
    }

    match loader(&temp_dir).load() {
        Err(ConfigError::InvalidValue { key, value }) => {
            assert_eq!(key, "TRAINWATCH_RELAY_MAX_ATTEMPTS");
            assert_eq!(value, "many");
        }
        other => panic!("unexpected result: {other:?}"),
    }

    clear_env();
}

#[test]
fn invalid_qos_and_bind_addr_return_errors() {
    let _guard = env_guard();
    clear_env();
    let temp_dir = TempDir::new().unwrap();

    unsafe {
        env::set_var("TRAINWATCH_MQTT_QOS", "3");
    }
    assert!(matches!(
        loader(&temp_dir).load(),
        Err(ConfigError::InvalidMqttQos { value: 3 })
    ));
    clear_env();

    unsafe {
        env::set_var("TRAINWATCH_API_BIND_ADDR", "not-an-addr");
    }
    assert!(matches!(
        loader(&temp_dir).load(),
        Err(ConfigError::InvalidBindAddr { .. })
    ));
    clear_env();
}

#[test]
fn password_is_redacted() {
    let _guard = env_guard();
    clear_env();
    let temp_dir = TempDir::new().unwrap();

    unsafe {
        env::set_var("TRAINWATCH_MQTT_USERNAME", "device");
        env::set_var("TRAINWATCH_MQTT_PASSWORD", "s3cret");
    }

    let cfg = loader(&temp_dir).load().unwrap();
    assert_eq!(cfg.mqtt.password.as_deref(), Some("s3cret"));

    let json = cfg.redacted_json().unwrap();
    assert!(!json.contains("s3cret"));

    clear_env();
}
