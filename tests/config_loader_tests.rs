use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};

use stream_ingest::config::{ConfigLoader, KvBackend};
use tempfile::TempDir;

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
    unsafe {
        env::remove_var("STREAM_PROFILE");
        env::remove_var("STREAM_API_BIND_ADDR");
        env::remove_var("STREAM_LOG_LEVEL");
        env::remove_var("STREAM_OPERATOR_TOKEN");
        env::remove_var("STREAM_OPERATOR_TOKENS");
        env::remove_var("STREAM_KV_BACKEND");
        env::remove_var("STREAM_MAX_SOURCES_PER_BRANCH");
    }
}

fn write_env_file(dir: &TempDir, name: &str, contents: &str) {
    let path = dir.path().join(name);
    fs::write(path, contents).unwrap();
}

#[test]
fn loads_defaults_when_no_env_present() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with defaults");

    assert_eq!(cfg.profile, "local");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:7000");
    assert_eq!(cfg.log_level, "info");
    assert_eq!(cfg.kv.backend, KvBackend::Sql);
    assert_eq!(cfg.limits.max_sources_per_branch, 100);
    assert!(!cfg.operator_auth_required());
    cfg.bind_addr().expect("default bind addr parses");
    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "STREAM_API_BIND_ADDR=127.0.0.1:3000\n");
    write_env_file(
        &temp_dir,
        ".env.test",
        "STREAM_API_BIND_ADDR=192.168.0.10:5000\nSTREAM_KV_BACKEND=memory\n",
    );
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "STREAM_API_BIND_ADDR=10.0.0.5:6000\n",
    );

    // Select profile via .env.local before profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        "STREAM_PROFILE=test\nSTREAM_API_BIND_ADDR=127.0.0.1:4000\nSTREAM_OPERATOR_TOKEN=test-token-for-layered-test\n",
    );

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.api_bind_addr, "10.0.0.5:6000");
    assert_eq!(cfg.kv.backend, KvBackend::Memory);
    assert_eq!(cfg.operator_tokens, vec!["test-token-for-layered-test"]);
    clear_env();
}

#[test]
fn os_environment_has_highest_precedence() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(
        &temp_dir,
        ".env",
        "STREAM_API_BIND_ADDR=127.0.0.1:3000\nSTREAM_MAX_SOURCES_PER_BRANCH=5\n",
    );

    unsafe {
        env::set_var("STREAM_API_BIND_ADDR", "0.0.0.0:9090");
        env::set_var("STREAM_MAX_SOURCES_PER_BRANCH", "7");
    }

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with env override");
    assert_eq!(cfg.api_bind_addr, "0.0.0.0:9090");
    assert_eq!(cfg.limits.max_sources_per_branch, 7);

    clear_env();
}

#[test]
fn operator_tokens_list_is_split_and_trimmed() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("STREAM_PROFILE", "production");
        env::set_var("STREAM_OPERATOR_TOKENS", " first , ,second");
    }

    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with token list");
    assert_eq!(cfg.operator_tokens, vec!["first", "second"]);
    assert!(cfg.operator_auth_required());

    clear_env();
}

#[test]
fn production_profile_without_tokens_fails() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("STREAM_PROFILE", "production");
    }

    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let err = loader.load().expect_err("tokens are required outside local/test");
    assert!(err.to_string().contains("no operator tokens configured"));

    clear_env();
}

#[test]
fn invalid_numeric_value_names_the_variable() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("STREAM_MAX_SOURCES_PER_BRANCH", "many");
    }

    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let err = loader.load().expect_err("non-numeric limit should fail");
    assert_eq!(err.to_string(), "invalid value 'many' of STREAM_MAX_SOURCES_PER_BRANCH");

    clear_env();
}

#[test]
fn invalid_bind_addr_returns_error() {
    let _guard = env_guard();
    clear_env();

    unsafe {
        env::set_var("STREAM_API_BIND_ADDR", "not-an-addr");
    }
    let temp_dir = TempDir::new().unwrap();
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let err = loader.load().expect_err("invalid bind addr should fail");
    assert!(format!("{}", err).contains("invalid api bind address"));

    clear_env();
}
