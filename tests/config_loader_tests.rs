use biztools::config::ConfigLoader;
use std::{
    env, fs,
    path::PathBuf,
    sync::{Mutex, MutexGuard, OnceLock},
};
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

const KEYS: &[&str] = &[
    "BIZTOOLS_PROFILE",
    "BIZTOOLS_LOG_LEVEL",
    "BIZTOOLS_LOG_FORMAT",
    "BIZTOOLS_LOG_NAME",
    "BIZTOOLS_DB_SERVER",
    "BIZTOOLS_DB_PASS",
    "BIZTOOLS_SLACK_BOT_TOKEN",
    "BIZTOOLS_SHARE_GRANT_ATTEMPTS",
    "BIZTOOLS_SHARE_SKIP_EXISTING",
    "BIZTOOLS_SHARE_RETRY_AFTER_CAP_MS",
];

fn clear_env() {
    unsafe {
        for key in KEYS {
            env::remove_var(key);
        }
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
    assert_eq!(cfg.log_level, "info");
    assert_eq!(cfg.log_format, "json");
    assert_eq!(cfg.log_name, "biztools");
    assert_eq!(cfg.share.grant_attempts, 1);
    assert!(!cfg.share.skip_existing);
    assert_eq!(cfg.share.retry_after_cap_ms, 300_000);
    assert!(cfg.slack.bot_token.is_none());
    assert!(cfg.database.server.is_none());
    clear_env();
}

#[test]
fn layered_env_files_apply_in_order() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "BIZTOOLS_LOG_NAME=base\n");
    write_env_file(&temp_dir, ".env.test", "BIZTOOLS_LOG_NAME=profile\n");
    write_env_file(
        &temp_dir,
        ".env.test.local",
        "BIZTOOLS_LOG_NAME=profile-local\nBIZTOOLS_SHARE_GRANT_ATTEMPTS=3\nBIZTOOLS_SHARE_RETRY_AFTER_CAP_MS=2000\n",
    );

    // Select profile via .env.local before profile-specific files load.
    write_env_file(
        &temp_dir,
        ".env.local",
        "BIZTOOLS_PROFILE=test\nBIZTOOLS_LOG_NAME=local\nBIZTOOLS_DB_SERVER=sql01,1433\n",
    );

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with layered env files");

    assert_eq!(cfg.profile, "test");
    assert_eq!(cfg.log_name, "profile-local");
    assert_eq!(cfg.share.grant_attempts, 3);
    assert_eq!(cfg.share.retry_after_cap_ms, 2_000);
    assert_eq!(cfg.database.server.as_deref(), Some("sql01,1433"));
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
        "BIZTOOLS_SLACK_BOT_TOKEN=xoxb-from-file\nBIZTOOLS_SHARE_SKIP_EXISTING=false\n",
    );

    unsafe {
        env::set_var("BIZTOOLS_SLACK_BOT_TOKEN", "xoxb-from-env");
        env::set_var("BIZTOOLS_SHARE_SKIP_EXISTING", "yes");
    }

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads with env override");
    assert_eq!(cfg.slack.bot_token.as_deref(), Some("xoxb-from-env"));
    assert!(cfg.share.skip_existing);

    clear_env();
}

#[test]
fn unprefixed_keys_are_ignored() {
    let _guard = env_guard();
    clear_env();

    let temp_dir = TempDir::new().unwrap();
    write_env_file(&temp_dir, ".env", "LOG_NAME=ignored\nDB_PASS=ignored\n");

    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let cfg = loader.load().expect("config loads");
    assert_eq!(cfg.log_name, "biztools");
    assert!(cfg.database.password.is_none());

    clear_env();
}

#[test]
fn invalid_values_return_errors() {
    let _guard = env_guard();
    clear_env();
    let temp_dir = TempDir::new().unwrap();

    unsafe {
        env::set_var("BIZTOOLS_LOG_FORMAT", "xml");
    }
    let loader = ConfigLoader::with_base_dir(PathBuf::from(temp_dir.path()));
    let err = loader.load().expect_err("unknown log format should fail");
    assert!(format!("{}", err).contains("log format"));
    clear_env();

    unsafe {
        env::set_var("BIZTOOLS_SHARE_SKIP_EXISTING", "maybe");
    }
    let err = loader.load().expect_err("non-boolean flag should fail");
    assert!(format!("{}", err).contains("BIZTOOLS_SHARE_SKIP_EXISTING"));
    clear_env();

    unsafe {
        env::set_var("BIZTOOLS_SHARE_GRANT_ATTEMPTS", "0");
    }
    let err = loader.load().expect_err("zero grant attempts should fail");
    assert!(format!("{}", err).contains("grant attempts"));
    clear_env();
}
