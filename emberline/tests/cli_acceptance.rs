use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
    xdg_runtime: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");
        let xdg_runtime = base.join("xdg-runtime");

        fs::create_dir_all(&home).expect("failed to create HOME");
        fs::create_dir_all(&xdg_data).expect("failed to create XDG_DATA_HOME");
        fs::create_dir_all(&xdg_config).expect("failed to create XDG_CONFIG_HOME");
        fs::create_dir_all(&xdg_state).expect("failed to create XDG_STATE_HOME");
        fs::create_dir_all(&xdg_runtime).expect("failed to create XDG_RUNTIME_DIR");

        let env = Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
            xdg_runtime,
        };
        env.write_config("api_key = \"em_test_cli\"\n");
        env
    }

    fn write_config(&self, content: &str) {
        let config_dir = self.xdg_config.join("emberline");
        fs::create_dir_all(&config_dir).expect("failed to create config dir");
        fs::write(config_dir.join("config.toml"), content).expect("failed to write config");
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("emberline/queue.db")
    }
}

fn run(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("emberline"));

    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env("XDG_RUNTIME_DIR", &env.xdg_runtime)
        .output()
        .unwrap_or_else(|e| panic!("failed to execute emberline: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "emberline {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

fn stdout_of(env: &CliTestEnv, args: &[&str]) -> String {
    let output = run(env, args);
    assert_success(args, &output);
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn open_creates_database_and_session() {
    let env = CliTestEnv::new();

    let stdout = stdout_of(&env, &["open"]);
    assert!(
        stdout.contains("Opened session"),
        "unexpected output: {stdout}"
    );
    assert!(env.db_path().exists(), "database file should be created");

    let status = stdout_of(&env, &["status"]);
    assert!(status.contains("Open session:"), "status output: {status}");
    assert!(!status.contains("Open session:     none"));
}

#[test]
fn tagging_accumulates_events_in_queue() {
    let env = CliTestEnv::new();

    stdout_of(&env, &["open"]);
    stdout_of(&env, &["tag", "purchase", "-a", "sku=42", "-a", "qty=1"]);
    stdout_of(&env, &["screen", "checkout"]);
    stdout_of(&env, &["close"]);

    // open + custom + flow + close
    let status = stdout_of(&env, &["status"]);
    assert!(
        status.contains("Unclaimed events: 4"),
        "status output: {status}"
    );
    assert!(status.contains("Pending blobs:    0"));
}

#[test]
fn malformed_attribute_is_rejected() {
    let env = CliTestEnv::new();
    stdout_of(&env, &["open"]);

    let args = ["tag", "purchase", "-a", "no-equals-sign"];
    let output = run(&env, &args);
    assert!(!output.status.success());

    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("expected key=value"),
        "stderr: {stderr}"
    );
}

#[test]
fn duplicate_screen_is_reported_as_not_recorded() {
    let env = CliTestEnv::new();
    stdout_of(&env, &["open"]);

    let first = stdout_of(&env, &["screen", "home"]);
    assert!(first.contains("Recorded screen 'home'"));

    let second = stdout_of(&env, &["screen", "home"]);
    assert!(
        second.contains("not recorded"),
        "duplicate should be suppressed: {second}"
    );
}

#[test]
fn opt_out_suppresses_tagging_until_opt_in() {
    let env = CliTestEnv::new();
    stdout_of(&env, &["open"]);

    let out = stdout_of(&env, &["opt-out"]);
    assert!(out.contains("Opted out"));

    let tagged = stdout_of(&env, &["tag", "ignored"]);
    assert!(tagged.contains("not recorded"), "output: {tagged}");

    let status = stdout_of(&env, &["status"]);
    assert!(status.contains("Opted out:        yes"));

    stdout_of(&env, &["opt-in"]);
    // The close from opt-out is still inside the reconnect window, so the
    // reopen may resume it; either way a session must be live again.
    let reopened = stdout_of(&env, &["open"]);
    assert!(
        reopened.contains("Opened session") || reopened.contains("Resumed session"),
        "output: {reopened}"
    );
}

#[test]
fn upload_without_uploader_config_prints_guidance() {
    let env = CliTestEnv::new();
    stdout_of(&env, &["open"]);
    stdout_of(&env, &["close"]);

    let stdout = stdout_of(&env, &["upload"]);
    assert!(
        stdout.contains("Uploader is disabled"),
        "output: {stdout}"
    );
    assert!(stdout.contains("server_url"));
}

#[test]
fn status_reports_uploader_configuration() {
    let env = CliTestEnv::new();
    env.write_config(
        "api_key = \"em_test_cli\"\n\n[uploader]\nenabled = true\nserver_url = \"https://collect.example.com\"\n",
    );

    let status = stdout_of(&env, &["status"]);
    assert!(status.contains("Uploader enabled: true"));
    assert!(status.contains("https://collect.example.com"));
}
