use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::atomic::{AtomicU64, Ordering};

fn portcheck_cmd(cwd: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_portcheck"));
    cmd.current_dir(cwd);
    cmd.env_remove("PORTCHECK_CONFIG");
    cmd.env_remove("PORTCHECK_TEST_RUN");
    cmd.env_remove("PORTCHECK_FIXTURES_DIR");
    cmd.env_remove("PORTCHECK_TIMEOUT_SECS");
    cmd.env_remove("PORTCHECK_GO");
    cmd.env_remove("PORTCHECK_GIT");
    cmd.env_remove("PORTCHECK_HG");
    cmd.env_remove("PORTCHECK_LOG_DIR");
    cmd
}

fn make_temp_dir() -> PathBuf {
    static DIR_SEQ: AtomicU64 = AtomicU64::new(0);

    let temp = std::env::temp_dir();
    let seq = DIR_SEQ.fetch_add(1, Ordering::Relaxed);
    let uniq = format!("portcheck-config-test-{}-{seq}", std::process::id());
    let dir = temp.join(uniq);
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn write_file(path: &Path, bytes: &[u8]) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("mkdirs");
    }
    std::fs::write(path, bytes).expect("write");
}

fn show_json(out: &Output) -> serde_json::Value {
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    serde_json::from_slice(&out.stdout).expect("parse json")
}

const CONFIG: &[u8] = br#"
[harness]
fixtures_dir = "fixtures"
timeout_secs = 60
go = "go1.21"

[modules."github.com/foo/bar/v2"]
tests = [
    { version = "v2.0.0" },
    { version = "v2.1.0", name = "sub", paths = ["github.com/foo/bar/v2/sub"], go_version = "go1.18" },
]
"#;

#[test]
fn file_values_resolve_relative_to_the_config_file() {
    let dir = make_temp_dir();
    write_file(&dir.join("conf/portcheck.toml"), CONFIG);

    let out = portcheck_cmd(&dir)
        .args(["--config", "conf/portcheck.toml", "--json", "config", "--show"])
        .output()
        .expect("run portcheck");
    let v = show_json(&out);

    let fixtures = v["harness"]["fixtures_dir"].as_str().expect("fixtures_dir");
    assert!(Path::new(fixtures).is_absolute(), "fixtures_dir: {fixtures}");
    assert!(fixtures.ends_with("fixtures"));
    assert_eq!(v["harness"]["timeout_secs"], 60);
    assert_eq!(v["harness"]["go"], "go1.21");
    assert!(
        v["config_path"]
            .as_str()
            .unwrap_or_default()
            .ends_with("portcheck.toml")
    );

    let module = &v["modules"]["github.com/foo/bar/v2"];
    assert_eq!(module["name"], "bar_v2");
    assert_eq!(module["tests"][0]["name"], "v2.0.0");
    assert_eq!(module["tests"][0]["expected"], "bar_v2@v2.0.0.json");
    assert_eq!(module["tests"][0]["paths"][0], "github.com/foo/bar/v2");
    assert_eq!(module["tests"][1]["expected"], "bar_v2@sub.json");
    assert_eq!(module["tests"][1]["go_version"], "1.18");

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn cli_beats_env_beats_file() {
    let dir = make_temp_dir();
    write_file(&dir.join("portcheck.toml"), CONFIG);

    let v = show_json(
        &portcheck_cmd(&dir)
            .env("PORTCHECK_TIMEOUT_SECS", "90")
            .env("PORTCHECK_GO", "/opt/go/bin/go")
            .args(["--json", "config", "--show"])
            .output()
            .expect("run portcheck"),
    );
    assert_eq!(v["harness"]["timeout_secs"], 90);
    assert_eq!(v["harness"]["go"], "/opt/go/bin/go");

    let v = show_json(
        &portcheck_cmd(&dir)
            .env("PORTCHECK_TIMEOUT_SECS", "90")
            .args(["--timeout", "120", "--json", "config", "--show"])
            .output()
            .expect("run portcheck"),
    );
    assert_eq!(v["harness"]["timeout_secs"], 120);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn env_config_path_is_used_when_no_flag_is_given() {
    let dir = make_temp_dir();
    write_file(&dir.join("elsewhere.toml"), CONFIG);

    let v = show_json(
        &portcheck_cmd(&dir)
            .env("PORTCHECK_CONFIG", dir.join("elsewhere.toml"))
            .args(["--json", "config", "--show"])
            .output()
            .expect("run portcheck"),
    );
    assert_eq!(v["harness"]["timeout_secs"], 60);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn defaults_apply_without_a_config_file() {
    let dir = make_temp_dir();
    let out = portcheck_cmd(&dir)
        .args(["config", "--show"])
        .output()
        .expect("run portcheck");
    assert!(out.status.success());
    let s = String::from_utf8_lossy(&out.stdout);
    assert!(s.contains("timeout_secs = 1800"), "stdout: {s}");
    assert!(s.contains("fixtures_dir = \"testdata/expected\""), "stdout: {s}");
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn list_prints_the_normalized_matrix() {
    let dir = make_temp_dir();
    write_file(&dir.join("portcheck.toml"), CONFIG);
    let out = portcheck_cmd(&dir)
        .arg("list")
        .output()
        .expect("run portcheck");
    assert!(out.status.success());
    let s = String::from_utf8_lossy(&out.stdout);
    let rows: Vec<&str> = s.lines().skip(2).collect();
    assert_eq!(rows.len(), 2, "stdout: {s}");
    assert!(rows[0].contains("bar_v2@v2.0.0.json"));
    assert!(rows[1].contains("github.com/foo/bar/v2/sub"));
    assert!(rows[1].ends_with("go>=1.18"));
    let _ = std::fs::remove_dir_all(&dir);
}
