use assert_cmd::Command;
use predicates::str::contains;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread;
use tempfile::tempdir;

fn bin() -> Command {
    let path = assert_cmd::cargo::cargo_bin!("pysetup");
    Command::new(path)
}

fn parse_json(bytes: &[u8]) -> Value {
    serde_json::from_slice(bytes).expect("json output")
}

fn platform_name() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        "windows" => "windows",
        _ => "linux",
    }
}

/// Serves fixed bodies over plain HTTP and records every requested path.
struct Fixture {
    base: String,
    hits: Arc<Mutex<Vec<String>>>,
}

impl Fixture {
    fn start(routes: BTreeMap<String, (u16, String)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let hits = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&hits);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut request_line = String::new();
                if reader.read_line(&mut request_line).is_err() {
                    continue;
                }
                loop {
                    let mut header = String::new();
                    match reader.read_line(&mut header) {
                        Ok(0) => break,
                        Ok(_) if header == "\r\n" || header == "\n" => break,
                        Ok(_) => continue,
                        Err(_) => break,
                    }
                }
                let path = request_line
                    .split_whitespace()
                    .nth(1)
                    .unwrap_or("/")
                    .to_string();
                seen.lock().unwrap().push(path.clone());
                let (status, body) = routes
                    .get(&path)
                    .cloned()
                    .unwrap_or((404, "404: Not Found".to_string()));
                let response = format!(
                    "HTTP/1.1 {status} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
                let _ = stream.flush();
            }
        });
        Self { base, hits }
    }

    fn hits(&self, path: &str) -> usize {
        self.hits
            .lock()
            .unwrap()
            .iter()
            .filter(|hit| hit.as_str() == path)
            .count()
    }
}

fn default_routes() -> BTreeMap<String, (u16, String)> {
    let mut routes = BTreeMap::new();
    routes.insert(
        "/settings/default.json".to_string(),
        (200, r#"{"editor.tabSize": 4, "python.defaultInterpreterPath": "python"}"#.to_string()),
    );
    routes.insert(
        format!("/settings/{}.json", platform_name()),
        (200, r#"{"terminal.integrated.shell": "bash"}"#.to_string()),
    );
    routes.insert("/run.py".to_string(), (200, "print('run')\n".to_string()));
    routes
}

#[cfg(unix)]
fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    fs::write(path, body).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
}

/// Fake `conda` and `code` that keep their state under `state`.
#[cfg(unix)]
fn install_fake_tools(bin_dir: &Path, state: &Path) {
    fs::create_dir_all(bin_dir).unwrap();
    fs::create_dir_all(state).unwrap();
    let conda = format!(
        r##"#!/bin/sh
STATE="{state}"
echo "$*" >> "$STATE/conda.log"
case "$1 $2" in
  "env list")
    echo "# conda environments:"
    echo "#"
    echo "base                  *  $CONDA_PREFIX"
    if [ -f "$STATE/env-created" ]; then
      echo "totogoto                 $CONDA_PREFIX/envs/totogoto"
    fi
    ;;
  "env create")
    mkdir -p "$CONDA_PREFIX/envs/totogoto"
    touch "$STATE/env-created"
    echo "done"
    ;;
  "install -y")
    echo "All requested packages already installed."
    ;;
  *)
    echo "unexpected: $*" >&2
    exit 1
    ;;
esac
"##,
        state = state.display()
    );
    let code = format!(
        r#"#!/bin/sh
STATE="{state}"
touch "$STATE/extensions"
case "$1" in
  --list-extensions)
    cat "$STATE/extensions"
    ;;
  --install-extension)
    echo "$2" >> "$STATE/extensions"
    echo "Extension '$2' was successfully installed."
    ;;
esac
"#,
        state = state.display()
    );
    write_script(&bin_dir.join("conda"), &conda);
    write_script(&bin_dir.join("code"), &code);
}

#[cfg(unix)]
struct Sandbox {
    _dir: tempfile::TempDir,
    workdir: PathBuf,
    bin_dir: PathBuf,
    state: PathBuf,
    conda_prefix: PathBuf,
    config_dir: PathBuf,
}

#[cfg(unix)]
impl Sandbox {
    fn new() -> Self {
        let dir = tempdir().unwrap();
        let workdir = dir.path().join("project");
        let bin_dir = dir.path().join("bin");
        let state = dir.path().join("state");
        let conda_prefix = dir.path().join("miniconda3");
        let config_dir = dir.path().join("config");
        fs::create_dir_all(&workdir).unwrap();
        fs::create_dir_all(&conda_prefix).unwrap();
        install_fake_tools(&bin_dir, &state);
        Self {
            _dir: dir,
            workdir,
            bin_dir,
            state,
            conda_prefix,
            config_dir,
        }
    }

    fn command(&self, fixture: &Fixture) -> Command {
        let mut cmd = bin();
        cmd.env("PATH", format!("{}:/usr/bin:/bin", self.bin_dir.display()))
            .env("CONDA_PREFIX", &self.conda_prefix)
            .env("PYSETUP_CONFIG_DIR", &self.config_dir)
            .env_remove("PYSETUP_CONFIG")
            .env_remove("HTTP_PROXY")
            .env_remove("http_proxy")
            .env_remove("ALL_PROXY")
            .env_remove("all_proxy")
            .env(
                "PYSETUP_SETTINGS_BASE_URL",
                format!("{}/settings", fixture.base),
            )
            .env("PYSETUP_HELPER_SCRIPT_URL", format!("{}/run.py", fixture.base))
            .arg("--dir")
            .arg(&self.workdir);
        cmd
    }
}

#[cfg(unix)]
#[test]
fn fresh_directory_is_fully_bootstrapped() {
    let sandbox = Sandbox::new();
    let fixture = Fixture::start(default_routes());

    let output = sandbox
        .command(&fixture)
        .arg("--json")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    assert!(value["ok"].as_bool().unwrap());
    let result = &value["result"];
    assert_eq!(result["platform"], platform_name());
    assert_eq!(result["base_package"], "requests");
    assert_eq!(result["definition_file"], "created");
    assert_eq!(result["environment"], "created");
    assert_eq!(result["helper_script"], "fetched");
    let extensions = result["extensions"].as_array().unwrap();
    assert_eq!(extensions.len(), 5);
    assert!(extensions.iter().all(|ext| ext["action"] == "installed"));

    let definition = fs::read_to_string(sandbox.workdir.join("environment.yml")).unwrap();
    assert!(definition.contains("name: totogoto"));
    assert!(definition.contains("python=3.9.5"));
    assert_eq!(
        definition.contains("pywin32=228"),
        std::env::consts::OS == "windows"
    );

    let settings: Value = serde_json::from_str(
        &fs::read_to_string(sandbox.workdir.join(".vscode").join("settings.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(
        settings,
        json!({
            "editor.tabSize": 4,
            "python.defaultInterpreterPath": "python",
            "terminal.integrated.shell": "bash"
        })
    );

    assert_eq!(
        fs::read_to_string(sandbox.workdir.join("run.py")).unwrap(),
        "print('run')\n"
    );
    assert!(sandbox.conda_prefix.join("envs").join("totogoto").is_dir());
    let conda_log = fs::read_to_string(sandbox.state.join("conda.log")).unwrap();
    assert!(conda_log.contains("install -y requests"));
    assert!(conda_log.contains("env create -f environment.yml"));
}

#[cfg(unix)]
#[test]
fn second_run_converges_without_redoing_work() {
    let sandbox = Sandbox::new();
    let fixture = Fixture::start(default_routes());

    sandbox.command(&fixture).assert().success();
    let definition_path = sandbox.workdir.join("environment.yml");
    fs::write(&definition_path, "name: totogoto\n# pinned by hand\n").unwrap();
    let settings_path = sandbox.workdir.join(".vscode").join("settings.json");
    fs::write(&settings_path, r#"{"editor.tabSize": 8, "files.autoSave": "off"}"#).unwrap();

    let output = sandbox
        .command(&fixture)
        .arg("--json")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let result = parse_json(&output)["result"].clone();
    assert_eq!(result["definition_file"], "present");
    assert_eq!(result["environment"], "present");
    assert_eq!(result["helper_script"], "present");
    assert!(result["extensions"]
        .as_array()
        .unwrap()
        .iter()
        .all(|ext| ext["action"] == "present"));

    assert_eq!(
        fs::read_to_string(&definition_path).unwrap(),
        "name: totogoto\n# pinned by hand\n"
    );
    let settings: Value =
        serde_json::from_str(&fs::read_to_string(&settings_path).unwrap()).unwrap();
    assert_eq!(settings["editor.tabSize"], 4);
    assert_eq!(settings["files.autoSave"], "off");
    assert_eq!(fixture.hits("/run.py"), 1);
    assert_eq!(fixture.hits("/settings/default.json"), 2);

    let conda_log = fs::read_to_string(sandbox.state.join("conda.log")).unwrap();
    assert_eq!(conda_log.matches("env create").count(), 1);
}

#[cfg(unix)]
#[test]
fn keep_local_settings_preserves_customizations() {
    let sandbox = Sandbox::new();
    let fixture = Fixture::start(default_routes());
    let settings_path = sandbox.workdir.join(".vscode").join("settings.json");
    fs::create_dir_all(settings_path.parent().unwrap()).unwrap();
    fs::write(&settings_path, r#"{"editor.tabSize": 2}"#).unwrap();

    sandbox
        .command(&fixture)
        .arg("--keep-local-settings")
        .assert()
        .success();

    let settings: Value =
        serde_json::from_str(&fs::read_to_string(&settings_path).unwrap()).unwrap();
    assert_eq!(settings["editor.tabSize"], 2);
    assert_eq!(settings["terminal.integrated.shell"], "bash");
}

#[cfg(unix)]
#[test]
fn missing_remote_settings_are_tolerated() {
    let sandbox = Sandbox::new();
    let mut routes = BTreeMap::new();
    routes.insert("/run.py".to_string(), (200, "print('run')\n".to_string()));
    let fixture = Fixture::start(routes);

    sandbox.command(&fixture).assert().success();

    let settings =
        fs::read_to_string(sandbox.workdir.join(".vscode").join("settings.json")).unwrap();
    let value: Value = serde_json::from_str(&settings).unwrap();
    assert_eq!(value, json!({}));
}

#[cfg(unix)]
#[test]
fn missing_editor_aborts_the_run() {
    let sandbox = Sandbox::new();
    fs::remove_file(sandbox.bin_dir.join("code")).unwrap();
    let fixture = Fixture::start(default_routes());

    let output = sandbox
        .command(&fixture)
        .arg("--json")
        .assert()
        .failure()
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    assert!(!value["ok"].as_bool().unwrap());
    let error = value["error"].as_str().unwrap_or_default();
    assert!(error.contains("`code` is not installed"));
    assert!(sandbox.workdir.join("environment.yml").exists());
    assert!(!sandbox.workdir.join(".vscode").exists());
    assert!(!sandbox.workdir.join("run.py").exists());
    assert_eq!(fixture.hits("/run.py"), 0);
}

#[cfg(unix)]
#[test]
fn failed_helper_download_is_reported_without_partial_file() {
    let sandbox = Sandbox::new();
    let mut routes = default_routes();
    routes.remove("/run.py");
    let fixture = Fixture::start(routes);

    let output = sandbox
        .command(&fixture)
        .arg("--json")
        .assert()
        .success()
        .stderr(contains("returned HTTP 404"))
        .get_output()
        .stdout
        .clone();

    let result = parse_json(&output)["result"].clone();
    assert_eq!(result["helper_script"], "failed");
    assert_eq!(result["environment"], "created");
    assert!(sandbox.workdir.join(".vscode").join("settings.json").is_file());
    assert!(!sandbox.workdir.join("run.py").exists());
    let leftovers: Vec<_> = fs::read_dir(&sandbox.workdir)
        .unwrap()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().contains(".tmp."))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn invalid_config_file_is_rejected() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.yaml");
    fs::write(&config_path, "version: 1\nunknown_field: true\n").unwrap();

    let output = bin()
        .arg("--json")
        .arg("--config")
        .arg(&config_path)
        .arg("--dir")
        .arg(dir.path())
        .assert()
        .failure()
        .get_output()
        .stdout
        .clone();

    let value = parse_json(&output);
    assert!(!value["ok"].as_bool().unwrap());
    let error = value["error"].as_str().unwrap_or_default();
    assert!(error.contains("unknown_field") || error.contains("unknown field"));
    assert!(!dir.path().join("environment.yml").exists());
}
