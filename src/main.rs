use clap::Parser;
use dirs::home_dir;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};
use std::env;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

const DOWNLOAD_CHUNK_BYTES: usize = 1024;
const ENV_LIST_HEADER_LINES: usize = 2;

const DEFAULT_EXTENSIONS: &[&str] = &[
    "ms-python.vscode-pylance",
    "ms-toolsai.jupyter",
    "ms-toolsai.jupyter-keymap",
    "ms-toolsai.jupyter-renderers",
    "ms-vsliveshare.vsliveshare",
];

#[derive(Parser, Debug)]
#[command(
    name = "pysetup",
    version,
    about = "Bootstrap a conda environment and VS Code workspace in the current directory"
)]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,
    /// Directory holding environment.yml, .vscode/ and run.py (defaults to the current directory).
    #[arg(long)]
    dir: Option<PathBuf>,
    #[arg(long)]
    json: bool,
    /// Let existing local editor settings win over the remote defaults.
    #[arg(long)]
    keep_local_settings: bool,
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Debug, Error)]
enum SetupError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("http error: {url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },
    #[error("`{0}` is not installed or not on PATH; install VS Code and its command line launcher first")]
    EditorMissing(String),
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct Config {
    version: u32,
    environment: EnvironmentSection,
    editor: EditorSection,
    remote: RemoteSection,
    settings: SettingsSection,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct EnvironmentSection {
    name: String,
    definition_file: String,
    conda_binary: String,
    conda_root: Option<String>,
    base_package: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct EditorSection {
    binary: String,
    settings_dir: String,
    extensions: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct RemoteSection {
    settings_base_url: String,
    helper_script_url: String,
    helper_script_file: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default, deny_unknown_fields)]
struct SettingsSection {
    precedence: Precedence,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
enum Precedence {
    #[default]
    RemoteWins,
    LocalWins,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            environment: EnvironmentSection::default(),
            editor: EditorSection::default(),
            remote: RemoteSection::default(),
            settings: SettingsSection::default(),
        }
    }
}

impl Default for EnvironmentSection {
    fn default() -> Self {
        Self {
            name: "totogoto".to_string(),
            definition_file: "environment.yml".to_string(),
            conda_binary: "conda".to_string(),
            conda_root: None,
            base_package: "requests".to_string(),
        }
    }
}

impl Default for EditorSection {
    fn default() -> Self {
        Self {
            binary: "code".to_string(),
            settings_dir: ".vscode".to_string(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            settings_base_url: "https://raw.githubusercontent.com/totogoto/pysetup/main/settings"
                .to_string(),
            helper_script_url: "https://raw.githubusercontent.com/totogoto/pysetup/main/run.py"
                .to_string(),
            helper_script_file: "run.py".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum Platform {
    Linux,
    Windows,
    Darwin,
}

impl Platform {
    fn from_os(os: &str) -> Result<Self, SetupError> {
        match os {
            "linux" => Ok(Platform::Linux),
            "windows" => Ok(Platform::Windows),
            "macos" | "darwin" => Ok(Platform::Darwin),
            other => Err(SetupError::Config(format!("unsupported platform: {other}"))),
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Windows => "windows",
            Platform::Darwin => "darwin",
        }
    }

    fn default_conda_root(self, username: &str) -> PathBuf {
        match self {
            Platform::Linux => PathBuf::from(format!("/home/{username}/miniconda3")),
            Platform::Windows => PathBuf::from(format!("C:/Users/{username}/miniconda3")),
            Platform::Darwin => PathBuf::from(format!("/Users/{username}/miniconda3")),
        }
    }
}

/// Which settings document a layer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SettingsSource {
    Existing,
    Default,
    Platform,
}

/// Ordered lowest to highest: later sources overwrite earlier ones on key collision.
#[derive(Debug, Clone, PartialEq, Eq)]
struct MergePolicy {
    precedence: Vec<SettingsSource>,
}

impl MergePolicy {
    fn remote_wins() -> Self {
        Self {
            precedence: vec![
                SettingsSource::Existing,
                SettingsSource::Default,
                SettingsSource::Platform,
            ],
        }
    }

    fn local_wins() -> Self {
        Self {
            precedence: vec![
                SettingsSource::Default,
                SettingsSource::Platform,
                SettingsSource::Existing,
            ],
        }
    }
}

impl From<Precedence> for MergePolicy {
    fn from(value: Precedence) -> Self {
        match value {
            Precedence::RemoteWins => MergePolicy::remote_wins(),
            Precedence::LocalWins => MergePolicy::local_wins(),
        }
    }
}

type SettingsDocument = Map<String, Value>;

#[derive(Debug, Default)]
struct SettingsLayers {
    existing: SettingsDocument,
    default: SettingsDocument,
    platform: SettingsDocument,
}

impl SettingsLayers {
    fn layer(&self, source: SettingsSource) -> &SettingsDocument {
        match source {
            SettingsSource::Existing => &self.existing,
            SettingsSource::Default => &self.default,
            SettingsSource::Platform => &self.platform,
        }
    }

    fn merged(&self, policy: &MergePolicy) -> SettingsDocument {
        let mut merged = SettingsDocument::new();
        for source in &policy.precedence {
            for (key, value) in self.layer(*source) {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }
}

#[derive(Debug, Serialize)]
struct EnvironmentDefinition {
    name: String,
    channels: Vec<String>,
    dependencies: Vec<Dependency>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Dependency {
    Package(String),
    Pip { pip: Vec<String> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum StepOutcome {
    Present,
    Created,
    Installed,
    Fetched,
    Failed,
}

#[derive(Debug, Serialize)]
struct ExtensionResult {
    id: String,
    action: StepOutcome,
}

#[derive(Debug, Serialize)]
struct SettingsSummary {
    path: PathBuf,
    keys: Vec<String>,
}

#[derive(Debug, Serialize)]
struct EditorReport {
    extensions: Vec<ExtensionResult>,
    settings: SettingsSummary,
}

#[derive(Debug, Serialize)]
struct RunReport {
    platform: Platform,
    base_package: Option<String>,
    definition_file: StepOutcome,
    environment: StepOutcome,
    extensions: Vec<ExtensionResult>,
    settings: SettingsSummary,
    helper_script: StepOutcome,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Clone)]
struct Context {
    workdir: PathBuf,
    platform: Platform,
    conda_root: PathBuf,
    merge_policy: MergePolicy,
    cfg: Config,
}

#[derive(Debug, Clone)]
struct CommandOutput {
    status_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl CommandOutput {
    fn success(&self) -> bool {
        self.status_code == 0
    }

    fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

trait CommandRunner {
    fn locate(&self, program: &str) -> Option<PathBuf>;

    fn run(&self, program: &str, args: &[&str], cwd: &Path) -> Result<CommandOutput, io::Error>;
}

struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn locate(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }

    fn run(&self, program: &str, args: &[&str], cwd: &Path) -> Result<CommandOutput, io::Error> {
        // `which` also resolves `code.cmd` and friends on Windows.
        let resolved = self
            .locate(program)
            .unwrap_or_else(|| PathBuf::from(program));
        let output = Command::new(resolved).args(args).current_dir(cwd).output()?;
        let status_code = output
            .status
            .code()
            .unwrap_or(if output.status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

struct HttpResponse {
    status: u16,
    body: Box<dyn Read>,
}

impl HttpResponse {
    fn success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

trait Transport {
    fn get(&self, url: &str) -> Result<HttpResponse, SetupError>;
}

struct HttpTransport {
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    fn new() -> Result<Self, SetupError> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("pysetup/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

impl Transport for HttpTransport {
    fn get(&self, url: &str) -> Result<HttpResponse, SetupError> {
        debug!("GET {url}");
        let response = self.client.get(url).send()?;
        Ok(HttpResponse {
            status: response.status().as_u16(),
            body: Box::new(response),
        })
    }
}

fn main() -> Result<(), SetupError> {
    let cli = Cli::parse();
    init_logging(&cli);

    let result = build_context(&cli).and_then(|ctx| {
        let transport = HttpTransport::new()?;
        run_setup(&ctx, &SystemRunner, &transport)
    });

    match result {
        Ok(report) => output(cli.json, serde_json::to_value(&report)?),
        Err(err) => {
            if cli.json {
                let payload = JsonResult::<Value> {
                    ok: false,
                    result: None,
                    error: Some(err.to_string()),
                };
                print_json(&payload)?;
            } else {
                eprintln!("{err}");
            }
            std::process::exit(1);
        }
    }
}

fn init_logging(cli: &Cli) {
    let level = if cli.verbose {
        LevelFilter::Debug
    } else if cli.json {
        LevelFilter::Warn
    } else {
        LevelFilter::Info
    };
    let config = ConfigBuilder::new()
        .set_time_level(LevelFilter::Off)
        .set_thread_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off)
        .build();
    let _ = TermLogger::init(level, config, TerminalMode::Stderr, ColorChoice::Auto);
}

fn build_context(cli: &Cli) -> Result<Context, SetupError> {
    let config_path = resolve_config_path(cli.config.as_ref());
    let mut cfg = load_config(&config_path)?;
    apply_env_overrides(&mut cfg, |key| env::var(key).ok());
    if cli.keep_local_settings {
        cfg.settings.precedence = Precedence::LocalWins;
    }
    let platform = Platform::from_os(env::consts::OS)?;
    let workdir = match &cli.dir {
        Some(dir) => dir.clone(),
        None => env::current_dir()?,
    };
    let conda_root = resolve_conda_root(
        &cfg,
        platform,
        env::var("CONDA_PREFIX").ok(),
        &current_username(),
    );
    debug!(
        "platform={} workdir={} conda_root={}",
        platform.as_str(),
        workdir.display(),
        conda_root.display()
    );
    Ok(Context {
        workdir,
        platform,
        conda_root,
        merge_policy: MergePolicy::from(cfg.settings.precedence),
        cfg,
    })
}

fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("PYSETUP_CONFIG") {
        return PathBuf::from(path);
    }
    let mut base = default_config_dir();
    base.push("config.yaml");
    base
}

fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("PYSETUP_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("pysetup");
    base
}

fn load_config(path: &Path) -> Result<Config, SetupError> {
    if !path.exists() {
        debug!("no config at {}, using defaults", path.display());
        return Ok(Config::default());
    }
    read_config(path)
}

fn read_config(path: &Path) -> Result<Config, SetupError> {
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

fn validate_config(cfg: &Config) -> Result<(), SetupError> {
    if cfg.version != 1 {
        return Err(SetupError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    let required = [
        ("environment.name", &cfg.environment.name),
        ("environment.definition_file", &cfg.environment.definition_file),
        ("environment.conda_binary", &cfg.environment.conda_binary),
        ("editor.binary", &cfg.editor.binary),
        ("editor.settings_dir", &cfg.editor.settings_dir),
        ("remote.helper_script_file", &cfg.remote.helper_script_file),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(SetupError::Config(format!("{field} must not be empty")));
        }
    }
    Ok(())
}

fn apply_env_overrides<F>(cfg: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
    if let Some(url) = non_empty("PYSETUP_SETTINGS_BASE_URL") {
        cfg.remote.settings_base_url = url;
    }
    if let Some(url) = non_empty("PYSETUP_HELPER_SCRIPT_URL") {
        cfg.remote.helper_script_url = url;
    }
}

fn expand_path(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

fn current_username() -> String {
    for key in ["USER", "USERNAME"] {
        if let Ok(name) = env::var(key) {
            if !name.trim().is_empty() {
                return name;
            }
        }
    }
    home_dir()
        .and_then(|home| home.file_name().map(|n| n.to_string_lossy().to_string()))
        .unwrap_or_else(|| "user".to_string())
}

fn resolve_conda_root(
    cfg: &Config,
    platform: Platform,
    conda_prefix: Option<String>,
    username: &str,
) -> PathBuf {
    if let Some(root) = cfg
        .environment
        .conda_root
        .as_deref()
        .filter(|root| !root.trim().is_empty())
    {
        return PathBuf::from(expand_path(root));
    }
    if let Some(prefix) = conda_prefix.filter(|prefix| !prefix.trim().is_empty()) {
        return PathBuf::from(prefix);
    }
    platform.default_conda_root(username)
}

fn render_command(program: &str, args: &[&str]) -> String {
    fn shell_quote(part: &str) -> String {
        if part.is_empty() {
            return "\"\"".to_string();
        }
        if part.chars().any(|c| c.is_whitespace()) {
            return format!("\"{}\"", part.replace('"', "\\\""));
        }
        part.to_string()
    }
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(shell_quote(program));
    parts.extend(args.iter().map(|arg| shell_quote(arg)));
    parts.join(" ")
}

fn run_logged<R: CommandRunner>(
    runner: &R,
    program: &str,
    args: &[&str],
    cwd: &Path,
) -> Result<CommandOutput, io::Error> {
    info!("Running ==> `{}`", render_command(program, args));
    runner.run(program, args, cwd)
}

fn log_output(output: &CommandOutput) {
    let stdout = output.stdout_text();
    if !stdout.trim().is_empty() {
        info!("{}", stdout.trim_end());
    }
    let stderr = output.stderr_text();
    if !stderr.is_empty() {
        debug!("{stderr}");
    }
}

fn binary_exists<R: CommandRunner>(runner: &R, name: &str) -> bool {
    runner.locate(name).is_some()
}

/// Names from `conda env list`: header lines dropped, first token of each row.
fn parse_env_names(listing: &str) -> Vec<&str> {
    listing
        .lines()
        .skip(ENV_LIST_HEADER_LINES)
        .filter_map(|line| line.split_whitespace().next())
        .collect()
}

fn environment_exists<R: CommandRunner>(ctx: &Context, runner: &R) -> bool {
    let conda = &ctx.cfg.environment.conda_binary;
    let output = match run_logged(runner, conda, &["env", "list"], &ctx.workdir) {
        Ok(output) => output,
        Err(err) => {
            warn!("failed to list conda environments: {err}");
            return false;
        }
    };
    if !output.success() {
        warn!(
            "`{conda} env list` exited with status {}: {}",
            output.status_code,
            output.stderr_text()
        );
        return false;
    }
    let listing = output.stdout_text();
    parse_env_names(&listing).contains(&ctx.cfg.environment.name.as_str())
}

fn environment_definition(name: &str, platform: Platform) -> EnvironmentDefinition {
    let mut dependencies: Vec<Dependency> = [
        "python=3.9.5",
        "git",
        "pip",
        "ipython=7.29.0",
        "ipykernel=6.4.2",
    ]
    .iter()
    .map(|pkg| Dependency::Package(pkg.to_string()))
    .collect();
    let mut pip = Vec::new();
    if platform == Platform::Windows {
        dependencies.push(Dependency::Package("pywin32=228".to_string()));
        pip.push("ipykernel==6.4.2".to_string());
    }
    pip.extend(["ottopy".to_string(), "requests".to_string()]);
    dependencies.push(Dependency::Pip { pip });
    EnvironmentDefinition {
        name: name.to_string(),
        channels: vec!["conda-forge".to_string(), "defaults".to_string()],
        dependencies,
    }
}

fn render_environment_definition(name: &str, platform: Platform) -> Result<String, SetupError> {
    Ok(serde_yaml::to_string(&environment_definition(name, platform))?)
}

/// Writes the environment definition only when the file is absent; existing content is never touched.
fn ensure_definition_file(ctx: &Context) -> Result<StepOutcome, SetupError> {
    let path = ctx.workdir.join(&ctx.cfg.environment.definition_file);
    if path.is_file() {
        info!("{} already exists", path.display());
        return Ok(StepOutcome::Present);
    }
    let content = render_environment_definition(&ctx.cfg.environment.name, ctx.platform)?;
    ensure_parent(&path)?;
    fs::write(&path, content)?;
    info!("wrote {}", path.display());
    Ok(StepOutcome::Created)
}

fn environment_dir(ctx: &Context) -> PathBuf {
    ctx.conda_root.join("envs").join(&ctx.cfg.environment.name)
}

fn ensure_environment<R: CommandRunner>(ctx: &Context, runner: &R) -> StepOutcome {
    let name = &ctx.cfg.environment.name;
    // A leftover directory from a failed create does not count on its own.
    if environment_dir(ctx).is_dir() && environment_exists(ctx, runner) {
        info!("{name} environment exists");
        return StepOutcome::Present;
    }

    info!("Creating {name} environment ...");
    let conda = &ctx.cfg.environment.conda_binary;
    let args = ["env", "create", "-f", ctx.cfg.environment.definition_file.as_str()];
    match run_logged(runner, conda, &args, &ctx.workdir) {
        Ok(output) => {
            log_output(&output);
            if output.success() {
                StepOutcome::Created
            } else {
                warn!(
                    "creating environment {name} failed with status {}: {}",
                    output.status_code,
                    output.stderr_text()
                );
                StepOutcome::Failed
            }
        }
        Err(err) => {
            warn!("failed to run `{}`: {err}", render_command(conda, &args));
            StepOutcome::Failed
        }
    }
}

fn installed_extensions<R: CommandRunner>(ctx: &Context, runner: &R) -> Vec<String> {
    let editor = &ctx.cfg.editor.binary;
    match run_logged(runner, editor, &["--list-extensions"], &ctx.workdir) {
        Ok(output) if output.success() => output
            .stdout_text()
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect(),
        Ok(output) => {
            warn!(
                "`{editor} --list-extensions` exited with status {}: {}",
                output.status_code,
                output.stderr_text()
            );
            Vec::new()
        }
        Err(err) => {
            warn!("failed to list editor extensions: {err}");
            Vec::new()
        }
    }
}

fn install_extension<R: CommandRunner>(ctx: &Context, runner: &R, id: &str) -> StepOutcome {
    let editor = &ctx.cfg.editor.binary;
    match run_logged(runner, editor, &["--install-extension", id], &ctx.workdir) {
        Ok(output) => {
            log_output(&output);
            if output.success() {
                StepOutcome::Installed
            } else {
                warn!(
                    "installing extension {id} failed with status {}: {}",
                    output.status_code,
                    output.stderr_text()
                );
                StepOutcome::Failed
            }
        }
        Err(err) => {
            warn!("failed to install extension {id}: {err}");
            StepOutcome::Failed
        }
    }
}

fn ensure_editor<R: CommandRunner, T: Transport>(
    ctx: &Context,
    runner: &R,
    transport: &T,
) -> Result<EditorReport, SetupError> {
    let editor = &ctx.cfg.editor.binary;
    if !binary_exists(runner, editor) {
        return Err(SetupError::EditorMissing(editor.clone()));
    }

    let installed = installed_extensions(ctx, runner);
    let mut extensions = Vec::with_capacity(ctx.cfg.editor.extensions.len());
    for id in &ctx.cfg.editor.extensions {
        let action = if installed.iter().any(|existing| existing == id) {
            info!("editor extension {id} already installed");
            StepOutcome::Present
        } else {
            info!("Installing editor extension {id}");
            install_extension(ctx, runner, id)
        };
        extensions.push(ExtensionResult {
            id: id.clone(),
            action,
        });
    }

    let settings = reconcile_settings(ctx, transport)?;
    Ok(EditorReport {
        extensions,
        settings,
    })
}

fn remote_url(base: &str, name: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), name)
}

/// Remote settings never fail the run: any problem yields an empty document.
fn fetch_remote_settings<T: Transport>(transport: &T, url: &str) -> SettingsDocument {
    let mut response = match transport.get(url) {
        Ok(response) => response,
        Err(err) => {
            warn!("could not fetch {url}: {err}");
            return SettingsDocument::new();
        }
    };
    if !response.success() {
        warn!("{url} returned HTTP {}, skipping", response.status);
        return SettingsDocument::new();
    }
    let mut body = String::new();
    if let Err(err) = response.body.read_to_string(&mut body) {
        warn!("could not read {url}: {err}");
        return SettingsDocument::new();
    }
    match serde_json::from_str::<Value>(&body) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            warn!("{url} is not a JSON object, skipping");
            SettingsDocument::new()
        }
        Err(err) => {
            warn!("{url} is not valid JSON ({err}), skipping");
            SettingsDocument::new()
        }
    }
}

fn load_local_settings(path: &Path) -> Result<SettingsDocument, SetupError> {
    let has_content = match fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.len() > 0,
        Err(err) if err.kind() == io::ErrorKind::NotFound => false,
        Err(err) => return Err(err.into()),
    };
    if !has_content {
        return Ok(SettingsDocument::new());
    }
    let content = fs::read_to_string(path)?;
    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(SetupError::Config(format!(
            "{} is not a JSON object; fix or remove it and try again",
            path.display()
        ))),
        Err(err) => Err(SetupError::Config(format!(
            "{} is not valid JSON ({err}); fix or remove it and try again",
            path.display()
        ))),
    }
}

fn settings_path(ctx: &Context) -> PathBuf {
    ctx.workdir
        .join(&ctx.cfg.editor.settings_dir)
        .join("settings.json")
}

/// Rewrites the editor settings file on every run from the merged layers.
fn reconcile_settings<T: Transport>(
    ctx: &Context,
    transport: &T,
) -> Result<SettingsSummary, SetupError> {
    let base = &ctx.cfg.remote.settings_base_url;
    let path = settings_path(ctx);
    let layers = SettingsLayers {
        default: fetch_remote_settings(transport, &remote_url(base, "default.json")),
        platform: fetch_remote_settings(
            transport,
            &remote_url(base, &format!("{}.json", ctx.platform.as_str())),
        ),
        existing: load_local_settings(&path)?,
    };
    let merged = layers.merged(&ctx.merge_policy);
    debug!("merged settings: {}", Value::Object(merged.clone()));

    let mut content = serde_json::to_string_pretty(&merged)?;
    content.push('\n');
    write_atomic(&path, |file| file.write_all(content.as_bytes()))?;
    info!("wrote {}", path.display());

    Ok(SettingsSummary {
        path,
        keys: merged.keys().cloned().collect(),
    })
}

/// Downloads `url` into `path` unless `path` already exists, even as an empty file.
/// Network failures are reported as `Failed` and leave no file, so the next run retries.
fn fetch_if_absent<T: Transport>(
    transport: &T,
    url: &str,
    path: &Path,
) -> Result<StepOutcome, SetupError> {
    if path.exists() {
        info!("{} already exists", path.display());
        return Ok(StepOutcome::Present);
    }
    match download(transport, url, path) {
        Ok(()) => {
            info!("downloaded {url} to {}", path.display());
            Ok(StepOutcome::Fetched)
        }
        Err(err @ (SetupError::Http(_) | SetupError::HttpStatus { .. })) => {
            warn!("could not download {}: {err}", path.display());
            Ok(StepOutcome::Failed)
        }
        Err(err) => Err(err),
    }
}

fn download<T: Transport>(transport: &T, url: &str, path: &Path) -> Result<(), SetupError> {
    let response = transport.get(url)?;
    if !response.success() {
        return Err(SetupError::HttpStatus {
            url: url.to_string(),
            status: response.status,
        });
    }
    let mut body = response.body;
    write_atomic(path, |file| copy_in_chunks(&mut body, file))
}

fn copy_in_chunks<R: Read + ?Sized, W: Write>(reader: &mut R, writer: &mut W) -> io::Result<()> {
    let mut buf = [0u8; DOWNLOAD_CHUNK_BYTES];
    loop {
        let read = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(read) => read,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };
        writer.write_all(&buf[..read])?;
    }
    writer.flush()
}

fn ensure_parent(path: &Path) -> Result<(), SetupError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn temp_path_for(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "pysetup".to_string()),
        pid,
        ts
    ))
}

/// Fills a sibling temp file and renames it over `path`, so readers never see a partial file.
fn write_atomic<F>(path: &Path, fill: F) -> Result<(), SetupError>
where
    F: FnOnce(&mut fs::File) -> io::Result<()>,
{
    ensure_parent(path)?;
    let tmp_path = temp_path_for(path);
    let written = fs::File::create(&tmp_path).and_then(|mut file| {
        fill(&mut file)?;
        file.sync_all()
    });
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    if let Err(err) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}

fn install_base_package<R: CommandRunner>(
    ctx: &Context,
    runner: &R,
) -> Result<Option<String>, SetupError> {
    let package = ctx.cfg.environment.base_package.trim();
    if package.is_empty() {
        debug!("no base package configured, skipping install");
        return Ok(None);
    }
    let conda = &ctx.cfg.environment.conda_binary;
    let args = ["install", "-y", package];
    let command = render_command(conda, &args);
    let output = run_logged(runner, conda, &args, &ctx.workdir)
        .map_err(|err| SetupError::Process(format!("failed to run `{command}`: {err}")))?;
    log_output(&output);
    if !output.success() {
        let stderr = output.stderr_text();
        let mut message = format!(
            "command failed with status {} while running `{}`",
            output.status_code, command
        );
        if !stderr.is_empty() {
            message = format!("{message}: {stderr}");
        }
        return Err(SetupError::Process(message));
    }
    Ok(Some(package.to_string()))
}

fn run_setup<R: CommandRunner, T: Transport>(
    ctx: &Context,
    runner: &R,
    transport: &T,
) -> Result<RunReport, SetupError> {
    let base_package = install_base_package(ctx, runner)?;
    let definition_file = ensure_definition_file(ctx)?;
    let environment = ensure_environment(ctx, runner);
    let editor = ensure_editor(ctx, runner, transport)?;
    let helper_script = fetch_if_absent(
        transport,
        &ctx.cfg.remote.helper_script_url,
        &ctx.workdir.join(&ctx.cfg.remote.helper_script_file),
    )?;

    Ok(RunReport {
        platform: ctx.platform,
        base_package,
        definition_file,
        environment,
        extensions: editor.extensions,
        settings: editor.settings,
        helper_script,
    })
}

fn output(json_mode: bool, payload: Value) -> Result<(), SetupError> {
    if json_mode {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), SetupError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
