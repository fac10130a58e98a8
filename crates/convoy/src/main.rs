use std::env;
use std::fmt;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use convoy::agent::AgentConfig;
use convoy::auth::AuthConfig;
use convoy::container::{ContainerRuntime, ContainerRuntimeApi};
use convoy::db::Database;
use convoy::driver::{DriverConfig, ProcessDriverFactory};
use convoy::health::{HealthConfig, HealthMonitor};
use convoy::isolation::{IsolationAllocator, IsolationConfig, IsolationMode, IsolationSlot};
use convoy::orchestrator::{OrchestratorConfig, OrchestratorSettings, SessionOrchestrator};
use convoy::registry::{SessionRegistry, SessionRepository};

const APP_NAME: &str = "convoy";
const CONFIG_FILE: &str = "config.toml";
const STORE_FILE: &str = "sessions.db";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("paths: {}", ctx.paths);

    match cli.command {
        Command::Serve => block_on(handle_serve(&ctx)),
        Command::Slots => block_on(handle_slots(&ctx)),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

/// Only the async commands pay for a runtime.
fn block_on<F: std::future::Future<Output = Result<()>>>(future: F) -> Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting tokio runtime")?
        .block_on(future)
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Convoy - runs isolated, long-lived client sessions for many tenants.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Config file (or directory holding config.toml)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Only log errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// More log output; repeat for trace
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Log at debug level
    #[arg(long, global = true)]
    debug: bool,
    /// Log at trace level
    #[arg(long, global = true)]
    trace: bool,
    /// JSON logs and JSON command output
    #[arg(long, global = true)]
    json: bool,
    /// Never colour log output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// When to colour log output
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Report file changes instead of making them
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Overwrite without asking
    #[arg(short = 'y', long = "yes", global = true)]
    assume_yes: bool,
    /// Include targets, files and line numbers in log lines
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the orchestrator until interrupted
    Serve,
    /// Write the default config file
    Init(InitCommand),
    /// Show or reset configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Reconcile and list isolation slots
    Slots,
    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Replace an existing config file
    #[arg(long = "force")]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the merged configuration
    Show,
    /// Print the config file location
    Path,
    /// Overwrite the config file with defaults
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_file = AppPaths::config_file(common.config.clone())?;
        if !config_file.exists() {
            if common.dry_run {
                info!("dry-run: no config at {}, defaults apply", config_file.display());
            } else {
                write_default_config(&config_file)?;
            }
        }
        let config = load_config(&config_file)?;
        let paths = AppPaths::resolve(config_file, &config.paths)?;

        let ctx = Self {
            common,
            paths,
            config,
        };
        ctx.ensure_directories()?;
        Ok(ctx)
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Error);
        }
        let level = self.log_level();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={}", level.as_str())));

        let registry = tracing_subscriber::registry().with(filter);
        let installed = if self.common.json {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
        } else {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(use_color(&self.common))
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
        };
        if let Err(err) = installed {
            debug!("tracing subscriber already set: {}", err);
        }

        // The library logs through `log`.
        env_logger::Builder::from_env(env_logger::Env::default())
            .filter_level(level)
            .try_init()
            .ok();
        Ok(())
    }

    /// `--quiet`, then `--trace`/`--debug`/`-v`, then the config file.
    fn log_level(&self) -> LevelFilter {
        if self.common.quiet {
            return LevelFilter::Error;
        }
        if self.common.trace || self.common.verbose >= 2 {
            return LevelFilter::Trace;
        }
        if self.common.debug || self.common.verbose == 1 {
            return LevelFilter::Debug;
        }
        self.config
            .logging
            .level
            .parse()
            .unwrap_or(LevelFilter::Info)
    }

    fn ensure_directories(&self) -> Result<()> {
        for (what, dir) in [
            ("data", &self.paths.data_dir),
            ("state", &self.paths.state_dir),
        ] {
            if self.common.dry_run {
                info!("dry-run: would create {} directory {}", what, dir.display());
                continue;
            }
            fs::create_dir_all(dir)
                .with_context(|| format!("creating {} directory {}", what, dir.display()))?;
        }
        Ok(())
    }

    fn store_path(&self) -> Result<PathBuf> {
        match self.config.store.path.as_deref() {
            Some(path) => expand(path),
            None => Ok(self.paths.state_dir.join(STORE_FILE)),
        }
    }
}

/// Explicit flags first, then NO_COLOR/FORCE_COLOR, then whether stderr is a tty.
fn use_color(opts: &CommonOpts) -> bool {
    if opts.no_color {
        return false;
    }
    match opts.color {
        ColorOption::Always => true,
        ColorOption::Never => false,
        ColorOption::Auto => {
            if env::var_os("NO_COLOR").is_some() {
                false
            } else {
                env::var_os("FORCE_COLOR").is_some() || io::stderr().is_terminal()
            }
        }
    }
}

/// Where the config file lives and where slots and the store go.
#[derive(Debug, Clone)]
struct AppPaths {
    config_file: PathBuf,
    /// Root of every tenant slot directory.
    data_dir: PathBuf,
    state_dir: PathBuf,
}

impl AppPaths {
    fn config_file(explicit: Option<PathBuf>) -> Result<PathBuf> {
        let file = match explicit {
            Some(path) => {
                let path = path
                    .to_str()
                    .map(expand)
                    .transpose()?
                    .unwrap_or(path);
                if path.is_dir() {
                    path.join(CONFIG_FILE)
                } else {
                    path
                }
            }
            None => xdg_dir(XdgDir::Config)?.join(CONFIG_FILE),
        };
        if file.file_name().is_none() {
            return Err(anyhow!("not a config file path: {}", file.display()));
        }
        Ok(file)
    }

    fn resolve(config_file: PathBuf, overrides: &PathsConfig) -> Result<Self> {
        let data_dir = match overrides.data_dir.as_deref() {
            Some(dir) => expand(dir)?,
            None => xdg_dir(XdgDir::Data)?,
        };
        let state_dir = match overrides.state_dir.as_deref() {
            Some(dir) => expand(dir)?,
            None => xdg_dir(XdgDir::State)?,
        };
        Ok(Self {
            config_file,
            data_dir,
            state_dir,
        })
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config={} data={} state={}",
            self.config_file.display(),
            self.data_dir.display(),
            self.state_dir.display()
        )
    }
}

#[derive(Debug, Clone, Copy)]
enum XdgDir {
    Config,
    Data,
    State,
}

/// `$XDG_*_HOME/convoy`, else the platform directory, else the usual
/// dot-directory under home.
fn xdg_dir(kind: XdgDir) -> Result<PathBuf> {
    let (var, platform, fallback): (&str, Option<PathBuf>, &[&str]) = match kind {
        XdgDir::Config => ("XDG_CONFIG_HOME", dirs::config_dir(), &[".config"]),
        XdgDir::Data => ("XDG_DATA_HOME", dirs::data_dir(), &[".local", "share"]),
        XdgDir::State => ("XDG_STATE_HOME", dirs::state_dir(), &[".local", "state"]),
    };

    let base = env::var_os(var)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .or(platform)
        .or_else(|| dirs::home_dir().map(|home| fallback.iter().fold(home, |p, part| p.join(part))))
        .ok_or_else(|| anyhow!("cannot locate a {:?} directory; set {}", kind, var))?;
    Ok(base.join(APP_NAME))
}

fn expand(text: &str) -> Result<PathBuf> {
    let expanded =
        shellexpand::full(text).with_context(|| format!("expanding path {text:?}"))?;
    Ok(PathBuf::from(expanded.as_ref()))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    logging: LoggingConfig,
    paths: PathsConfig,
    /// Tenant slots: address pool, containers, directories.
    isolation: IsolationConfig,
    /// Driver process spawned per session.
    driver: DriverConfig,
    orchestrator: OrchestratorConfig,
    /// Challenge windows and confirmation budgets.
    auth: AuthConfig,
    /// Memory monitor, context refresh and driver call timeouts.
    agent: AgentConfig,
    health: HealthConfig,
    /// Persisted session registry.
    store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct PathsConfig {
    data_dir: Option<String>,
    state_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct StoreConfig {
    /// Write sessions through to SQLite and recover them on start-up.
    enabled: bool,
    /// Defaults to `sessions.db` in the state dir.
    path: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

/// Defaults, then the TOML file, then `CONVOY__SECTION__KEY` variables.
fn load_config(file: &Path) -> Result<AppConfig> {
    Config::builder()
        .add_source(
            File::from(file)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(
            Environment::with_prefix(&env_prefix())
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .and_then(Config::try_deserialize)
        .with_context(|| format!("loading configuration from {}", file.display()))
}

fn env_prefix() -> String {
    APP_NAME.to_ascii_uppercase().replace('-', "_")
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let defaults =
        toml::to_string_pretty(&AppConfig::default()).context("rendering default config")?;
    let body = format!(
        "# {APP_NAME} configuration ({path})\n\
         # Durations take values such as \"90s\" or \"6h\".\n\
         # Any key can be overridden with {prefix}__SECTION__KEY.\n\n{defaults}",
        path = path.display(),
        prefix = env_prefix(),
    );
    fs::write(path, body).with_context(|| format!("writing {}", path.display()))?;
    info!("Wrote default config to {}", path.display());
    Ok(())
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    let file = &ctx.paths.config_file;
    let overwrite = cmd.force || ctx.common.assume_yes;
    if file.exists() && !overwrite {
        return Err(anyhow!(
            "{} already exists; pass --force to replace it",
            file.display()
        ));
    }
    if ctx.common.dry_run {
        info!("dry-run: would write {}", file.display());
        return Ok(());
    }
    write_default_config(file)
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let rendered = if ctx.common.json {
                serde_json::to_string_pretty(&ctx.config).context("rendering config as JSON")?
            } else {
                toml::to_string_pretty(&ctx.config).context("rendering config as TOML")?
            };
            println!("{rendered}");
        }
        ConfigCommand::Path => println!("{}", ctx.paths.config_file.display()),
        ConfigCommand::Reset if ctx.common.dry_run => {
            info!("dry-run: would reset {}", ctx.paths.config_file.display());
        }
        ConfigCommand::Reset => write_default_config(&ctx.paths.config_file)?,
    }
    Ok(())
}

fn handle_completions(shell: Shell) -> Result<()> {
    clap_complete::generate(shell, &mut Cli::command(), APP_NAME, &mut io::stdout());
    Ok(())
}

/// Container runtime for container mode, `None` in local mode.
async fn build_runtime(config: &IsolationConfig) -> Result<Option<Arc<dyn ContainerRuntimeApi>>> {
    if config.mode == IsolationMode::Local {
        return Ok(None);
    }

    let runtime = match (&config.runtime, &config.runtime_binary) {
        (Some(rt), Some(binary)) => ContainerRuntime::with_binary(*rt, binary.clone()),
        (Some(rt), None) => ContainerRuntime::with_type(*rt),
        (None, _) => ContainerRuntime::new(),
    };

    let version = runtime.health_check().await.with_context(|| {
        format!(
            "container runtime {} is not available",
            runtime.runtime_type()
        )
    })?;
    info!("Container runtime: {} ({})", runtime.runtime_type(), version.trim());

    Ok(Some(Arc::new(runtime)))
}

async fn build_allocator(ctx: &RuntimeContext) -> Result<Arc<IsolationAllocator>> {
    let config = ctx.config.isolation.clone();
    let runtime = build_runtime(&config).await?;
    let allocator = IsolationAllocator::new(config, ctx.paths.data_dir.clone(), runtime)
        .context("configuring isolation allocator")?;
    info!(
        "Isolation: {} mode, {} slot(s), root {}",
        allocator.mode(),
        allocator.capacity(),
        allocator.root().display()
    );
    Ok(Arc::new(allocator))
}

async fn open_repository(ctx: &RuntimeContext) -> Result<Option<SessionRepository>> {
    if !ctx.config.store.enabled {
        info!("Session store disabled; sessions will not survive a restart");
        return Ok(None);
    }
    let path = ctx.store_path()?;
    info!("Session store: {}", path.display());
    let database = Database::new(&path).await?;
    Ok(Some(SessionRepository::new(database.pool().clone())))
}

async fn handle_serve(ctx: &RuntimeContext) -> Result<()> {
    info!("Starting session orchestrator...");

    let allocator = build_allocator(ctx).await?;
    let repository = open_repository(ctx).await?;
    let registry = Arc::new(match repository.clone() {
        Some(repository) => SessionRegistry::with_store(repository),
        None => SessionRegistry::new(),
    });

    let factory = Arc::new(ProcessDriverFactory::new(ctx.config.driver.clone()));
    let settings = OrchestratorSettings {
        orchestrator: ctx.config.orchestrator.clone(),
        auth: ctx.config.auth.clone(),
        agent: ctx.config.agent.clone(),
    };

    let mut orchestrator = SessionOrchestrator::new(registry, allocator, factory, settings);
    if let Some(repository) = repository {
        orchestrator = orchestrator.with_repository(repository);
    }

    let events = spawn_event_logger(&orchestrator);

    match orchestrator.restore().await {
        Ok(report) => info!(
            "Adopted {} slot(s); {} session(s) recovered, {} failed, {} discarded",
            report.slots.recovered.len(),
            report.recovered.len(),
            report.failed.len(),
            report.discarded.len()
        ),
        Err(err) => warn!("Start-up recovery incomplete: {:#}", err),
    }

    let monitor = Arc::new(HealthMonitor::new(
        orchestrator.clone(),
        ctx.config.health.clone(),
    ));
    let sweeps = monitor.start();

    if let Err(err) = shutdown_signal().await {
        error!("Signal handling failed, shutting down: {:#}", err);
    }

    info!("Shutting down, closing {} session(s)", orchestrator.list_sessions().len());
    for handle in sweeps {
        handle.abort();
    }
    orchestrator.shutdown().await;
    events.abort();
    info!("Shutdown complete");

    Ok(())
}

/// Mirror lifecycle events into the log.
fn spawn_event_logger(orchestrator: &SessionOrchestrator) -> JoinHandle<()> {
    let mut events = orchestrator.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(line) => debug!("event: {}", line),
                    Err(err) => debug!("event {:?} (unserializable: {})", event, err),
                },
                Err(RecvError::Lagged(skipped)) => {
                    debug!("event log lagged, {} event(s) skipped", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Resolves on Ctrl-C or, on unix, SIGTERM.
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async { tokio::signal::ctrl_c().await.context("waiting for Ctrl-C") };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        signal(SignalKind::terminate())
            .context("installing SIGTERM handler")?
            .recv()
            .await;
        Ok::<(), anyhow::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => result,
        result = terminate => result,
    }
}

async fn handle_slots(ctx: &RuntimeContext) -> Result<()> {
    let allocator = build_allocator(ctx).await?;
    let report = allocator
        .reconcile()
        .await
        .context("reconciling isolation slots")?;
    for conflict in &report.conflicts {
        warn!("Not adopted: {}", conflict);
    }

    let slots = allocator.list_all().await;
    if ctx.common.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&slots).context("rendering slots as JSON")?
        );
    } else if slots.is_empty() {
        println!("No slots allocated");
    } else {
        print_slot_table(&slots);
    }
    Ok(())
}

fn print_slot_table(slots: &[IsolationSlot]) {
    println!(
        "{:<24} {:<16} {:<6} {:<28} {}",
        "USER", "ADDRESS", "PORT", "CONTAINER", "DATA"
    );
    for slot in slots {
        println!(
            "{:<24} {:<16} {:<6} {:<28} {}",
            slot.user_id,
            slot.address,
            slot.port,
            slot.container_name.as_deref().unwrap_or("-"),
            slot.data_dir.display()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn env_prefix_is_uppercase() {
        assert_eq!(env_prefix(), "CONVOY");
    }

    #[test]
    fn default_config_round_trips_through_toml() {
        let body = toml::to_string_pretty(&AppConfig::default()).unwrap();
        let parsed: AppConfig = toml::from_str(&body).unwrap();
        assert_eq!(parsed.auth.auth_budget, Duration::from_secs(90));
        assert_eq!(parsed.agent.hard_memory_threshold, 0.85);
        assert_eq!(parsed.health.idle_timeout, Some(Duration::from_secs(1800)));
        assert!(parsed.store.enabled);
    }

    #[test]
    fn partial_config_keeps_defaults() {
        let parsed: AppConfig = toml::from_str(
            r#"
            [isolation]
            mode = "local"

            [auth]
            auth_budget = "2m"
            "#,
        )
        .unwrap();
        assert_eq!(parsed.isolation.mode, IsolationMode::Local);
        assert_eq!(parsed.auth.auth_budget, Duration::from_secs(120));
        assert_eq!(parsed.auth.ready_budget, Duration::from_secs(30));
        assert_eq!(parsed.orchestrator.max_sessions_per_user, 1);
    }

    #[test]
    fn config_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(CONFIG_FILE);
        fs::write(&file, "[orchestrator]\nmax_sessions_per_user = 3\n").unwrap();

        let config = load_config(&file).unwrap();
        assert_eq!(config.orchestrator.max_sessions_per_user, 3);
        assert_eq!(config.logging.level, "info");
        assert!(config.store.enabled);
    }

    #[test]
    fn partial_health_section_keeps_idle_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join(CONFIG_FILE);
        fs::write(&file, "[health]\nkeepalive_interval = \"5s\"\n").unwrap();

        let config = load_config(&file).unwrap();
        assert_eq!(config.health.keepalive_interval, Duration::from_secs(5));
        assert_eq!(config.health.idle_timeout, Some(Duration::from_secs(1800)));
        assert_eq!(config.health.idle_limit(), Some(Duration::from_secs(1800)));
    }

    #[test]
    fn missing_config_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.orchestrator.max_sessions_per_user, 1);
    }

    #[test]
    fn write_default_config_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        write_default_config(&path).unwrap();
        let body = fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("# convoy configuration"));
        assert!(body.contains("[isolation]"));
        load_config(&path).unwrap();
    }

    #[test]
    fn explicit_config_directory_resolves_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = AppPaths::config_file(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(file, dir.path().join(CONFIG_FILE));
    }

    #[test]
    fn path_overrides_are_expanded() {
        let overrides = PathsConfig {
            data_dir: Some("/srv/convoy/data".to_string()),
            state_dir: None,
        };
        let paths = AppPaths::resolve(PathBuf::from("/etc/convoy/config.toml"), &overrides).unwrap();
        assert_eq!(paths.data_dir, PathBuf::from("/srv/convoy/data"));
        assert!(paths.state_dir.ends_with(APP_NAME));
    }
}
