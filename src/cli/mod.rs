use std::ffi::OsString;
use std::io;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand};
use serde::Serialize;

use crate::config::EffectiveConfig;
use crate::engine::{Engine, EngineOptions};
use crate::harness;
use crate::rules::{self, PortError, PortRequest, RewriteEngine};
use crate::ui::UiConfig;

#[derive(Debug, Parser)]
#[command(
    name = "portcheck",
    version,
    about = "Golden-fixture verification harness for a source-porting tool"
)]
pub struct Cli {
    #[arg(long, global = true)]
    pub json: bool,
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,
    #[arg(long, global = true)]
    pub verbose: bool,
    #[arg(long, global = true)]
    pub quiet: bool,
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Per-case deadline in seconds.
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the test matrix against the recorded fixtures.
    Run(RunArgs),
    /// Print the normalized test matrix.
    List,
    /// Port build targets in the current workspace.
    Port(PortArgs),
    Config(ConfigArgs),
    Completion(CompletionArgs),
    #[command(name = "harness-port", hide = true)]
    HarnessPort(PortArgs),
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Include tests marked long.
    #[arg(long)]
    pub long: bool,
    /// Also smoke-test the latest upstream revision of each module.
    #[arg(long)]
    pub latest: bool,
    /// Only run modules whose path or name contains this string.
    #[arg(long)]
    pub filter: Option<String>,
    /// Rewrite fixtures from the captured output instead of comparing.
    #[arg(long)]
    pub bless: bool,
    #[arg(long)]
    pub keep_workspace: bool,
    #[arg(long, default_value_t = 1)]
    pub jobs: usize,
}

#[derive(Debug, Args)]
pub struct PortArgs {
    #[arg(required = true)]
    pub targets: Vec<String>,
}

#[derive(Debug, Args)]
pub struct CompletionArgs {
    pub shell: String,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[arg(long)]
    pub show: bool,
}

/// Harness mode selected by the environment marker. Returns the exit code
/// when the marker is present; clap never sees the arguments.
pub fn run_marker_mode() -> Option<i32> {
    if std::env::var_os(harness::TEST_RUN_ENV).is_none_or(|v| v.is_empty()) {
        return None;
    }
    let targets = std::env::args_os()
        .skip(1)
        .map(|a| a.to_string_lossy().into_owned())
        .collect();
    Some(harness_port(targets))
}

fn harness_port(targets: Vec<String>) -> i32 {
    let stdout = io::stdout();
    let stderr = io::stderr();
    let mut out = stdout.lock();
    let mut err = stderr.lock();

    let env_config_path = std::env::var_os("PORTCHECK_CONFIG").map(PathBuf::from);
    let setup = crate::config::load(env_config_path.as_deref()).and_then(|cfg| {
        let root = std::env::current_dir().context("unable to determine working directory")?;
        Ok((cfg, root))
    });
    match setup {
        Ok((cfg, root)) => harness::run_harness_mode(&cfg, &root, targets, &mut out, &mut err),
        Err(e) => harness::report_setup_failure(&mut err, e),
    }
}

pub fn run() -> Result<()> {
    run_from(std::env::args_os())
}

pub fn run_from<I, T>(args: I) -> Result<()>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::parse_from(args);

    if let Commands::HarnessPort(args) = &cli.command {
        let code = harness_port(args.targets.clone());
        if code != 0 {
            std::process::exit(code);
        }
        return Ok(());
    }

    let stdout_is_tty = io::stdout().is_terminal();
    let stderr_is_tty = io::stderr().is_terminal();

    let env_config_path = std::env::var_os("PORTCHECK_CONFIG").map(PathBuf::from);
    let mut cfg = crate::config::load(cli.config.as_deref().or(env_config_path.as_deref()))
        .map_err(crate::exit::invalid_args_err)?;
    if let Some(timeout) = cli.timeout {
        if timeout == 0 {
            return Err(crate::exit::invalid_args(
                "--timeout must be greater than 0",
            ));
        }
        cfg.harness.timeout_secs = timeout;
    }

    let ui_cfg = UiConfig {
        color: stdout_is_tty && !cli.no_color && std::env::var_os("NO_COLOR").is_none(),
        stdout_is_tty,
        stderr_is_tty,
        quiet: cli.quiet,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Run(args) => run_matrix(&cfg, args, &ui_cfg, cli.json),
        Commands::List => {
            if cli.json {
                write_json(&cfg.modules)
            } else {
                let mut out = io::stdout().lock();
                crate::ui::print_matrix(&mut out, &cfg);
                Ok(())
            }
        }
        Commands::Port(args) => port_targets(&cfg, args.targets, &ui_cfg, cli.json),
        Commands::Completion(args) => {
            let shell = parse_shell(&args.shell)?;
            let mut cmd = Cli::command();
            let mut out = io::stdout().lock();
            clap_complete::generate(shell, &mut cmd, "portcheck", &mut out);
            Ok(())
        }
        Commands::Config(args) => {
            if args.show {
                if cli.json {
                    write_json(&cfg)?;
                } else {
                    println!("{}", toml::to_string_pretty(&cfg)?);
                }
            } else if !ui_cfg.quiet {
                eprintln!("config: use `portcheck config --show`");
            }
            Ok(())
        }
        Commands::HarnessPort(_) => Ok(()),
    }
}

fn run_matrix(cfg: &EffectiveConfig, args: RunArgs, ui_cfg: &UiConfig, json: bool) -> Result<()> {
    if args.jobs == 0 {
        return Err(crate::exit::invalid_args("--jobs must be at least 1"));
    }
    crate::scan::validate_excludes(&cfg.engine.exclude).map_err(crate::exit::invalid_args_err)?;

    let harness_bin = std::env::current_exe()
        .context("unable to locate the portcheck executable")
        .map_err(crate::exit::external_cmd_err)?;

    let engine = Engine::new(
        cfg,
        EngineOptions {
            include_long: args.long,
            include_latest: args.latest,
            filter: args.filter.clone(),
            bless: args.bless,
            keep_workspace: args.keep_workspace,
            jobs: args.jobs,
            timeout: Duration::from_secs(cfg.harness.timeout_secs),
            show_progress: ui_cfg.stderr_is_tty && !ui_cfg.quiet && !json,
            harness_bin,
        },
    );

    let report = engine.run(&|case| {
        if !json {
            let mut out = io::stdout().lock();
            crate::ui::print_case(&mut out, case, ui_cfg);
        }
    });

    if let Some(dir) = &cfg.harness.log_dir {
        let options = crate::logs::RunLogOptions {
            long: args.long,
            latest: args.latest,
            filter: args.filter,
            bless: args.bless,
            timeout_secs: cfg.harness.timeout_secs,
            config_path: cfg.config_path.clone(),
        };
        match crate::logs::write_run_log(dir, &report, &options) {
            Ok(path) => {
                if ui_cfg.verbose && !json {
                    eprintln!("run log: {}", path.display());
                }
            }
            Err(err) => eprintln!("warning: {err:#}"),
        }
    }

    if json {
        write_json(&report)?;
    } else if !ui_cfg.quiet || report.has_failures() {
        let mut out = io::stdout().lock();
        crate::ui::print_run_summary(&mut out, &report, ui_cfg);
    }

    if report.has_failures() {
        let s = &report.summary;
        return Err(crate::exit::verification_failed(format!(
            "{} failed, {} errors",
            s.failed, s.errors
        )));
    }
    Ok(())
}

fn port_targets(
    cfg: &EffectiveConfig,
    targets: Vec<String>,
    ui_cfg: &UiConfig,
    json: bool,
) -> Result<()> {
    let engine = RewriteEngine::new(&cfg.engine).map_err(crate::exit::invalid_args_err)?;
    let req = PortRequest {
        workspace_root: std::env::current_dir().context("unable to determine working directory")?,
        targets,
    };

    let (list, result) = rules::port(&engine, &req);
    if let Err(e @ PortError::Internal(_)) = &result {
        return Err(crate::exit::external_cmd_err(anyhow!("{e}")));
    }

    if json {
        write_json(&list)?;
    } else if !ui_cfg.quiet {
        let mut out = io::stdout().lock();
        crate::ui::print_port_summary(&mut out, &list, ui_cfg);
    }

    result.map_err(|e| crate::exit::external_cmd_err(anyhow!("{e}")))
}

fn write_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    use std::io::Write;

    let buf = serde_json::to_vec_pretty(value)?;

    let mut stdout = io::stdout().lock();
    match stdout.write_all(&buf) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => return Ok(()),
        Err(err) => return Err(err.into()),
    }
    match stdout.write_all(b"\n") {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn parse_shell(s: &str) -> Result<clap_complete::Shell> {
    let s = s.trim().to_ascii_lowercase();
    match s.as_str() {
        "bash" => Ok(clap_complete::Shell::Bash),
        "zsh" => Ok(clap_complete::Shell::Zsh),
        "fish" => Ok(clap_complete::Shell::Fish),
        other => Err(crate::exit::invalid_args(format!(
            "unsupported shell: {other} (use bash|zsh|fish)"
        ))),
    }
}
