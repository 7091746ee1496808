use std::io;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, CommandFactory, Parser, Subcommand};
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;

use crate::config::{EffectiveConfig, HostConfig};
use crate::core::{Code, Report, ReportDocument};
use crate::engine::{EngineOptions, Scheduler};
use crate::fixes::{Dispatcher, FixError, FixRegistry, FixRunOutcome};
use crate::plugins::{PluginCatalog, PluginKind};
use crate::rules::{RuleSet, TagFilter};
use crate::ui::UiConfig;

#[derive(Debug, Parser)]
#[command(
    name = "ddct",
    version,
    about = "Checks and repairs host prerequisites for attaching to the storage fabric"
)]
pub struct Cli {
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,
    #[arg(long, global = true)]
    pub verbose: bool,
    #[arg(long, global = true)]
    pub quiet: bool,
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long = "config-file", short = 'c', global = true)]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    Check(CheckArgs),
    Fix(FixArgs),
    Install(InstallArgs),
    Plugins,
    Tags(TagsArgs),
    Config(ConfigArgs),
    Completion(CompletionArgs),
}

#[derive(Debug, Args)]
pub struct CheckArgs {
    #[arg(short = 't', long, value_delimiter = ',')]
    pub tags: Vec<String>,
    #[arg(short = 'n', long = "not-tags", value_delimiter = ',')]
    pub not_tags: Vec<String>,
    #[arg(short = 'p', long = "use-plugins", value_delimiter = ',')]
    pub use_plugins: Vec<String>,
    #[arg(long = "use-fix-plugins", value_delimiter = ',')]
    pub use_fix_plugins: Vec<String>,
    #[arg(long)]
    pub json: bool,
    #[arg(long)]
    pub out: Option<PathBuf>,
    #[arg(long)]
    pub strict: bool,
    #[arg(long)]
    pub fix: bool,
    #[arg(short = 'w', long = "no-warnings")]
    pub no_warnings: bool,
    #[arg(long = "no-wrap")]
    pub no_wrap: bool,
}

#[derive(Debug, Args)]
pub struct FixArgs {
    pub codes: Vec<String>,
    #[arg(long = "from-report")]
    pub from_report: Option<PathBuf>,
    #[arg(short = 'p', long = "use-plugins", value_delimiter = ',')]
    pub use_plugins: Vec<String>,
    #[arg(long)]
    pub list: bool,
    #[arg(long = "dry-run")]
    pub dry_run: bool,
}

#[derive(Debug, Args)]
pub struct InstallArgs {
    #[arg(required = true, value_delimiter = ',')]
    pub names: Vec<String>,
}

#[derive(Debug, Args)]
pub struct TagsArgs {
    #[arg(short = 'p', long = "use-plugins", value_delimiter = ',')]
    pub use_plugins: Vec<String>,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[arg(long)]
    pub show: bool,
    #[arg(long)]
    pub generate: bool,
    #[arg(long)]
    pub force: bool,
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct CompletionArgs {
    pub shell: String,
}

struct Session {
    home_dir: PathBuf,
    cfg: EffectiveConfig,
    ui: UiConfig,
    host_config_path: Option<PathBuf>,
}

impl Session {
    fn catalog(&self) -> Result<PluginCatalog> {
        Ok(PluginCatalog::discover(&self.cfg.paths.plugin_dir)?)
    }

    fn require_host_config(&self) -> Result<HostConfig> {
        let Some(path) = &self.host_config_path else {
            return Err(crate::exit::invalid_args(format!(
                "no host configuration found: pass --config-file, set DDCT_CONFIG_FILE or create ./{} (see `ddct config --generate`)",
                crate::config::DEFAULT_HOST_CONFIG_FILE
            )));
        };
        if !path.exists() {
            return Err(crate::exit::invalid_args(format!(
                "host configuration file does not exist: {}",
                path.display()
            )));
        }
        HostConfig::load(path).map_err(crate::exit::invalid_args_err)
    }

    fn optional_host_config(&self) -> Result<HostConfig> {
        match &self.host_config_path {
            Some(_) => self.require_host_config(),
            None => Ok(HostConfig::default()),
        }
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    let stdin_is_tty = io::stdin().is_terminal();
    let stdout_is_tty = io::stdout().is_terminal();
    let stderr_is_tty = io::stderr().is_terminal();

    let home_dir = crate::platform::effective_home_dir()?;

    let env_config_path = std::env::var_os("DDCT_CONFIG").map(PathBuf::from);
    let cfg = crate::config::load(
        cli.config.as_deref().or(env_config_path.as_deref()),
        &home_dir,
    )
    .map_err(crate::exit::invalid_args_err)?;

    let ui = UiConfig {
        color: stdout_is_tty && cfg.ui.color && !cli.no_color,
        stdin_is_tty,
        stdout_is_tty,
        stderr_is_tty,
        quiet: cli.quiet,
        verbose: cli.verbose,
    };

    let env_host_config = std::env::var_os("DDCT_CONFIG_FILE").map(PathBuf::from);
    let cwd = std::env::current_dir().context("failed to determine the working directory")?;
    let host_config_path = crate::config::resolve_host_config_path(
        cli.config_file.as_deref(),
        env_host_config.as_deref(),
        &cwd,
    );
    tracing::debug!(
        settings = ?cfg.config_path,
        host_config = ?host_config_path,
        plugin_dir = %cfg.paths.plugin_dir.display(),
        "configuration resolved"
    );

    let ctx = Session {
        home_dir,
        cfg,
        ui,
        host_config_path,
    };

    match cli.command {
        Commands::Check(args) => cmd_check(&ctx, args),
        Commands::Fix(args) => cmd_fix(&ctx, args),
        Commands::Install(args) => cmd_install(&ctx, args),
        Commands::Plugins => cmd_plugins(&ctx),
        Commands::Tags(args) => cmd_tags(&ctx, args),
        Commands::Config(args) => cmd_config(&ctx, args, &cwd),
        Commands::Completion(args) => {
            let shell = parse_shell(&args.shell)?;
            let mut cmd = Cli::command();
            let mut out = io::stdout().lock();
            clap_complete::generate(shell, &mut cmd, "ddct", &mut out);
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default = if verbose {
        "debug"
    } else if quiet {
        "error"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_env("DDCT_LOG").unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn cmd_check(ctx: &Session, args: CheckArgs) -> Result<()> {
    let host_config = ctx.require_host_config()?;

    // Every requested plugin must resolve before the first rule runs.
    let catalog = ctx.catalog()?;
    let mut rules = RuleSet::builtin();
    rules.extend(catalog.load_checks_for(&args.use_plugins)?);
    let registry = if args.fix {
        let mut registry = crate::fixes::builtin::registry();
        registry.merge(catalog.load_fixes_for(&args.use_fix_plugins)?);
        Some(registry)
    } else {
        None
    };

    let report = Report::new();
    report.set_warnings_enabled(ctx.cfg.report.warnings && !args.no_warnings);
    report.set_wrap(ctx.cfg.report.wrap && !args.no_wrap);

    let scheduler = Scheduler::new(EngineOptions {
        max_workers: ctx.cfg.engine.max_workers,
        show_progress: ctx.ui.stderr_is_tty && !ctx.ui.quiet && !args.json,
    });
    let filter = TagFilter::new(args.tags, args.not_tags);
    let summary = scheduler.run(&rules, &host_config, &report, &filter);
    tracing::info!(
        selected = summary.selected,
        errored = summary.errored.len(),
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "checks finished"
    );

    if args.json {
        write_json(&report.render_json())?;
    } else if !ctx.ui.quiet {
        println!("{}", report.render_with(ctx.ui.color));
    }

    if let Some(out) = &args.out {
        let buf = serde_json::to_vec_pretty(&report.snapshot())
            .context("failed to serialize report (JSON)")?;
        std::fs::write(out, buf)
            .with_context(|| format!("failed to write report: {}", out.display()))?;
        if !ctx.ui.quiet && !args.json {
            eprintln!("report written to {}", out.display());
        }
    }

    if let Some(registry) = registry {
        let codes = report.remediation_codes();
        remediate(ctx, &registry, &codes, &host_config, false, !args.json)?;
    }

    if args.strict && report.has_failures() {
        let failed = report.partition(crate::core::Status::Failure);
        return Err(crate::exit::checks_failed(format!(
            "{} check(s) failed: {}",
            failed.len(),
            failed.join(", ")
        )));
    }
    Ok(())
}

fn cmd_fix(ctx: &Session, args: FixArgs) -> Result<()> {
    let catalog = ctx.catalog()?;
    let mut registry = crate::fixes::builtin::registry();
    registry.merge(catalog.load_fixes_for(&args.use_plugins)?);

    if args.list {
        print_fix_table(&registry);
        return Ok(());
    }

    let mut codes = Vec::new();
    if let Some(path) = &args.from_report {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read report: {}", path.display()))
            .map_err(crate::exit::invalid_args_err)?;
        let doc = ReportDocument::from_json(&s)
            .with_context(|| format!("failed to parse report (JSON): {}", path.display()))
            .map_err(crate::exit::invalid_args_err)?;
        codes.extend(doc.codes());
    }
    for raw in &args.codes {
        let code = raw.parse::<Code>().map_err(crate::exit::invalid_args)?;
        codes.push(code);
    }
    let mut seen = std::collections::BTreeSet::new();
    codes.retain(|c| seen.insert(c.clone()));
    if codes.is_empty() {
        return Err(crate::exit::invalid_args(
            "fix: no codes given (pass codes, --from-report <file> or --list)",
        ));
    }

    if args.dry_run {
        return remediate(ctx, &registry, &codes, &HostConfig::default(), true, true);
    }
    let host_config = ctx.require_host_config()?;
    remediate(ctx, &registry, &codes, &host_config, false, true)
}

fn remediate(
    ctx: &Session,
    registry: &FixRegistry,
    codes: &[Code],
    host_config: &HostConfig,
    dry_run: bool,
    show: bool,
) -> Result<()> {
    let show = show && !ctx.ui.quiet;
    let dispatcher = Dispatcher::new(registry, &ctx.cfg.paths.state_file);

    if dry_run {
        let outcome = dispatcher
            .plan(codes)
            .map_err(|e| crate::exit::remediation_failed_err(e.into()))?;
        if show {
            print_outcome(&outcome);
        }
        return Ok(());
    }

    let started_at = OffsetDateTime::now_utc();
    let result = dispatcher.run(codes, host_config);
    let finished_at = OffsetDateTime::now_utc();

    let outcome = match &result {
        Ok(outcome) => Some(outcome),
        Err(err) => err.outcome(),
    };
    if let Some(outcome) = outcome {
        if show {
            print_outcome(outcome);
        }
        match crate::logs::write_fix_run_log(
            &ctx.home_dir,
            started_at,
            finished_at,
            &ctx.cfg.paths.state_file,
            codes,
            outcome,
        ) {
            Ok(path) => {
                if show {
                    eprintln!("log: {}", display_home(&path, &ctx.home_dir));
                }
            }
            Err(err) => tracing::warn!(error = %format!("{err:#}"), "fix run log could not be written"),
        }
    }

    result
        .map(|_| ())
        .map_err(|err: FixError| crate::exit::remediation_failed_err(err.into()))
}

fn cmd_install(ctx: &Session, args: InstallArgs) -> Result<()> {
    let catalog = ctx.catalog()?;
    let installers = catalog.load_installers_for(&args.names)?;
    let host_config = ctx.optional_host_config()?;

    let started_at = OffsetDateTime::now_utc();
    let mut completed = Vec::new();
    let mut failure = None;
    for installer in &installers {
        if !ctx.ui.quiet {
            eprintln!("installing {}...", installer.name());
        }
        tracing::info!(installer = installer.name(), "running installer");
        match installer.run(&host_config) {
            Ok(()) => completed.push(installer.name().to_string()),
            Err(err) => {
                failure = Some(err.context(format!("installer `{}` failed", installer.name())));
                break;
            }
        }
    }
    let finished_at = OffsetDateTime::now_utc();

    if let Err(err) = crate::logs::write_install_log(
        &ctx.home_dir,
        started_at,
        finished_at,
        &args.names,
        &completed,
        failure.as_ref(),
    ) {
        tracing::warn!(error = %format!("{err:#}"), "install log could not be written");
    }

    match failure {
        Some(err) => Err(crate::exit::remediation_failed_err(err)),
        None => {
            if !ctx.ui.quiet {
                println!("installed: {}", completed.join(", "));
            }
            Ok(())
        }
    }
}

fn cmd_plugins(ctx: &Session) -> Result<()> {
    let catalog = ctx.catalog()?;
    if !ctx.ui.quiet {
        println!("plugin directory: {}", ctx.cfg.paths.plugin_dir.display());
    }
    for kind in PluginKind::ALL {
        let rows: Vec<Vec<String>> = catalog
            .listing(kind)
            .into_iter()
            .map(|(name, source)| vec![name, source])
            .collect();
        println!("{}", kind.title());
        crate::ui::print_table(&["Name", "Source"], &rows);
    }
    Ok(())
}

fn cmd_tags(ctx: &Session, args: TagsArgs) -> Result<()> {
    let catalog = ctx.catalog()?;
    let mut rules = RuleSet::builtin();
    rules.extend(catalog.load_checks_for(&args.use_plugins)?);
    for tag in rules.tags() {
        println!("{tag}");
    }
    Ok(())
}

fn cmd_config(ctx: &Session, args: ConfigArgs, cwd: &Path) -> Result<()> {
    if args.generate {
        let path = cwd.join(crate::config::GENERATED_HOST_CONFIG_FILE);
        if path.exists() && !args.force {
            return Err(crate::exit::invalid_args(format!(
                "{} already exists (use --force to overwrite)",
                path.display()
            )));
        }
        let buf = serde_json::to_vec_pretty(&HostConfig::sample())
            .context("failed to serialize sample host configuration")?;
        crate::platform::write_atomic(&path, &buf)?;
        if !ctx.ui.quiet {
            eprintln!(
                "wrote {}; edit it, then run `ddct --config-file {} check`",
                path.display(),
                path.display()
            );
        }
        return Ok(());
    }

    if args.show {
        if args.json {
            write_json(&serde_json::to_value(&ctx.cfg)?)?;
        } else {
            println!("{}", toml::to_string_pretty(&ctx.cfg)?);
        }
    } else if !ctx.ui.quiet {
        eprintln!("config: use `ddct config --show` or `ddct config --generate`");
    }
    Ok(())
}

fn print_fix_table(registry: &FixRegistry) {
    let mut rows = Vec::new();
    for (code, fixes) in registry.iter() {
        for (idx, fix) in fixes.iter().enumerate() {
            rows.push(vec![
                if idx == 0 { code.to_string() } else { String::new() },
                fix.key().to_string(),
                fix.label().to_string(),
                if fix.is_idempotent() { "once" } else { "always" }.to_string(),
            ]);
        }
    }
    crate::ui::print_table(&["Code", "Key", "Fix", "Runs"], &rows);
}

fn print_outcome(outcome: &FixRunOutcome) {
    let verb = if outcome.dry_run { "would apply" } else { "applied" };
    let mut rows = Vec::new();
    for step in &outcome.applied {
        rows.push(vec![step.code.clone(), step.key.clone(), verb.to_string(), step.label.clone()]);
    }
    for step in &outcome.skipped {
        rows.push(vec![
            step.code.clone(),
            step.key.clone(),
            "skipped (already applied)".to_string(),
            step.label.clone(),
        ]);
    }
    if let Some(failed) = &outcome.failed {
        rows.push(vec![
            failed.step.code.clone(),
            failed.step.key.clone(),
            "failed".to_string(),
            failed.error.clone(),
        ]);
    }
    for code in &outcome.unfixable {
        rows.push(vec![
            code.clone(),
            String::new(),
            "no fix registered".to_string(),
            String::new(),
        ]);
    }
    crate::ui::print_table(&["Code", "Key", "Result", "Detail"], &rows);
}

fn display_home(path: &Path, home_dir: &Path) -> String {
    path.strip_prefix(home_dir)
        .map(|p| format!("~/{}", p.display()))
        .unwrap_or_else(|_| path.display().to_string())
}

fn write_json(value: &serde_json::Value) -> Result<()> {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn tag_lists_accept_commas_and_repeats() {
        let cli = Cli::try_parse_from([
            "ddct", "check", "--tags", "basic,local", "-t", "multipath", "-n", "connection",
        ])
        .expect("parse");
        let Commands::Check(args) = cli.command else {
            panic!("expected check");
        };
        assert_eq!(args.tags, vec!["basic", "local", "multipath"]);
        assert_eq!(args.not_tags, vec!["connection"]);
    }

    #[test]
    fn config_file_is_global() {
        let cli = Cli::try_parse_from(["ddct", "fix", "--dry-run", "9000C3B6", "-c", "/tmp/x.json"])
            .expect("parse");
        assert_eq!(cli.config_file.as_deref(), Some(Path::new("/tmp/x.json")));
    }

    #[test]
    fn parse_shell_rejects_unknown_shells() {
        assert!(parse_shell("Bash").is_ok());
        let err = parse_shell("powershell").expect_err("unsupported");
        assert_eq!(crate::exit::exit_code(&err), 2);
    }

    #[test]
    fn display_home_masks_the_home_prefix() {
        assert_eq!(
            display_home(Path::new("/home/u/.config/ddct/logs/x.json"), Path::new("/home/u")),
            "~/.config/ddct/logs/x.json"
        );
        assert_eq!(display_home(Path::new("/var/log/x"), Path::new("/home/u")), "/var/log/x");
    }
}
