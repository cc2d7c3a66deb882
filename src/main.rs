use anyhow::{Context, Result};
use buildmedic::collab::{
    default_build_command, BuildOptions, CommandAdvisor, CommandBuildExecutor, PathToolRegistry,
    StdinPrompt,
};
use buildmedic::config::Config;
use buildmedic::diagnose::{Catalog, Diagnoser};
use buildmedic::fix::assess;
use buildmedic::history::FixHistory;
use buildmedic::project::ProjectContext;
use buildmedic::recovery::{Recovery, RecoveryContext};
use buildmedic::{logging, util};
use clap::{Args, Parser, Subcommand};
use std::io::Read;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "buildmedic",
    about = "Diagnose failed builds, apply guarded fixes, and rebuild",
    version
)]
struct Cli {
    /// More log output (repeat for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Diagnose a saved build log (or stdin)
    Diagnose(DiagnoseArgs),
    /// Run a build command with automatic recovery
    Build(BuildArgs),
    /// Inspect or maintain the fix history
    History(HistoryArgs),
    /// Show the effective configuration
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
struct DiagnoseArgs {
    /// Log file to read instead of stdin
    #[arg(long)]
    log: Option<PathBuf>,
    /// Print the diagnosis as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct BuildArgs {
    /// Project root
    #[arg(long, default_value = ".")]
    path: PathBuf,
    /// Apply fixes up to the configured risk ceiling without asking
    #[arg(long)]
    auto: bool,
    /// Recovery attempts after the first failure
    #[arg(long)]
    retries: Option<u32>,
    /// Skip the rebuild after each fix
    #[arg(long)]
    no_verify: bool,
    /// Build command; detected from the project when omitted
    #[arg(last = true)]
    command: Vec<String>,
}

#[derive(Args, Debug)]
struct HistoryArgs {
    /// Print entries as JSON
    #[arg(long)]
    json: bool,
    /// Delete every entry
    #[arg(long)]
    clear: bool,
    /// Keep only the N most recently used entries
    #[arg(long, value_name = "N")]
    prune: Option<usize>,
}

#[derive(Args, Debug)]
struct ConfigArgs {
    /// Write the effective settings (environment overrides included) to the config file
    #[arg(long)]
    save: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    let config = Config::load();

    match cli.command {
        Commands::Diagnose(args) => run_diagnose(args, &config),
        Commands::Build(args) => run_build(args, config),
        Commands::History(args) => run_history(args, &config),
        Commands::Config(args) => run_config(args, &config),
    }
}

fn open_history(config: &Config) -> Option<FixHistory> {
    let path = config.history_file()?;
    match FixHistory::open(&path) {
        Ok(history) => Some(history),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "fix history unavailable");
            None
        }
    }
}

fn run_diagnose(args: DiagnoseArgs, config: &Config) -> Result<()> {
    let text = match &args.log {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read build output from stdin")?;
            buf
        }
    };

    let cwd = std::env::current_dir().context("Failed to determine current directory")?;
    let project = ProjectContext::detect(&cwd);
    let catalog = Catalog::builtin();
    let history = open_history(config);
    let advisor = config.advisor_command.clone().map(CommandAdvisor::new);

    let mut diagnoser = Diagnoser::new(&catalog);
    if let Some(advisor) = &advisor {
        if config.strategy.use_ai_analysis {
            diagnoser = diagnoser.with_advisor(advisor);
        }
    }
    if let Some(history) = &history {
        diagnoser = diagnoser.with_history(history);
    }
    let diagnosis = diagnoser.diagnose(&text, Some(&project));

    if args.json {
        println!("{}", serde_json::to_string_pretty(&diagnosis)?);
        return Ok(());
    }

    println!();
    println!("  {} ({:.0}% confidence)", diagnosis.kind, diagnosis.confidence * 100.0);
    println!("  {}", diagnosis.diagnosis.replace('\n', "\n  "));
    if diagnosis.fixes.is_empty() {
        println!("\n  No automatic fix available.");
    } else {
        println!("\n  Suggested fixes:");
        for (i, fix) in diagnosis.fixes.iter().enumerate() {
            let risk = assess(fix);
            let learned = if i == 0 && diagnosis.from_history { " [learned]" } else { "" };
            println!("  {}. {} ({} risk){}", i + 1, fix.description, risk.level, learned);
            if let Some(command) = &fix.command {
                println!("       $ {}", command);
            }
        }
    }
    println!();
    Ok(())
}

fn run_build(args: BuildArgs, mut config: Config) -> Result<()> {
    let root = args
        .path
        .canonicalize()
        .with_context(|| format!("Project path {} not found", args.path.display()))?;
    let project = ProjectContext::detect(&root);

    let command = args.command.join(" ");
    if command.trim().is_empty() && default_build_command(&project).is_none() {
        anyhow::bail!(
            "No build command given and none known for {}; pass one after `--`",
            project.build_system.name()
        );
    }

    if args.auto {
        config.strategy.auto_apply_fixes = true;
    }
    if let Some(retries) = args.retries {
        config.strategy.max_retries = retries;
    }
    if args.no_verify {
        config.session.verify_each = false;
    }

    let sandbox = config.sandbox.to_sandbox_config();
    let executor = CommandBuildExecutor::new(sandbox.clone());
    let tools = PathToolRegistry::new(config.install_command.clone());
    let advisor = config.advisor_command.clone().map(CommandAdvisor::new);
    let mut history = open_history(&config);

    tracing::info!(
        root = %project.root.display(),
        language = project.language.name(),
        build_system = project.build_system.name(),
        "starting build"
    );

    let (result, report) = {
        let mut recovery = Recovery::new(&executor, &StdinPrompt, config.ledger.for_project(&root))
            .with_session_config(config.session.clone())
            .with_sandbox(sandbox);
        if let Some(history) = history.as_mut() {
            recovery = recovery.with_history(history);
        }

        let mut ctx = RecoveryContext::new(config.strategy.clone()).with_tools(&tools);
        if let Some(advisor) = &advisor {
            ctx = ctx.with_advisor(advisor);
        }

        let result = recovery.build_with_retry(&mut ctx, &project, &BuildOptions::new(command));
        let purged = recovery.cleanup();
        if purged > 0 {
            tracing::debug!(purged, "expired backups removed");
        }
        let report = recovery.report(&ctx, result.success);
        (result, report)
    };

    if let Some(history) = history.as_mut() {
        history.save().context("Failed to save fix history")?;
    }

    println!("{}", report.display());
    if !result.success {
        eprintln!("\n{}", util::truncate(&result.output(), 4000));
        std::process::exit(result.exit_code.filter(|c| *c != 0).unwrap_or(1));
    }
    Ok(())
}

fn run_history(args: HistoryArgs, config: &Config) -> Result<()> {
    let path = config
        .history_file()
        .context("Could not determine data directory for fix history")?;
    let mut history = FixHistory::open(&path)
        .with_context(|| format!("Failed to open fix history at {}", path.display()))?;

    if args.clear {
        history.clear();
        history.save().context("Failed to save fix history")?;
        println!("  Fix history cleared.");
        return Ok(());
    }
    if let Some(max) = args.prune {
        let removed = history.prune(max);
        history.save().context("Failed to save fix history")?;
        println!("  Pruned {} entr{}.", removed, if removed == 1 { "y" } else { "ies" });
        return Ok(());
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(history.entries())?);
        return Ok(());
    }

    println!("{}", history.stats().display());
    if !history.entries().is_empty() {
        println!();
        for entry in history.entries() {
            println!(
                "  {:<28} {:<14} {:>3}/{:<3} {}",
                util::truncate(&entry.signature, 28),
                entry.fix_kind,
                entry.success_count,
                entry.attempts(),
                entry.fix_description
            );
        }
    }
    Ok(())
}

fn run_config(args: ConfigArgs, config: &Config) -> Result<()> {
    if args.save {
        config.save()?;
        println!("  Configuration saved to {}", Config::config_location());
        return Ok(());
    }
    println!("  # {}", Config::config_location());
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
