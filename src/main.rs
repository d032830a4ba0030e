use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, warn};

use taskwing::agents::bootstrap::{bootstrap, BootstrapOptions, BootstrapReport};
use taskwing::agents::default_agents;
use taskwing::config::Config;
use taskwing::error::{ErrorEnvelope, MemoryError};
use taskwing::hooks::{HookController, HookDecision};
use taskwing::knowledge::KnowledgeService;
use taskwing::logging;
use taskwing::memory::model::NodeType;
use taskwing::memory::Repo;
use taskwing::plan::{self, DagCheck, TaskStatus};
use taskwing::providers::{FsSource, Providers};
use taskwing::workspace::{self, WorkspaceInfo};

#[derive(Parser)]
#[command(
    name = "taskwing",
    version,
    about = "TaskWing - project memory and autonomous task execution",
    long_about = "Builds a local knowledge graph of a repository, answers questions over it, and drives plan tasks from AI assistant stop hooks."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Workspace root (defaults to current directory)
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Machine-readable output and error envelope
    #[arg(long, global = true)]
    json: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze the workspace and ingest findings into project memory
    Bootstrap {
        /// Run analyzers and write the report without ingesting
        #[arg(long)]
        preview: bool,
    },

    /// Hybrid keyword + semantic search over project memory
    Search {
        /// Query text
        query: String,

        /// Maximum results
        #[arg(short, long)]
        limit: Option<usize>,

        /// Restrict to node types (feature, decision, symbol, pattern, constraint)
        #[arg(short = 't', long = "type", value_delimiter = ',')]
        types: Vec<String>,

        /// Include nodes whose evidence no longer matches
        #[arg(long)]
        include_unverified: bool,

        /// Synthesize a cited answer (needs a chat model)
        #[arg(short, long)]
        answer: bool,
    },

    /// Stop-hook protocol for autonomous task execution
    Hook {
        #[command(subcommand)]
        command: HookCommands,
    },

    /// Inspect the active plan
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },

    /// Move a task through its lifecycle
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
}

#[derive(Subcommand)]
enum HookCommands {
    /// Start a new session and print the banner
    SessionInit,
    /// Decide whether the assistant may stop (always exits 0)
    ContinueCheck,
    /// End the session and print its summary
    SessionEnd,
}

#[derive(Subcommand)]
enum PlanCommands {
    /// Show the next ready task
    Next,
    /// Check the task graph for cycles
    Validate,
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Mark a task in progress
    Start { id: String },
    /// Mark a task completed
    Complete { id: String },
}

/// Everything a command needs, opened from the workspace root.
struct Ctx {
    config: Config,
    memory_dir: PathBuf,
    info: WorkspaceInfo,
    svc: KnowledgeService,
}

fn open(root: &Path) -> Result<Ctx> {
    let info = workspace::detect(root)?;
    let config = Config::load(&info.root)?;
    let memory_dir = config.memory_dir(&info.root);
    let repo = Repo::open_dir(&memory_dir)?;
    let providers = Providers::from_config(&config.providers)?;
    let files = Arc::new(FsSource::new(&info.root));
    let svc = KnowledgeService::new(Arc::new(repo), providers, files, info.to_workspace())?
        .with_retrieval(config.retrieval.clone());
    debug!(root = %info.root.display(), memory = %memory_dir.display(), "workspace opened");
    Ok(Ctx {
        config,
        memory_dir,
        info,
        svc,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let line = serde_json::to_string(value).context("Failed to encode output")?;
    println!("{line}");
    Ok(())
}

fn active_plan_id(ctx: &Ctx) -> Result<String> {
    let ws = ctx.svc.workspace_id();
    ctx.svc
        .repo()
        .read(|c| plan::active_plan(c, ws))?
        .map(|p| p.id)
        .ok_or_else(|| MemoryError::not_found("plan", "active").into())
}

// ── Commands ────────────────────────────────────────────────────────────────

fn run_bootstrap(ctx: &Ctx, preview: bool, json: bool) -> Result<bool> {
    let mut opts = BootstrapOptions::from_config(&ctx.config.agents);
    opts.preview = preview;
    let report = bootstrap(&ctx.svc, &ctx.info, &ctx.memory_dir, &default_agents(), &opts)?;
    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }
    Ok(report.is_success())
}

fn print_report(report: &BootstrapReport) {
    println!(
        "Bootstrap {} ({}, {} findings, {} relationships, {:.0}% coverage)",
        if report.preview { "preview" } else { "finished" },
        report.kind,
        report.total_findings,
        report.total_relationships,
        report.coverage_pct
    );
    for a in &report.agents {
        let scope = a.service.as_deref().map(|s| format!(" [{s}]")).unwrap_or_default();
        match &a.error {
            Some(e) => println!("  {}{scope}: {e}", a.agent),
            None => println!("  {}{scope}: {} findings in {}ms", a.agent, a.findings, a.duration_ms),
        }
    }
    if let Some(ingest) = &report.ingest {
        println!(
            "Ingested: {} created, {} merged, {} unchanged, {} unverified",
            ingest.nodes_created, ingest.nodes_merged, ingest.nodes_unchanged, ingest.unverified
        );
    }
    if let Some(reason) = &report.refused_reason {
        println!("Not ingested: {reason}");
    }
    if let Some(err) = &report.ingest_error {
        println!("Ingest failed: {err}");
    }
}

struct SearchArgs {
    query: String,
    limit: Option<usize>,
    types: Vec<String>,
    include_unverified: bool,
    answer: bool,
}

fn run_search(ctx: &Ctx, args: SearchArgs, json: bool) -> Result<()> {
    let mut opts = ctx.svc.search_options();
    if let Some(limit) = args.limit {
        opts.limit = limit.max(1);
    }
    if !args.types.is_empty() {
        let types = args
            .types
            .iter()
            .map(|t| NodeType::parse(t))
            .collect::<Result<Vec<_>, _>>()?;
        opts.type_filter = Some(types);
    }
    opts.include_unverified = args.include_unverified;
    opts.generate_answer = args.answer;

    if json {
        return print_json(&ctx.svc.search(&args.query, &opts)?);
    }

    let resp = if args.answer {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        let resp = ctx.svc.search_streaming(&args.query, &opts, &mut out)?;
        writeln!(out).context("Failed to write answer")?;
        resp
    } else {
        ctx.svc.search(&args.query, &opts)?
    };
    if resp.results.is_empty() {
        println!("No results for '{}'", args.query);
    }
    for (i, r) in resp.results.iter().enumerate() {
        println!("{:>2}. [{}] {} ({:.4}, {:?})", i + 1, r.node_type, r.title, r.score, r.source);
        if !r.summary.is_empty() {
            println!("    {}", r.summary.lines().next().unwrap_or_default());
        }
        println!("    id: {}", r.node_id);
    }
    if resp.answer_unavailable {
        println!("(answer unavailable: no chat model configured or the call failed)");
    }
    if !resp.degraded.is_empty() {
        warn!("degraded: {}", resp.degraded.join(", "));
    }
    Ok(())
}

fn run_hook(ctx: &Ctx, command: HookCommands, json: bool) -> Result<()> {
    let hooks = HookController::new(&ctx.svc, &ctx.memory_dir, ctx.config.hooks.clone());
    match command {
        HookCommands::SessionInit => {
            let banner = hooks.session_init()?;
            if json {
                print_json(&serde_json::json!({ "banner": banner }))?;
            } else {
                print!("{banner}");
            }
        }
        HookCommands::ContinueCheck => print_json(&hooks.continue_check()?)?,
        HookCommands::SessionEnd => match hooks.session_end()? {
            Some(summary) if json => print_json(&summary)?,
            Some(s) => println!(
                "Session {} ended: {}/{} tasks completed in {} minutes",
                s.session_id, s.tasks_completed, s.tasks_started, s.minutes
            ),
            None if json => print_json(&serde_json::Value::Null)?,
            None => println!("No active session"),
        },
    }
    Ok(())
}

/// The hook protocol always gets a decision line and exit 0; a failure
/// approves so the assistant is never trapped by a broken hook.
fn continue_check(root: &Path) -> ExitCode {
    let decision = open(root).and_then(|ctx| {
        let hooks = HookController::new(&ctx.svc, &ctx.memory_dir, ctx.config.hooks.clone());
        hooks.continue_check()
    });
    let decision = decision.unwrap_or_else(|e| {
        warn!("continue-check failed: {e:#}");
        HookDecision::approve(format!("TaskWing hook error: {e:#}"))
    });
    match serde_json::to_string(&decision) {
        Ok(line) => println!("{line}"),
        Err(e) => eprintln!("error: {e}"),
    }
    ExitCode::SUCCESS
}

fn run_plan(ctx: &Ctx, command: PlanCommands, json: bool) -> Result<bool> {
    let plan_id = active_plan_id(ctx)?;
    match command {
        PlanCommands::Next => {
            let next = ctx.svc.repo().read(|c| plan::next_task(c, &plan_id))?;
            match &next {
                _ if json => print_json(&next)?,
                Some(t) => println!("{} [{}] {}", t.id, t.priority, t.title),
                None => println!("No ready tasks"),
            }
            Ok(true)
        }
        PlanCommands::Validate => {
            let check = ctx.svc.repo().read(|c| plan::validate_dag(c, &plan_id))?;
            let ok = matches!(check, DagCheck::Ok { .. });
            match &check {
                _ if json => print_json(&check)?,
                DagCheck::Ok { order } => println!("OK: {} tasks, acyclic", order.len()),
                DagCheck::Cycle { path } => println!("Cycle: {}", path.join(" -> ")),
            }
            Ok(ok)
        }
    }
}

fn run_task(ctx: &Ctx, command: TaskCommands, json: bool) -> Result<()> {
    let (id, to) = match command {
        TaskCommands::Start { id } => (id, TaskStatus::InProgress),
        TaskCommands::Complete { id } => (id, TaskStatus::Completed),
    };
    let now = ctx.svc.repo().now_millis();
    let task = ctx.svc.repo().write(|tx| plan::set_task_status(tx, now, &id, to))?;
    if json {
        print_json(&task)?;
    } else {
        println!("{} {}: {}", task.id, task.status, task.title);
    }
    Ok(())
}

fn run(cli: Cli) -> Result<bool> {
    let ctx = open(&cli.root)?;
    match cli.command {
        Commands::Bootstrap { preview } => run_bootstrap(&ctx, preview, cli.json),
        Commands::Search {
            query,
            limit,
            types,
            include_unverified,
            answer,
        } => {
            let args = SearchArgs {
                query,
                limit,
                types,
                include_unverified,
                answer,
            };
            run_search(&ctx, args, cli.json).map(|_| true)
        }
        Commands::Hook { command } => run_hook(&ctx, command, cli.json).map(|_| true),
        Commands::Plan { command } => run_plan(&ctx, command, cli.json),
        Commands::Task { command } => run_task(&ctx, command, cli.json).map(|_| true),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    if matches!(
        cli.command,
        Commands::Hook {
            command: HookCommands::ContinueCheck
        }
    ) {
        return continue_check(&cli.root);
    }

    let json = cli.json;
    match run(cli) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            let envelope = ErrorEnvelope::from_error(&e);
            if json {
                match serde_json::to_string(&envelope) {
                    Ok(line) => println!("{line}"),
                    Err(_) => eprintln!("error: {}", envelope.message),
                }
            } else {
                eprintln!("error: {}", envelope.message);
                if let Some(hint) = &envelope.hint {
                    eprintln!("hint: {hint}");
                }
            }
            ExitCode::FAILURE
        }
    }
}
