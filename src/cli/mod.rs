//! AQ-016: CLI subcommands — init, validate, check, lint-plan, schema, ask, completions.

use crate::core::{config, draft, guard, resolver, state, types};
use crate::core::engine::Engine;
use crate::events::{FanoutSink, JsonlSink, ProgressSink, TracingSink};
use crate::planner::command::CommandPlanner;
use crate::planner::scripted::ScriptedPlanner;
use crate::planner::Planner;
use crate::source::catalog::LexicalRetriever;
use crate::source::sqlite::SqliteExecutor;
use crate::source::SchemaRetriever;
use clap::{CommandFactory, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "stepql",
    version,
    about = "Adaptive multi-step query planning over read-only data sources"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new stepql project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate stepql.yaml
    Validate {
        /// Path to stepql.yaml
        #[arg(short, long, default_value = config::CONFIG_FILE)]
        file: PathBuf,
    },

    /// Check that a SQL statement is read-only
    Check {
        /// Statement to check
        sql: String,
    },

    /// Validate a plan draft (JSON or YAML) and print its execution order
    LintPlan {
        /// Plan draft file
        plan: PathBuf,
    },

    /// Show the schema retrieved for a question
    Schema {
        /// Path to stepql.yaml
        #[arg(short, long, default_value = config::CONFIG_FILE)]
        file: PathBuf,

        /// Database id (default: first configured)
        #[arg(short, long)]
        database: Option<String>,

        /// Question to rank tables against
        #[arg(default_value = "")]
        question: String,
    },

    /// Answer a question end to end
    Ask {
        /// Question to answer
        question: String,

        /// Path to stepql.yaml
        #[arg(short, long, default_value = config::CONFIG_FILE)]
        file: PathBuf,

        /// Database id (default: first configured)
        #[arg(short, long)]
        database: Option<String>,

        /// Replay a YAML planner script instead of the configured command
        #[arg(long, env = "STEPQL_PLANNER_SCRIPT")]
        planner_script: Option<PathBuf>,

        /// Append progress events to this JSONL file
        #[arg(long)]
        events: Option<PathBuf>,

        /// Save the artifact into this directory
        #[arg(long)]
        out: Option<PathBuf>,

        /// Print the artifact as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print shell completions
    Completions {
        /// Target shell
        shell: clap_complete::Shell,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Check { sql } => cmd_check(&sql),
        Commands::LintPlan { plan } => cmd_lint_plan(&plan),
        Commands::Schema {
            file,
            database,
            question,
        } => cmd_schema(&file, database.as_deref(), &question),
        Commands::Ask {
            question,
            file,
            database,
            planner_script,
            events,
            out,
            json,
        } => cmd_ask(&AskArgs {
            question: &question,
            file: &file,
            database: database.as_deref(),
            planner_script: planner_script.as_deref(),
            events: events.as_deref(),
            out: out.as_deref(),
            json,
        }),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "stepql", &mut std::io::stdout());
            Ok(())
        }
    }
}

fn cmd_init(path: &Path) -> Result<(), String> {
    let config_path = path.join(config::CONFIG_FILE);
    if config_path.exists() {
        return Err(format!("{} already exists", config_path.display()));
    }

    let artifacts = path.join("artifacts");
    std::fs::create_dir_all(&artifacts)
        .map_err(|e| format!("cannot create artifacts dir: {}", e))?;
    std::fs::write(&config_path, config::CONFIG_TEMPLATE)
        .map_err(|e| format!("cannot write {}: {}", config_path.display(), e))?;

    println!("Initialized stepql project at {}", path.display());
    println!("  Created: {}", config_path.display());
    println!("  Created: {}/", artifacts.display());
    Ok(())
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let config = config::parse_config_file(file).map_err(|e| e.to_string())?;
    let errors = config::validate_config(&config);

    if errors.is_empty() {
        println!(
            "OK: {} ({} databases, planner: {})",
            file.display(),
            config.databases.len(),
            config.planner.command.as_deref().unwrap_or("none")
        );
        Ok(())
    } else {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        Err(format!("{} validation error(s)", errors.len()))
    }
}

fn cmd_check(sql: &str) -> Result<(), String> {
    guard::check_read_only(sql).map_err(|e| e.to_string())?;
    println!("OK: read-only");
    Ok(())
}

/// Parse a plan draft file; `.yaml`/`.yml` files are YAML, everything else
/// goes through the planner-response parser.
fn read_plan_draft(path: &Path) -> Result<draft::PlanDraft, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    if is_yaml {
        serde_yaml_ng::from_str(&content).map_err(|e| format!("YAML parse error: {}", e))
    } else {
        draft::parse_plan_draft(&content).map_err(|e| e.to_string())
    }
}

fn cmd_lint_plan(path: &Path) -> Result<(), String> {
    let plan = read_plan_draft(path)?;
    let steps = draft::build_steps(&plan).map_err(|e| e.to_string())?;
    let order = resolver::execution_order(&steps)?;

    let mut unsafe_steps = 0;
    println!("Plan: {} ({} steps)", plan.intent, steps.len());
    for id in &order {
        let Some(step) = steps.iter().find(|s| s.id == *id) else {
            continue;
        };
        let verdict = match step.executable_sql() {
            None => "skip".to_string(),
            Some(sql) => match guard::check_read_only(sql) {
                Ok(()) => "ok".to_string(),
                Err(e) => {
                    unsafe_steps += 1;
                    e.to_string()
                }
            },
        };
        let deps = if step.depends_on.is_empty() {
            String::new()
        } else {
            format!(
                " after [{}]",
                step.depends_on
                    .iter()
                    .map(|d| d.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };
        println!("  {} [{}] {}{}: {}", step.id, step.kind, step.description, deps, verdict);
    }

    if unsafe_steps > 0 {
        return Err(format!("{} unsafe step(s)", unsafe_steps));
    }
    Ok(())
}

/// Parse and validate a config file, returning errors if invalid.
fn parse_and_validate(file: &Path) -> Result<types::StepqlConfig, String> {
    let config = config::parse_config_file(file).map_err(|e| e.to_string())?;
    let errors = config::validate_config(&config);
    if errors.is_empty() {
        return Ok(config);
    }
    for e in &errors {
        eprintln!("  ERROR: {}", e);
    }
    Err("validation failed".to_string())
}

/// Pick a database profile and resolve its path against the config location.
fn select_database<'a>(
    config: &'a types::StepqlConfig,
    file: &Path,
    database: Option<&str>,
) -> Result<(&'a str, &'a types::DatabaseProfile, PathBuf), String> {
    let (id, profile) = match database {
        Some(id) => config
            .databases
            .get_key_value(id)
            .ok_or_else(|| format!("unknown database '{}'", id))?,
        None => config
            .databases
            .first()
            .ok_or_else(|| "no databases configured".to_string())?,
    };
    let dir = file.parent().unwrap_or_else(|| Path::new("."));
    let path = config::database_path(dir, profile);
    Ok((id.as_str(), profile, path))
}

fn runtime() -> Result<tokio::runtime::Runtime, String> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("cannot start runtime: {}", e))
}

fn cmd_schema(file: &Path, database: Option<&str>, question: &str) -> Result<(), String> {
    let config = parse_and_validate(file)?;
    let (id, _, path) = select_database(&config, file, database)?;
    let retriever = LexicalRetriever::new()
        .with_sqlite(id, &path)
        .map_err(|e| e.to_string())?;

    let tables = runtime()?
        .block_on(retriever.retrieve_relevant_schema(id, question, config.policy.schema_top_k))
        .map_err(|e| e.to_string())?;

    println!("{} ({} tables)", id, tables.len());
    for table in &tables {
        println!("  {}", table.render());
    }
    Ok(())
}

struct AskArgs<'a> {
    question: &'a str,
    file: &'a Path,
    database: Option<&'a str>,
    planner_script: Option<&'a Path>,
    events: Option<&'a Path>,
    out: Option<&'a Path>,
    json: bool,
}

fn cmd_ask(args: &AskArgs) -> Result<(), String> {
    let config = parse_and_validate(args.file)?;
    let (id, profile, path) = select_database(&config, args.file, args.database)?;

    let retriever = LexicalRetriever::new()
        .with_sqlite(id, &path)
        .map_err(|e| e.to_string())?;
    let executor = SqliteExecutor::new(&path, &config.executor);
    let planner: Arc<dyn Planner> = match args.planner_script {
        Some(script) => Arc::new(ScriptedPlanner::load(script)?),
        None => Arc::new(CommandPlanner::from_settings(&config.planner).map_err(|e| e.to_string())?),
    };

    let mut sink = FanoutSink::new().with(TracingSink);
    if let Some(events) = args.events {
        sink = sink.with(JsonlSink::new(events));
    }
    let sink: Arc<dyn ProgressSink> = Arc::new(sink);

    let engine = Engine::new(Arc::new(retriever), planner, Arc::new(executor))
        .with_sink(sink)
        .with_policy(config.policy.clone());

    let outcome = runtime()?
        .block_on(engine.run_plan(args.question, id, &profile.dialect, &[]))
        .map_err(|e| e.to_string())?;
    let artifact = types::Artifact::from_plan(&outcome.plan);

    if let Some(out) = args.out {
        let saved = state::save_artifact(out, &artifact).map_err(|e| e.to_string())?;
        if !args.json {
            println!("Saved: {}", saved.display());
        }
    }

    if args.json {
        let json = serde_json::to_string_pretty(&artifact)
            .map_err(|e| format!("serialize error: {}", e))?;
        println!("{}", json);
        return Ok(());
    }

    print_outcome(&outcome.plan, &artifact);
    Ok(())
}

/// Display a finished plan to stdout.
fn print_outcome(plan: &types::Plan, artifact: &types::Artifact) {
    println!("{}", artifact.answer);
    println!();
    if let Some(ref sql) = artifact.sql {
        println!("SQL: {}", sql);
    }
    if let Some(ref chart) = artifact.chart_spec {
        println!("Chart: {} ({} categories)", chart.kind, chart.data.len());
    }

    let summary = plan.summary();
    println!(
        "Steps: {} succeeded, {} failed, {} skipped, {} blocked ({} rows, {}ms)",
        summary.successful_steps,
        summary.failed_steps,
        summary.skipped_steps,
        summary.pending_steps,
        summary.total_rows,
        summary.total_elapsed_ms
    );
}
