mod agent;
mod analyzer;
mod build;
mod cancel;
mod config;
mod error;
mod evaluate;
mod knowledge;
mod llm;
mod models;
mod preprocess;
mod project;
mod sandbox;
mod store;

use agent::state::Checkpoint;
use agent::PlannerAgent;
use analyzer::format::Formatter;
use analyzer::AnalyzerBridge;
use anyhow::Context;
use build::MavenDriver;
use cancel::CancelToken;
use clap::{Args, Parser, Subcommand};
use config::Config;
use knowledge::embedding::EmbeddingClient;
use knowledge::store::VectorStore;
use knowledge::KnowledgeBase;
use llm::LlmClient;
use models::Target;
use preprocess::WorkerContext;
use project::Scanner;
use sandbox::SandboxManager;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use store::Database;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "coevo")]
#[command(version)]
#[command(about = "LLM-driven co-evolution of unit tests and mutants")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the full pipeline against a target project
    Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to the target Maven project
    #[arg(long)]
    project_path: PathBuf,

    /// Path to configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Maximum planner rounds (overrides config)
    #[arg(long)]
    max_iterations: Option<u32>,

    /// LLM call budget (overrides config)
    #[arg(long)]
    budget: Option<u32>,

    /// Enable parallel preprocessing
    #[arg(long)]
    parallel: bool,

    /// Concurrent target evaluations (overrides config)
    #[arg(long)]
    parallel_targets: Option<usize>,

    /// Directory of bug reports to index
    #[arg(long)]
    bug_reports_dir: Option<PathBuf>,

    /// Resume from a checkpoint file
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let Commands::Run(args) = cli.command;

    FmtSubscriber::builder()
        .with_max_level(if args.debug { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .init();

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("fatal: {e}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(args: RunArgs) -> anyhow::Result<i32> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(max_iterations) = args.max_iterations {
        config.agent.max_iterations = max_iterations;
    }
    if let Some(budget) = args.budget {
        config.agent.budget_llm_calls = budget;
    }
    if args.parallel {
        config.preprocessing.enabled = true;
    }
    if let Some(parallel_targets) = args.parallel_targets {
        config.agent.parallel_targets = parallel_targets;
    }
    config.validate()?;

    let checkpoint = args
        .resume
        .as_deref()
        .map(Checkpoint::load)
        .transpose()?;

    std::fs::create_dir_all(config.data_dir())
        .with_context(|| format!("cannot create data dir {}", config.data_dir().display()))?;
    let config = Arc::new(config);

    // Durable stores
    let db = Database::new(&config.database_path()).await?;
    db.run_migrations().await?;
    if checkpoint.is_none() {
        db.reset().await?;
    }
    tracing::info!("store initialized at {}", config.database_path().display());

    // Knowledge base
    let namespace = match &checkpoint {
        Some(checkpoint) => checkpoint.knowledge_namespace.clone(),
        None => format!("run-{}", chrono::Utc::now().format("%Y%m%dT%H%M%S")),
    };
    let vector_store = VectorStore::new(&config.knowledge_db_path()).await?;
    let embedder = EmbeddingClient::new(
        config.embedding_base_url(),
        &config.llm.api_key,
        &config.knowledge.embedding.model,
        Duration::from_secs(config.execution.timeout_seconds),
        Some(config.embedding_cache_dir()),
    )?;
    let knowledge = Arc::new(KnowledgeBase::new(
        vector_store,
        embedder,
        config.knowledge.enabled,
        namespace,
        config.knowledge.alpha,
    ));

    // External collaborators; any of these missing is fatal.
    let llm = Arc::new(LlmClient::new(
        &config.llm.base_url,
        &config.llm.api_key,
        &config.llm.model,
        config.llm.temperature,
        Duration::from_secs(config.execution.timeout_seconds),
    )?);
    let analyzer = Arc::new(AnalyzerBridge::new(
        &config.execution.java_cmd,
        &config.execution.analyzer_jar,
        Duration::from_secs(config.execution.timeout_seconds),
    )?);
    let formatter = Arc::new(Formatter::new(
        &config.execution.java_cmd,
        &config.execution.formatter_jar,
        config.formatting.style,
        Duration::from_secs(config.execution.timeout_seconds),
    )?);
    let driver = Arc::new(
        MavenDriver::locate(
            Duration::from_secs(config.execution.timeout_seconds),
            Duration::from_secs(config.execution.test_timeout_seconds),
            Duration::from_secs(config.execution.coverage_timeout_seconds),
        )
        .await?,
    );

    // Sandboxes
    let sandboxes = SandboxManager::new(config.sandbox_root())?;
    let resuming = checkpoint.is_some();
    let workspace = if resuming {
        sandboxes.open_workspace()?
    } else {
        sandboxes.create_workspace(&args.project_path).await?
    };

    // Cooperative cancellation on ctrl-c
    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("cancellation requested, finishing current step");
                cancel.cancel();
            }
        });
    }

    // Targets: fresh scan, or the checkpointed set on resume
    let targets = match &checkpoint {
        Some(checkpoint) => checkpoint.targets.clone(),
        None => {
            let scanner = Scanner::new(&analyzer);
            scanner.scan(workspace.path()).await?
        }
    };
    if targets.is_empty() {
        tracing::warn!("no targets found; nothing to do");
        return Ok(0);
    }
    for target in &targets {
        db.upsert_target(target).await?;
    }

    if !resuming {
        index_knowledge(&knowledge, &workspace, &targets, args.bug_reports_dir.clone()).await?;
    }

    if config.preprocessing.enabled && !resuming {
        let ctx = Arc::new(WorkerContext {
            config: Arc::clone(&config),
            knowledge: Arc::clone(&knowledge),
            llm: Arc::clone(&llm),
            analyzer: Arc::clone(&analyzer),
            formatter: Arc::clone(&formatter),
            driver: Arc::clone(&driver),
            sandboxes: sandboxes.clone(),
            workspace: workspace.clone(),
            cancel: cancel.clone(),
        });
        preprocess::run_preprocessing(ctx, &db, &targets).await?;
    }

    let mut planner = PlannerAgent::new(
        &config,
        &db,
        &knowledge,
        &llm,
        &analyzer,
        &formatter,
        &driver,
        &sandboxes,
        workspace,
        cancel,
        targets,
    );
    if let Some(checkpoint) = checkpoint {
        planner.resume_from(checkpoint).await?;
    }

    let outcome = planner.run().await?;
    tracing::info!("workspace with final test suite: {}", config.sandbox_root().join("workspace").display());
    Ok(outcome.exit_code())
}

/// Index source contracts (per target, class chunks deduped) and bug
/// reports into this run's namespace.
async fn index_knowledge(
    knowledge: &KnowledgeBase,
    workspace: &sandbox::Workspace,
    targets: &[Target],
    bug_reports_dir: Option<PathBuf>,
) -> error::Result<()> {
    knowledge.clear_namespace().await?;

    let mut source_cache: HashMap<String, String> = HashMap::new();
    let mut report = knowledge::IndexReport::default();
    for target in targets {
        if !source_cache.contains_key(&target.file_path) {
            let absolute = workspace.path().join(&target.file_path);
            match tokio::fs::read_to_string(&absolute).await {
                Ok(content) => {
                    source_cache.insert(target.file_path.clone(), content);
                }
                Err(e) => {
                    tracing::warn!("cannot read {} for indexing: {e}", target.file_path);
                    continue;
                }
            }
        }
        let source = &source_cache[&target.file_path];
        let chunk_report = knowledge.index_source(target, source).await?;
        report.chunks_indexed += chunk_report.chunks_indexed;
        report.embedding_failures += chunk_report.embedding_failures;
    }
    tracing::info!(
        "indexed {} contract chunks ({} embedding failures)",
        report.chunks_indexed,
        report.embedding_failures
    );

    if let Some(dir) = bug_reports_dir {
        knowledge.index_bug_reports(&[dir]).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parse_run() {
        let cli = Cli::try_parse_from(["coevo", "run", "--project-path", "/tmp/demo"]).unwrap();
        let Commands::Run(args) = cli.command;
        assert_eq!(args.project_path, PathBuf::from("/tmp/demo"));
        assert!(!args.parallel);
        assert!(!args.debug);
        assert!(args.resume.is_none());
    }

    #[test]
    fn test_cli_requires_project_path() {
        assert!(Cli::try_parse_from(["coevo", "run"]).is_err());
    }

    #[test]
    fn test_cli_parse_all_flags() {
        let cli = Cli::try_parse_from([
            "coevo",
            "run",
            "--project-path",
            "/tmp/demo",
            "--config",
            "/tmp/config.toml",
            "--max-iterations",
            "25",
            "--budget",
            "500",
            "--parallel",
            "--parallel-targets",
            "2",
            "--bug-reports-dir",
            "/tmp/bugs",
            "--resume",
            "/tmp/checkpoint.json",
            "--debug",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command;
        assert_eq!(args.max_iterations, Some(25));
        assert_eq!(args.budget, Some(500));
        assert!(args.parallel);
        assert_eq!(args.parallel_targets, Some(2));
        assert_eq!(args.bug_reports_dir, Some(PathBuf::from("/tmp/bugs")));
        assert_eq!(args.resume, Some(PathBuf::from("/tmp/checkpoint.json")));
        assert!(args.debug);
    }

    #[test]
    fn test_cli_validate() {
        let cmd = Cli::command();
        cmd.debug_assert();
    }

    #[test]
    fn test_cli_version_and_about() {
        let cmd = Cli::command();
        assert!(cmd.get_version().is_some());
        assert!(cmd.get_about().is_some());
    }
}
