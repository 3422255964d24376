//! Parallel preprocessing: seed every target with initial tests and
//! mutants before the main loop starts.
//!
//! Each target runs `generate-initial-tests → generate-initial-mutants`
//! in its own worker, bounded by `preprocessing.max_workers`. Workers
//! validate generated tests in an independent target sandbox and return
//! everything by value; only the coordinator touches the workspace and the
//! store.

use crate::agent::writeback;
use crate::analyzer::format::Formatter;
use crate::analyzer::AnalyzerBridge;
use crate::build::MavenDriver;
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::Result;
use crate::knowledge::store::{ChunkFilter, ChunkKind};
use crate::knowledge::{format_context, KnowledgeBase};
use crate::llm::prompts::{self, MutantProposal, PromptRole, TestPromptInput, MutantPromptInput};
use crate::llm::LlmClient;
use crate::models::{Target, TestOrigin, TestStatus};
use crate::sandbox::{SandboxManager, Workspace};
use crate::store::Database;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Shared handles a preprocessing worker needs.
pub struct WorkerContext {
    pub config: Arc<Config>,
    pub knowledge: Arc<KnowledgeBase>,
    pub llm: Arc<LlmClient>,
    pub analyzer: Arc<AnalyzerBridge>,
    pub formatter: Arc<Formatter>,
    pub driver: Arc<MavenDriver>,
    pub sandboxes: SandboxManager,
    pub workspace: Workspace,
    pub cancel: CancelToken,
}

/// A validated initial test file for one target.
struct SeedTests {
    file_content: String,
    methods: Vec<(String, String)>,
}

/// Everything one worker produced, returned by value.
struct WorkerResult {
    target: Target,
    tests: Option<SeedTests>,
    mutants: Vec<MutantProposal>,
    llm_calls: u32,
}

/// Aggregate preprocessing report.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreprocessReport {
    pub targets_processed: usize,
    pub targets_with_tests: usize,
    pub tests_seeded: usize,
    pub mutants_seeded: usize,
}

/// Run the preprocessing phase over all targets.
pub async fn run_preprocessing(
    ctx: Arc<WorkerContext>,
    db: &Database,
    targets: &[Target],
) -> Result<PreprocessReport> {
    let worker_count = ctx.config.preprocessing.max_workers;
    let semaphore = Arc::new(Semaphore::new(worker_count));
    let mut join_set = JoinSet::new();

    tracing::info!(
        "preprocessing {} targets with {} workers",
        targets.len(),
        worker_count
    );

    for (index, target) in targets.iter().cloned().enumerate() {
        let ctx = Arc::clone(&ctx);
        let semaphore = Arc::clone(&semaphore);
        join_set.spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            if ctx.cancel.is_cancelled() {
                return None;
            }
            Some(preprocess_target(ctx, index, target).await)
        });
    }

    let mut report = PreprocessReport::default();
    while let Some(joined) = join_set.join_next().await {
        let result = match joined {
            Ok(Some(result)) => result,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!("preprocessing worker panicked: {e}");
                continue;
            }
        };

        report.targets_processed += 1;
        for _ in 0..result.llm_calls {
            db.record_llm_call().await?;
        }

        if let Some(seed) = result.tests {
            let path = writeback::test_file_path(&ctx.workspace, &result.target);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, &seed.file_content).await?;

            for (name, code) in &seed.methods {
                let id = db
                    .insert_test(
                        &result.target.id,
                        name,
                        code,
                        TestStatus::PendingFormat,
                        &TestOrigin::Initial,
                        0,
                    )
                    .await?;
                db.update_test_status(id, TestStatus::Active).await?;
                report.tests_seeded += 1;
            }
            report.targets_with_tests += 1;
        }

        for proposal in &result.mutants {
            db.insert_mutant(&result.target.id, &proposal.patch, proposal.tag, 0)
                .await?;
            report.mutants_seeded += 1;
        }
    }

    // The per-target sandboxes validated each file in isolation; one final
    // compile catches cross-file surprises early.
    if report.targets_with_tests > 0 {
        let compile = ctx.driver.compile_tests(ctx.workspace.path()).await;
        if !compile.success {
            tracing::warn!(
                "seeded test suite does not compile together: {}",
                compile.error.unwrap_or_default()
            );
        }
    }

    tracing::info!(
        "preprocessing done: {}/{} targets seeded, {} tests, {} mutants",
        report.targets_with_tests,
        report.targets_processed,
        report.tests_seeded,
        report.mutants_seeded
    );
    Ok(report)
}

/// One worker: initial tests (validated in a sandbox), then initial
/// mutants. Mutants are generated even when no test compiles; they simply
/// survive trivially until the first refine cycle.
async fn preprocess_target(
    ctx: Arc<WorkerContext>,
    index: usize,
    target: Target,
) -> WorkerResult {
    let mut llm_calls = 0u32;

    let context = retrieval_context(&ctx, &target).await;

    let tests = match seed_tests(&ctx, index, &target, context.as_deref(), &mut llm_calls).await
    {
        Ok(seed) => Some(seed),
        Err(e) => {
            tracing::warn!(target = %target.id, "initial tests dropped: {e}");
            None
        }
    };

    let mutants = match seed_mutants(&ctx, &target, context.as_deref(), &mut llm_calls).await {
        Ok(mutants) => mutants,
        Err(e) => {
            tracing::warn!(target = %target.id, "initial mutants dropped: {e}");
            Vec::new()
        }
    };

    WorkerResult {
        target,
        tests,
        mutants,
        llm_calls,
    }
}

async fn retrieval_context(ctx: &WorkerContext, target: &Target) -> Option<String> {
    let query = format!(
        "{} {}",
        target.signature,
        target.javadoc.as_deref().unwrap_or_default()
    );
    let filter = ChunkFilter {
        kind: Some(ChunkKind::Contract),
        target_class: Some(target.id.class_fqn.clone()),
        ..ChunkFilter::default()
    };
    let mut chunks = ctx
        .knowledge
        .retrieve(&query, &filter, ctx.config.knowledge.top_k_contracts)
        .await
        .unwrap_or_default();

    let bug_filter = ChunkFilter {
        kind: Some(ChunkKind::BugReport),
        ..ChunkFilter::default()
    };
    chunks.extend(
        ctx.knowledge
            .retrieve(
                &format!("bugs in {}", target.signature),
                &bug_filter,
                ctx.config.knowledge.top_k_bugs,
            )
            .await
            .unwrap_or_default(),
    );

    format_context(&chunks)
}

async fn seed_tests(
    ctx: &WorkerContext,
    index: usize,
    target: &Target,
    context: Option<&str>,
    llm_calls: &mut u32,
) -> crate::error::Result<SeedTests> {
    let input = TestPromptInput {
        target,
        context,
        existing_test_methods: &[],
        surviving_mutants: &[],
    };
    let (system, user) = prompts::render_test_prompt(PromptRole::GenTestsInitial, &input);

    *llm_calls += 1;
    let response = ctx.llm.chat_json(&system, &user).await?;
    let validated = prompts::validate_tests(response)?;

    let package = target.id.class_fqn.rsplit_once('.').map(|(p, _)| p);
    let method_sources: Vec<&str> = validated.methods.iter().map(|m| m.code.as_str()).collect();
    let rendered = writeback::render_test_class(
        package,
        &target.id.test_class_name(),
        &validated.imports,
        &method_sources,
    );

    ctx.analyzer.validate_test(&rendered).await?;
    let formatted = ctx.formatter.format_source(&rendered).await?;

    // Independent sandbox per target: compile and baseline-check the seed
    // file without touching the workspace or other workers.
    let sandbox = ctx
        .sandboxes
        .acquire_named_sandbox(&ctx.workspace, &format!("prep_{index}"))
        .await?;
    let file_path = writeback::test_file_path_in(sandbox.path(), target);
    if let Some(parent) = file_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&file_path, &formatted).await?;

    let compile = ctx.driver.compile_tests(sandbox.path()).await;
    if !compile.success {
        return Err(crate::error::Error::new(
            crate::error::ErrorKind::BuildFailed,
            format!(
                "seed tests do not compile: {}",
                compile.error.unwrap_or_default()
            ),
        ));
    }

    let baseline = ctx
        .driver
        .run_tests_matching(sandbox.path(), &target.id.test_class_name())
        .await;
    if !baseline.output.success {
        return Err(crate::error::Error::new(
            crate::error::ErrorKind::BaselineRegressed,
            "seed tests fail against the unmutated baseline",
        ));
    }

    Ok(SeedTests {
        file_content: formatted,
        methods: validated
            .methods
            .into_iter()
            .map(|m| (m.name, m.code))
            .collect(),
    })
}

async fn seed_mutants(
    ctx: &WorkerContext,
    target: &Target,
    context: Option<&str>,
    llm_calls: &mut u32,
) -> crate::error::Result<Vec<MutantProposal>> {
    let input = MutantPromptInput {
        target,
        context,
        known_patches: &[],
    };
    let (system, user) = prompts::render_mutant_prompt(PromptRole::GenMutantsInitial, &input);

    *llm_calls += 1;
    let raw: serde_json::Value = ctx.llm.chat_json(&system, &user).await?;
    prompts::validate_mutants(raw, target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_default_is_zeroed() {
        let report = PreprocessReport::default();
        assert_eq!(report.targets_processed, 0);
        assert_eq!(report.tests_seeded, 0);
        assert_eq!(report.mutants_seeded, 0);
    }
}
