//! Replay demo
//!
//! Runs a script as a job, replays it with an edited script, and prints the
//! lineage diff of the replay.
//!
//! Usage:
//!   replay-demo --script Jenkinsfile --replacement Jenkinsfile.edited
//!   replay-demo --inline "echo 'hi'" --replacement-inline "echo 'bye'"

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use pipeline_replay::config::{EngineConfig, ReplayConfig};
use pipeline_replay::dispatch::StandardAmbient;
use pipeline_replay::engine::{PipelineEngine, RunProgress};
use pipeline_replay::permissions::{MemoryPermissions, Permission, PermissionCatalog, Principal};
use pipeline_replay::replay::ReplayService;
use pipeline_replay::scheduler::{MemoryScheduler, Scheduler};
use pipeline_replay::state::{StepCall, Value};
use pipeline_replay::steps::{StepCatalog, StepDescriptor, StepLibrary, StepResult};
use pipeline_replay::store::RunStore;
use pipeline_replay::store_memory::MemoryStore;
use pipeline_replay::types::JobDefinition;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "replay-demo")]
#[command(about = "Run a pipeline script, replay it with edits, and show the diff")]
struct Args {
    /// Main script file
    #[arg(long, short = 's', conflicts_with = "inline")]
    script: Option<PathBuf>,

    /// Main script text
    #[arg(long)]
    inline: Option<String>,

    /// Edited main script file for the replay
    #[arg(long, short = 'r', conflicts_with = "replacement_inline")]
    replacement: Option<PathBuf>,

    /// Edited main script text for the replay
    #[arg(long)]
    replacement_inline: Option<String>,

    /// Job name
    #[arg(long, short = 'j', default_value = "demo")]
    job: String,

    /// Run the original outside the sandbox
    #[arg(long)]
    no_sandbox: bool,

    /// Acting user
    #[arg(long, env = "PIPELINE_REPLAY_USER", default_value = "admin")]
    user: String,
}

/// Steps that print to the console.
struct ConsoleSteps {
    catalog: StepCatalog,
}

#[async_trait]
impl StepLibrary for ConsoleSteps {
    fn descriptor(&self, name: &str) -> Option<StepDescriptor> {
        self.catalog.get(name).cloned()
    }

    async fn execute(&self, call: &StepCall) -> Result<StepResult> {
        match (call.step.as_str(), call.args.as_slice()) {
            ("echo", [message]) => {
                println!("[echo] {message}");
                Ok(StepResult::Value(Value::Null))
            }
            ("sleep", [Value::I64(secs)]) => {
                tokio::time::sleep(Duration::from_secs((*secs).max(0) as u64)).await;
                Ok(StepResult::Value(Value::Null))
            }
            ("node", _) | ("stage", _) => {
                println!("[{}] {:?}", call.step, call.args.first().map(Value::to_string));
                Ok(StepResult::RunBody)
            }
            (step, args) => Ok(StepResult::Failed(format!(
                "{step} cannot take {} argument(s)",
                args.len()
            ))),
        }
    }
}

fn read_script(path: Option<PathBuf>, inline: Option<String>, what: &str) -> Result<String> {
    match (path, inline) {
        (Some(path), _) => std::fs::read_to_string(&path)
            .with_context(|| format!("reading {what} from {}", path.display())),
        (None, Some(text)) => Ok(text),
        (None, None) => bail!("no {what} given"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,pipeline_replay=info".into()),
        )
        .init();

    let args = Args::parse();
    let original = read_script(args.script, args.inline, "script")?;
    let edited = read_script(args.replacement, args.replacement_inline, "replacement script")?;

    let store = Arc::new(MemoryStore::new());
    let steps = Arc::new(ConsoleSteps {
        catalog: StepCatalog::basic(),
    });
    let engine = Arc::new(PipelineEngine::new(
        store.clone(),
        steps,
        Arc::new(StandardAmbient),
        EngineConfig::from_env(),
    ));
    let scheduler = Arc::new(MemoryScheduler::new(store.clone(), engine.clone()));
    scheduler
        .register_job(JobDefinition::new(&args.job, original, !args.no_sandbox))
        .await;

    // Registration is done before any service is built.
    let permissions = MemoryPermissions::new(PermissionCatalog::standard().seal())
        .grant("admin", Permission::Replay)
        .grant("admin", Permission::RunScripts);
    let principal = Principal::new(args.user, vec!["admin".into()]);
    let replay_config = ReplayConfig::from_env();
    let quiet_period = replay_config.quiet_period;
    let service = ReplayService::new(
        store.clone(),
        engine.clone(),
        Arc::new(permissions),
        scheduler.clone(),
        replay_config,
    );

    println!("== original");
    let mut handle = scheduler
        .submit(&args.job, Duration::ZERO, vec![])
        .await?
        .ok_or_else(|| anyhow!("job {} refused the run", args.job))?;
    scheduler.start_ready().await?;
    let first = handle.wait_for_start().await?;
    report(&engine, &first).await?;

    let run = store
        .load_run(&first)
        .await?
        .ok_or_else(|| anyhow!("run {first} vanished"))?;
    println!("replay enabled: {:?}", service.check(&principal, &run).await);

    println!("== replay");
    let submission = service
        .submit_form(&principal, &run, &serde_json::json!({ "mainScript": edited }))
        .await?;
    let mut handle = submission
        .handle
        .ok_or_else(|| anyhow!("replay was not queued"))?;
    tokio::time::sleep(quiet_period).await;
    scheduler.start_ready().await?;
    let second = handle.wait_for_start().await?;
    report(&engine, &second).await?;

    let replayed = store
        .load_run(&second)
        .await?
        .ok_or_else(|| anyhow!("run {second} vanished"))?;
    println!("== diff ({second} against its root)");
    print!("{}", service.diff_chain(&replayed).await);
    Ok(())
}

async fn report(engine: &PipelineEngine, run: &pipeline_replay::types::RunId) -> Result<()> {
    match engine.drive(run).await? {
        RunProgress::Completed => println!("{run}: completed"),
        RunProgress::Failed(message) => println!("{run}: failed: {message}"),
        other => println!("{run}: {other:?}"),
    }
    Ok(())
}
