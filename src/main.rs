use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use glossa::broker::Broker;
use glossa::config::Config;
use glossa::document::parse_document;
use glossa::planner::VerificationPlanner;
use glossa::protocol::AgentId;
use glossa::providers::{CorpusSearch, ExtractiveGenerator, FsDocumentStore};
use glossa::runtime::{Agent, AgentRuntime, LivenessMonitor, RetryPolicy, RuntimeHandle};
use glossa::workers::{DocumentAgent, DocumentRequest, ResearchAgent, VerificationAgent};
use glossa::{Error, Orchestrator, Result, WorkflowClient};

/// Glossa - build a verified glossary for a document with cooperating agents
#[derive(Parser, Debug)]
#[command(name = "glossa")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    GLOSSA_DEBUG=1     Enable debug logging (alternative to --debug)\n    GLOSSA_LOG=<filter> Full tracing filter, overrides both")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.glossa/glossa.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run the full glossary workflow on a document
    Run {
        /// Document to process
        file: PathBuf,

        /// Directory indexed as the research corpus (defaults to the document itself)
        #[arg(long)]
        corpus: Option<PathBuf>,

        /// Print Markdown instead of JSON
        #[arg(long)]
        markdown: bool,
    },

    /// Score a document's nodes and print the verification plan
    Plan {
        /// Document to plan
        file: PathBuf,

        /// Override planner.min_confidence
        #[arg(long)]
        min_confidence: Option<f64>,

        /// Also verify every batch against the document's corpus
        #[arg(long)]
        verify: bool,
    },

    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    glossa::log::init_with_debug(cli.debug);

    let config = Config::load()?;
    info!(command = ?cli.command, "glossa starting");

    match cli.command {
        Command::Run {
            file,
            corpus,
            markdown,
        } => run_workflow(&config, &file, corpus.as_deref(), markdown),
        Command::Plan {
            file,
            min_confidence,
            verify,
        } => run_plan(config, &file, min_confidence, verify),
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Split a path into the directory a store is rooted at and the doc id.
fn locate(file: &Path) -> Result<(PathBuf, String)> {
    let doc_id = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::Config(format!("not a file: {}", file.display())))?;
    let root = match file.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    Ok((root, doc_id))
}

async fn corpus_for(file: &Path, corpus: Option<&Path>) -> Result<CorpusSearch> {
    let search = match corpus {
        Some(dir) => CorpusSearch::from_store(&FsDocumentStore::new(dir)).await?,
        None => {
            let mut search = CorpusSearch::new();
            let content = tokio::fs::read_to_string(file).await?;
            search.add_document(&locate(file)?.1, &content);
            search
        }
    };
    if search.is_empty() {
        warn!("research corpus is empty, every entity will be unverified");
    }
    Ok(search)
}

fn run_workflow(config: &Config, file: &Path, corpus: Option<&Path>, markdown: bool) -> Result<()> {
    let (root, doc_id) = locate(file)?;
    let rt = tokio::runtime::Runtime::new()?;

    let report = rt.block_on(async {
        let broker = Broker::connect(&config.broker)?;
        let search = Arc::new(corpus_for(file, corpus).await?);

        let orchestrator = Orchestrator::new(&config.orchestrator, &config.aggregation)
            .with_publish_policy(RetryPolicy::from_config(&config.runtime));
        let document = DocumentAgent::new(Arc::new(FsDocumentStore::new(root)));
        let research = ResearchAgent::new(search.clone(), Arc::new(ExtractiveGenerator), &config.aggregation);
        let verification = VerificationAgent::new(search, &config.planner);

        let agents: [Arc<dyn Agent>; 4] = [
            Arc::new(orchestrator),
            Arc::new(document),
            Arc::new(research),
            Arc::new(verification),
        ];
        let handles: Vec<RuntimeHandle> = agents
            .into_iter()
            .map(|agent| AgentRuntime::new(agent, broker.clone(), &config.runtime).spawn())
            .collect();

        let stop_liveness = CancellationToken::new();
        let (liveness, _events) = LivenessMonitor::new(config.stale_after()).spawn(&broker, stop_liveness.clone());

        let client = WorkflowClient::new(broker.clone(), AgentId::from("cli"), &config.orchestrator);
        let report = client.run(DocumentRequest::stored(doc_id)).await;

        for handle in handles {
            if let Err(err) = handle.shutdown().await {
                warn!(error = %err, "runtime shutdown failed");
            }
        }
        stop_liveness.cancel();
        let _ = liveness.await;
        report
    })?;

    if markdown {
        print!("{}", report.output.render_markdown());
    } else {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    if !report.affected_entities.is_empty() {
        eprintln!(
            "{} entities unverified: {}",
            report.affected_entities.len(),
            report.affected_entities.join(", ")
        );
    }
    Ok(())
}

fn run_plan(mut config: Config, file: &Path, min_confidence: Option<f64>, verify: bool) -> Result<()> {
    if let Some(min) = min_confidence {
        config.planner.min_confidence = min;
        config.validate()?;
    }
    let (_, doc_id) = locate(file)?;
    let content = std::fs::read_to_string(file)?;
    let document = parse_document(&doc_id, &content)?;
    let plan = VerificationPlanner::new(&config.planner).plan(&document);

    if !verify {
        println!("{}", serde_json::to_string_pretty(&plan)?);
        return Ok(());
    }

    let rt = tokio::runtime::Runtime::new()?;
    let verified = rt.block_on(async {
        let search = Arc::new(corpus_for(file, None).await?);
        let agent = VerificationAgent::new(search, &config.planner);
        let mut tasks = Vec::with_capacity(plan.tasks.len());
        for task in plan.tasks.clone() {
            tasks.push(agent.verify(task).await?);
        }
        Ok::<_, Error>(tasks)
    })?;
    println!("{}", serde_json::to_string_pretty(&verified)?);
    Ok(())
}
