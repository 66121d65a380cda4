//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Scripted search and generation providers
//! - A research agent wrapper that can stall, go silent or count calls
//! - A harness running every agent on one in-memory broker

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use glossa::broker::Broker;
use glossa::config::Config;
use glossa::protocol::{AgentId, Intent, TaskRequest};
use glossa::providers::{
    FinishReason, Generation, GenerationOptions, InMemoryDocumentStore, Prompt, ProviderError,
    SearchHit, SearchProvider, TextGenerator,
};
use glossa::runtime::{Agent, AgentRuntime, Outcome, RetryPolicy, RuntimeHandle, TaskContext};
use glossa::workers::{
    DocumentAgent, ResearchAgent, ResearchRequest, VerificationAgent, RESEARCH_AGENT,
};
use glossa::{Error, Orchestrator, WorkflowClient};

/// Timings small enough for paused-clock tests, large enough that the
/// per-task timeout never fires before a stage deadline.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.runtime.max_concurrent_tasks = 32;
    config.runtime.task_timeout_ms = 30_000;
    config.runtime.heartbeat_interval_ms = 1_000;
    config.runtime.max_retries = 3;
    config.runtime.backoff_base_ms = 10;
    config.runtime.backoff_cap_ms = 100;
    config.orchestrator.fanout_concurrency = 4;
    config.orchestrator.stage_deadline_ms = 5_000;
    config.orchestrator.stage_timeout_ms = 5_000;
    config.orchestrator.workflow_timeout_ms = 60_000;
    config
}

/// `n` glossary blocks naming `Entity0` .. `Entity{n-1}`.
pub fn glossary_doc(n: usize) -> String {
    let mut raw = String::from("# Test Glossary\n\n");
    for i in 0..n {
        raw.push_str(&format!("[term] Entity{i}: Entity{i} is thing number {i}.\n\n"));
    }
    raw
}

pub fn entity_names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("Entity{i}")).collect()
}

// ========== Providers ==========

/// One hit per query, derived from the query itself.
#[derive(Debug, Default)]
pub struct ScriptedSearch {
    calls: AtomicUsize,
}

impl ScriptedSearch {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchProvider for ScriptedSearch {
    async fn search(&self, query: &str, _max_results: usize) -> Result<Vec<SearchHit>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let slug = query.to_lowercase().replace(' ', "-");
        Ok(vec![SearchHit {
            title: format!("{query} reference"),
            snippet: format!("{query} is a documented concept."),
            url: Some(format!("https://ref.example/{slug}")),
        }])
    }
}

/// Rate-limited for the first `failures` calls, then a scripted search.
#[derive(Debug)]
pub struct FlakySearch {
    failures: usize,
    calls: AtomicUsize,
    inner: ScriptedSearch,
}

impl FlakySearch {
    pub fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
            inner: ScriptedSearch::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchProvider for FlakySearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(ProviderError::RateLimited(format!("call {}", call + 1)));
        }
        self.inner.search(query, max_results).await
    }
}

/// Always answers with filtered, empty text.
#[derive(Debug, Default)]
pub struct FilteredGenerator;

#[async_trait]
impl TextGenerator for FilteredGenerator {
    async fn generate(
        &self,
        _prompt: &Prompt,
        _options: &GenerationOptions,
    ) -> Result<Generation, ProviderError> {
        let mut generation = Generation::stop("");
        generation.finish_reason = FinishReason::ContentFilter;
        Ok(generation)
    }
}

// ========== Research wrapper ==========

/// Research agent that can stall every call or never answer some entities.
pub struct ScriptedResearch {
    inner: ResearchAgent,
    silent: HashSet<String>,
    delay: Duration,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedResearch {
    pub fn new(inner: ResearchAgent) -> Self {
        Self {
            inner,
            silent: HashSet::new(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    /// Entities that are accepted but never answered.
    pub fn silent_on<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.silent = entities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most handler calls ever running at once.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for ScriptedResearch {
    fn id(&self) -> AgentId {
        AgentId::from(RESEARCH_AGENT)
    }

    fn handles(&self, intent: &Intent) -> bool {
        *intent == Intent::ResearchEntity
    }

    async fn handle(&self, ctx: TaskContext, request: &TaskRequest) -> glossa::Result<Outcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let ResearchRequest { entity, .. } = request.payload_as()?;
        if self.silent.contains(&entity) {
            ctx.cancel.cancelled().await;
            return Err(Error::Cancelled(request.task_id));
        }

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        self.inner.handle(ctx, request).await
    }
}

pub fn research_agent(
    search: Arc<dyn SearchProvider>,
    generator: Arc<dyn TextGenerator>,
    config: &Config,
) -> ResearchAgent {
    ResearchAgent::new(search, generator, &config.aggregation)
}

// ========== Harness ==========

/// Every agent running on one in-memory broker.
pub struct Harness {
    pub broker: Broker,
    pub config: Config,
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<InMemoryDocumentStore>,
    handles: Vec<RuntimeHandle>,
}

impl Harness {
    pub fn start(config: Config, research: Arc<dyn Agent>) -> Self {
        let broker = Broker::in_memory();
        let store = Arc::new(InMemoryDocumentStore::new());
        let orchestrator = Arc::new(
            Orchestrator::new(&config.orchestrator, &config.aggregation)
                .with_publish_policy(RetryPolicy::from_config(&config.runtime)),
        );
        let verification = VerificationAgent::new(Arc::new(ScriptedSearch::default()), &config.planner);

        let agents: Vec<Arc<dyn Agent>> = vec![
            orchestrator.clone(),
            Arc::new(DocumentAgent::new(store.clone())),
            research,
            Arc::new(verification),
        ];
        let handles = agents
            .into_iter()
            .map(|agent| AgentRuntime::new(agent, broker.clone(), &config.runtime).spawn())
            .collect();

        Self {
            broker,
            config,
            orchestrator,
            store,
            handles,
        }
    }

    /// Harness with the plain research agent over `search` and `generator`.
    pub fn with_providers(
        config: Config,
        search: Arc<dyn SearchProvider>,
        generator: Arc<dyn TextGenerator>,
    ) -> Self {
        let research = research_agent(search, generator, &config);
        Self::start(config, Arc::new(research))
    }

    pub fn client(&self) -> WorkflowClient {
        WorkflowClient::new(self.broker.clone(), AgentId::from("tester"), &self.config.orchestrator)
    }

    pub fn in_flight(&self, agent: &str) -> usize {
        self.handles
            .iter()
            .find(|h| h.agent_id().as_str() == agent)
            .map(|h| h.in_flight())
            .unwrap_or(0)
    }

    pub async fn shutdown(self) {
        for handle in self.handles {
            handle.shutdown().await.unwrap();
        }
    }
}
