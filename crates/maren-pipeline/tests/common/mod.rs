//! Shared test scaffolding: a scripted chat platform, a scripted model,
//! and a fully wired pipeline over in-memory store and broker.

// Each test binary compiles its own copy; not every helper is used in both.
#![allow(dead_code)]

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use maren_broker::Broker;
use maren_core::platform::{
    PlatformClient, PlatformError, PlatformMessage, PlatformResult, PlatformUser,
};
use maren_core::{IntakeEntry, PlatformMessageId, ProcessingUnit, UserId};
use maren_llm::{
    CompletionProvider, LlmError, LlmResult, ModelPricing, ProfileSpec, ProviderRequest,
    RawCompletion, RoleSpec, Router, RouterConfig,
};
use maren_memory::{MemoryConfig, MemoryManager};
use maren_pipeline::Resources;
use maren_pipeline::safety::SafetyFilter;
use maren_pipeline::workers::PipelineHandles;
use maren_store::Store;

pub const MOCK_MODEL: &str = "mock-model";

/// Scripted chat platform.
pub struct MockPlatform {
    pub dialogs: Mutex<Vec<UserId>>,
    pub history: Mutex<HashMap<UserId, Vec<PlatformMessage>>>,
    pub sent: Mutex<Vec<(UserId, String)>>,
    pub typing: Mutex<usize>,
    pub fail_sends: Mutex<bool>,
    next_outbound_id: Mutex<i64>,
}

impl MockPlatform {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dialogs: Mutex::new(Vec::new()),
            history: Mutex::new(HashMap::new()),
            sent: Mutex::new(Vec::new()),
            typing: Mutex::new(0),
            fail_sends: Mutex::new(false),
            next_outbound_id: Mutex::new(1_000_000),
        })
    }

    pub fn seed_history(&self, user_id: UserId, messages: Vec<PlatformMessage>) {
        self.dialogs.lock().unwrap().push(user_id);
        self.history.lock().unwrap().insert(user_id, messages);
    }

    pub fn sent_to(&self, user_id: UserId) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| *to == user_id)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl PlatformClient for MockPlatform {
    async fn send_message(
        &self,
        user_id: UserId,
        text: &str,
    ) -> PlatformResult<PlatformMessageId> {
        if *self.fail_sends.lock().unwrap() {
            return Err(PlatformError::Transient("scripted send failure".into()));
        }
        self.sent.lock().unwrap().push((user_id, text.to_owned()));
        let mut next = self.next_outbound_id.lock().unwrap();
        *next += 1;
        Ok(PlatformMessageId(*next))
    }

    async fn send_typing(&self, _user_id: UserId) -> PlatformResult<()> {
        *self.typing.lock().unwrap() += 1;
        Ok(())
    }

    async fn resolve_user(&self, user_id: UserId) -> PlatformResult<PlatformUser> {
        Ok(PlatformUser {
            id: user_id,
            display_name: Some("testuser".to_owned()),
        })
    }

    async fn list_dialogs(&self) -> PlatformResult<Vec<UserId>> {
        Ok(self.dialogs.lock().unwrap().clone())
    }

    async fn history_after(
        &self,
        user_id: UserId,
        after: Option<PlatformMessageId>,
        limit: usize,
    ) -> PlatformResult<Vec<PlatformMessage>> {
        let history = self.history.lock().unwrap();
        let Some(messages) = history.get(&user_id) else {
            return Ok(Vec::new());
        };
        Ok(messages
            .iter()
            .filter(|m| after.is_none_or(|after| m.id > after))
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Scripted model: buckets requests by the shape of the system block.
pub struct MockModel {
    pub generator: Mutex<VecDeque<LlmResult<String>>>,
    pub analysis: Mutex<VecDeque<String>>,
    pub refine: Mutex<VecDeque<String>>,
    pub generate_calls: Mutex<usize>,
}

impl MockModel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            generator: Mutex::new(VecDeque::new()),
            analysis: Mutex::new(VecDeque::new()),
            refine: Mutex::new(VecDeque::new()),
            generate_calls: Mutex::new(0),
        })
    }

    pub fn push_draft(&self, text: &str) {
        self.generator.lock().unwrap().push_back(Ok(text.to_owned()));
    }

    pub fn push_generator_error(&self, err: LlmError) {
        self.generator.lock().unwrap().push_back(Err(err));
    }

    pub fn push_verdict(&self, json: &str) {
        self.analysis.lock().unwrap().push_back(json.to_owned());
    }

    pub fn push_bubbles(&self, text: &str) {
        self.refine.lock().unwrap().push_back(text.to_owned());
    }
}

#[async_trait]
impl CompletionProvider for MockModel {
    fn model(&self) -> &str {
        MOCK_MODEL
    }

    async fn complete(&self, request: &ProviderRequest) -> LlmResult<RawCompletion> {
        let completion = |text: String| RawCompletion {
            text,
            tokens_in: 100,
            tokens_out: 25,
            cached_tokens: 0,
        };

        if request.system.contains("audit a draft") {
            let text = self
                .analysis
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| "{\"status\": \"ok\"}".to_owned());
            return Ok(completion(text));
        }
        if request.system.contains("[BUBBLE]") {
            let text = self
                .refine
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| {
                    // Default: echo the draft as a single bubble.
                    request
                        .user
                        .split("Draft to rewrite:\n")
                        .nth(1)
                        .unwrap_or("okay")
                        .to_owned()
                });
            return Ok(completion(text));
        }
        *self.generate_calls.lock().unwrap() += 1;
        match self.generator.lock().unwrap().pop_front() {
            Some(Ok(text)) => Ok(completion(text)),
            Some(Err(err)) => Err(err),
            None => Ok(completion("hey! just studying for my exam".to_owned())),
        }
    }
}

/// A fully wired pipeline over in-memory everything.
pub struct TestEnv {
    pub handles: PipelineHandles,
    pub platform: Arc<MockPlatform>,
    pub model: Arc<MockModel>,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_config_overlay("").await
    }

    pub async fn with_config_overlay(overlay: &str) -> Self {
        let config = Arc::new(maren_config::loader::load_str(overlay).unwrap());
        let store = Store::connect_memory().await.unwrap();
        let broker = Arc::new(Broker::new());
        let platform = MockPlatform::new();
        let model = MockModel::new();

        let providers: HashMap<String, Arc<dyn CompletionProvider>> = HashMap::from([(
            MOCK_MODEL.to_owned(),
            Arc::clone(&model) as Arc<dyn CompletionProvider>,
        )]);
        let profile = ProfileSpec {
            generator: RoleSpec {
                model: MOCK_MODEL.to_owned(),
                temperature: 0.8,
                max_tokens: 256,
            },
            refiner: RoleSpec {
                model: MOCK_MODEL.to_owned(),
                temperature: 0.4,
                max_tokens: 256,
            },
            fallback_chain: Vec::new(),
            daily_quota: HashMap::new(),
            stable_prefix_caching: true,
        };
        let router = Router::new(
            RouterConfig {
                profiles: HashMap::from([("default".to_owned(), profile)]),
                active_profile: "default".to_owned(),
                pricing: HashMap::from([(
                    MOCK_MODEL.to_owned(),
                    ModelPricing {
                        input_per_million: 3.0,
                        output_per_million: 15.0,
                        cached_per_million: 0.3,
                    },
                )]),
                repair_model: None,
                call_timeout: Duration::from_secs(5),
            },
            providers,
            Arc::clone(&broker),
        )
        .unwrap();

        let memory = Arc::new(MemoryManager::new(store.clone(), MemoryConfig::default()));
        let safety = Arc::new(SafetyFilter::new(&config.safety.extra_terms));

        let resources = Resources {
            config,
            store,
            broker,
            platform: platform.clone(),
            router: Arc::new(router),
            memory,
            safety,
        };
        let handles = PipelineHandles::build(resources);
        Self {
            handles,
            platform,
            model,
        }
    }

    pub fn resources(&self) -> &Resources {
        &self.handles.resources
    }

    pub fn message(user: i64, id: i64, text: &str, sent_at: DateTime<Utc>) -> PlatformMessage {
        PlatformMessage {
            id: PlatformMessageId(id),
            user_id: UserId(user),
            text: text.to_owned(),
            sent_at,
        }
    }

    /// Ingest one live message through the ingress adapter.
    pub async fn ingest(
        &self,
        user: i64,
        id: i64,
        text: &str,
    ) -> maren_pipeline::ingress::IngestOutcome {
        self.handles
            .ingress
            .handle_event(maren_core::platform::PlatformEvent::Message(Self::message(
                user,
                id,
                text,
                Utc::now(),
            )))
            .await
            .unwrap()
    }

    /// Drain everything on the intake list into the tracker's buffers.
    pub async fn drain_intake(&self) {
        loop {
            let moved: Option<IntakeEntry> = self
                .resources()
                .broker
                .move_blocking(
                    maren_broker::keys::INTAKE,
                    "processing:test",
                    Duration::from_millis(10),
                )
                .await
                .unwrap();
            let Some(entry) = moved else { break };
            self.handles.tracker.accept(entry).unwrap();
            let _ = self
                .resources()
                .broker
                .pop_front::<IntakeEntry>("processing:test")
                .unwrap();
        }
    }

    /// Force-release every live buffer and run each resulting unit through
    /// the supervisor. Returns the supervisor outcomes.
    pub async fn run_supervisor(
        &self,
        users: &[i64],
    ) -> Vec<maren_pipeline::supervisor::SupervisorOutcome> {
        for &user in users {
            self.handles.tracker.release(UserId(user)).unwrap();
        }
        let mut outcomes = Vec::new();
        while let Some(unit) = self
            .resources()
            .broker
            .pop_front::<ProcessingUnit>(maren_broker::keys::UNITS)
            .unwrap()
        {
            outcomes.push(self.handles.supervisor.process_unit(unit).await.unwrap());
        }
        outcomes
    }

    /// Full drive: ingest is done by the caller; this debounces and
    /// supervises everything currently queued for the given users.
    pub async fn process_all(
        &self,
        users: &[i64],
    ) -> Vec<maren_pipeline::supervisor::SupervisorOutcome> {
        self.drain_intake().await;
        self.run_supervisor(users).await
    }
}
