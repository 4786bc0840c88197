//! Resource acquisition, worker spawn, and graceful shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use maren_broker::Broker;
use maren_config::Config;
use maren_core::platform::PlatformEvent;
use maren_llm::{
    AnthropicProvider, CompletionProvider, ModelPricing, OpenAiCompatProvider, ProfileSpec,
    RoleSpec, Router, RouterConfig,
};
use maren_memory::{MemoryConfig, MemoryManager};
use maren_pipeline::safety::SafetyFilter;
use maren_pipeline::workers::PipelineHandles;
use maren_pipeline::Resources;
use maren_store::Store;
use maren_telegram::TelegramPlatform;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// How long workers get to drain after the cancel signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Startup failures mapped onto process exit codes.
#[derive(Debug, Error)]
pub(crate) enum StartupError {
    /// Configuration is unusable.
    #[error("configuration error: {0}")]
    Config(String),

    /// The message store could not be opened.
    #[error("store unreachable: {0}")]
    Store(String),

    /// The queue broker could not be brought up.
    #[error("broker unreachable: {0}")]
    #[allow(dead_code)]
    Broker(String),

    /// The chat platform rejected us at startup.
    #[error("platform unreachable: {0}")]
    Platform(String),
}

impl StartupError {
    pub(crate) const CONFIG_EXIT: u8 = 2;

    pub(crate) const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => Self::CONFIG_EXIT,
            Self::Store(_) => 3,
            Self::Broker(_) => 4,
            Self::Platform(_) => 5,
        }
    }
}

/// Initialize tracing from the logging section (`RUST_LOG` wins).
pub(crate) fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Bring everything up, run until a shutdown signal, tear down.
pub(crate) async fn run(config: Config, no_recovery: bool) -> Result<(), StartupError> {
    let config = Arc::new(config);

    // Store (exit 3 on failure).
    let store = Store::connect(
        &config.store.path,
        Duration::from_millis(config.timeouts.store_ms),
    )
    .await
    .map_err(|err| StartupError::Store(err.to_string()))?;

    // Broker: in-process, infallible by construction.
    let broker = Arc::new(Broker::new());

    // Router over the configured provider registry.
    let router = Arc::new(build_router(&config, Arc::clone(&broker))?);

    // Transport (exit 2 when the token is missing, 5 when rejected).
    let token = config
        .platform
        .token
        .clone()
        .or_else(|| std::env::var("PLATFORM_TOKEN").ok())
        .ok_or_else(|| StartupError::Config("platform.token is not set".to_owned()))?;
    if token.trim().is_empty() {
        return Err(StartupError::Platform("empty platform token".to_owned()));
    }
    let platform = Arc::new(TelegramPlatform::new(&token));

    let memory = Arc::new(MemoryManager::new(
        store.clone(),
        MemoryConfig {
            max_messages: config.memory.max_messages,
            max_bytes: config.memory.max_bytes,
            recent_window: config.memory.recent_window,
            ttl_days: config.memory.history_ttl_days,
        },
    ));
    let safety = Arc::new(SafetyFilter::new(&config.safety.extra_terms));

    let resources = Resources {
        config: Arc::clone(&config),
        store,
        broker,
        platform: platform.clone(),
        router,
        memory,
        safety,
    };

    let handles = PipelineHandles::build(resources.clone());
    handles
        .reseed_from_store()
        .await
        .map_err(|err| StartupError::Store(err.to_string()))?;

    let cancel = CancellationToken::new();
    let mut workers = handles.spawn_workers(&cancel);

    // Platform events → ingress.
    let (event_tx, mut event_rx) = mpsc::channel::<PlatformEvent>(1024);
    workers.push(tokio::spawn(maren_telegram::run_listener(
        platform,
        event_tx,
        cancel.clone(),
    )));
    {
        let ingress = Arc::clone(&handles.ingress);
        let cancel = cancel.clone();
        workers.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = event_rx.recv() => {
                        let Some(event) = event else { break };
                        if let Err(err) = ingress.handle_event(event).await {
                            error!(%err, "ingress rejected event");
                        }
                    },
                }
            }
        }));
    }

    if no_recovery {
        info!("startup recovery skipped by flag");
    } else {
        workers.push(handles.spawn_startup_recovery());
    }

    // Reviewer API.
    let api_state = maren_api::ApiState::new(
        resources.clone(),
        Arc::clone(&handles.protocol),
        Arc::clone(&handles.recovery),
    );
    let listener = tokio::net::TcpListener::bind(&config.review.listen_addr)
        .await
        .map_err(|err| {
            StartupError::Config(format!(
                "cannot bind review API to {}: {err}",
                config.review.listen_addr
            ))
        })?;
    info!(addr = %config.review.listen_addr, "review API listening");
    {
        let cancel = cancel.clone();
        let app = maren_api::router(api_state);
        workers.push(tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await });
            if let Err(err) = serve.await {
                error!(%err, "review API server error");
            }
        }));
    }

    wait_for_shutdown().await;
    info!("shutdown signal received, draining workers");
    cancel.cancel();

    let drain = async {
        for worker in workers {
            let _ = worker.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("shutdown grace period elapsed with workers still running");
    }
    Ok(())
}

fn build_router(config: &Config, broker: Arc<Broker>) -> Result<Router, StartupError> {
    let mut providers: HashMap<String, Arc<dyn CompletionProvider>> = HashMap::new();
    let mut pricing = HashMap::new();

    for (name, entry) in &config.llm.models {
        let api_key = entry
            .api_key
            .clone()
            .or_else(|| match entry.provider.as_str() {
                "anthropic" => std::env::var("ANTHROPIC_API_KEY").ok(),
                _ => std::env::var("OPENAI_API_KEY").ok(),
            })
            .unwrap_or_default();

        let provider: Arc<dyn CompletionProvider> = match entry.provider.as_str() {
            "anthropic" => {
                let mut provider = AnthropicProvider::new(name, api_key);
                if let Some(url) = &entry.api_url {
                    provider = provider.with_base_url(url);
                }
                Arc::new(provider)
            },
            "openai" => {
                let mut provider = OpenAiCompatProvider::new(name, api_key);
                if let Some(url) = &entry.api_url {
                    provider = provider.with_base_url(url);
                }
                Arc::new(provider)
            },
            other => {
                return Err(StartupError::Config(format!(
                    "unknown provider '{other}' for model {name}"
                )));
            },
        };
        providers.insert(name.clone(), provider);
        pricing.insert(
            name.clone(),
            ModelPricing {
                input_per_million: entry.pricing.input_per_million,
                output_per_million: entry.pricing.output_per_million,
                cached_per_million: entry.pricing.cached_per_million,
            },
        );
    }

    let profiles = config
        .llm
        .profiles
        .iter()
        .map(|(name, profile)| {
            (
                name.clone(),
                ProfileSpec {
                    generator: RoleSpec {
                        model: profile.generator.model.clone(),
                        temperature: profile.generator.temperature,
                        max_tokens: profile.generator.max_tokens,
                    },
                    refiner: RoleSpec {
                        model: profile.refiner.model.clone(),
                        temperature: profile.refiner.temperature,
                        max_tokens: profile.refiner.max_tokens,
                    },
                    fallback_chain: profile.fallback_chain.clone(),
                    daily_quota: profile.daily_quota.clone(),
                    stable_prefix_caching: matches!(
                        profile.cache_hint_strategy,
                        maren_config::CacheHintStrategy::StablePrefix
                    ),
                },
            )
        })
        .collect();

    Router::new(
        RouterConfig {
            profiles,
            active_profile: config.llm.profile.clone(),
            pricing,
            repair_model: config.llm.repair_model.clone(),
            call_timeout: Duration::from_millis(config.timeouts.llm_ms),
        },
        providers,
        broker,
    )
    .map_err(|err| StartupError::Config(err.to_string()))
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(signal) => signal,
            Err(err) => {
                warn!(%err, "SIGTERM handler unavailable");
                let _ = ctrl_c.await;
                return;
            },
        };
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
