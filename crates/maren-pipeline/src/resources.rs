//! Shared resource record.

use std::sync::Arc;
use std::time::Duration;

use maren_broker::Broker;
use maren_config::Config;
use maren_core::PlatformClient;
use maren_llm::Router;
use maren_memory::MemoryManager;
use maren_store::Store;

use crate::safety::SafetyFilter;

/// Everything a pipeline component may need, acquired once at startup and
/// passed through construction. No component reaches for globals.
#[derive(Clone)]
pub struct Resources {
    /// Full daemon configuration.
    pub config: Arc<Config>,
    /// Durable message store.
    pub store: Store,
    /// In-process queue broker.
    pub broker: Arc<Broker>,
    /// Chat transport.
    pub platform: Arc<dyn PlatformClient>,
    /// LLM router.
    pub router: Arc<Router>,
    /// Conversation memory.
    pub memory: Arc<MemoryManager>,
    /// Safety filter.
    pub safety: Arc<SafetyFilter>,
}

impl Resources {
    /// Platform call timeout from config.
    #[must_use]
    pub fn platform_timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeouts.platform_ms)
    }

    /// Debounce quiet window.
    #[must_use]
    pub fn debounce_window(&self) -> Duration {
        Duration::from_secs(self.config.debounce.window_seconds)
    }

    /// Maximum wait from the first buffered message.
    #[must_use]
    pub fn debounce_max_wait(&self) -> Duration {
        Duration::from_secs(self.config.debounce.max_wait_seconds)
    }

    /// Typing-flag TTL.
    #[must_use]
    pub fn typing_window(&self) -> Duration {
        Duration::from_secs(self.config.debounce.typing_window_seconds)
    }
}

impl std::fmt::Debug for Resources {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resources").finish_non_exhaustive()
    }
}
