//! Builder for dispatcher instances

use std::sync::Arc;
use std::time::Duration;

use super::{DEFAULT_REQUEST_TIMEOUT, DEFAULT_STREAM_BUFFER, ExecutionDispatcher};
use crate::backend::{Backend, DEFAULT_MODEL, RetryConfig, RetryingBackend};
use crate::cache::{CacheConfig, ResponseCache};
use crate::registry::{FunctionDescriptor, FunctionRegistry};
use crate::session::{SessionConfig, SessionManager};
use crate::sink::{ExecutionSink, NoopSink};
use crate::{Result, SkaldError};

/// Main entry point for creating dispatcher instances.
pub struct Skald;

impl Skald {
    /// Create a new builder for configuring the dispatcher.
    pub fn builder() -> SkaldBuilder {
        SkaldBuilder::new()
    }
}

/// Builder for configuring dispatcher instances.
///
/// ```rust,no_run
/// # fn main() -> skald::Result<()> {
/// let dispatcher = skald::Skald::builder()
///     .openai("sk-...", None)
///     .cache(skald::CacheConfig::new().max_entries(500))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct SkaldBuilder {
    backend: Option<Arc<dyn Backend>>,
    #[cfg(feature = "openai")]
    openai: Option<(String, Option<String>)>,
    registry: Option<FunctionRegistry>,
    functions: Vec<FunctionDescriptor>,
    cache: CacheConfig,
    sessions: SessionConfig,
    retry: Option<RetryConfig>,
    sink: Option<Arc<dyn ExecutionSink>>,
    default_model: String,
    request_timeout: Duration,
    stream_buffer: usize,
}

impl SkaldBuilder {
    pub fn new() -> Self {
        Self {
            backend: None,
            #[cfg(feature = "openai")]
            openai: None,
            registry: None,
            functions: Vec::new(),
            cache: CacheConfig::default(),
            sessions: SessionConfig::default(),
            retry: None,
            sink: None,
            default_model: DEFAULT_MODEL.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            stream_buffer: DEFAULT_STREAM_BUFFER,
        }
    }

    /// Use a custom backend.
    pub fn backend(self, backend: impl Backend + 'static) -> Self {
        self.backend_arc(Arc::new(backend))
    }

    /// Use a shared backend.
    pub fn backend_arc(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Use the OpenAI-compatible HTTP backend. `base_url` defaults to
    /// DeepSeek.
    #[cfg(feature = "openai")]
    pub fn openai(mut self, api_key: impl Into<String>, base_url: Option<String>) -> Self {
        self.openai = Some((api_key.into(), base_url));
        self
    }

    /// Replace the function registry. Defaults to the built-in functions.
    pub fn registry(mut self, registry: FunctionRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Register an additional function (last write wins on id).
    pub fn function(mut self, descriptor: FunctionDescriptor) -> Self {
        self.functions.push(descriptor);
        self
    }

    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    pub fn sessions(mut self, config: SessionConfig) -> Self {
        self.sessions = config;
        self
    }

    /// Wrap the backend in a [`RetryingBackend`].
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    /// Where execution records go. Defaults to discarding them.
    pub fn sink(mut self, sink: Arc<dyn ExecutionSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Model used when neither request nor function names one.
    pub fn default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    /// Deadline for synchronous backend calls.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Events buffered between a streaming relay and its consumer.
    pub fn stream_buffer(mut self, size: usize) -> Self {
        self.stream_buffer = size.max(1);
        self
    }

    pub fn build(self) -> Result<ExecutionDispatcher> {
        let backend = self.resolve_backend()?;
        let backend: Arc<dyn Backend> = match self.retry {
            Some(config) => Arc::new(RetryingBackend::new(backend, config)),
            None => backend,
        };

        let mut registry = self
            .registry
            .unwrap_or_else(FunctionRegistry::with_builtin_functions);
        for descriptor in self.functions {
            registry.register(descriptor);
        }

        let sink: Arc<dyn ExecutionSink> = match self.sink {
            Some(sink) => sink,
            None => Arc::new(NoopSink),
        };

        Ok(ExecutionDispatcher {
            registry: Arc::new(registry),
            cache: Arc::new(ResponseCache::new(self.cache)),
            sessions: Arc::new(SessionManager::new(self.sessions)),
            backend,
            sink,
            default_model: self.default_model,
            request_timeout: self.request_timeout,
            stream_buffer: self.stream_buffer,
        })
    }

    fn resolve_backend(&self) -> Result<Arc<dyn Backend>> {
        if let Some(ref backend) = self.backend {
            return Ok(Arc::clone(backend));
        }
        self.openai_backend()?
            .ok_or_else(|| SkaldError::Configuration("no backend configured".into()))
    }

    #[cfg(feature = "openai")]
    fn openai_backend(&self) -> Result<Option<Arc<dyn Backend>>> {
        use crate::backend::OpenAiBackend;

        let Some((ref key, ref base_url)) = self.openai else {
            return Ok(None);
        };
        let backend = match base_url {
            Some(url) => OpenAiBackend::with_base_url(key.clone(), url.clone())?,
            None => OpenAiBackend::new(key.clone())?,
        };
        let backend: Arc<dyn Backend> = Arc::new(backend.request_timeout(self.request_timeout));
        Ok(Some(backend))
    }

    #[cfg(not(feature = "openai"))]
    fn openai_backend(&self) -> Result<Option<Arc<dyn Backend>>> {
        Ok(None)
    }
}

impl Default for SkaldBuilder {
    fn default() -> Self {
        Self::new()
    }
}
