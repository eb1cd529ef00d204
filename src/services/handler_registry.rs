//! task_type -> handler lookup.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::models::Config;
use crate::domain::ports::JobHandler;
use crate::infrastructure::handlers::{EchoHandler, ProcessHandler};

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn JobHandler>>,
    timeouts: BTreeMap<String, Duration>,
    default_timeout: Duration,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.handlers.keys().collect::<Vec<_>>())
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            handlers: BTreeMap::new(),
            timeouts: BTreeMap::new(),
            default_timeout,
        }
    }

    /// Built-in `echo` plus a process handler per configured task type.
    /// A configured `echo` entry replaces the built-in.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new(Duration::from_secs(config.dispatcher.handler_timeout_secs));
        registry.register("echo", Arc::new(EchoHandler));
        for (task_type, handler) in &config.handlers {
            registry.register(
                task_type.clone(),
                Arc::new(ProcessHandler::from_config(task_type, handler)),
            );
            if let Some(secs) = handler.timeout_secs {
                registry
                    .timeouts
                    .insert(task_type.clone(), Duration::from_secs(secs));
            }
        }
        registry
    }

    pub fn register(&mut self, task_type: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(task_type.into(), handler);
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn timeout_for(&self, task_type: &str) -> Duration {
        self.timeouts
            .get(task_type)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    pub fn task_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}
