//! Name-keyed command table.
//!
//! A handler receives the bridge's context and the decoded payload, and
//! either succeeds silently or returns the [`ProblemReport`] to publish.
//! Unknown command names are dropped without a report.

use std::collections::HashMap;

use backplane_types::{Command, Fields, ProblemReport};
use tracing::debug;

pub type Handler<C> = Box<dyn Fn(&mut C, &Fields) -> Result<(), ProblemReport> + Send>;

/// Outcome of one [`CommandRegistry::dispatch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    Rejected(ProblemReport),
    /// No handler is registered under this name.
    Unknown(String),
}

pub struct CommandRegistry<C> {
    handlers: HashMap<String, Handler<C>>,
}

impl<C> Default for CommandRegistry<C> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<C> CommandRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `command`, replacing any earlier handler.
    pub fn register<F>(&mut self, command: Command, handler: F)
    where
        F: Fn(&mut C, &Fields) -> Result<(), ProblemReport> + Send + 'static,
    {
        self.handlers.insert(command.as_str().to_string(), Box::new(handler));
    }

    pub fn contains(&self, command: &str) -> bool {
        self.handlers.contains_key(command)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Look up `fields.command` and run its handler.
    ///
    /// The codec guarantees a `command` field; a payload without one is
    /// treated like an unknown command.
    pub fn dispatch(&self, context: &mut C, fields: &Fields) -> Dispatch {
        let name = fields.command().unwrap_or_default();
        let Some(handler) = self.handlers.get(name) else {
            debug!(command = name, "no handler registered; dropping");
            return Dispatch::Unknown(name.to_string());
        };
        match handler(context, fields) {
            Ok(()) => Dispatch::Handled,
            Err(report) => Dispatch::Rejected(report),
        }
    }
}
