//! Ordered handler registry.
//!
//! Registration order is fixed at startup and decides which handler
//! claims a message first.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn, Instrument};

use crate::context::RequestContext;
use crate::handlers::{Handler, HandlerError, Params};
use crate::metrics::Metrics;
use crate::nlu::IntentSignature;
use crate::postback::{Postback, PostbackError};
use crate::reply::Message;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no handler for module '{0}'")]
    UnknownModule(String),

    #[error("module '{0}' registered twice")]
    DuplicateModule(String),

    #[error("unknown intent '{intent}' for module '{module}'")]
    UnknownIntent { module: String, intent: String },

    #[error("missing parameter '{0}'")]
    MissingParameter(String),

    #[error(transparent)]
    Postback(#[from] PostbackError),

    #[error(transparent)]
    Handler(HandlerError),
}

impl From<HandlerError> for DispatchError {
    fn from(e: HandlerError) -> Self {
        match e {
            HandlerError::UnknownIntent { module, intent } => {
                DispatchError::UnknownIntent { module, intent }
            }
            HandlerError::MissingParameter(name) => DispatchError::MissingParameter(name),
            HandlerError::Postback(e) => DispatchError::Postback(e),
            other => DispatchError::Handler(other),
        }
    }
}

impl DispatchError {
    /// Short label for metrics and logs.
    pub fn classification(&self) -> &'static str {
        match self {
            DispatchError::UnknownModule(_) => "unknown_module",
            DispatchError::DuplicateModule(_) => "duplicate_module",
            DispatchError::UnknownIntent { .. } => "unknown_intent",
            DispatchError::MissingParameter(_) => "missing_parameter",
            DispatchError::Postback(_) => "postback",
            DispatchError::Handler(e) => e.classification(),
        }
    }
}

/// Run a handler call under the context's deadline and cancellation. A
/// handler still running when the deadline passes is dropped.
async fn bounded<F>(
    ctx: &RequestContext,
    module: &str,
    fut: F,
) -> Result<Vec<Message>, HandlerError>
where
    F: Future<Output = Result<Vec<Message>, HandlerError>>,
{
    match ctx.guard(fut).await {
        Ok(result) => result,
        Err(e) => {
            warn!(module, error = %e, "Handler abandoned");
            Err(e.into())
        }
    }
}

pub struct Dispatcher {
    handlers: Vec<Arc<dyn Handler>>,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            handlers: Vec::new(),
            metrics,
        }
    }

    /// Append a handler. Module names must be unique.
    pub fn register(&mut self, handler: Arc<dyn Handler>) -> Result<(), DispatchError> {
        let module = handler.module();
        if self.get_handler(module).is_some() {
            return Err(DispatchError::DuplicateModule(module.to_string()));
        }
        debug!(module, position = self.handlers.len(), "Registered handler");
        self.handlers.push(handler);
        Ok(())
    }

    /// Builder form of [`Dispatcher::register`].
    pub fn with(mut self, handler: Arc<dyn Handler>) -> Result<Self, DispatchError> {
        self.register(handler)?;
        Ok(self)
    }

    pub fn get_handler(&self, module: &str) -> Option<&Arc<dyn Handler>> {
        self.handlers.iter().find(|h| h.module() == module)
    }

    pub fn modules(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.module()).collect()
    }

    /// Intents of every registered handler, in registration order.
    pub fn catalogue(&self) -> Vec<IntentSignature> {
        self.handlers
            .iter()
            .flat_map(|h| {
                let module = h.module();
                h.intents()
                    .iter()
                    .map(move |spec| IntentSignature::new(module, spec))
            })
            .collect()
    }

    fn record(&self, module: &str, outcome: &str) {
        self.metrics
            .handler_requests
            .with_label_values(&[module, outcome])
            .inc();
    }

    fn finish(
        &self,
        module: &str,
        result: Result<Vec<Message>, HandlerError>,
    ) -> Result<Vec<Message>, DispatchError> {
        match &result {
            Ok(messages) if messages.is_empty() => self.record(module, "empty"),
            Ok(_) => self.record(module, "ok"),
            Err(e) => self.record(module, e.classification()),
        }
        result.map_err(DispatchError::from)
    }

    /// First non-empty reply of a handler that claims `text`. An empty
    /// result means nobody answered.
    pub async fn dispatch_message(
        &self,
        ctx: &RequestContext,
        text: &str,
    ) -> Result<Vec<Message>, DispatchError> {
        for handler in &self.handlers {
            if !handler.can_handle(text) {
                continue;
            }
            let module = handler.module();
            let call = handler
                .handle_message(ctx, text)
                .instrument(tracing::debug_span!("handler", module));
            let result = bounded(ctx, module, call).await;
            let messages = self.finish(module, result)?;
            if !messages.is_empty() {
                return Ok(messages);
            }
        }
        Ok(Vec::new())
    }

    /// Decode a postback payload and route it by module.
    pub async fn dispatch_postback(
        &self,
        ctx: &RequestContext,
        data: &str,
    ) -> Result<Vec<Message>, DispatchError> {
        let postback = Postback::decode(data)?;
        let handler = self
            .get_handler(&postback.module)
            .ok_or_else(|| DispatchError::UnknownModule(postback.module.clone()))?;
        let module = handler.module();
        let call = handler
            .handle_postback(ctx, &postback)
            .instrument(tracing::debug_span!("postback", module, action = %postback.action));
        let result = bounded(ctx, module, call).await;
        self.finish(module, result)
    }

    /// Route an NLU-parsed intent.
    pub async fn dispatch_intent(
        &self,
        ctx: &RequestContext,
        module: &str,
        intent: &str,
        params: &Params,
    ) -> Result<Vec<Message>, DispatchError> {
        let handler = self
            .get_handler(module)
            .ok_or_else(|| DispatchError::UnknownModule(module.to_string()))?;
        let module = handler.module();
        let call = handler
            .dispatch_intent(ctx, intent, params)
            .instrument(tracing::debug_span!("intent", module, intent));
        let result = bounded(ctx, module, call).await;
        self.finish(module, result)
    }
}
