//! Request context: tracing values, deadline and cancellation.
//!
//! A context is cheap to clone. Children created with [`RequestContext::with_timeout`]
//! inherit the parent's cancellation and tighten its deadline.
//! [`RequestContext::preserve_tracing`] detaches from both: the result has the
//! same tracing values, no deadline and cannot be cancelled by the parent.
//! A detached context must be given its own bounded deadline before use.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ContextError {
    #[error("operation canceled")]
    Canceled,

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// Values propagated for logging and reply quoting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceFields {
    pub chat_id: Option<String>,
    pub user_id: Option<String>,
    pub quote_token: Option<String>,
}

/// Owner side of a cancellation signal.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

#[derive(Debug, Clone)]
pub struct RequestContext {
    fields: Arc<TraceFields>,
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::background()
    }
}

impl RequestContext {
    /// A context with no tracing values, deadline or cancellation.
    pub fn background() -> Self {
        Self {
            fields: Arc::new(TraceFields::default()),
            deadline: None,
            cancel: None,
        }
    }

    /// A context carrying tracing values and a cancellation handle.
    pub fn with_fields(fields: TraceFields) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        let ctx = Self {
            fields: Arc::new(fields),
            deadline: None,
            cancel: Some(rx),
        };
        (ctx, CancelHandle { tx })
    }

    /// A cancellable context without tracing values.
    pub fn cancellable() -> (Self, CancelHandle) {
        Self::with_fields(TraceFields::default())
    }

    pub fn fields(&self) -> &TraceFields {
        &self.fields
    }

    pub fn chat_id(&self) -> Option<&str> {
        self.fields.chat_id.as_deref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, if any.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Derive a child whose deadline is at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < candidate => parent,
            _ => candidate,
        };
        Self {
            fields: Arc::clone(&self.fields),
            deadline: Some(deadline),
            cancel: self.cancel.clone(),
        }
    }

    /// Fresh context with the same tracing values and no parent deadline
    /// or cancellation.
    pub fn preserve_tracing(&self) -> Self {
        Self {
            fields: Arc::new(TraceFields::clone(&self.fields)),
            deadline: None,
            cancel: None,
        }
    }

    /// Non-blocking check of the context state.
    pub fn check(&self) -> Result<(), ContextError> {
        if let Some(rx) = &self.cancel {
            if *rx.borrow() {
                return Err(ContextError::Canceled);
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(ContextError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Resolves when the context is canceled. Never resolves for
    /// contexts without a cancellation signal.
    pub async fn canceled(&self) {
        match &self.cancel {
            Some(rx) => {
                let mut rx = rx.clone();
                // A dropped handle means nobody can cancel any more.
                if rx.wait_for(|c| *c).await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// Run `fut` until it completes, the deadline passes, or the context is
    /// canceled.
    pub async fn guard<F>(&self, fut: F) -> Result<F::Output, ContextError>
    where
        F: Future,
    {
        self.check()?;
        let deadline = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.canceled() => Err(ContextError::Canceled),
            _ = deadline => Err(ContextError::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }

    /// Cancellation-aware sleep.
    pub async fn sleep(&self, duration: Duration) -> Result<(), ContextError> {
        self.guard(tokio::time::sleep(duration)).await
    }

    /// Tracing span carrying this context's fields.
    pub fn span(&self, name: &'static str) -> tracing::Span {
        tracing::info_span!(
            "request",
            op = name,
            chat_id = self.fields.chat_id.as_deref().unwrap_or("-"),
            user_id = self.fields.user_id.as_deref().unwrap_or("-"),
        )
    }
}
