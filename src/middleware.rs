//! Middleware hooks around the store's change notification.
//!
//! The store runs middleware after a slice has committed (and persisted) a
//! change, but before global listeners and plugins hear about it:
//!
//! ```text
//! slice commit ─▶ before_change (in order, first `false` halts)
//!              ─▶ global listeners / plugins
//!              ─▶ after_change (in order)
//! ```
//!
//! A `before_change` veto therefore suppresses notification only; the slice
//! keeps the new value. Handler errors and panics are logged and treated as
//! "continue".

use tracing::Level;

use crate::error::Result;
use crate::event::ChangeEvent;

/// Pre/post notification hook.
pub trait Middleware: Send + Sync {
    /// Unique name, used by `remove_middleware`.
    fn name(&self) -> &str;

    /// Return `Ok(false)` to stop notification of this event.
    fn before_change(&self, _event: &ChangeEvent) -> Result<bool> {
        Ok(true)
    }

    /// Observe an event after listeners were notified.
    fn after_change(&self, _event: &ChangeEvent) -> Result<()> {
        Ok(())
    }
}

/// Logs every notified change through `tracing`.
#[derive(Debug, Clone, Copy)]
pub struct LoggingMiddleware {
    level: Level,
}

impl LoggingMiddleware {
    pub fn new(level: Level) -> Self {
        Self { level }
    }
}

impl Default for LoggingMiddleware {
    fn default() -> Self {
        Self::new(Level::DEBUG)
    }
}

impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    fn after_change(&self, event: &ChangeEvent) -> Result<()> {
        macro_rules! log_change {
            ($mac:ident) => {
                tracing::$mac!(
                    key = %event.key,
                    source = %event.source,
                    old = %event.old_value,
                    new = %event.new_value,
                    "state changed"
                )
            };
        }
        if self.level == Level::TRACE {
            log_change!(trace);
        } else if self.level == Level::DEBUG {
            log_change!(debug);
        } else if self.level == Level::INFO {
            log_change!(info);
        } else if self.level == Level::WARN {
            log_change!(warn);
        } else {
            log_change!(error);
        }
        Ok(())
    }
}

type BeforeFn = Box<dyn Fn(&ChangeEvent) -> Result<bool> + Send + Sync>;
type AfterFn = Box<dyn Fn(&ChangeEvent) -> Result<()> + Send + Sync>;

/// Middleware assembled from closures.
pub struct FnMiddleware {
    name: String,
    before: Option<BeforeFn>,
    after: Option<AfterFn>,
}

impl FnMiddleware {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            before: None,
            after: None,
        }
    }

    /// Set the `before_change` hook.
    pub fn before<F>(mut self, f: F) -> Self
    where
        F: Fn(&ChangeEvent) -> Result<bool> + Send + Sync + 'static,
    {
        self.before = Some(Box::new(f));
        self
    }

    /// Set the `after_change` hook.
    pub fn after<F>(mut self, f: F) -> Self
    where
        F: Fn(&ChangeEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.after = Some(Box::new(f));
        self
    }
}

impl Middleware for FnMiddleware {
    fn name(&self) -> &str {
        &self.name
    }

    fn before_change(&self, event: &ChangeEvent) -> Result<bool> {
        match &self.before {
            Some(f) => f(event),
            None => Ok(true),
        }
    }

    fn after_change(&self, event: &ChangeEvent) -> Result<()> {
        match &self.after {
            Some(f) => f(event),
            None => Ok(()),
        }
    }
}
