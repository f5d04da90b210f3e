//! Plugin instance lifecycle.
//!
//! ```text
//! Discovered -> Constructing -> Active -> TearingDown -> Unloaded
//!                           \-> Failed
//! ```
//! `Failed` is terminal; a failed instance is never retried. `Active ->
//! TearingDown` happens exactly once.

use std::time::Instant;

use crate::bus::panic_message;

/// Plugin lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Descriptor found, nothing constructed yet.
    Discovered,
    /// Factory is running.
    Constructing,
    /// Construction succeeded; handlers and threads are live.
    Active,
    /// Construction failed.
    Failed,
    /// Teardown in progress.
    TearingDown,
    /// Instance released.
    Unloaded,
}

impl LifecycleState {
    /// Check if the instance is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Unloaded)
    }

    /// Check whether `next` is a legal successor.
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        matches!(
            (self, next),
            (Self::Discovered, Self::Constructing)
                | (Self::Constructing, Self::Active)
                | (Self::Constructing, Self::Failed)
                | (Self::Active, Self::TearingDown)
                | (Self::TearingDown, Self::Unloaded)
        )
    }

    /// Get a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Discovered => "Plugin discovered but not constructed",
            Self::Constructing => "Plugin constructor running",
            Self::Active => "Plugin active and bound to the bus",
            Self::Failed => "Plugin construction failed",
            Self::TearingDown => "Plugin tearing down",
            Self::Unloaded => "Plugin unloaded",
        }
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Discovered => "discovered",
            Self::Constructing => "constructing",
            Self::Active => "active",
            Self::Failed => "failed",
            Self::TearingDown => "tearing-down",
            Self::Unloaded => "unloaded",
        };
        write!(f, "{}", name)
    }
}

/// Lifecycle event for hooks.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    /// Plugin module was discovered.
    Discovered {
        /// Module name.
        name: String,
        /// Discovery time.
        at: Instant,
    },
    /// Plugin instance became active.
    Activated {
        /// Instance name.
        name: String,
        /// Activation time.
        at: Instant,
    },
    /// Plugin construction failed.
    Failed {
        /// Instance name.
        name: String,
        /// Error message.
        message: String,
        /// Failure time.
        at: Instant,
    },
    /// Plugin teardown started.
    TearingDown {
        /// Instance name.
        name: String,
        /// Start time.
        at: Instant,
    },
    /// Plugin was unloaded.
    Unloaded {
        /// Instance name.
        name: String,
        /// Unload time.
        at: Instant,
    },
}

impl LifecycleEvent {
    /// Get the plugin name.
    pub fn plugin_name(&self) -> &str {
        match self {
            Self::Discovered { name, .. } => name,
            Self::Activated { name, .. } => name,
            Self::Failed { name, .. } => name,
            Self::TearingDown { name, .. } => name,
            Self::Unloaded { name, .. } => name,
        }
    }

    /// Get the event timestamp.
    pub fn timestamp(&self) -> Instant {
        match self {
            Self::Discovered { at, .. } => *at,
            Self::Activated { at, .. } => *at,
            Self::Failed { at, .. } => *at,
            Self::TearingDown { at, .. } => *at,
            Self::Unloaded { at, .. } => *at,
        }
    }

    /// Get the event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Discovered { .. } => "discovered",
            Self::Activated { .. } => "activated",
            Self::Failed { .. } => "failed",
            Self::TearingDown { .. } => "tearing-down",
            Self::Unloaded { .. } => "unloaded",
        }
    }
}

/// Hooks for lifecycle events.
pub struct LifecycleHooks {
    handlers: Vec<Box<dyn Fn(&LifecycleEvent) + Send + Sync>>,
}

impl LifecycleHooks {
    /// Create new lifecycle hooks.
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    /// Add a lifecycle event handler.
    pub fn on_event<F>(&mut self, handler: F)
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.handlers.push(Box::new(handler));
    }

    /// Emit a lifecycle event.
    ///
    /// A panicking hook is logged and skipped; the remaining hooks still run.
    pub fn emit(&self, event: LifecycleEvent) {
        tracing::trace!(plugin = %event.plugin_name(), event = event.event_name(), "lifecycle event");
        for handler in &self.handlers {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&event)));
            if let Err(panic) = outcome {
                tracing::error!(
                    plugin = %event.plugin_name(),
                    event = event.event_name(),
                    panic = %panic_message(panic.as_ref()),
                    "lifecycle hook panicked"
                );
            }
        }
    }

    /// Emit a discovered event.
    pub fn emit_discovered(&self, name: &str) {
        self.emit(LifecycleEvent::Discovered {
            name: name.to_string(),
            at: Instant::now(),
        });
    }

    /// Emit an activated event.
    pub fn emit_activated(&self, name: &str) {
        self.emit(LifecycleEvent::Activated {
            name: name.to_string(),
            at: Instant::now(),
        });
    }

    /// Emit a failed event.
    pub fn emit_failed(&self, name: &str, message: &str) {
        self.emit(LifecycleEvent::Failed {
            name: name.to_string(),
            message: message.to_string(),
            at: Instant::now(),
        });
    }

    /// Emit a tearing-down event.
    pub fn emit_tearing_down(&self, name: &str) {
        self.emit(LifecycleEvent::TearingDown {
            name: name.to_string(),
            at: Instant::now(),
        });
    }

    /// Emit an unloaded event.
    pub fn emit_unloaded(&self, name: &str) {
        self.emit(LifecycleEvent::Unloaded {
            name: name.to_string(),
            at: Instant::now(),
        });
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// True if no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for LifecycleHooks {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("handler_count", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_lifecycle_state_transitions() {
        use LifecycleState::*;

        assert!(Discovered.can_transition_to(Constructing));
        assert!(Constructing.can_transition_to(Active));
        assert!(Constructing.can_transition_to(Failed));
        assert!(Active.can_transition_to(TearingDown));
        assert!(TearingDown.can_transition_to(Unloaded));

        assert!(!Failed.can_transition_to(Constructing));
        assert!(!Active.can_transition_to(Active));
        assert!(!Unloaded.can_transition_to(TearingDown));
        assert!(!Discovered.can_transition_to(Active));

        assert!(Failed.is_terminal());
        assert!(Unloaded.is_terminal());
        assert!(!Active.is_terminal());
    }

    #[test]
    fn test_lifecycle_hooks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let mut hooks = LifecycleHooks::new();
        hooks.on_event(move |_| {
            counter_clone.fetch_add(1, Ordering::Relaxed);
        });

        hooks.emit_discovered("AudioPlugin");
        hooks.emit_activated("AudioPlugin.AudioSubSystem");
        hooks.emit_tearing_down("AudioPlugin.AudioSubSystem");
        hooks.emit_unloaded("AudioPlugin.AudioSubSystem");

        assert_eq!(counter.load(Ordering::Relaxed), 4);
        assert_eq!(hooks.len(), 1);
    }

    #[test]
    fn test_panicking_hook_does_not_stop_others() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();

        let mut hooks = LifecycleHooks::new();
        hooks.on_event(|_| panic!("hook bug"));
        hooks.on_event(move |_| {
            counter_clone.fetch_add(1, Ordering::Relaxed);
        });

        hooks.emit_failed("Broken.Widget", "no config");
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_lifecycle_event_info() {
        let event = LifecycleEvent::Failed {
            name: "Broken.Widget".to_string(),
            message: "no config".to_string(),
            at: Instant::now(),
        };

        assert_eq!(event.plugin_name(), "Broken.Widget");
        assert_eq!(event.event_name(), "failed");
    }
}
