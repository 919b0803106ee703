//! Component lifecycle and events.
//!
//! Every long-lived part of the pipeline (logs, processors, the dispatcher
//! itself) is a [`Component`] with the same state machine:
//!
//! ```text
//!   Created ──open──▶ Opening ──▶ Opened ──close──▶ Closing ──▶ Closed
//!                        │                             │
//!                        └────────── Faulted ◀─────────┘
//! ```
//!
//! Lifecycle transitions are published through [`ComponentEvents`], an
//! explicit subscribe/unsubscribe listener registry.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

// =============================================================================
// Events
// =============================================================================

/// Lifecycle event published by a component.
#[derive(Debug, Clone)]
pub enum ComponentEvent {
    Opening,
    Opened,
    Closing,
    Closed,
    Faulted(Arc<anyhow::Error>),
}

impl ComponentEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Opening => "opening",
            Self::Opened => "opened",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Faulted(_) => "faulted",
        }
    }
}

/// Handle returned by [`ComponentEvents::subscribe`].
pub type ListenerId = u64;

type Listener = Arc<dyn Fn(&ComponentEvent) + Send + Sync>;

/// Listener registry for one component.
pub struct ComponentEvents {
    owner: String,
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
}

impl ComponentEvents {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            next_id: AtomicU64::new(1),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ComponentEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Deliver an event to a snapshot of the current listeners.
    ///
    /// Listeners may subscribe or unsubscribe from inside the callback. A
    /// panicking listener is logged and skipped.
    pub fn raise(&self, event: &ComponentEvent) {
        let snapshot: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, l)| l.clone())
            .collect();

        debug!(component = %self.owner, event = event.name(), listeners = snapshot.len(), "raising event");

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!(
                    component = %self.owner,
                    event = event.name(),
                    "event listener panicked"
                );
            }
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Errors raised by lifecycle operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ComponentError {
    #[error("component '{component}' faulted: {error}")]
    Faulted {
        component: String,
        error: Arc<anyhow::Error>,
    },

    #[error("close of component '{component}' was cancelled")]
    CloseCancelled { component: String },
}

// =============================================================================
// Component trait
// =============================================================================

/// A unit with an asynchronous open/close lifecycle.
#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &str;

    fn events(&self) -> &ComponentEvents;

    async fn open(&self, cancel: &CancellationToken) -> Result<(), ComponentError>;

    async fn close(&self, cancel: &CancellationToken) -> Result<(), ComponentError>;
}

/// Lifecycle state of a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentState {
    Created,
    Opening,
    Opened,
    Closing,
    Closed,
    Faulted,
}

// =============================================================================
// BaseComponent
// =============================================================================

/// Shared lifecycle plumbing embedded by concrete components.
///
/// `open` runs the synchronous `before` hook, then the asynchronous work,
/// raising `Opening` and `Opened` around them (`close` is symmetric). Any
/// failure raises `Faulted` and is returned to the caller.
pub struct BaseComponent {
    name: String,
    events: ComponentEvents,
    state: Mutex<ComponentState>,
    faulted: AtomicBool,
}

impl BaseComponent {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            events: ComponentEvents::new(name.clone()),
            name,
            state: Mutex::new(ComponentState::Created),
            faulted: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn events(&self) -> &ComponentEvents {
        &self.events
    }

    pub fn state(&self) -> ComponentState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ComponentState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub async fn open<B, W>(&self, before: B, work: W) -> Result<(), ComponentError>
    where
        B: FnOnce() -> anyhow::Result<()>,
        W: Future<Output = anyhow::Result<()>>,
    {
        self.faulted.store(false, Ordering::SeqCst);
        self.set_state(ComponentState::Opening);
        self.events.raise(&ComponentEvent::Opening);

        if let Err(e) = before() {
            return Err(self.fault(e));
        }
        if let Err(e) = work.await {
            return Err(self.fault(e));
        }

        self.set_state(ComponentState::Opened);
        self.events.raise(&ComponentEvent::Opened);
        info!(component = %self.name, "component opened");
        Ok(())
    }

    pub async fn close<B, W>(&self, before: B, work: W) -> Result<(), ComponentError>
    where
        B: FnOnce() -> anyhow::Result<()>,
        W: Future<Output = anyhow::Result<()>>,
    {
        self.set_state(ComponentState::Closing);
        self.events.raise(&ComponentEvent::Closing);

        if let Err(e) = before() {
            return Err(self.fault(e));
        }
        if let Err(e) = work.await {
            if let Some(cancelled @ ComponentError::CloseCancelled { .. }) =
                e.downcast_ref::<ComponentError>()
            {
                return Err(cancelled.clone());
            }
            return Err(self.fault(e));
        }

        self.set_state(ComponentState::Closed);
        self.events.raise(&ComponentEvent::Closed);
        info!(component = %self.name, "component closed");
        Ok(())
    }

    /// Record a fault. Only the first fault of a lifecycle raises `Faulted`.
    pub fn fault(&self, error: anyhow::Error) -> ComponentError {
        let error = Arc::new(error);
        self.set_state(ComponentState::Faulted);
        if !self.faulted.swap(true, Ordering::SeqCst) {
            error!(component = %self.name, error = %error, "component faulted");
            self.events.raise(&ComponentEvent::Faulted(error.clone()));
        }
        ComponentError::Faulted {
            component: self.name.clone(),
            error,
        }
    }

    /// Forward a fault raised elsewhere (a child component) as this
    /// component's own.
    pub fn forward_fault(&self, error: Arc<anyhow::Error>) {
        self.set_state(ComponentState::Faulted);
        if !self.faulted.swap(true, Ordering::SeqCst) {
            error!(component = %self.name, error = %error, "component faulted");
            self.events.raise(&ComponentEvent::Faulted(error));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    fn recorder(events: &ComponentEvents) -> (Arc<StdMutex<Vec<&'static str>>>, ListenerId) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let id = events.subscribe(move |e| sink.lock().unwrap().push(e.name()));
        (seen, id)
    }

    #[tokio::test]
    async fn test_open_close_event_order() {
        let base = BaseComponent::new("test");
        let (seen, _) = recorder(base.events());

        base.open(|| Ok(()), async { Ok(()) }).await.unwrap();
        assert_eq!(base.state(), ComponentState::Opened);
        base.close(|| Ok(()), async { Ok(()) }).await.unwrap();
        assert_eq!(base.state(), ComponentState::Closed);

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["opening", "opened", "closing", "closed"]
        );
    }

    #[tokio::test]
    async fn test_open_failure_raises_fault_and_returns_error() {
        let base = BaseComponent::new("broken");
        let (seen, _) = recorder(base.events());

        let err = base
            .open(|| Ok(()), async { Err(anyhow::anyhow!("disk on fire")) })
            .await
            .unwrap_err();

        assert!(matches!(err, ComponentError::Faulted { ref component, .. } if component == "broken"));
        assert!(err.to_string().contains("disk on fire"));
        assert_eq!(*seen.lock().unwrap(), vec!["opening", "faulted"]);
        assert_eq!(base.state(), ComponentState::Faulted);
    }

    #[tokio::test]
    async fn test_before_hook_aborts_open() {
        let base = BaseComponent::new("guarded");
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();

        let result = base
            .open(
                || anyhow::bail!("not ready"),
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Ok(())
                },
            )
            .await;

        assert!(result.is_err());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_close_cancelled_is_not_a_fault() {
        let base = BaseComponent::new("slow");
        let (seen, _) = recorder(base.events());

        let err = base
            .close(|| Ok(()), async {
                Err(ComponentError::CloseCancelled {
                    component: "slow".into(),
                }
                .into())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ComponentError::CloseCancelled { .. }));
        assert_eq!(*seen.lock().unwrap(), vec!["closing"]);
    }

    #[test]
    fn test_fault_raised_once() {
        let base = BaseComponent::new("twice");
        let (seen, _) = recorder(base.events());

        base.fault(anyhow::anyhow!("first"));
        base.fault(anyhow::anyhow!("second"));

        assert_eq!(*seen.lock().unwrap(), vec!["faulted"]);
    }

    #[test]
    fn test_unsubscribe() {
        let events = ComponentEvents::new("x");
        let (seen, id) = recorder(&events);

        events.raise(&ComponentEvent::Opening);
        assert!(events.unsubscribe(id));
        assert!(!events.unsubscribe(id));
        events.raise(&ComponentEvent::Opened);

        assert_eq!(*seen.lock().unwrap(), vec!["opening"]);
        assert_eq!(events.listener_count(), 0);
    }

    #[test]
    fn test_panicking_listener_does_not_propagate() {
        let events = ComponentEvents::new("x");
        events.subscribe(|_| panic!("listener bug"));
        let (seen, _) = recorder(&events);

        events.raise(&ComponentEvent::Closed);
        assert_eq!(*seen.lock().unwrap(), vec!["closed"]);
    }
}
