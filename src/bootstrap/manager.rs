//! Component trees.
//!
//! A [`ComponentManager`] owns an ordered list of children. Opening walks the
//! list front to back, closing walks it back to front, so anything added
//! later (consumers) stops before what it depends on (logs).
//!
//! ```text
//!   root
//!    ├── instant log        open 1st   close last
//!    ├── delayed-0 log
//!    ├── delayed-0 processor
//!    └── instant processor  open last  close 1st
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::component::{
    BaseComponent, Component, ComponentError, ComponentEvent, ComponentEvents, ListenerId,
};

struct Child {
    key: u64,
    component: Arc<dyn Component>,
    closed_listener: ListenerId,
    fault_listener: Option<ListenerId>,
}

struct ManagerInner {
    base: BaseComponent,
    children: Mutex<Vec<Child>>,
    next_key: Mutex<u64>,
}

impl ManagerInner {
    fn children(&self) -> MutexGuard<'_, Vec<Child>> {
        self.children.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> Vec<Arc<dyn Component>> {
        self.children().iter().map(|c| c.component.clone()).collect()
    }

    fn on_child_closed(&self, key: u64) {
        let removed = {
            let mut children = self.children();
            let position = children.iter().position(|c| c.key == key);
            position.map(|p| children.remove(p))
        };
        if let Some(child) = removed {
            let events = child.component.events();
            events.unsubscribe(child.closed_listener);
            if let Some(id) = child.fault_listener {
                events.unsubscribe(id);
            }
            debug!(manager = %self.base.name(), child = %child.component.name(), "child deregistered");
        }
    }

    fn on_child_faulted(&self, key: u64, error: Arc<anyhow::Error>) {
        let taken = {
            let mut children = self.children();
            children
                .iter_mut()
                .find(|c| c.key == key)
                .and_then(|c| c.fault_listener.take().map(|id| (c.component.clone(), id)))
        };
        let Some((component, id)) = taken else {
            return;
        };
        component.events().unsubscribe(id);
        warn!(manager = %self.base.name(), child = %component.name(), "child faulted");
        self.base.forward_fault(error);
    }
}

/// A component that opens and closes an ordered set of children.
pub struct ComponentManager {
    inner: Arc<ManagerInner>,
}

impl ComponentManager {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                base: BaseComponent::new(name),
                children: Mutex::new(Vec::new()),
                next_key: Mutex::new(0),
            }),
        }
    }

    /// Register a child. Children open in registration order.
    pub fn add(&self, component: Arc<dyn Component>) {
        let key = {
            let mut next = self.inner.next_key.lock().unwrap_or_else(PoisonError::into_inner);
            *next += 1;
            *next
        };

        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let closed_listener = component.events().subscribe(move |event| {
            if let (ComponentEvent::Closed, Some(inner)) = (event, weak.upgrade()) {
                inner.on_child_closed(key);
            }
        });

        let weak: Weak<ManagerInner> = Arc::downgrade(&self.inner);
        let fault_listener = component.events().subscribe(move |event| {
            if let (ComponentEvent::Faulted(error), Some(inner)) = (event, weak.upgrade()) {
                inner.on_child_faulted(key, error.clone());
            }
        });

        debug!(manager = %self.inner.base.name(), child = %component.name(), "child registered");
        self.inner.children().push(Child {
            key,
            component,
            closed_listener,
            fault_listener: Some(fault_listener),
        });
    }

    pub fn len(&self) -> usize {
        self.inner.children().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Component for ComponentManager {
    fn name(&self) -> &str {
        self.inner.base.name()
    }

    fn events(&self) -> &ComponentEvents {
        self.inner.base.events()
    }

    async fn open(&self, cancel: &CancellationToken) -> Result<(), ComponentError> {
        let children = self.inner.snapshot();
        self.inner
            .base
            .open(|| Ok(()), async {
                for child in children {
                    child.open(cancel).await?;
                }
                Ok(())
            })
            .await
    }

    async fn close(&self, cancel: &CancellationToken) -> Result<(), ComponentError> {
        let children = self.inner.snapshot();
        self.inner
            .base
            .close(|| Ok(()), async {
                let mut first_error: Option<ComponentError> = None;
                for child in children.iter().rev() {
                    if let Err(e) = child.close(cancel).await {
                        warn!(child = %child.name(), error = %e, "child failed to close");
                        first_error.get_or_insert(e);
                    }
                }
                match first_error {
                    Some(e) => Err(e.into()),
                    None => Ok(()),
                }
            })
            .await
    }
}
