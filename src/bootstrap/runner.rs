//! Components backed by a background task.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::component::{BaseComponent, Component, ComponentError, ComponentEvents};

/// Work run in the background while a [`RunAsyncComponent`] is open.
#[async_trait]
pub trait Runnable: Send + Sync + 'static {
    /// Run until `cancel` fires. Returning an error faults the component.
    async fn run(self: Arc<Self>, cancel: CancellationToken) -> anyhow::Result<()>;
}

struct Running {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Spawns its [`Runnable`] once opened and stops it on close.
pub struct RunAsyncComponent<R: Runnable> {
    base: Arc<BaseComponent>,
    runnable: Arc<R>,
    running: Mutex<Option<Running>>,
}

impl<R: Runnable> RunAsyncComponent<R> {
    pub fn new(name: impl Into<String>, runnable: R) -> Self {
        Self {
            base: Arc::new(BaseComponent::new(name)),
            runnable: Arc::new(runnable),
            running: Mutex::new(None),
        }
    }

    pub fn runnable(&self) -> &Arc<R> {
        &self.runnable
    }

    /// Whether the background task has been spawned and not yet finished.
    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    fn spawn(&self) {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return;
        }

        let token = CancellationToken::new();
        let runnable = self.runnable.clone();
        let base = self.base.clone();
        let run_token = token.clone();
        let handle = tokio::spawn(async move {
            match runnable.run(run_token).await {
                Ok(()) => debug!(component = %base.name(), "run loop finished"),
                Err(e) => {
                    base.fault(e);
                }
            }
        });

        *running = Some(Running { token, handle });
    }

    fn take_running(&self) -> Option<Running> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

#[async_trait]
impl<R: Runnable> Component for RunAsyncComponent<R> {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn events(&self) -> &ComponentEvents {
        self.base.events()
    }

    async fn open(&self, _cancel: &CancellationToken) -> Result<(), ComponentError> {
        self.base.open(|| Ok(()), async { Ok(()) }).await?;
        self.spawn();
        Ok(())
    }

    async fn close(&self, cancel: &CancellationToken) -> Result<(), ComponentError> {
        let running = self.take_running();
        let name = self.base.name().to_string();
        self.base
            .close(|| Ok(()), async move {
                let Some(Running { token, mut handle }) = running else {
                    return Ok(());
                };
                token.cancel();

                tokio::select! {
                    biased;

                    joined = &mut handle => match joined {
                        Ok(()) => Ok(()),
                        Err(e) if e.is_panic() => Err(anyhow::anyhow!("run loop panicked")),
                        Err(_) => Ok(()),
                    },

                    _ = cancel.cancelled() => {
                        info!(component = %name, "close cancelled, detaching run loop");
                        Err(ComponentError::CloseCancelled { component: name }.into())
                    }
                }
            })
            .await
    }
}

/// Named future for [`run_loops`].
pub type NamedLoop = (&'static str, BoxFuture<'static, anyhow::Result<()>>);

/// Run several loops concurrently.
///
/// Returns once all loops finish, or as soon as one fails; the remaining
/// loops are then detached and are expected to stop with the token that
/// drives them.
pub async fn run_loops(loops: Vec<NamedLoop>) -> anyhow::Result<()> {
    let mut set = JoinSet::new();
    for (name, fut) in loops {
        set.spawn(async move { (name, fut.await) });
    }

    while let Some(joined) = set.join_next().await {
        let failure = match joined {
            Ok((_, Ok(()))) => continue,
            Ok((name, Err(e))) => e.context(format!("loop '{name}' failed")),
            Err(e) => anyhow::anyhow!("loop task failed: {e}"),
        };
        error!(error = %failure, "run loop failed");
        set.detach_all();
        return Err(failure);
    }
    Ok(())
}
