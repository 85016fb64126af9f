//! Named event dispatch with per-handler fault isolation.
//!
//! Handlers registered for one event run concurrently when it is emitted;
//! `emit` returns once all of them have settled. A failing or panicking
//! handler is logged and counted, never propagated.

use std::{
    collections::HashMap,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        Arc, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use futures::{
    FutureExt,
    future::{self, BoxFuture},
};

/// Boxed async handler.
pub type Handler<A> = Arc<dyn Fn(A) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Catch-all handler; receives the event name alongside the argument.
pub type AnyHandler<A> =
    Arc<dyn Fn(String, A) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Identifies one registration so it can be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Result of one `emit`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitOutcome {
    /// Handlers that were run.
    pub invoked: usize,
    /// Handlers that returned an error or panicked.
    pub failed: usize,
}

struct Listener<A> {
    id: ListenerId,
    handler: Handler<A>,
    once: bool,
}

struct AnyListener<A> {
    id: ListenerId,
    handler: AnyHandler<A>,
}

struct Listeners<A> {
    named: HashMap<String, Vec<Listener<A>>>,
    any: Vec<AnyListener<A>>,
}

/// Event registry.
pub struct EventRegistry<A> {
    inner: RwLock<Listeners<A>>,
    next_id: AtomicU64,
}

impl<A> Default for EventRegistry<A>
where
    A: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<A> EventRegistry<A>
where
    A: Clone + Send + 'static,
{
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Listeners {
                named: HashMap::new(),
                any: Vec::new(),
            }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a handler for `event`.
    pub fn on<F, Fut>(&self, event: impl Into<String>, handler: F) -> ListenerId
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add(event.into(), Arc::new(move |arg| handler(arg).boxed()), false)
    }

    /// Register a handler that is removed after its first invocation.
    pub fn once<F, Fut>(&self, event: impl Into<String>, handler: F) -> ListenerId
    where
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add(event.into(), Arc::new(move |arg| handler(arg).boxed()), true)
    }

    /// Register an already boxed handler.
    pub fn on_boxed(&self, event: impl Into<String>, handler: Handler<A>) -> ListenerId {
        self.add(event.into(), handler, false)
    }

    /// Register a catch-all handler, run for every emitted event.
    pub fn on_any<F, Fut>(&self, handler: F) -> ListenerId
    where
        F: Fn(String, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.next_id();
        self.write().any.push(AnyListener {
            id,
            handler: Arc::new(move |event, arg| handler(event, arg).boxed()),
        });
        id
    }

    /// Remove one registration. Returns false if it was not present.
    pub fn off(&self, id: ListenerId) -> bool {
        let mut inner = self.write();
        let before = inner.any.len();
        inner.any.retain(|l| l.id != id);
        if inner.any.len() != before {
            return true;
        }
        for listeners in inner.named.values_mut() {
            if let Some(pos) = listeners.iter().position(|l| l.id == id) {
                listeners.remove(pos);
                return true;
            }
        }
        false
    }

    /// Remove every handler for `event`. Returns how many were removed.
    pub fn off_all(&self, event: &str) -> usize {
        self.write().named.remove(event).map_or(0, |l| l.len())
    }

    /// Number of handlers registered for `event`, excluding catch-alls.
    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        self.read().named.get(event).map_or(0, Vec::len)
    }

    /// Whether any handler (named or catch-all) would see `event`.
    #[must_use]
    pub fn has_listeners(&self, event: &str) -> bool {
        let inner = self.read();
        !inner.any.is_empty() || inner.named.get(event).is_some_and(|l| !l.is_empty())
    }

    /// Run every handler for `event` plus all catch-alls, concurrently.
    pub async fn emit(&self, event: &str, arg: A) -> EmitOutcome {
        let (handlers, any) = self.take_matching(event);

        let mut outcome = EmitOutcome::default();
        let mut pending = Vec::with_capacity(handlers.len() + any.len());

        for handler in handlers {
            outcome.invoked += 1;
            let arg = arg.clone();
            match std::panic::catch_unwind(AssertUnwindSafe(|| handler(arg))) {
                Ok(fut) => pending.push(fut),
                Err(_) => {
                    outcome.failed += 1;
                    tracing::warn!(event, "Event handler panicked");
                }
            }
        }
        for handler in any {
            outcome.invoked += 1;
            let arg = arg.clone();
            match std::panic::catch_unwind(AssertUnwindSafe(|| handler(event.to_string(), arg))) {
                Ok(fut) => pending.push(fut),
                Err(_) => {
                    outcome.failed += 1;
                    tracing::warn!(event, "Catch-all handler panicked");
                }
            }
        }

        let results =
            future::join_all(pending.into_iter().map(|f| AssertUnwindSafe(f).catch_unwind())).await;
        for result in results {
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    outcome.failed += 1;
                    tracing::warn!(event, error = %e, "Event handler failed");
                }
                Err(_) => {
                    outcome.failed += 1;
                    tracing::warn!(event, "Event handler panicked");
                }
            }
        }

        outcome
    }

    fn take_matching(&self, event: &str) -> (Vec<Handler<A>>, Vec<AnyHandler<A>>) {
        let mut inner = self.write();
        let any = inner.any.iter().map(|l| Arc::clone(&l.handler)).collect();
        let handlers = match inner.named.get_mut(event) {
            Some(listeners) => {
                let handlers = listeners.iter().map(|l| Arc::clone(&l.handler)).collect();
                listeners.retain(|l| !l.once);
                handlers
            }
            None => Vec::new(),
        };
        (handlers, any)
    }

    fn add(&self, event: String, handler: Handler<A>, once: bool) -> ListenerId {
        let id = self.next_id();
        self.write()
            .named
            .entry(event)
            .or_default()
            .push(Listener { id, handler, once });
        id
    }

    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Listeners<A>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Listeners<A>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use tokio::sync::Barrier;

    use super::*;

    type Log = Arc<Mutex<Vec<String>>>;

    fn log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn test_emit_runs_all_handlers() {
        let registry = EventRegistry::<u32>::new();
        let seen = log();
        for name in ["a", "b"] {
            let seen = Arc::clone(&seen);
            registry.on("tick", move |n| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.lock().unwrap().push(format!("{name}:{n}"));
                    anyhow::Ok(())
                }
            });
        }

        let outcome = registry.emit("tick", 7).await;
        assert_eq!(outcome, EmitOutcome { invoked: 2, failed: 0 });
        let mut seen = seen.lock().unwrap().clone();
        seen.sort();
        assert_eq!(seen, vec!["a:7", "b:7"]);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let registry = EventRegistry::<()>::new();
        let seen = log();
        registry.on("x", |()| async { Err::<(), _>(anyhow::anyhow!("boom")) });
        registry.on("x", |()| async { explode() });
        registry.on("x", |()| -> futures::future::Ready<anyhow::Result<()>> {
            panic!("sync panic")
        });
        let ok_seen = Arc::clone(&seen);
        registry.on("x", move |()| {
            let seen = Arc::clone(&ok_seen);
            async move {
                seen.lock().unwrap().push("ran".into());
                anyhow::Ok(())
            }
        });

        let outcome = registry.emit("x", ()).await;
        assert_eq!(outcome, EmitOutcome { invoked: 4, failed: 3 });
        assert_eq!(seen.lock().unwrap().as_slice(), ["ran"]);
    }

    fn explode() -> anyhow::Result<()> {
        panic!("handler panic")
    }

    #[tokio::test]
    async fn test_handlers_run_concurrently() {
        let registry = EventRegistry::<()>::new();
        let barrier = Arc::new(Barrier::new(2));
        for _ in 0..2 {
            let barrier = Arc::clone(&barrier);
            registry.on("sync", move |()| {
                let barrier = Arc::clone(&barrier);
                async move {
                    barrier.wait().await;
                    anyhow::Ok(())
                }
            });
        }
        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            registry.emit("sync", ()),
        )
        .await
        .expect("sequential dispatch would deadlock on the barrier");
        assert_eq!(outcome.failed, 0);
    }

    #[test]
    fn test_once_and_off() {
        let registry = EventRegistry::<()>::new();
        registry.once("e", |()| async { anyhow::Ok(()) });
        let id = registry.on("e", |()| async { anyhow::Ok(()) });
        assert_eq!(registry.listener_count("e"), 2);

        assert_eq!(tokio_test::block_on(registry.emit("e", ())).invoked, 2);
        assert_eq!(registry.listener_count("e"), 1);

        assert!(registry.off(id));
        assert!(!registry.off(id));
        assert_eq!(tokio_test::block_on(registry.emit("e", ())).invoked, 0);
    }

    #[tokio::test]
    async fn test_catch_all_sees_event_name() {
        let registry = EventRegistry::<i32>::new();
        let seen = log();
        let any_seen = Arc::clone(&seen);
        registry.on_any(move |event, n| {
            let seen = Arc::clone(&any_seen);
            async move {
                seen.lock().unwrap().push(format!("{event}={n}"));
                anyhow::Ok(())
            }
        });

        assert!(registry.has_listeners("anything"));
        registry.emit("left", 1).await;
        registry.emit("right", 2).await;
        assert_eq!(seen.lock().unwrap().as_slice(), ["left=1", "right=2"]);
        assert_eq!(registry.off_all("left"), 0);
    }
}
