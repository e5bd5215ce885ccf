use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use std::future::Future;
use std::io::Write;
use tracing::{debug, info, warn};

use crate::colors::Palette;
use crate::error::{RenderError, WatchError};
use crate::model::{ChangeEvent, NamespaceScope, ResourceKind, ResourceRow, TableSpec};
use crate::table::{Screen, Table};

const WATCHING_BANNER: &str = "Watching for changes... (Ctrl+C to stop)";
const STOPPING_NOTICE: &str = "Stopping watch...";

/// Pulls a complete, ordered listing of one resource kind.
#[async_trait]
pub trait SnapshotFetcher: Send + Sync {
    async fn fetch(&self, kind: ResourceKind, scope: &NamespaceScope) -> Result<Vec<ResourceRow>>;
}

/// Opens change streams for a resource collection.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn open(&self, kind: ResourceKind, scope: &NamespaceScope) -> Result<Subscription>;
}

/// An open change stream. Stopping or dropping it releases the underlying watch.
pub struct Subscription {
    events: BoxStream<'static, ChangeEvent>,
    on_stop: Option<Box<dyn FnOnce() + Send>>,
    released: bool,
}

impl Subscription {
    pub fn new(events: BoxStream<'static, ChangeEvent>) -> Self {
        Self {
            events,
            on_stop: None,
            released: false,
        }
    }

    pub fn on_stop(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_stop = Some(Box::new(hook));
        self
    }

    /// `None` means the transport closed the stream.
    pub async fn next_event(&mut self) -> Option<ChangeEvent> {
        self.events.next().await
    }

    pub fn stop(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.events = futures::stream::empty().boxed();
        if let Some(hook) = self.on_stop.take() {
            hook();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

/// Drives one watch session: initial render, then one full re-render per event
/// until the stream fails or the shutdown future resolves.
pub struct WatchLoop<'a, F, C, S> {
    fetcher: &'a F,
    feed: &'a C,
    screen: &'a mut S,
    palette: Palette,
}

impl<'a, F, C, S> WatchLoop<'a, F, C, S>
where
    F: SnapshotFetcher,
    C: ChangeFeed,
    S: Screen,
{
    pub fn new(fetcher: &'a F, feed: &'a C, screen: &'a mut S, palette: Palette) -> Self {
        Self {
            fetcher,
            feed,
            screen,
            palette,
        }
    }

    pub async fn run<X>(
        &mut self,
        kind_token: &str,
        scope: NamespaceScope,
        shutdown: X,
    ) -> Result<(), WatchError>
    where
        X: Future<Output = ()>,
    {
        let kind = ResourceKind::from_token(kind_token)
            .ok_or_else(|| WatchError::unsupported(kind_token, "watch"))?;
        debug!(%kind, scope = scope.label(), "initializing watch");

        let mut subscription =
            self.feed
                .open(kind, &scope)
                .await
                .map_err(|source| WatchError::Subscription {
                    kind,
                    scope: scope.clone(),
                    source,
                })?;

        let outcome = match self.initial_render(kind, &scope).await {
            Ok(()) => {
                info!(%kind, scope = scope.label(), "watch streaming");
                self.stream(kind, &scope, &mut subscription, shutdown).await
            }
            Err(error) => Err(error),
        };

        subscription.stop();
        match &outcome {
            Ok(()) => {
                info!(%kind, "watch stopped by operator");
                self.write_line(kind, &format!("\n{STOPPING_NOTICE}"))?;
            }
            Err(error) => warn!(%kind, "watch failed: {error}"),
        }
        outcome
    }

    async fn initial_render(
        &mut self,
        kind: ResourceKind,
        scope: &NamespaceScope,
    ) -> Result<(), WatchError> {
        self.render_cycle(kind, scope, None).await?;
        self.write_line(kind, &format!("\n{WATCHING_BANNER}"))
    }

    async fn stream<X>(
        &mut self,
        kind: ResourceKind,
        scope: &NamespaceScope,
        subscription: &mut Subscription,
        shutdown: X,
    ) -> Result<(), WatchError>
    where
        X: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        loop {
            // Shutdown is checked first so buffered events never start another cycle.
            tokio::select! {
                biased;
                () = &mut shutdown => {
                    debug!(%kind, "shutdown signal observed");
                    return Ok(());
                }
                event = subscription.next_event() => match event {
                    Some(event) => {
                        let object = event.object();
                        debug!(
                            %kind,
                            event = event.label(),
                            name = %object.name,
                            namespace = ?object.namespace,
                            "change received"
                        );
                        self.render_cycle(kind, scope, Some(&event)).await?;
                    }
                    None => {
                        return Err(WatchError::StreamClosed {
                            kind,
                            scope: scope.clone(),
                        });
                    }
                },
            }
        }
    }

    async fn render_cycle(
        &mut self,
        kind: ResourceKind,
        scope: &NamespaceScope,
        event: Option<&ChangeEvent>,
    ) -> Result<(), WatchError> {
        let rows = self
            .fetcher
            .fetch(kind, scope)
            .await
            .map_err(|source| WatchError::Fetch {
                kind,
                scope: scope.clone(),
                source,
            })?;
        let table = build_table(TableSpec::for_kind(kind, scope), rows);

        let render = |error: RenderError| WatchError::Render {
            kind,
            source: error,
        };
        if event.is_some() {
            self.screen
                .clear_viewport()
                .map_err(|error| render(error.into()))?;
        }
        table.render(&mut *self.screen, self.palette).map_err(render)?;
        if let Some(event) = event {
            writeln!(self.screen, "\n{}", event.annotation())
                .map_err(|error| render(error.into()))?;
        }
        self.screen.flush().map_err(|error| render(error.into()))
    }

    fn write_line(&mut self, kind: ResourceKind, line: &str) -> Result<(), WatchError> {
        writeln!(self.screen, "{line}")
            .and_then(|()| self.screen.flush())
            .map_err(|error| WatchError::Render {
                kind,
                source: error.into(),
            })
    }
}

/// Collects rows into a table, dropping any whose shape does not match `spec`.
pub fn build_table(spec: TableSpec, rows: Vec<ResourceRow>) -> Table {
    let mut table = Table::new(spec);
    for row in rows {
        if let Err(error) = table.push(row) {
            warn!("dropping malformed row: {error}");
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use super::{ChangeFeed, SnapshotFetcher, Subscription, WatchLoop};
    use crate::colors::{ColumnRole, Palette};
    use crate::error::WatchError;
    use crate::model::{ChangeEvent, NamespaceScope, ObjectRef, ResourceKind, ResourceRow};
    use crate::table::MemoryScreen;
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use futures::StreamExt;
    use futures::stream;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;

    fn pod(name: &str, ready: &str, status: &str) -> ResourceRow {
        ResourceRow::new(vec![
            name.to_string(),
            ready.to_string(),
            status.to_string(),
            "0".to_string(),
            "1m".to_string(),
        ])
    }

    fn added(name: &str) -> ChangeEvent {
        ChangeEvent::Added(ObjectRef::new(name, Some("default".to_string())))
    }

    fn modified(name: &str) -> ChangeEvent {
        ChangeEvent::Modified(ObjectRef::new(name, Some("default".to_string())))
    }

    fn default_scope() -> NamespaceScope {
        NamespaceScope::Named("default".to_string())
    }

    /// Serves queued snapshots in order, repeating the last one, and can fire a
    /// shutdown trigger once a given number of fetches has happened.
    struct ScriptedFetcher {
        snapshots: Mutex<VecDeque<Vec<ResourceRow>>>,
        last: Mutex<Vec<ResourceRow>>,
        calls: AtomicUsize,
        fail_on_call: Option<usize>,
        trigger: Mutex<Option<(usize, oneshot::Sender<()>)>>,
    }

    impl ScriptedFetcher {
        fn new(snapshots: Vec<Vec<ResourceRow>>) -> Self {
            Self {
                snapshots: Mutex::new(snapshots.into()),
                last: Mutex::new(Vec::new()),
                calls: AtomicUsize::new(0),
                fail_on_call: None,
                trigger: Mutex::new(None),
            }
        }

        fn failing_on(mut self, call: usize) -> Self {
            self.fail_on_call = Some(call);
            self
        }

        fn trigger_after(self, calls: usize, tx: oneshot::Sender<()>) -> Self {
            *self.trigger.lock().unwrap() = Some((calls, tx));
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SnapshotFetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            _kind: ResourceKind,
            _scope: &NamespaceScope,
        ) -> Result<Vec<ResourceRow>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_on_call == Some(call) {
                return Err(anyhow!("apiserver unavailable"));
            }

            let mut trigger = self.trigger.lock().unwrap();
            if trigger.as_ref().is_some_and(|(after, _)| *after == call)
                && let Some((_, tx)) = trigger.take()
            {
                let _ = tx.send(());
            }

            let mut last = self.last.lock().unwrap();
            if let Some(next) = self.snapshots.lock().unwrap().pop_front() {
                *last = next;
            }
            Ok(last.clone())
        }
    }

    enum Tail {
        Close,
        Hold,
    }

    struct ScriptedFeed {
        events: Mutex<Option<Vec<ChangeEvent>>>,
        tail: Tail,
        fail_open: bool,
        opened: AtomicBool,
        stopped: Arc<AtomicBool>,
    }

    impl ScriptedFeed {
        fn new(events: Vec<ChangeEvent>, tail: Tail) -> Self {
            Self {
                events: Mutex::new(Some(events)),
                tail,
                fail_open: false,
                opened: AtomicBool::new(false),
                stopped: Arc::new(AtomicBool::new(false)),
            }
        }

        fn refusing() -> Self {
            Self {
                fail_open: true,
                ..Self::new(Vec::new(), Tail::Close)
            }
        }

        fn stopped(&self) -> bool {
            self.stopped.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChangeFeed for ScriptedFeed {
        async fn open(&self, _kind: ResourceKind, _scope: &NamespaceScope) -> Result<Subscription> {
            if self.fail_open {
                return Err(anyhow!("forbidden"));
            }
            self.opened.store(true, Ordering::SeqCst);

            let events = stream::iter(self.events.lock().unwrap().take().unwrap_or_default());
            let events = match self.tail {
                Tail::Close => events.boxed(),
                Tail::Hold => events.chain(stream::pending()).boxed(),
            };
            let stopped = Arc::clone(&self.stopped);
            Ok(Subscription::new(events).on_stop(move || stopped.store(true, Ordering::SeqCst)))
        }
    }

    #[tokio::test]
    async fn stream_close_after_two_events_is_a_failure() {
        let fetcher = ScriptedFetcher::new(vec![vec![pod("r1", "1/1", "Running")]]);
        let feed = ScriptedFeed::new(vec![added("r1"), modified("r1")], Tail::Close);
        let mut screen = MemoryScreen::default();

        let result = WatchLoop::new(&fetcher, &feed, &mut screen, Palette::plain())
            .run("pods", default_scope(), std::future::pending())
            .await;

        assert!(matches!(result, Err(WatchError::StreamClosed { .. })));
        assert_eq!(fetcher.calls(), 3);
        assert_eq!(screen.clears, 2);
        assert!(feed.stopped());
        assert!(!screen.text().contains("Stopping watch"));
    }

    #[tokio::test]
    async fn cancellation_after_two_events_is_a_clean_stop() {
        let (tx, rx) = oneshot::channel();
        let fetcher =
            ScriptedFetcher::new(vec![vec![pod("r1", "1/1", "Running")]]).trigger_after(3, tx);
        let feed = ScriptedFeed::new(vec![added("r1"), modified("r1")], Tail::Hold);
        let mut screen = MemoryScreen::default();

        let result = WatchLoop::new(&fetcher, &feed, &mut screen, Palette::plain())
            .run("po", default_scope(), async move {
                let _ = rx.await;
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(fetcher.calls(), 3);
        assert!(feed.stopped());

        let text = screen.text();
        assert!(text.contains("Watching for changes... (Ctrl+C to stop)"));
        assert!(text.contains("Event: ADDED - r1"));
        assert!(text.contains("Event: MODIFIED - r1"));
        assert!(text.trim_end().ends_with("Stopping watch..."));
    }

    #[tokio::test]
    async fn no_cycle_starts_after_cancellation_even_with_buffered_events() {
        let (tx, rx) = oneshot::channel();
        tx.send(()).unwrap();
        let fetcher = ScriptedFetcher::new(vec![vec![pod("r1", "1/1", "Running")]]);
        let feed = ScriptedFeed::new(
            vec![added("r2"), modified("r1"), modified("r2")],
            Tail::Hold,
        );
        let mut screen = MemoryScreen::default();

        let result = WatchLoop::new(&fetcher, &feed, &mut screen, Palette::plain())
            .run("pods", default_scope(), async move {
                let _ = rx.await;
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(fetcher.calls(), 1);
        assert_eq!(screen.clears, 0);
        assert!(!screen.text().contains("Event:"));
    }

    #[tokio::test]
    async fn unknown_kind_fails_before_opening_anything() {
        let fetcher = ScriptedFetcher::new(Vec::new());
        let feed = ScriptedFeed::new(Vec::new(), Tail::Close);
        let mut screen = MemoryScreen::default();

        let result = WatchLoop::new(&fetcher, &feed, &mut screen, Palette::plain())
            .run("nodes", default_scope(), std::future::pending())
            .await;

        match result {
            Err(WatchError::UnsupportedKind { kind, operation }) => {
                assert_eq!(kind, "nodes");
                assert_eq!(operation, "watch");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(fetcher.calls(), 0);
        assert!(!feed.opened.load(Ordering::SeqCst));
        assert!(screen.buffer.is_empty());
    }

    #[tokio::test]
    async fn subscription_failure_happens_before_any_render() {
        let fetcher = ScriptedFetcher::new(vec![vec![pod("r1", "1/1", "Running")]]);
        let feed = ScriptedFeed::refusing();
        let mut screen = MemoryScreen::default();

        let result = WatchLoop::new(&fetcher, &feed, &mut screen, Palette::plain())
            .run("pods", default_scope(), std::future::pending())
            .await;

        assert!(matches!(result, Err(WatchError::Subscription { .. })));
        assert_eq!(fetcher.calls(), 0);
        assert!(screen.buffer.is_empty());
    }

    #[tokio::test]
    async fn fetch_failure_mid_watch_stops_and_releases() {
        let fetcher =
            ScriptedFetcher::new(vec![vec![pod("r1", "1/1", "Running")]]).failing_on(2);
        let feed = ScriptedFeed::new(vec![added("r2"), modified("r2")], Tail::Hold);
        let mut screen = MemoryScreen::default();

        let result = WatchLoop::new(&fetcher, &feed, &mut screen, Palette::plain())
            .run("pods", default_scope(), std::future::pending())
            .await;

        match result {
            Err(WatchError::Fetch { kind, scope, .. }) => {
                assert_eq!(kind, ResourceKind::Pods);
                assert_eq!(scope, default_scope());
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert_eq!(fetcher.calls(), 2);
        assert!(feed.stopped());
    }

    #[tokio::test]
    async fn initial_fetch_failure_still_releases_subscription() {
        let fetcher = ScriptedFetcher::new(Vec::new()).failing_on(1);
        let feed = ScriptedFeed::new(vec![added("r1")], Tail::Hold);
        let mut screen = MemoryScreen::default();

        let result = WatchLoop::new(&fetcher, &feed, &mut screen, Palette::plain())
            .run("pods", default_scope(), std::future::pending())
            .await;

        assert!(matches!(result, Err(WatchError::Fetch { .. })));
        assert!(feed.stopped());
        assert!(!screen.text().contains("Watching for changes"));
    }

    #[tokio::test]
    async fn added_pod_shows_up_in_second_render() {
        let (tx, rx) = oneshot::channel();
        let fetcher = ScriptedFetcher::new(vec![
            vec![pod("a", "1/1", "Running")],
            vec![pod("a", "1/1", "Running"), pod("b", "0/1", "Pending")],
        ])
        .trigger_after(2, tx);
        let feed = ScriptedFeed::new(vec![added("b")], Tail::Hold);
        let mut screen = MemoryScreen::default();
        let palette = Palette::new(true);

        let result = WatchLoop::new(&fetcher, &feed, &mut screen, palette)
            .run("pods", default_scope(), async move {
                let _ = rx.await;
            })
            .await;
        assert!(result.is_ok());

        let text = screen.text();
        let (first, second) = text
            .split_once("Watching for changes")
            .expect("banner after first render");

        let first_rows = first.lines().filter(|line| line.starts_with("│ ")).count();
        assert_eq!(first_rows, 2);
        assert!(first.contains(&palette.decorate(ColumnRole::Ready, "1/1")));
        assert!(first.contains(&palette.decorate(ColumnRole::Status, "Running")));

        let second_rows = second.lines().filter(|line| line.starts_with("│ ")).count();
        assert_eq!(second_rows, 3);
        assert!(second.contains(&palette.decorate(ColumnRole::Ready, "0/1")));
        assert!(second.contains(&palette.decorate(ColumnRole::Status, "Pending")));
        assert!(second.contains("Event: ADDED - b"));
        assert!(second.find("│ b ").unwrap() < second.find("Event: ADDED - b").unwrap());
    }

    #[tokio::test]
    async fn all_namespaces_watch_renders_namespace_column() {
        let fetcher = ScriptedFetcher::new(vec![vec![ResourceRow::scoped(
            &NamespaceScope::All,
            Some("kube-system".to_string()),
            vec!["coredns".to_string(), "2".to_string(), "4d".to_string()],
        )]]);
        let feed = ScriptedFeed::new(Vec::new(), Tail::Close);
        let mut screen = MemoryScreen::default();

        let result = WatchLoop::new(&fetcher, &feed, &mut screen, Palette::plain())
            .run("cm", NamespaceScope::All, std::future::pending())
            .await;

        assert!(matches!(result, Err(WatchError::StreamClosed { .. })));
        let text = screen.text();
        assert!(text.contains("│ NAMESPACE   │ NAME    │ DATA │ AGE │"));
        assert!(text.contains("│ kube-system │ coredns │ 2    │ 4d  │"));
    }
}
