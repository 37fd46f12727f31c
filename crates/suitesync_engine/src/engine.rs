//! The reconciliation actor.
//!
//! [`SyncEngine::run`] owns the only write path into the [`Replica`]. It
//! interleaves three inputs on one task: frames from the change feed,
//! completions of fetches it spawned (pages, self-heal lookups, child
//! listings) and commands from [`EngineHandle`]s. Fetch tasks only ever
//! report back; they never touch the replica themselves.
//!
//! Every (re)connect bumps a generation counter. Fetches started under an
//! older generation stop retrying and their results are ignored, and
//! pagination restarts from the first page so changes missed while
//! disconnected are recovered from the snapshot.
//!
//! A self-heal fetch from the previous generation may still be on the
//! network after a reconnect. The in-flight set is cleared on disconnect, so
//! a heal for the same id can start alongside it; the older result is
//! discarded when it reports back.
//!
//! A response that cannot be decoded is never retried. A bad snapshot page
//! stops the engine with the decode error. A bad self-heal answer drops the
//! pending update it was meant to resolve and counts a decode error.

use crate::config::{MissingEntityPolicy, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::feed::{subscribe, FeedEvent, FeedSubscriber};
use crate::pagination::{PageCursor, Paginator};
use crate::replica::{ChangeOutcome, PageSummary, Replica};
use crate::retry::retry;
use crate::transport::{ChangeFeed, ChildQuery, SnapshotSource};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use suitesync_protocol::{
    Attachment, Case, Change, Collection, JsonValue, LogLine, Owner, SnapshotPage, Suite,
    SuiteAggs, SUITE_AGGS_ID,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// The current state of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Not started.
    Idle,
    /// Waiting for a change feed connection.
    Connecting,
    /// Connected; the snapshot is incomplete or updates are unresolved.
    CatchingUp,
    /// Connected and consistent with the server.
    Live,
    /// `run` has returned.
    Stopped,
}

impl SyncState {
    /// Returns true while the engine is running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Connecting | SyncState::CatchingUp | SyncState::Live
        )
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Snapshot pages applied.
    pub pages_fetched: u64,
    /// Changes, rows and self-heal results that changed the replica.
    pub changes_applied: u64,
    /// Changes and rows dropped because a newer version was held.
    pub stale_drops: u64,
    /// Frames and rows that could not be decoded.
    pub decode_errors: u64,
    /// Fetches issued to resolve unknown entities.
    pub self_heal_fetches: u64,
    /// Change feed reconnects.
    pub reconnects: u64,
    /// Last error that stopped the engine.
    pub last_error: Option<String>,
}

impl SyncStats {
    fn record_page(&mut self, summary: &PageSummary) {
        self.changes_applied += summary.applied as u64;
        self.stale_drops += summary.stale as u64;
        self.decode_errors += summary.rejected as u64;
    }

    fn record_change(&mut self, outcome: ChangeOutcome) {
        match outcome {
            ChangeOutcome::Applied => self.changes_applied += 1,
            ChangeOutcome::Stale => self.stale_drops += 1,
            ChangeOutcome::Queued => {}
        }
    }
}

/// State shared between the engine and its handles.
struct Shared {
    replica: RwLock<Replica>,
    cursor: RwLock<PageCursor>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    caught_up: AtomicBool,
    mounted: AtomicBool,
    generation: AtomicU64,
}

impl Shared {
    fn new() -> Self {
        Self {
            replica: RwLock::new(Replica::new()),
            cursor: RwLock::new(PageCursor::new()),
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            caught_up: AtomicBool::new(false),
            mounted: AtomicBool::new(true),
            generation: AtomicU64::new(0),
        }
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// Relevance check for work tied to the current connection.
fn still_current(
    shared: &Arc<Shared>,
    generation: u64,
) -> impl FnMut() -> bool + Send + 'static {
    let shared = shared.clone();
    move || shared.mounted.load(Ordering::SeqCst) && shared.generation() == generation
}

/// Relevance check for work that survives reconnects.
fn still_mounted(shared: &Arc<Shared>) -> impl FnMut() -> bool + Send + 'static {
    let shared = shared.clone();
    move || shared.mounted.load(Ordering::SeqCst)
}

/// Fetches one entity; `None` if the server no longer has it.
async fn fetch_entity<S: SnapshotSource>(
    source: &S,
    collection: Collection,
    id: &str,
) -> SyncResult<Option<JsonValue>> {
    match source.fetch_one(collection, id).await {
        Ok(doc) => Ok(Some(doc)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

async fn next_feed_event(subscriber: &mut Option<FeedSubscriber>) -> FeedEvent {
    match subscriber {
        Some(subscriber) => subscriber.next_event().await,
        None => std::future::pending().await,
    }
}

enum Command {
    Load(ChildQuery),
    Unmount(Owner),
    Shutdown,
}

/// Completion of a spawned fetch.
enum TaskEvent {
    Connected {
        generation: u64,
        subscriber: FeedSubscriber,
    },
    Page {
        generation: u64,
        page: SnapshotPage,
    },
    PageFailed {
        generation: u64,
        error: SyncError,
    },
    Entity {
        generation: u64,
        collection: Collection,
        id: String,
        doc: Option<JsonValue>,
    },
    Aggs {
        generation: u64,
        page: SnapshotPage,
    },
    HealFailed {
        generation: u64,
        collection: Collection,
        id: String,
        error: SyncError,
    },
    Children {
        query: ChildQuery,
        result: SyncResult<Vec<JsonValue>>,
    },
}

enum Step {
    Feed(FeedEvent),
    Task(TaskEvent),
    Command(Option<Command>),
}

/// Read access to the replica and control of a running engine.
///
/// Handles never mutate the replica; every change goes through the engine.
#[derive(Clone)]
pub struct EngineHandle {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl EngineHandle {
    /// Runs `f` against the replica under a read lock.
    ///
    /// The engine cannot apply changes while `f` runs. `f` must not call
    /// back into this handle or any clone of it: the accessors take the same
    /// lock, and a queued writer would deadlock the nested read.
    pub fn read<R>(&self, f: impl FnOnce(&Replica) -> R) -> R {
        f(&*self.shared.replica.read())
    }

    /// Every suite, newest first.
    pub fn suites(&self) -> Vec<Suite> {
        self.read(Replica::suites)
    }

    /// Suites that are not soft-deleted, newest first.
    pub fn active_suites(&self) -> Vec<Suite> {
        self.read(Replica::active_suites)
    }

    /// One suite.
    pub fn suite(&self, id: &str) -> Option<Suite> {
        self.read(|r| r.suite(id))
    }

    /// The suite counters.
    pub fn suite_aggs(&self) -> Option<SuiteAggs> {
        self.read(Replica::suite_aggs)
    }

    /// Cases of a suite in `idx` order.
    pub fn cases_for_suite(&self, suite_id: &str) -> Vec<Case> {
        self.read(|r| r.cases_for_suite(suite_id))
    }

    /// One case.
    pub fn case(&self, id: &str) -> Option<Case> {
        self.read(|r| r.case(id))
    }

    /// Log lines of a case in `idx` order.
    pub fn logs_for_case(&self, case_id: &str) -> Vec<LogLine> {
        self.read(|r| r.logs_for_case(case_id))
    }

    /// Live attachments of a suite or case.
    pub fn attachments_for(&self, owner: &Owner) -> Vec<Attachment> {
        self.read(|r| r.attachments_for(owner))
    }

    /// Current state.
    pub fn state(&self) -> SyncState {
        *self.shared.state.read()
    }

    /// Current stats.
    pub fn stats(&self) -> SyncStats {
        self.shared.stats.read().clone()
    }

    /// Returns true once the feed reported it has delivered its backlog.
    pub fn is_caught_up(&self) -> bool {
        self.shared.caught_up.load(Ordering::SeqCst)
    }

    /// Returns true while the snapshot is incomplete or updates for unseen
    /// entities are still waiting.
    pub fn has_more(&self) -> bool {
        let cursor = self.shared.cursor.read().clone();
        let replica = self.shared.replica.read();
        cursor.has_more(replica.total_pending())
    }

    /// Loads the cases of a suite and keeps them live.
    pub fn load_cases(&self, suite_id: impl Into<String>) -> SyncResult<()> {
        self.send(Command::Load(ChildQuery::SuiteCases(suite_id.into())))
    }

    /// Loads the log lines of a case and keeps them live.
    pub fn load_logs(&self, case_id: impl Into<String>) -> SyncResult<()> {
        self.send(Command::Load(ChildQuery::CaseLogs(case_id.into())))
    }

    /// Loads the attachments of a suite or case and keeps them live.
    pub fn load_attachments(&self, owner: Owner) -> SyncResult<()> {
        self.send(Command::Load(ChildQuery::Attachments(owner)))
    }

    /// Stops reloading `owner`'s children and purges its log lines and
    /// attachments.
    pub fn unmount(&self, owner: Owner) -> SyncResult<()> {
        self.send(Command::Unmount(owner))
    }

    /// Asks the engine to stop. In-flight fetches are abandoned.
    pub fn shutdown(&self) -> SyncResult<()> {
        self.send(Command::Shutdown)
    }

    fn send(&self, command: Command) -> SyncResult<()> {
        self.commands.send(command).map_err(|_| SyncError::Stopped)
    }
}

/// The sync engine keeps a [`Replica`] consistent with a remote server.
pub struct SyncEngine<S: SnapshotSource, F: ChangeFeed> {
    config: SyncConfig,
    source: Arc<S>,
    feed: Arc<F>,
    shared: Arc<Shared>,
    paginator: Paginator,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<TaskEvent>,
    events_rx: mpsc::UnboundedReceiver<TaskEvent>,
    subscriber: Option<FeedSubscriber>,
    decode_errors_seen: u64,
    connected_once: bool,
    page_in_flight: bool,
    in_flight: HashSet<(Collection, String)>,
    listings_in_flight: HashMap<Collection, usize>,
    watched: HashSet<ChildQuery>,
}

impl<S: SnapshotSource, F: ChangeFeed> SyncEngine<S, F> {
    /// Creates a new sync engine and a handle to it.
    ///
    /// The engine stops once every handle is dropped.
    pub fn new(config: SyncConfig, source: S, feed: F) -> (Self, EngineHandle) {
        let shared = Arc::new(Shared::new());
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let paginator = Paginator::new(config.collection, config.page_size);

        let engine = Self {
            config,
            source: Arc::new(source),
            feed: Arc::new(feed),
            shared: shared.clone(),
            paginator,
            commands,
            events_tx,
            events_rx,
            subscriber: None,
            decode_errors_seen: 0,
            connected_once: false,
            page_in_flight: false,
            in_flight: HashSet::new(),
            listings_in_flight: HashMap::new(),
            watched: HashSet::new(),
        };
        let handle = EngineHandle {
            shared,
            commands: commands_tx,
        };
        (engine, handle)
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Runs until shutdown.
    ///
    /// Returns an error when a snapshot page cannot be decoded, or in strict
    /// mode when an update names an entity that cannot be located.
    pub async fn run(mut self) -> SyncResult<()> {
        info!(base_url = %self.config.base_url, collection = %self.paginator.collection(),
            "sync engine starting");
        let result = self.run_loop().await;
        if let Err(err) = &result {
            warn!(error = %err, "sync engine failed");
            self.shared.stats.write().last_error = Some(err.to_string());
        }
        self.teardown();
        result
    }

    /// Enumerates the snapshot and resolves pending updates without a feed.
    ///
    /// Used by polling deployments and tests. Unknown entities are fetched by
    /// id one at a time, or reported in strict mode.
    pub async fn catch_up(&mut self) -> SyncResult<()> {
        let interval = self.config.retry.interval;
        let paged = self.paginator.collection();
        self.paginator.reset();

        loop {
            if let Some(request) = self.paginator.next_request() {
                let source = &*self.source;
                let page =
                    retry(interval, still_mounted(&self.shared), || request.send(source)).await?;
                self.complete_page(page);
                continue;
            }

            let Some((collection, id)) = self.pending_entries().into_iter().next() else {
                break;
            };
            self.check_policy(collection, &id)?;
            self.shared.stats.write().self_heal_fetches += 1;

            let source = &*self.source;
            if collection.is_aggregate() {
                let result = retry(interval, still_mounted(&self.shared), || {
                    source.fetch_page(paged, None, 1)
                })
                .await;
                match result {
                    Ok(page) => self.complete_aggs_heal(page),
                    Err(err) if err.is_decode() => self.fail_heal(collection, &id, &err),
                    Err(err) => return Err(err),
                }
            } else {
                let result = retry(interval, still_mounted(&self.shared), || {
                    fetch_entity(source, collection, &id)
                })
                .await;
                match result {
                    Ok(doc) => self.complete_heal(collection, &id, doc),
                    Err(err) if err.is_decode() => self.fail_heal(collection, &id, &err),
                    Err(err) => return Err(err),
                }
            }
        }

        info!(collection = %paged, pages = self.paginator.pages_fetched(),
            "caught up from snapshot");
        Ok(())
    }

    async fn run_loop(&mut self) -> SyncResult<()> {
        self.set_state(SyncState::Connecting);
        self.connect();

        loop {
            let step = tokio::select! {
                event = next_feed_event(&mut self.subscriber) => Step::Feed(event),
                Some(event) = self.events_rx.recv() => Step::Task(event),
                command = self.commands.recv() => Step::Command(command),
            };

            match step {
                Step::Feed(event) => self.on_feed_event(event)?,
                Step::Task(event) => self.on_task_event(event)?,
                Step::Command(None) | Step::Command(Some(Command::Shutdown)) => {
                    info!("sync engine shutting down");
                    return Ok(());
                }
                Step::Command(Some(command)) => self.on_command(command),
            }
            self.refresh_state();
        }
    }

    fn teardown(&mut self) {
        self.shared.mounted.store(false, Ordering::SeqCst);
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.subscriber = None;
        self.set_state(SyncState::Stopped);
        info!("sync engine stopped");
    }

    fn on_feed_event(&mut self, event: FeedEvent) -> SyncResult<()> {
        self.collect_decode_errors();
        match event {
            FeedEvent::Change(change) => self.on_change(change),
            FeedEvent::CaughtUp => {
                info!("change feed caught up");
                self.shared.caught_up.store(true, Ordering::SeqCst);
                self.resolve_pending()
            }
            FeedEvent::Closed => {
                self.disconnect();
                Ok(())
            }
        }
    }

    fn on_change(&mut self, change: Change) -> SyncResult<()> {
        let collection = change.collection();
        let id = change.id().to_string();
        let result = self.shared.replica.write().apply_change(change);

        match result {
            Ok(ChangeOutcome::Queued) if self.waits_for_snapshot(collection) => {
                self.resolve_pending()
            }
            Ok(ChangeOutcome::Queued) => self.heal(collection, id),
            Ok(outcome) => {
                self.shared.stats.write().record_change(outcome);
                Ok(())
            }
            Err(err) => {
                warn!(collection = %collection, id = %id, error = %err,
                    "dropping change that does not fit its entity");
                self.shared.stats.write().decode_errors += 1;
                Ok(())
            }
        }
    }

    fn on_task_event(&mut self, event: TaskEvent) -> SyncResult<()> {
        let current = self.shared.generation();
        match event {
            TaskEvent::Connected {
                generation,
                subscriber,
            } => {
                if generation == current {
                    self.on_connected(subscriber);
                }
            }
            TaskEvent::Page { generation, page } => {
                if generation != current {
                    debug!(generation, current, "discarding page from old connection");
                    return Ok(());
                }
                self.page_in_flight = false;
                self.complete_page(page);
                if self.paginator.cursor().is_exhausted() {
                    self.resolve_pending()?;
                } else {
                    self.request_page();
                }
            }
            TaskEvent::PageFailed { generation, error } => {
                if generation == current {
                    return Err(error);
                }
            }
            TaskEvent::Entity {
                generation,
                collection,
                id,
                doc,
            } => {
                if generation == current {
                    self.in_flight.remove(&(collection, id.clone()));
                    self.complete_heal(collection, &id, doc);
                }
            }
            TaskEvent::Aggs { generation, page } => {
                if generation == current {
                    self.in_flight
                        .remove(&(Collection::SuiteAggs, SUITE_AGGS_ID.to_string()));
                    self.complete_aggs_heal(page);
                }
            }
            TaskEvent::HealFailed {
                generation,
                collection,
                id,
                error,
            } => {
                if generation == current {
                    self.in_flight.remove(&(collection, id.clone()));
                    self.fail_heal(collection, &id, &error);
                }
            }
            TaskEvent::Children { query, result } => {
                match result {
                    Ok(rows) if self.watched.contains(&query) => {
                        let summary = self
                            .shared
                            .replica
                            .write()
                            .apply_listing(query.collection(), rows);
                        self.shared.stats.write().record_page(&summary);
                    }
                    Ok(_) => debug!(?query, "discarding listing for unmounted view"),
                    Err(err) => {
                        warn!(?query, error = %err, "dropping undecodable child listing");
                        self.shared.stats.write().decode_errors += 1;
                    }
                }
                return self.listing_done(query.collection());
            }
        }
        Ok(())
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Load(query) => {
                self.watched.insert(query.clone());
                self.spawn_children(query);
            }
            Command::Unmount(owner) => {
                self.watched.retain(|query| !owned_by(query, &owner));
                self.shared.replica.write().purge(&owner);
            }
            Command::Shutdown => {}
        }
    }

    fn on_connected(&mut self, subscriber: FeedSubscriber) {
        if self.connected_once {
            info!("change feed reconnected, restarting snapshot");
            self.shared.stats.write().reconnects += 1;
        }
        self.connected_once = true;
        self.subscriber = Some(subscriber);
        self.decode_errors_seen = 0;
        self.paginator.reset();
        self.publish_cursor();
        self.request_page();
        for query in self.watched.clone() {
            self.spawn_children(query);
        }
    }

    fn disconnect(&mut self) {
        warn!("change feed disconnected");
        self.subscriber = None;
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.caught_up.store(false, Ordering::SeqCst);
        self.in_flight.clear();
        self.page_in_flight = false;
        self.connect();
    }

    fn collect_decode_errors(&mut self) {
        if let Some(subscriber) = &self.subscriber {
            let total = subscriber.decode_errors();
            let new = total - self.decode_errors_seen;
            if new > 0 {
                self.shared.stats.write().decode_errors += new;
                self.decode_errors_seen = total;
            }
        }
    }

    /// Updates for the paginated collection (and the aggregates that ride
    /// along with its pages) may still arrive with a later page.
    fn waits_for_snapshot(&self, collection: Collection) -> bool {
        collection == self.paginator.collection() || collection.is_aggregate()
    }

    fn pending_entries(&self) -> Vec<(Collection, String)> {
        let replica = self.shared.replica.read();
        Collection::ALL
            .iter()
            .flat_map(|c| replica.pending_ids(*c).into_iter().map(move |id| (*c, id)))
            .collect()
    }

    /// Heals every pending update once the snapshot is exhausted.
    fn resolve_pending(&mut self) -> SyncResult<()> {
        if !self.paginator.cursor().is_exhausted() {
            return Ok(());
        }
        for (collection, id) in self.pending_entries() {
            self.heal(collection, id)?;
        }
        Ok(())
    }

    fn is_strict(&self) -> bool {
        self.config.missing_entity_policy == MissingEntityPolicy::Strict
    }

    /// A child listing still on its way may yet deliver the entity.
    fn listing_in_flight(&self, collection: Collection) -> bool {
        self.listings_in_flight.get(&collection).is_some_and(|n| *n > 0)
    }

    /// Settles updates that were waiting on the last listing of `collection`.
    ///
    /// Only strict mode defers on listings; self-heal fetches are already
    /// under way.
    fn listing_done(&mut self, collection: Collection) -> SyncResult<()> {
        let count = self.listings_in_flight.entry(collection).or_default();
        *count = count.saturating_sub(1);
        if *count > 0 || !self.is_strict() {
            return Ok(());
        }
        if self.waits_for_snapshot(collection) {
            return self.resolve_pending();
        }
        let ids = self.shared.replica.read().pending_ids(collection);
        for id in ids {
            self.heal(collection, id)?;
        }
        Ok(())
    }

    fn check_policy(&self, collection: Collection, id: &str) -> SyncResult<()> {
        match self.config.missing_entity_policy {
            MissingEntityPolicy::SelfHeal => Ok(()),
            MissingEntityPolicy::Strict => Err(SyncError::MissingEntity {
                collection,
                id: id.to_string(),
            }),
        }
    }

    /// Starts a fetch for an entity that pending updates are waiting on.
    fn heal(&mut self, collection: Collection, id: String) -> SyncResult<()> {
        if self.is_strict() && self.listing_in_flight(collection) {
            debug!(collection = %collection, id = %id, "waiting on child listing");
            return Ok(());
        }
        self.check_policy(collection, &id)?;
        if !self.in_flight.insert((collection, id.clone())) {
            return Ok(());
        }
        debug!(collection = %collection, id = %id, "self-heal fetch");
        self.shared.stats.write().self_heal_fetches += 1;

        let generation = self.shared.generation();
        let is_relevant = still_current(&self.shared, generation);
        let source = self.source.clone();
        let events = self.events_tx.clone();
        let interval = self.config.retry.interval;

        if collection.is_aggregate() {
            let paged = self.paginator.collection();
            tokio::spawn(async move {
                let result =
                    retry(interval, is_relevant, || source.fetch_page(paged, None, 1)).await;
                let event = match result {
                    Ok(page) => TaskEvent::Aggs { generation, page },
                    Err(err) if err.is_decode() => TaskEvent::HealFailed {
                        generation,
                        collection,
                        id,
                        error: err,
                    },
                    Err(err) => {
                        debug!(error = %err, "aggregate fetch abandoned");
                        return;
                    }
                };
                let _ = events.send(event);
            });
        } else {
            tokio::spawn(async move {
                let result = retry(interval, is_relevant, || {
                    fetch_entity(&*source, collection, &id)
                })
                .await;
                let event = match result {
                    Ok(doc) => TaskEvent::Entity {
                        generation,
                        collection,
                        id,
                        doc,
                    },
                    Err(err) if err.is_decode() => TaskEvent::HealFailed {
                        generation,
                        collection,
                        id,
                        error: err,
                    },
                    Err(err) => {
                        debug!(collection = %collection, id = %id, error = %err,
                            "self-heal fetch abandoned");
                        return;
                    }
                };
                let _ = events.send(event);
            });
        }
        Ok(())
    }

    fn complete_heal(&self, collection: Collection, id: &str, doc: Option<JsonValue>) {
        let mut replica = self.shared.replica.write();
        let Some(doc) = doc else {
            warn!(collection = %collection, id, "entity no longer exists, dropping pending update");
            replica.drop_pending(collection, id);
            return;
        };

        let result = replica.insert_value(collection, doc);
        if replica.drop_pending(collection, id) {
            warn!(collection = %collection, id, "fetched entity did not resolve pending update");
        }
        drop(replica);

        let mut stats = self.shared.stats.write();
        match result {
            Ok(outcome) => stats.record_change(outcome),
            Err(err) => {
                warn!(collection = %collection, id, error = %err, "dropping undecodable entity");
                stats.decode_errors += 1;
            }
        }
    }

    /// Drops the pending update a self-heal fetch could not decode.
    fn fail_heal(&self, collection: Collection, id: &str, error: &SyncError) {
        warn!(collection = %collection, id, error = %error,
            "undecodable self-heal answer, dropping pending update");
        self.shared.replica.write().drop_pending(collection, id);
        self.shared.stats.write().decode_errors += 1;
    }

    fn complete_aggs_heal(&self, page: SnapshotPage) {
        let mut replica = self.shared.replica.write();
        let summary = replica.apply_page_aggs(page);
        if replica.drop_pending(Collection::SuiteAggs, SUITE_AGGS_ID) {
            warn!("no aggregates in first page, dropping pending delta");
        }
        drop(replica);
        self.shared.stats.write().record_page(&summary);
    }

    fn complete_page(&mut self, page: SnapshotPage) {
        let summary = {
            let mut replica = self.shared.replica.write();
            self.paginator.complete(&mut replica, page)
        };
        {
            let mut stats = self.shared.stats.write();
            stats.pages_fetched += 1;
            stats.record_page(&summary);
        }
        self.publish_cursor();
    }

    fn connect(&self) {
        let generation = self.shared.generation();
        let is_relevant = still_current(&self.shared, generation);
        let feed = self.feed.clone();
        let events = self.events_tx.clone();
        let interval = self.config.retry.interval;

        tokio::spawn(async move {
            match subscribe(&*feed, interval, is_relevant).await {
                Ok(subscriber) => {
                    let _ = events.send(TaskEvent::Connected {
                        generation,
                        subscriber,
                    });
                }
                Err(err) => debug!(error = %err, "connect abandoned"),
            }
        });
    }

    fn request_page(&mut self) {
        if self.page_in_flight || self.subscriber.is_none() {
            return;
        }
        let Some(request) = self.paginator.next_request() else {
            return;
        };
        self.page_in_flight = true;

        let generation = self.shared.generation();
        let is_relevant = still_current(&self.shared, generation);
        let source = self.source.clone();
        let events = self.events_tx.clone();
        let interval = self.config.retry.interval;

        tokio::spawn(async move {
            let result = retry(interval, is_relevant, || request.send(&*source)).await;
            let event = match result {
                Ok(page) => TaskEvent::Page { generation, page },
                Err(SyncError::Cancelled) => {
                    debug!("page fetch abandoned");
                    return;
                }
                Err(error) => TaskEvent::PageFailed { generation, error },
            };
            let _ = events.send(event);
        });
    }

    fn spawn_children(&mut self, query: ChildQuery) {
        *self.listings_in_flight.entry(query.collection()).or_default() += 1;
        let is_relevant = still_mounted(&self.shared);
        let source = self.source.clone();
        let events = self.events_tx.clone();
        let interval = self.config.retry.interval;

        tokio::spawn(async move {
            let result = retry(interval, is_relevant, || source.fetch_children(&query)).await;
            if matches!(result, Err(SyncError::Cancelled)) {
                debug!(?query, "child listing abandoned");
                return;
            }
            let _ = events.send(TaskEvent::Children { query, result });
        });
    }

    fn publish_cursor(&self) {
        *self.shared.cursor.write() = self.paginator.cursor().clone();
    }

    fn set_state(&self, state: SyncState) {
        let mut current = self.shared.state.write();
        if *current != state {
            debug!(from = ?*current, to = ?state, "state change");
            *current = state;
        }
    }

    fn refresh_state(&self) {
        let state = if self.subscriber.is_none() {
            SyncState::Connecting
        } else if self.paginator.has_more(&self.shared.replica.read()) {
            SyncState::CatchingUp
        } else {
            SyncState::Live
        };
        self.set_state(state);
    }
}

fn owned_by(query: &ChildQuery, owner: &Owner) -> bool {
    match (query, owner) {
        (ChildQuery::SuiteCases(suite), Owner::Suite(id)) => suite == id,
        (ChildQuery::CaseLogs(case), Owner::Case(id)) => case == id,
        (ChildQuery::Attachments(of), owner) => of == owner,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::transport::{MockFeed, MockSource};
    use serde_json::json;
    use std::time::Duration;
    use suitesync_protocol::{ProtocolError, UpdateChange};

    fn suite(i: usize) -> JsonValue {
        json!({"id": format!("s{i:02}"), "version": 1, "status": "started", "started_at": i})
    }

    fn config() -> SyncConfig {
        SyncConfig::new("https://reports.example.com")
            .with_retry(RetryConfig::fixed(Duration::from_millis(10)))
    }

    fn engine(
        source: MockSource,
        config: SyncConfig,
    ) -> (SyncEngine<MockSource, MockFeed>, EngineHandle) {
        SyncEngine::new(config, source, MockFeed::new())
    }

    fn queue_update(engine: &SyncEngine<MockSource, MockFeed>, update: UpdateChange) {
        engine.shared.replica.write().apply_update(update).unwrap();
    }

    #[test]
    fn sync_state_checks() {
        assert!(SyncState::Live.is_active());
        assert!(SyncState::Connecting.is_active());
        assert!(!SyncState::Idle.is_active());
        assert!(!SyncState::Stopped.is_active());
    }

    #[test]
    fn owned_queries() {
        let suite = Owner::Suite("s1".into());
        assert!(owned_by(&ChildQuery::SuiteCases("s1".into()), &suite));
        assert!(owned_by(&ChildQuery::Attachments(suite.clone()), &suite));
        assert!(!owned_by(&ChildQuery::CaseLogs("s1".into()), &suite));
        assert!(!owned_by(&ChildQuery::SuiteCases("s2".into()), &suite));
    }

    #[tokio::test]
    async fn catch_up_paginates_to_the_end() {
        let source = MockSource::new();
        source.push_page(Ok(SnapshotPage::new((0..10).map(suite).collect(), Some("s10".into()))
            .with_aggs(json!({"version": 1, "running": 25, "finished": 0}))));
        source.push_page(Ok(SnapshotPage::new((10..20).map(suite).collect(), Some("s20".into()))));
        source.push_page(Ok(SnapshotPage::new((20..25).map(suite).collect(), None)));

        let (mut engine, handle) = engine(source, config());
        assert!(handle.has_more());
        engine.catch_up().await.unwrap();

        assert!(!handle.has_more());
        assert_eq!(handle.suites().len(), 25);
        assert_eq!(handle.suites()[0].id, "s24");
        assert_eq!(handle.suite_aggs().unwrap().running, 25);
        let stats = handle.stats();
        assert_eq!(stats.pages_fetched, 3);
        assert_eq!(stats.changes_applied, 26);
    }

    #[tokio::test]
    async fn catch_up_heals_unknown_entities() {
        let source = MockSource::new();
        source.push_page(Ok(SnapshotPage::new(vec![suite(1)], None)));
        source.set_entity(
            Collection::Suites,
            "s99",
            json!({"id": "s99", "version": 4, "status": "finished", "started_at": 99}),
        );

        let (mut engine, handle) = engine(source, config());
        queue_update(&engine, UpdateChange::new(Collection::Suites, "s99", 5).set("name", "late"));
        queue_update(&engine, UpdateChange::new(Collection::Suites, "gone", 2).set("name", "x"));

        engine.catch_up().await.unwrap();

        let healed = handle.suite("s99").unwrap();
        assert_eq!(healed.version, 5);
        assert_eq!(healed.name.as_deref(), Some("late"));
        assert!(handle.suite("gone").is_none());
        assert!(!handle.has_more());
        assert_eq!(handle.stats().self_heal_fetches, 2);
    }

    #[tokio::test]
    async fn catch_up_heals_aggregates_from_first_page() {
        let source = MockSource::new();
        source.push_page(Ok(SnapshotPage::new(vec![suite(1)], None)));
        source.push_page(Ok(SnapshotPage::new(vec![suite(1)], None)
            .with_aggs(json!({"version": 7, "running": 1, "finished": 3}))));

        let (mut engine, handle) = engine(source, config());
        queue_update(&engine, UpdateChange::new(Collection::SuiteAggs, "x", 8).set("running", 0));

        engine.catch_up().await.unwrap();

        let aggs = handle.suite_aggs().unwrap();
        assert_eq!((aggs.version, aggs.running, aggs.finished), (8, 0, 3));
    }

    #[tokio::test]
    async fn strict_mode_reports_missing_entity() {
        let source = MockSource::new();
        source.push_page(Ok(SnapshotPage::new(vec![suite(1)], None)));

        let (mut engine, _handle) = engine(
            source,
            config().with_missing_entity_policy(MissingEntityPolicy::Strict),
        );
        queue_update(&engine, UpdateChange::new(Collection::Cases, "c7", 2));

        let err = engine.catch_up().await.unwrap_err();
        assert_eq!(
            err,
            SyncError::MissingEntity {
                collection: Collection::Cases,
                id: "c7".into()
            }
        );
    }

    fn undecodable() -> SyncError {
        ProtocolError::decoding_failed("expected value at line 1 column 1").into()
    }

    #[tokio::test]
    async fn catch_up_stops_on_undecodable_page() {
        let source = MockSource::new();
        source.push_page(Ok(SnapshotPage::new(vec![suite(1)], Some("s02".into()))));
        source.push_page(Err(undecodable()));
        let source = Arc::new(source);

        let (mut engine, handle) = SyncEngine::new(config(), source.clone(), MockFeed::new());
        let err = engine.catch_up().await.unwrap_err();

        assert!(err.is_decode());
        assert_eq!(source.requests().len(), 2);
        assert!(handle.has_more());
    }

    #[tokio::test]
    async fn catch_up_drops_update_for_undecodable_entity() {
        let source = MockSource::new();
        source.push_page(Ok(SnapshotPage::new(vec![suite(1)], None)));
        source.set_entity_error(Collection::Suites, "s99", undecodable());

        let (mut engine, handle) = engine(source, config());
        queue_update(&engine, UpdateChange::new(Collection::Suites, "s99", 5).set("name", "late"));

        engine.catch_up().await.unwrap();

        assert!(handle.suite("s99").is_none());
        assert!(!handle.has_more());
        let stats = handle.stats();
        assert_eq!(stats.self_heal_fetches, 1);
        assert_eq!(stats.decode_errors, 1);
    }

    #[tokio::test]
    async fn run_fails_on_undecodable_page() {
        let source = MockSource::new();
        source.push_page(Err(undecodable()));
        let (engine, handle) = engine(source, config());

        let result = tokio::time::timeout(Duration::from_secs(5), engine.run())
            .await
            .unwrap();

        assert!(result.unwrap_err().is_decode());
        assert_eq!(handle.state(), SyncState::Stopped);
        assert!(handle.stats().last_error.is_some());
        assert_eq!(handle.stats().pages_fetched, 0);
    }

    #[tokio::test]
    async fn run_applies_feed_and_stops_on_shutdown() {
        let source = MockSource::new();
        source.push_page(Ok(SnapshotPage::new(vec![suite(1)], None)));
        let feed = Arc::new(MockFeed::new());
        let (engine, handle) = SyncEngine::new(config(), source, feed.clone());
        let task = tokio::spawn(engine.run());

        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.state() != SyncState::Live {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        assert!(feed.send(r#"{"coll":"suites","id":"s01","update":{"version":2,"name":"n"}}"#).await);
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.suite("s01").map(|s| s.version) != Some(2) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        handle.shutdown().unwrap();
        assert_eq!(task.await.unwrap(), Ok(()));
        assert_eq!(handle.state(), SyncState::Stopped);
        assert_eq!(handle.load_cases("s01"), Err(SyncError::Stopped));
    }
}
