//! Community background rotation engine
//!
//! The engine is the single "getter": it alone talks to the catalog, writes
//! the cache and owns the swap/refresh timers. It runs as one task and
//! handles one event at a time; network calls are spawned and report back
//! through the event queue, so completions are processed in arrival order
//! and never concurrently with anything else.
//!
//! Every rotation cycle bumps an epoch. Completions carry the epoch they were
//! issued under and are dropped once a newer cycle has started.

use chrono::{DateTime, Duration as TimeDelta, Utc};
use rand::seq::SliceRandom;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use utoipa::ToSchema;

use crate::cache::{CacheStore, ImageId};
use crate::catalog::{CatalogClient, CatalogManifest, FetchedMetadata, SAMPLE_SIZE};
use crate::display::{BackgroundChanged, BackgroundFrame, DisplaySurface};
use crate::error::{AppError, CacheError, CatalogError};
use crate::scheduler::{self, Arming, RotationScheduler, TimerKind};
use crate::settings::{BackgroundSource, RotationState, Settings};

/// Random picks per cycle before falling back to a catalog refresh
pub const MAX_LOAD_ATTEMPTS: u32 = 5;

/// Catalog refreshes per cycle triggered by cache problems
const MAX_CATALOG_REFETCHES: u32 = 1;

/// Monotonic sleeps stall while suspended; re-check the wall clock this often
const WAKE_CHECK_INTERVAL: Duration = Duration::from_secs(60);

const COMMAND_QUEUE: usize = 32;
const SELECTION_QUEUE: usize = 16;

pub const UNAVAILABLE_MESSAGE: &str = "Couldn't get community backgrounds";

/// Requests from the rest of the shell
#[derive(Debug)]
pub enum Command {
    /// Re-read the source and show a background
    Refresh,
    /// Swap to another community image now
    NextImage,
    /// Download a fresh catalog now
    FetchCatalog,
    SetSource(BackgroundSource),
    SetWaitTime(u32),
    Status(oneshot::Sender<EngineStatus>),
}

/// Completions and deferred actions, processed one per turn
#[derive(Debug)]
enum Event {
    Manifest {
        epoch: u64,
        result: Result<CatalogManifest, CatalogError>,
    },
    Metadata {
        epoch: u64,
        path: String,
        result: Result<FetchedMetadata, CatalogError>,
    },
    Image {
        epoch: u64,
        image_id: ImageId,
        result: Result<Vec<u8>, CatalogError>,
    },
    Display {
        epoch: u64,
        image_id: ImageId,
    },
    LoadRandom {
        epoch: u64,
    },
    FetchCatalog {
        epoch: u64,
    },
}

impl Event {
    fn epoch(&self) -> u64 {
        match self {
            Event::Manifest { epoch, .. }
            | Event::Metadata { epoch, .. }
            | Event::Image { epoch, .. }
            | Event::Display { epoch, .. }
            | Event::LoadRandom { epoch }
            | Event::FetchCatalog { epoch } => *epoch,
        }
    }
}

/// Snapshot of the engine for the control API
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct EngineStatus {
    pub source: String,
    pub current: Option<ImageId>,
    pub fetched: Option<DateTime<Utc>>,
    pub changed: Option<DateTime<Utc>>,
    pub wait_minutes: u32,
    pub next_swap: Option<DateTime<Utc>>,
    pub next_refresh: Option<DateTime<Utc>>,
    /// Network requests or deferred actions still pending
    pub busy: bool,
    pub last_error: Option<String>,
}

/// Cloneable sender side used by the control API
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
}

impl EngineHandle {
    pub async fn send(&self, command: Command) -> Result<(), AppError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| AppError::EngineUnavailable)
    }

    pub async fn status(&self) -> Result<EngineStatus, AppError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Status(tx)).await?;
        rx.await.map_err(|_| AppError::EngineUnavailable)
    }
}

/// Receiving side of the engine's queues
pub struct EngineInbox {
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedReceiver<Event>,
}

#[derive(Debug, Default)]
struct RetryBudget {
    load_attempts: u32,
    catalog_refetches: u32,
}

/// Completion counter for one catalog download
#[derive(Debug)]
struct MetadataBatch {
    expected: usize,
    done: usize,
}

pub struct RotationEngine<S: DisplaySurface> {
    catalog: Arc<dyn CatalogClient>,
    cache: CacheStore,
    settings: Settings,
    state: RotationState,
    scheduler: RotationScheduler,
    surface: S,
    selection: broadcast::Sender<BackgroundChanged>,
    events: mpsc::UnboundedSender<Event>,
    epoch: u64,
    budget: RetryBudget,
    batch: Option<MetadataBatch>,
    /// A catalog download is between its manifest request and the last metadata completion
    downloading: bool,
    in_flight: usize,
    current: Option<ImageId>,
    last_error: Option<String>,
}

impl<S: DisplaySurface> RotationEngine<S> {
    pub fn new(
        catalog: Arc<dyn CatalogClient>,
        cache: CacheStore,
        settings: Settings,
        surface: S,
    ) -> (Self, EngineHandle, EngineInbox) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (selection, _) = broadcast::channel(SELECTION_QUEUE);

        let engine = Self {
            catalog,
            cache,
            state: RotationState::load(&settings),
            settings,
            scheduler: RotationScheduler::new(),
            surface,
            selection,
            events: event_tx,
            epoch: 0,
            budget: RetryBudget::default(),
            batch: None,
            downloading: false,
            in_flight: 0,
            current: None,
            last_error: None,
        };

        let handle = EngineHandle {
            commands: command_tx,
        };
        let inbox = EngineInbox {
            commands: command_rx,
            events: event_rx,
        };

        (engine, handle, inbox)
    }

    /// Subscribe a non-getter display to selection changes
    pub fn subscribe(&self) -> broadcast::Receiver<BackgroundChanged> {
        self.selection.subscribe()
    }

    pub fn state(&self) -> &RotationState {
        &self.state
    }

    pub fn current(&self) -> Option<&ImageId> {
        self.current.as_ref()
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn scheduler(&self) -> &RotationScheduler {
        &self.scheduler
    }

    pub fn status(&self) -> EngineStatus {
        EngineStatus {
            source: self.state.source.to_string(),
            current: self.current.clone(),
            fetched: self.state.fetched,
            changed: self.state.changed,
            wait_minutes: self.state.wait_minutes,
            next_swap: self.scheduler.deadline(TimerKind::Swap),
            next_refresh: self.scheduler.deadline(TimerKind::Refresh),
            busy: self.in_flight > 0,
            last_error: self.last_error.clone(),
        }
    }

    pub fn show(&mut self) {
        self.surface.mark_as_desktop();
    }

    /// Process commands, completions and timers until every handle is dropped
    pub async fn run(mut self, mut inbox: EngineInbox) {
        loop {
            let wakeup = self
                .scheduler
                .next_wakeup(Utc::now())
                .map(|d| d.min(WAKE_CHECK_INTERVAL));

            tokio::select! {
                command = inbox.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        tracing::info!("All control handles dropped, stopping engine");
                        return;
                    }
                },
                Some(event) = inbox.events.recv() => self.handle_event(event),
                _ = sleep_or_pending(wakeup) => self.fire_due_timers(Utc::now()),
            }
        }
    }

    pub fn handle_command(&mut self, command: Command) {
        tracing::debug!("Command: {:?}", command);

        match command {
            Command::Refresh => self.refresh_background(),
            Command::NextImage => {
                if self.state.source == BackgroundSource::Community && self.cache.index_exists() {
                    self.begin_cycle();
                    self.load_random_cached_image();
                } else {
                    self.refresh_background();
                }
            }
            Command::FetchCatalog => {
                if self.state.source == BackgroundSource::Community {
                    self.begin_cycle();
                    self.fetch_new_catalog();
                } else {
                    tracing::info!("Ignoring catalog refresh, source is {}", self.state.source);
                }
            }
            Command::SetSource(source) => {
                if let Err(e) = self.state.set_source(&mut self.settings, source) {
                    tracing::warn!("Could not persist background source: {}", e);
                }
                self.refresh_background();
            }
            Command::SetWaitTime(minutes) => {
                if let Err(e) = self.state.set_wait_minutes(&mut self.settings, minutes) {
                    tracing::warn!("Could not persist wait time: {}", e);
                }
                // The download's completion arms the swap with the new wait
                if self.state.source == BackgroundSource::Community
                    && self.current.is_some()
                    && !self.downloading
                {
                    self.arm_timer(TimerKind::Swap);
                }
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        self.in_flight = self.in_flight.saturating_sub(1);

        if event.epoch() != self.epoch {
            tracing::debug!(
                "Dropping completion from superseded cycle {} (now {})",
                event.epoch(),
                self.epoch
            );
            return;
        }

        match event {
            Event::Manifest { result, .. } => self.on_manifest(result),
            Event::Metadata { path, result, .. } => self.on_metadata(&path, result),
            Event::Image {
                image_id, result, ..
            } => self.on_image(image_id, result),
            Event::Display { image_id, .. } => self.set_community_background(&image_id),
            Event::LoadRandom { .. } => self.load_random_cached_image(),
            Event::FetchCatalog { .. } => self.fetch_new_catalog(),
        }
    }

    fn fire_due_timers(&mut self, now: DateTime<Utc>) {
        let due = self.scheduler.take_due(now);
        if due.is_empty() {
            return;
        }
        tracing::info!("Timers fired: {:?}", due);

        // A catalog download ends by loading an image, which re-arms the swap
        if due.contains(&TimerKind::Refresh) {
            self.begin_cycle();
            self.fetch_new_catalog();
        } else if self.downloading {
            tracing::debug!("Catalog download in progress, skipping swap");
        } else {
            self.begin_cycle();
            self.load_random_cached_image();
        }
    }

    fn begin_cycle(&mut self) {
        self.epoch += 1;
        self.budget = RetryBudget::default();
        self.batch = None;
        self.downloading = false;
    }

    /// Queue an event for the next turn of the loop
    fn defer(&mut self, event: Event) {
        self.in_flight += 1;
        let _ = self.events.send(event);
    }

    fn spawn_request<F>(&mut self, request: F)
    where
        F: Future<Output = Event> + Send + 'static,
    {
        self.in_flight += 1;
        let events = self.events.clone();
        tokio::spawn(async move {
            let _ = events.send(request.await);
        });
    }

    /// Arm a timer from the persisted timestamps; an overdue one runs next turn
    fn arm_timer(&mut self, kind: TimerKind) -> Arming {
        let deadline = match kind {
            TimerKind::Swap => scheduler::swap_deadline(self.state.changed, self.state.wait_time()),
            TimerKind::Refresh => scheduler::refresh_deadline(self.state.fetched),
        };

        let arming = self.scheduler.arm(kind, deadline, Utc::now());
        if arming == Arming::Immediate {
            tracing::info!("{:?} deadline already passed, running now", kind);
            let epoch = self.epoch;
            self.defer(match kind {
                TimerKind::Swap => Event::LoadRandom { epoch },
                TimerKind::Refresh => Event::FetchCatalog { epoch },
            });
        }
        arming
    }

    /// Show whatever the configured source calls for
    pub fn refresh_background(&mut self) {
        self.begin_cycle();

        let source = self.state.source.clone();
        if source != BackgroundSource::Community {
            self.scheduler.disarm_all();
            self.current = None;
            self.last_error = None;
            self.surface.render_static(&source, self.state.display.stretch);
            let _ = self.selection.send(BackgroundChanged::Static(source));
            return;
        }

        if let Err(e) = self.cache.ensure_dirs() {
            tracing::warn!("Could not create background cache: {}", e);
        }

        if !self.cache.index_exists() {
            tracing::info!("No cached community backgrounds, fetching catalog");
            self.fetch_new_catalog();
            return;
        }

        // An overdue refresh ends by loading an image itself
        if let Arming::Scheduled(_) = self.arm_timer(TimerKind::Refresh) {
            self.load_random_cached_image();
        }
    }

    /// Request the manifest; the rest happens as completions arrive
    pub fn fetch_new_catalog(&mut self) {
        self.batch = None;
        self.downloading = true;

        let catalog = self.catalog.clone();
        let epoch = self.epoch;
        tracing::info!("Requesting community background manifest");
        self.spawn_request(async move {
            Event::Manifest {
                epoch,
                result: catalog.fetch_manifest().await,
            }
        });
    }

    fn on_manifest(&mut self, result: Result<CatalogManifest, CatalogError>) {
        match result {
            Ok(manifest) if !manifest.is_empty() => self.download_catalog(manifest),
            Ok(_) => self.on_manifest_failed(CatalogError::Parse(
                "manifest lists no backgrounds".to_string(),
            )),
            Err(e) => self.on_manifest_failed(e),
        }
    }

    fn download_catalog(&mut self, manifest: CatalogManifest) {
        let picks = manifest.sample(&mut rand::thread_rng(), SAMPLE_SIZE);
        tracing::info!(
            "Downloading metadata for {} of {} community backgrounds",
            picks.len(),
            manifest.entries().len()
        );

        if let Err(e) = self.state.set_fetched(&mut self.settings, Utc::now()) {
            tracing::warn!("Could not persist fetch time: {}", e);
        }
        if let Err(e) = self.cache.clear_all() {
            tracing::warn!("Could not clear background cache: {}", e);
        }
        self.arm_timer(TimerKind::Refresh);

        self.batch = Some(MetadataBatch {
            expected: picks.len(),
            done: 0,
        });

        let epoch = self.epoch;
        for path in picks {
            let catalog = self.catalog.clone();
            self.spawn_request(async move {
                let result = catalog.fetch_metadata(&path).await;
                Event::Metadata {
                    epoch,
                    path,
                    result,
                }
            });
        }
    }

    fn on_metadata(&mut self, path: &str, result: Result<FetchedMetadata, CatalogError>) {
        match result {
            Ok(fetched) => match self.store_metadata(&fetched) {
                Ok(()) => tracing::debug!("Cached metadata for {}", fetched.image_id),
                Err(e) => tracing::warn!("Could not cache metadata for {}: {}", fetched.image_id, e),
            },
            Err(e) if e.is_parse_failure() => {
                tracing::warn!("Skipping malformed background {}: {}", path, e)
            }
            Err(e) => tracing::warn!("Skipping background {}: {}", path, e),
        }

        let Some(batch) = self.batch.as_mut() else {
            return;
        };
        batch.done += 1;
        if batch.done < batch.expected {
            return;
        }

        self.batch = None;
        self.downloading = false;
        self.arm_timer(TimerKind::Refresh);
        self.load_random_cached_image();
    }

    fn store_metadata(&self, fetched: &FetchedMetadata) -> Result<(), CacheError> {
        self.cache.write_metadata(&fetched.image_id, &fetched.raw)?;
        self.cache.append_to_index(&fetched.image_id)
    }

    fn on_manifest_failed(&mut self, error: CatalogError) {
        tracing::warn!("Could not fetch background manifest: {}", error);
        self.downloading = false;

        let showing = self
            .current
            .as_ref()
            .is_some_and(|id| self.cache.has_image_file(id));
        if !showing && !self.cache.has_displayable_image() {
            self.fail(UNAVAILABLE_MESSAGE);
            return;
        }

        // Keep using the cache and try the catalog again tomorrow
        let retry_from = postponed_fetch(self.state.fetched, Utc::now());
        if let Err(e) = self.state.set_fetched(&mut self.settings, retry_from) {
            tracing::warn!("Could not persist fetch time: {}", e);
        }
        self.arm_timer(TimerKind::Refresh);

        if self.current.is_some() {
            self.arm_timer(TimerKind::Swap);
        } else {
            self.load_random_cached_image();
        }
    }

    /// Pick a random cached background and show it, downloading if needed
    pub fn load_random_cached_image(&mut self) {
        if self.budget.load_attempts >= MAX_LOAD_ATTEMPTS {
            tracing::warn!(
                "No usable cached background after {} attempts",
                self.budget.load_attempts
            );
            self.refetch_catalog();
            return;
        }
        self.budget.load_attempts += 1;

        let ids = match self.cache.read_index() {
            Ok(ids) => ids,
            Err(e) => {
                tracing::warn!("Could not read background index: {}", e);
                self.refetch_catalog();
                return;
            }
        };

        let Some(image_id) = ids.choose(&mut rand::thread_rng()).cloned() else {
            tracing::warn!("Background index is empty");
            self.refetch_catalog();
            return;
        };

        if self.cache.has_image_file(&image_id) {
            let epoch = self.epoch;
            self.defer(Event::Display { epoch, image_id });
            return;
        }

        let metadata = match self.cache.read_metadata(&image_id) {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!("Cached metadata is unusable: {}", e);
                self.refetch_catalog();
                return;
            }
        };

        let catalog = self.catalog.clone();
        let epoch = self.epoch;
        self.spawn_request(async move {
            let result = catalog.fetch_image(&metadata).await;
            Event::Image {
                epoch,
                image_id,
                result,
            }
        });
    }

    fn on_image(&mut self, image_id: ImageId, result: Result<Vec<u8>, CatalogError>) {
        let stored = result
            .map_err(|e| e.to_string())
            .and_then(|data| {
                self.cache
                    .write_image_file(&image_id, &data)
                    .map_err(|e| e.to_string())
            });

        match stored {
            Ok(()) => self.set_community_background(&image_id),
            Err(e) => {
                tracing::warn!("Could not download background {}: {}", image_id, e);
                self.load_random_cached_image();
            }
        }
    }

    /// Display a cached background, repairing the cache if files are missing
    pub fn set_community_background(&mut self, image_id: &ImageId) {
        if !self.cache.has_image_metadata(image_id) {
            tracing::warn!("Metadata for {} is missing", image_id);
            self.refetch_catalog();
            return;
        }
        if !self.cache.has_image_file(image_id) {
            self.load_random_cached_image();
            return;
        }

        let frame = match BackgroundFrame::load(&self.cache, image_id, &self.state.display) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!("Cannot display {}: {}", image_id, e);
                self.refetch_catalog();
                return;
            }
        };

        tracing::info!("Displaying community background {}", image_id);
        self.surface.render_community(&frame);
        self.current = Some(image_id.clone());
        self.last_error = None;
        self.budget = RetryBudget::default();
        let _ = self.selection.send(BackgroundChanged::Community {
            image_id: image_id.clone(),
        });

        if let Err(e) = self.state.set_changed(&mut self.settings, Utc::now()) {
            tracing::warn!("Could not persist change time: {}", e);
        }
        self.arm_timer(TimerKind::Swap);
    }

    /// Cache problems: start over from the catalog, once per cycle
    fn refetch_catalog(&mut self) {
        if self.budget.catalog_refetches >= MAX_CATALOG_REFETCHES {
            self.give_up();
            return;
        }

        self.budget.catalog_refetches += 1;
        self.budget.load_attempts = 0;
        self.fetch_new_catalog();
    }

    /// Out of retries: show any fully cached image, else report failure
    fn give_up(&mut self) {
        let ready: Vec<ImageId> = self
            .cache
            .read_index()
            .unwrap_or_default()
            .into_iter()
            .filter(|id| BackgroundFrame::load(&self.cache, id, &self.state.display).is_ok())
            .collect();

        match ready.choose(&mut rand::thread_rng()).cloned() {
            Some(image_id) => {
                let epoch = self.epoch;
                self.defer(Event::Display { epoch, image_id });
            }
            None => self.fail(UNAVAILABLE_MESSAGE),
        }
    }

    fn fail(&mut self, message: &str) {
        tracing::warn!("{}", message);
        self.scheduler.disarm_all();
        self.current = None;
        self.last_error = Some(message.to_string());
        self.surface.show_unavailable(message);
        let _ = self
            .selection
            .send(BackgroundChanged::Unavailable(message.to_string()));
    }
}

/// New `fetched` value after a failed refresh: one day later, but never so
/// far back that the next refresh would already be overdue
fn postponed_fetch(fetched: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    let earliest = now - scheduler::refresh_period();
    match fetched.map(|f| f + TimeDelta::days(1)) {
        Some(next) if next > earliest => next,
        _ => earliest + TimeDelta::days(1),
    }
}

async fn sleep_or_pending(wakeup: Option<Duration>) {
    match wakeup {
        Some(delay) => tokio::time::sleep(delay).await,
        None => std::future::pending().await,
    }
}
