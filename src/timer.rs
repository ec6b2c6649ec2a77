use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::enrich::{EnrichedTimeEntry, TagDirectory, enrich, enrich_entry, tag_directory};
use crate::models::{Client, Project, TimeEntry};
use crate::toggl::{TogglError, TrackerApi};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    pub projects: Vec<Project>,
    pub clients: Vec<Client>,
    pub tags: TagDirectory,
}

impl Catalog {
    pub fn enrich(&self, entry: &TimeEntry) -> EnrichedTimeEntry {
        enrich_entry(entry, &self.projects, &self.clients, &self.tags)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerState {
    Idle,
    Starting,
    Running {
        entry: EnrichedTimeEntry,
        started_at: DateTime<Utc>,
    },
    Stopping {
        entry: EnrichedTimeEntry,
    },
}

impl TimerState {
    fn running(entry: EnrichedTimeEntry) -> Self {
        let started_at = entry.entry.start;
        TimerState::Running { entry, started_at }
    }

    pub fn current(&self) -> Option<&EnrichedTimeEntry> {
        match self {
            TimerState::Running { entry, .. } | TimerState::Stopping { entry } => Some(entry),
            TimerState::Idle | TimerState::Starting => None,
        }
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, TimerState::Starting | TimerState::Stopping { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            TimerState::Idle => "idle",
            TimerState::Starting => "starting",
            TimerState::Running { .. } => "running",
            TimerState::Stopping { .. } => "stopping",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Conflict {
    #[error("A timer is already running.")]
    AlreadyRunning,
    #[error("No timer is running.")]
    NotRunning,
    #[error("A timer request is already in progress.")]
    RequestInFlight,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimerError {
    #[error(transparent)]
    Conflict(#[from] Conflict),
    #[error(transparent)]
    Remote(#[from] TogglError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Applied(Option<EnrichedTimeEntry>),
    Stale,
    Deferred,
}

struct Shared {
    state: TimerState,
    // Bumped by every request sent; a response is applied only while its
    // generation is still the latest.
    generation: u64,
    catalog: Catalog,
}

impl Shared {
    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }
}

pub struct TimerController<A: ?Sized> {
    api: Arc<A>,
    shared: Arc<Mutex<Shared>>,
    current: Arc<watch::Sender<Option<EnrichedTimeEntry>>>,
}

impl<A: ?Sized> Clone for TimerController<A> {
    fn clone(&self) -> Self {
        Self {
            api: Arc::clone(&self.api),
            shared: Arc::clone(&self.shared),
            current: Arc::clone(&self.current),
        }
    }
}

impl<A: TrackerApi + ?Sized> TimerController<A> {
    pub fn new(api: Arc<A>) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            api,
            shared: Arc::new(Mutex::new(Shared {
                state: TimerState::Idle,
                generation: 0,
                catalog: Catalog::default(),
            })),
            current: Arc::new(current),
        }
    }

    pub async fn connect(api: Arc<A>) -> Result<Self, TimerError> {
        let controller = Self::new(api);
        controller.refresh().await?;
        Ok(controller)
    }

    pub fn state(&self) -> TimerState {
        self.lock().state.clone()
    }

    pub fn current(&self) -> Option<EnrichedTimeEntry> {
        self.current.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<EnrichedTimeEntry>> {
        self.current.subscribe()
    }

    pub async fn start(
        &self,
        description: &str,
        project_id: Option<u64>,
        tag_ids: &[u64],
    ) -> Result<EnrichedTimeEntry, TimerError> {
        let generation = {
            let mut shared = self.lock();
            match shared.state {
                TimerState::Idle => {}
                TimerState::Running { .. } => return Err(Conflict::AlreadyRunning.into()),
                TimerState::Starting | TimerState::Stopping { .. } => {
                    return Err(Conflict::RequestInFlight.into());
                }
            }
            let generation = shared.next_generation();
            self.transition(&mut shared, TimerState::Starting);
            generation
        };

        debug!(generation, description, ?project_id, "starting timer");
        let result = self
            .api
            .create_and_start(description, project_id, tag_ids)
            .await;

        let mut shared = self.lock();
        // Refreshes are deferred while starting, so nothing can overtake us.
        debug_assert_eq!(shared.generation, generation);
        match result {
            Ok(created) => {
                let entry = shared.catalog.enrich(&created);
                info!(entry_id = entry.id(), "timer started");
                self.transition(&mut shared, TimerState::running(entry.clone()));
                Ok(entry)
            }
            Err(err) => {
                warn!(error = %err, "failed to start timer");
                self.transition(&mut shared, TimerState::Idle);
                Err(err.into())
            }
        }
    }

    pub async fn stop(&self) -> Result<EnrichedTimeEntry, TimerError> {
        let (generation, running) = {
            let mut shared = self.lock();
            let running = match &shared.state {
                TimerState::Running { entry, .. } => entry.clone(),
                TimerState::Idle => return Err(Conflict::NotRunning.into()),
                TimerState::Starting | TimerState::Stopping { .. } => {
                    return Err(Conflict::RequestInFlight.into());
                }
            };
            let generation = shared.next_generation();
            self.transition(
                &mut shared,
                TimerState::Stopping {
                    entry: running.clone(),
                },
            );
            (generation, running)
        };

        debug!(generation, entry_id = running.id(), "stopping timer");
        let result = self.api.stop_entry(running.id()).await;

        let mut shared = self.lock();
        debug_assert_eq!(shared.generation, generation);
        match result {
            Ok(stopped) => {
                let entry = shared.catalog.enrich(&stopped);
                info!(entry_id = entry.id(), "timer stopped");
                self.transition(&mut shared, TimerState::Idle);
                Ok(entry)
            }
            Err(err) => {
                warn!(error = %err, entry_id = running.id(), "failed to stop timer");
                self.transition(&mut shared, TimerState::running(running));
                Err(err.into())
            }
        }
    }

    pub async fn refresh(&self) -> Result<RefreshOutcome, TimerError> {
        let generation = {
            let mut shared = self.lock();
            if shared.state.is_busy() {
                debug!(state = shared.state.label(), "refresh deferred");
                return Ok(RefreshOutcome::Deferred);
            }
            shared.next_generation()
        };

        let result = tokio::try_join!(
            self.api.fetch_active_entry(),
            self.api.fetch_projects(),
            self.api.fetch_clients(),
            self.api.fetch_tags(),
        );

        let mut shared = self.lock();
        if shared.generation != generation {
            debug!(
                generation,
                latest = shared.generation,
                "discarding stale refresh"
            );
            return Ok(RefreshOutcome::Stale);
        }

        let (active, projects, clients, tags) = match result {
            Ok(fetched) => fetched,
            Err(err) => {
                warn!(error = %err, "failed to refresh timer");
                return Err(err.into());
            }
        };

        shared.catalog = Catalog {
            projects,
            clients,
            tags: tag_directory(&tags),
        };
        let active = active.filter(TimeEntry::is_active);
        let catalog = &shared.catalog;
        let current = enrich(
            active.as_ref(),
            &catalog.projects,
            &catalog.clients,
            &catalog.tags,
        );

        let previous = shared.state.current().map(EnrichedTimeEntry::id);
        match (previous, current.as_ref().map(EnrichedTimeEntry::id)) {
            (Some(id), None) => info!(entry_id = id, "timer was stopped elsewhere"),
            (Some(old), Some(new)) if old != new => {
                info!(old_entry_id = old, entry_id = new, "active entry replaced by server")
            }
            (None, Some(id)) => info!(entry_id = id, "found running timer"),
            _ => {}
        }

        let next = match current.clone() {
            Some(entry) => TimerState::running(entry),
            None => TimerState::Idle,
        };
        self.transition(&mut shared, next);
        Ok(RefreshOutcome::Applied(current))
    }

    fn transition(&self, shared: &mut Shared, next: TimerState) {
        if shared.state.label() != next.label() {
            debug!(from = shared.state.label(), to = next.label(), "timer state");
        }
        let current = next.current().cloned();
        shared.state = next;
        self.current.send_if_modified(|value| {
            if *value == current {
                return false;
            }
            *value = current;
            true
        });
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Duration;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    use crate::models::Tag;

    struct Gate {
        entered: oneshot::Sender<()>,
        release: oneshot::Receiver<()>,
    }

    pub(crate) struct FakeApi {
        active: Mutex<Option<TimeEntry>>,
        projects: Vec<Project>,
        clients: Vec<Client>,
        tags: Vec<Tag>,
        fail_next: Mutex<Option<TogglError>>,
        gates: Mutex<HashMap<&'static str, Gate>>,
        next_id: AtomicU64,
        pub(crate) start_calls: AtomicUsize,
        pub(crate) stop_calls: AtomicUsize,
    }

    impl FakeApi {
        pub(crate) fn new() -> Self {
            Self {
                active: Mutex::new(None),
                projects: vec![Project {
                    id: 1,
                    name: "Project 1".to_string(),
                    color: "#FF0000".to_string(),
                    client_id: Some(5),
                    workspace_id: 1,
                    active: true,
                }],
                clients: vec![Client {
                    id: 5,
                    name: "Acme".to_string(),
                }],
                tags: vec![
                    Tag {
                        id: 1,
                        name: "tag1".to_string(),
                        workspace_id: Some(1),
                    },
                    Tag {
                        id: 2,
                        name: "tag2".to_string(),
                        workspace_id: Some(1),
                    },
                ],
                fail_next: Mutex::new(None),
                gates: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(100),
                start_calls: AtomicUsize::new(0),
                stop_calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn with_active(self, entry: TimeEntry) -> Self {
            self.set_active(Some(entry));
            self
        }

        pub(crate) fn set_active(&self, entry: Option<TimeEntry>) {
            *self.active.lock().unwrap() = entry;
        }

        pub(crate) fn fail_next(&self, err: TogglError) {
            *self.fail_next.lock().unwrap() = Some(err);
        }

        fn take_failure(&self) -> Result<(), TogglError> {
            match self.fail_next.lock().unwrap().take() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        // Holds the next `op` call until the returned sender fires.
        pub(crate) fn hold(&self, op: &'static str) -> (oneshot::Receiver<()>, oneshot::Sender<()>) {
            let (entered_tx, entered_rx) = oneshot::channel();
            let (release_tx, release_rx) = oneshot::channel();
            self.gates.lock().unwrap().insert(
                op,
                Gate {
                    entered: entered_tx,
                    release: release_rx,
                },
            );
            (entered_rx, release_tx)
        }

        async fn pass(&self, op: &'static str) {
            let gate = self.gates.lock().unwrap().remove(op);
            if let Some(gate) = gate {
                let _ = gate.entered.send(());
                let _ = gate.release.await;
            }
        }
    }

    #[async_trait]
    impl TrackerApi for FakeApi {
        async fn fetch_active_entry(&self) -> Result<Option<TimeEntry>, TogglError> {
            let snapshot = self.active.lock().unwrap().clone();
            self.pass("fetch_active_entry").await;
            self.take_failure()?;
            Ok(snapshot)
        }

        async fn fetch_projects(&self) -> Result<Vec<Project>, TogglError> {
            Ok(self.projects.clone())
        }

        async fn fetch_clients(&self) -> Result<Vec<Client>, TogglError> {
            Ok(self.clients.clone())
        }

        async fn fetch_tags(&self) -> Result<Vec<Tag>, TogglError> {
            Ok(self.tags.clone())
        }

        async fn create_and_start(
            &self,
            description: &str,
            project_id: Option<u64>,
            tag_ids: &[u64],
        ) -> Result<TimeEntry, TogglError> {
            self.start_calls.fetch_add(1, Ordering::SeqCst);
            self.pass("create_and_start").await;
            self.take_failure()?;
            let entry = running_entry(
                self.next_id.fetch_add(1, Ordering::SeqCst),
                description,
                project_id,
                tag_ids.to_vec(),
            );
            self.set_active(Some(entry.clone()));
            Ok(entry)
        }

        async fn stop_entry(&self, id: u64) -> Result<TimeEntry, TogglError> {
            self.stop_calls.fetch_add(1, Ordering::SeqCst);
            self.pass("stop_entry").await;
            self.take_failure()?;
            let mut active = self.active.lock().unwrap();
            match active.take() {
                Some(mut entry) if entry.id == id => {
                    let stop = entry.start + Duration::hours(1);
                    entry.stop = Some(stop);
                    entry.duration = 3600;
                    Ok(entry)
                }
                other => {
                    *active = other;
                    Err(TogglError::Network("Toggl API error: 404 Not Found".to_string()))
                }
            }
        }
    }

    pub(crate) fn start_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2021-01-01T00:00:00+00:00")
            .unwrap()
            .with_timezone(&Utc)
    }

    pub(crate) fn running_entry(
        id: u64,
        description: &str,
        project_id: Option<u64>,
        tag_ids: Vec<u64>,
    ) -> TimeEntry {
        TimeEntry {
            id,
            description: Some(description.to_string()),
            start: start_time(),
            stop: None,
            duration: -1,
            project_id,
            tag_ids,
            workspace_id: 1,
            user_id: 1,
            server_deleted_at: None,
        }
    }

    fn controller(api: FakeApi) -> (Arc<FakeApi>, TimerController<FakeApi>) {
        let api = Arc::new(api);
        (Arc::clone(&api), TimerController::new(api))
    }

    #[tokio::test]
    async fn connect_picks_up_running_entry() {
        let api = Arc::new(
            FakeApi::new().with_active(running_entry(1, "Timer description", Some(1), vec![1, 2])),
        );
        let controller = TimerController::connect(api).await.unwrap();

        let TimerState::Running { entry, started_at } = controller.state() else {
            panic!("expected running state");
        };
        assert_eq!(started_at, start_time());
        let project = entry.project.as_ref().unwrap();
        assert_eq!(project.project.name, "Project 1");
        assert_eq!(project.client.as_ref().unwrap().name, "Acme");
        assert_eq!(entry.tag_names, vec!["tag1", "tag2"]);
        assert_eq!(controller.current(), Some(entry));
    }

    #[tokio::test]
    async fn connect_without_running_entry_is_idle() {
        let controller = TimerController::connect(Arc::new(FakeApi::new()))
            .await
            .unwrap();
        assert_eq!(controller.state(), TimerState::Idle);
        assert_eq!(controller.current(), None);
    }

    #[tokio::test]
    async fn start_runs_and_publishes_entry() {
        let (_, controller) = controller(FakeApi::new());
        controller.refresh().await.unwrap();
        let mut current = controller.subscribe();

        let entry = controller.start("Writing", Some(1), &[2, 9]).await.unwrap();

        assert!(current.has_changed().unwrap());
        assert_eq!(current.borrow_and_update().as_ref(), Some(&entry));
        assert_eq!(entry.description(), "Writing");
        assert_eq!(entry.tag_names, vec!["tag2"]);
        assert!(matches!(controller.state(), TimerState::Running { .. }));
    }

    #[tokio::test]
    async fn start_while_running_is_a_conflict() {
        let (api, controller) =
            controller(FakeApi::new().with_active(running_entry(1, "Busy", None, vec![])));
        controller.refresh().await.unwrap();
        let before = controller.state();

        let err = controller.start("Second", None, &[]).await.unwrap_err();

        assert_eq!(err, TimerError::Conflict(Conflict::AlreadyRunning));
        assert_eq!(controller.state(), before);
        assert_eq!(api.start_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_while_idle_is_a_conflict() {
        let (api, controller) = controller(FakeApi::new());

        let err = controller.stop().await.unwrap_err();

        assert_eq!(err, TimerError::Conflict(Conflict::NotRunning));
        assert_eq!(controller.state(), TimerState::Idle);
        assert_eq!(api.stop_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_start_returns_to_idle() {
        let (api, controller) = controller(FakeApi::new());
        api.fail_next(TogglError::RateLimited);

        let err = controller.start("Writing", None, &[]).await.unwrap_err();

        assert_eq!(err, TimerError::Remote(TogglError::RateLimited));
        assert_eq!(controller.state(), TimerState::Idle);
        assert_eq!(controller.current(), None);
    }

    #[tokio::test]
    async fn stop_returns_to_idle() {
        let (_, controller) =
            controller(FakeApi::new().with_active(running_entry(1, "Busy", Some(1), vec![])));
        controller.refresh().await.unwrap();

        let stopped = controller.stop().await.unwrap();

        assert_eq!(stopped.id(), 1);
        assert!(stopped.entry.stop.is_some());
        assert_eq!(controller.state(), TimerState::Idle);
        assert_eq!(controller.current(), None);
    }

    #[tokio::test]
    async fn failed_stop_keeps_running() {
        let (api, controller) =
            controller(FakeApi::new().with_active(running_entry(1, "Busy", None, vec![])));
        controller.refresh().await.unwrap();
        let before = controller.state();
        api.fail_next(TogglError::Network("offline".to_string()));

        let err = controller.stop().await.unwrap_err();

        assert_eq!(err, TimerError::Remote(TogglError::Network("offline".to_string())));
        assert_eq!(controller.state(), before);
        assert_eq!(controller.current().map(|entry| entry.id()), Some(1));
    }

    #[tokio::test]
    async fn refresh_without_server_entry_goes_idle() {
        let (api, controller) =
            controller(FakeApi::new().with_active(running_entry(1, "Busy", None, vec![])));
        controller.refresh().await.unwrap();
        api.set_active(None);

        let outcome = controller.refresh().await.unwrap();

        assert_eq!(outcome, RefreshOutcome::Applied(None));
        assert_eq!(controller.state(), TimerState::Idle);
    }

    #[tokio::test]
    async fn refresh_replaces_different_server_entry() {
        let (api, controller) =
            controller(FakeApi::new().with_active(running_entry(1, "Old", None, vec![])));
        controller.refresh().await.unwrap();
        api.set_active(Some(running_entry(2, "New", Some(1), vec![1])));

        controller.refresh().await.unwrap();

        let current = controller.current().unwrap();
        assert_eq!(current.id(), 2);
        assert_eq!(current.description(), "New");
        assert_eq!(current.tag_names, vec!["tag1"]);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_state() {
        let (api, controller) =
            controller(FakeApi::new().with_active(running_entry(1, "Busy", None, vec![])));
        controller.refresh().await.unwrap();
        let before = controller.state();
        api.fail_next(TogglError::Unauthorized);

        let err = controller.refresh().await.unwrap_err();

        assert_eq!(err, TimerError::Remote(TogglError::Unauthorized));
        assert_eq!(controller.state(), before);
    }

    #[tokio::test]
    async fn second_start_while_starting_is_rejected() {
        let (api, controller) = controller(FakeApi::new());
        let (entered, release) = api.hold("create_and_start");

        let first = tokio::spawn({
            let controller = controller.clone();
            async move { controller.start("First", None, &[]).await }
        });
        entered.await.unwrap();
        assert_eq!(controller.state(), TimerState::Starting);

        let err = controller.start("Second", None, &[]).await.unwrap_err();
        assert_eq!(err, TimerError::Conflict(Conflict::RequestInFlight));
        assert_eq!(
            controller.refresh().await.unwrap(),
            RefreshOutcome::Deferred
        );

        release.send(()).unwrap();
        let entry = first.await.unwrap().unwrap();
        assert_eq!(entry.description(), "First");
        assert_eq!(api.start_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_while_stopping_is_rejected() {
        let (api, controller) =
            controller(FakeApi::new().with_active(running_entry(1, "Busy", None, vec![])));
        controller.refresh().await.unwrap();
        let (entered, release) = api.hold("stop_entry");

        let first = tokio::spawn({
            let controller = controller.clone();
            async move { controller.stop().await }
        });
        entered.await.unwrap();
        assert!(matches!(controller.state(), TimerState::Stopping { .. }));
        assert_eq!(controller.current().map(|entry| entry.id()), Some(1));

        let err = controller.stop().await.unwrap_err();
        assert_eq!(err, TimerError::Conflict(Conflict::RequestInFlight));
        let err = controller.start("Other", None, &[]).await.unwrap_err();
        assert_eq!(err, TimerError::Conflict(Conflict::RequestInFlight));

        release.send(()).unwrap();
        first.await.unwrap().unwrap();
        assert_eq!(controller.state(), TimerState::Idle);
        assert_eq!(api.stop_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_overtaken_by_stop_is_discarded() {
        let (api, controller) =
            controller(FakeApi::new().with_active(running_entry(1, "Busy", None, vec![])));
        controller.refresh().await.unwrap();
        let (entered, release) = api.hold("fetch_active_entry");

        let poll = tokio::spawn({
            let controller = controller.clone();
            async move { controller.refresh().await }
        });
        entered.await.unwrap();

        controller.stop().await.unwrap();
        assert_eq!(controller.state(), TimerState::Idle);

        // The poll read the account while entry 1 was still running.
        release.send(()).unwrap();
        assert_eq!(poll.await.unwrap().unwrap(), RefreshOutcome::Stale);
        assert_eq!(controller.state(), TimerState::Idle);
        assert_eq!(controller.current(), None);
    }

    #[tokio::test]
    async fn older_refresh_loses_to_newer_refresh() {
        let (api, controller) =
            controller(FakeApi::new().with_active(running_entry(1, "Busy", None, vec![])));
        let (entered, release) = api.hold("fetch_active_entry");

        let slow = tokio::spawn({
            let controller = controller.clone();
            async move { controller.refresh().await }
        });
        entered.await.unwrap();

        api.set_active(None);
        assert_eq!(
            controller.refresh().await.unwrap(),
            RefreshOutcome::Applied(None)
        );

        release.send(()).unwrap();
        assert_eq!(slow.await.unwrap().unwrap(), RefreshOutcome::Stale);
        assert_eq!(controller.state(), TimerState::Idle);
    }
}
