use chrono::{DateTime, Local, Utc};
use crossterm::event::{KeyCode, KeyEvent};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::display::{self, DisplaySettings, InlineMarkdown, TimerView};
use crate::enrich::EnrichedTimeEntry;
use crate::storage::{self, Settings};
use crate::ticker::{self, PeriodicTask, SystemClock};
use crate::timer::{Conflict, RefreshOutcome, TimerController, TimerError, TimerState};
use crate::toggl::{TogglClient, TogglError, TrackerApi};

const TICK_PERIOD: Duration = Duration::from_secs(1);
const TOAST_TTL: Duration = Duration::from_secs(3);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub type Controller = TimerController<dyn TrackerApi>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Loading,
    Dashboard,
    Login,
    DescriptionInput,
    Error,
}

enum Outcome {
    Connected(Result<Controller, TimerError>),
    Started(Result<EnrichedTimeEntry, TimerError>),
    Stopped(Result<EnrichedTimeEntry, TimerError>),
    Refreshed(Result<RefreshOutcome, TimerError>),
}

struct Session {
    controller: Controller,
    timer_rx: watch::Receiver<Option<EnrichedTimeEntry>>,
    elapsed_rx: watch::Receiver<Option<i64>>,
    tasks: Vec<PeriodicTask>,
    commands: JoinSet<()>,
}

pub struct App {
    pub should_quit: bool,
    pub needs_connect: bool,
    pub mode: Mode,
    pub status: Option<String>,
    pub input: String,
    pub settings: Settings,
    pub show_help: bool,
    pub last_refresh: Option<DateTime<Local>>,
    pub log_path: Option<String>,
    pub current: Option<EnrichedTimeEntry>,
    pub elapsed: Option<i64>,
    token: Option<String>,
    session: Option<Session>,
    outcome_tx: mpsc::UnboundedSender<Outcome>,
    outcome_rx: mpsc::UnboundedReceiver<Outcome>,
    toast: Option<Toast>,
}

impl App {
    pub fn new(settings: Settings, force_login: bool) -> Self {
        let token = if force_login {
            None
        } else {
            storage::read_token()
        };
        let mode = if token.is_some() {
            Mode::Loading
        } else {
            Mode::Login
        };
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

        App {
            should_quit: false,
            needs_connect: token.is_some(),
            mode,
            status: None,
            input: String::new(),
            settings,
            show_help: false,
            last_refresh: None,
            log_path: None,
            current: None,
            elapsed: None,
            token,
            session: None,
            outcome_tx,
            outcome_rx,
            toast: None,
        }
    }

    pub fn timer_view(&self) -> TimerView {
        display::timer_view(
            self.current.as_ref(),
            self.elapsed,
            self.display_settings(),
            &InlineMarkdown,
        )
    }

    pub fn display_settings(&self) -> DisplaySettings {
        DisplaySettings {
            parse_markdown: self.settings.parse_markdown,
        }
    }

    pub fn timer_state(&self) -> Option<TimerState> {
        self.session
            .as_ref()
            .map(|session| session.controller.state())
    }

    pub fn connect(&mut self) {
        self.needs_connect = false;
        let Some(token) = self.token.clone() else {
            self.mode = Mode::Login;
            return;
        };

        self.mode = Mode::Loading;
        let workspace_id = self.settings.workspace_id;
        let tx = self.outcome_tx.clone();
        tokio::spawn(async move {
            let connected = match TogglClient::connect(token, workspace_id).await {
                Ok(client) => {
                    let api: Arc<dyn TrackerApi> = Arc::new(client);
                    TimerController::connect(api).await
                }
                Err(err) => Err(err.into()),
            };
            let _ = tx.send(Outcome::Connected(connected));
        });
    }

    pub fn sync(&mut self) {
        while let Ok(outcome) = self.outcome_rx.try_recv() {
            self.apply(outcome);
        }

        if let Some(session) = &mut self.session {
            while session.commands.try_join_next().is_some() {}
            self.current = session.timer_rx.borrow().clone();
            self.elapsed = *session.elapsed_rx.borrow();
        }
    }

    pub async fn shutdown(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        for task in session.tasks {
            task.cancel().await;
        }

        // A start or stop already sent must reach the server before exit.
        let pending = async { while session.commands.join_next().await.is_some() {} };
        if tokio::time::timeout(SHUTDOWN_GRACE, pending).await.is_err() {
            warn!("giving up on in-flight timer requests");
        }
    }

    fn apply(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Connected(Ok(controller)) => self.open_session(controller),
            Outcome::Connected(Err(err)) => self.handle_error(err),
            Outcome::Started(Ok(entry)) => {
                self.set_toast(format!("Started: {}", entry.description()), false);
            }
            Outcome::Stopped(Ok(entry)) => {
                let stopped_at = entry.entry.stop.unwrap_or_else(Utc::now);
                let seconds = ticker::elapsed_seconds(entry.entry.start, stopped_at);
                self.set_toast(
                    format!("Stopped after {}", ticker::format_duration(seconds)),
                    false,
                );
            }
            Outcome::Refreshed(Ok(RefreshOutcome::Applied(_))) => {
                self.last_refresh = Some(Local::now());
            }
            Outcome::Refreshed(Ok(RefreshOutcome::Stale | RefreshOutcome::Deferred)) => {}
            Outcome::Started(Err(err))
            | Outcome::Stopped(Err(err))
            | Outcome::Refreshed(Err(err)) => self.handle_error(err),
        }
    }

    fn open_session(&mut self, controller: Controller) {
        self.open_session_with(controller, self.settings.poll_interval());
    }

    fn open_session_with(&mut self, controller: Controller, poll_period: Duration) {
        let timer_rx = controller.subscribe();
        let (elapsed_rx, ticker_task) = ticker::spawn_ticker(timer_rx.clone(), SystemClock, TICK_PERIOD);
        let tx = self.outcome_tx.clone();
        let poll_task = ticker::spawn_refresh_loop(controller.clone(), poll_period, move |result| {
            let _ = tx.send(Outcome::Refreshed(result));
        });
        info!(poll_secs = poll_period.as_secs(), "session opened");

        self.session = Some(Session {
            controller,
            timer_rx,
            elapsed_rx,
            tasks: vec![ticker_task, poll_task],
            commands: JoinSet::new(),
        });
        self.last_refresh = Some(Local::now());
        self.mode = Mode::Dashboard;
        self.status = None;
    }

    fn handle_error(&mut self, err: TimerError) {
        match err {
            TimerError::Remote(TogglError::Unauthorized) => {
                self.token = None;
                self.session = None;
                self.mode = Mode::Login;
                self.status = Some("Invalid token. Please login.".to_string());
            }
            TimerError::Remote(err) if self.session.is_none() => {
                self.mode = Mode::Error;
                self.status = Some(err.to_string());
            }
            err => {
                warn!(error = %err, "timer command failed");
                self.set_toast(err.to_string(), true);
            }
        }
    }

    pub fn handle_key_event(&mut self, key: KeyEvent) {
        match self.mode {
            Mode::Login => self.handle_login_input(key),
            Mode::DescriptionInput => self.handle_description_input(key),
            Mode::Dashboard | Mode::Loading | Mode::Error => self.handle_dashboard_input(key),
        }
    }

    fn handle_dashboard_input(&mut self, key: KeyEvent) {
        if self.show_help {
            match key.code {
                KeyCode::Char('h') | KeyCode::Esc => {
                    self.show_help = false;
                }
                KeyCode::Char('q') => self.should_quit = true,
                _ => {}
            }
            return;
        }

        match key.code {
            KeyCode::Char('q') => self.should_quit = true,
            KeyCode::Char('h') => self.show_help = true,
            KeyCode::Char('r') if self.mode == Mode::Error => self.connect(),
            KeyCode::Char('r') => self.refresh(),
            KeyCode::Char('s') => self.begin_start(),
            KeyCode::Char('x') => self.stop(),
            KeyCode::Char('m') => self.toggle_markdown(),
            KeyCode::Char('t') => self.cycle_theme(),
            _ => {}
        }
    }

    fn handle_login_input(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Enter => {
                let token = self.input.trim().to_string();
                if token.is_empty() {
                    return;
                }
                if let Err(err) = storage::write_token(&token) {
                    self.status = Some(format!("Failed to save token: {err}"));
                    return;
                }
                self.token = Some(token);
                self.input.clear();
                self.status = None;
                self.needs_connect = true;
                self.mode = Mode::Loading;
            }
            KeyCode::Backspace => {
                self.input.pop();
            }
            KeyCode::Char(ch) => {
                if !ch.is_control() {
                    self.input.push(ch);
                }
            }
            KeyCode::Esc => self.should_quit = true,
            _ => {}
        }
    }

    fn handle_description_input(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Enter => {
                let description = self.input.trim().to_string();
                self.input.clear();
                self.mode = Mode::Dashboard;
                self.start(description);
            }
            KeyCode::Backspace => {
                self.input.pop();
            }
            KeyCode::Char(ch) => {
                if !ch.is_control() {
                    self.input.push(ch);
                }
            }
            KeyCode::Esc => {
                self.input.clear();
                self.mode = Mode::Dashboard;
            }
            _ => {}
        }
    }

    fn begin_start(&mut self) {
        let Some(state) = self.timer_state() else {
            return;
        };
        match state {
            TimerState::Idle => {
                self.input.clear();
                self.mode = Mode::DescriptionInput;
            }
            TimerState::Running { .. } => self.set_toast(Conflict::AlreadyRunning.to_string(), true),
            TimerState::Starting | TimerState::Stopping { .. } => {
                self.set_toast(Conflict::RequestInFlight.to_string(), true)
            }
        }
    }

    fn start(&mut self, description: String) {
        self.spawn_command(move |controller| async move {
            Outcome::Started(controller.start(&description, None, &[]).await)
        });
    }

    fn stop(&mut self) {
        self.spawn_command(|controller| async move { Outcome::Stopped(controller.stop().await) });
    }

    fn refresh(&mut self) {
        self.spawn_command(|controller| async move {
            Outcome::Refreshed(controller.refresh().await)
        });
    }

    fn spawn_command<F, Fut>(&mut self, command: F)
    where
        F: FnOnce(Controller) -> Fut,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let run = command(session.controller.clone());
        let tx = self.outcome_tx.clone();
        session.commands.spawn(async move {
            let _ = tx.send(run.await);
        });
    }

    fn toggle_markdown(&mut self) {
        self.settings.parse_markdown = !self.settings.parse_markdown;
        let label = if self.settings.parse_markdown {
            "Markdown rendering on."
        } else {
            "Markdown rendering off."
        };
        self.persist_settings(label);
    }

    fn cycle_theme(&mut self) {
        self.settings.theme = self.settings.theme.next();
        self.persist_settings("Theme updated.");
    }

    fn persist_settings(&mut self, message: &str) {
        match storage::write_settings(&self.settings) {
            Ok(()) => self.set_toast(message, false),
            Err(err) => self.set_toast(format!("Failed to save settings: {err}"), true),
        }
    }

    pub fn active_toast(&mut self) -> Option<ToastView> {
        let toast = self.toast.as_ref()?;
        if toast.created_at.elapsed() > TOAST_TTL {
            self.toast = None;
            return None;
        }
        Some(ToastView {
            message: toast.message.clone(),
            is_error: toast.is_error,
        })
    }

    fn set_toast(&mut self, message: impl Into<String>, is_error: bool) {
        self.toast = Some(Toast {
            message: message.into(),
            created_at: Instant::now(),
            is_error,
        });
    }
}

struct Toast {
    message: String,
    created_at: Instant,
    is_error: bool,
}

pub struct ToastView {
    pub message: String,
    pub is_error: bool,
}
