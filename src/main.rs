use clap::{Parser, Subcommand};
use crossterm::ExecutableCommand;
use crossterm::event::{self, Event};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

mod app;
mod display;
mod enrich;
mod logging;
mod models;
mod storage;
mod ticker;
mod timer;
mod toggl;
mod ui;

use app::App;
use display::{DisplaySettings, InlineMarkdown, TimerView};
use logging::LogTarget;
use storage::Settings;
use ticker::{Clock, DurationTicker, SystemClock};
use timer::TimerController;
use toggl::{TogglClient, TrackerApi};

#[derive(Parser)]
#[command(name = "toggl-now")]
#[command(about = "Show and control the running Toggl Track timer")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Workspace id (defaults to the configured or first workspace)
    #[arg(short, long, global = true)]
    workspace: Option<u64>,

    /// Ask for the API token even if one is stored
    #[arg(long)]
    login: bool,

    /// Log to stderr for one-shot commands
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Render markdown in descriptions for this run
    #[arg(long, global = true)]
    markdown: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Full-screen view of the current timer (default)
    Tui,

    /// Print the current timer
    Status {
        /// Print the enriched entry as JSON (`null` when idle)
        #[arg(long)]
        json: bool,
    },

    /// Start a new timer
    Start {
        /// What you are working on
        description: String,

        /// Project id
        #[arg(short, long)]
        project: Option<u64>,

        /// Tag id, repeatable
        #[arg(short, long = "tag")]
        tags: Vec<u64>,
    },

    /// Stop the running timer
    Stop,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let mut settings = storage::read_settings();
    if cli.workspace.is_some() {
        settings.workspace_id = cli.workspace;
    }
    if cli.markdown {
        settings.parse_markdown = true;
    }

    match cli.command {
        None | Some(Commands::Tui) => {
            let log_path = logging::init(LogTarget::File);
            run_tui(settings, cli.login, log_path.map(|path| path.display().to_string())).await
        }
        Some(command) => {
            logging::init(if cli.verbose {
                LogTarget::Stderr
            } else {
                LogTarget::Off
            });
            if let Err(err) = run_command(command, &settings).await {
                eprintln!("{err}");
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

async fn run_tui(
    settings: Settings,
    force_login: bool,
    log_path: Option<String>,
) -> Result<(), Box<dyn Error>> {
    let mut stdout = std::io::stdout();
    enable_raw_mode()?;
    stdout.execute(EnterAlternateScreen)?;

    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.clear()?;

    let mut app = App::new(settings, force_login);
    app.log_path = log_path;

    let result = loop {
        app.sync();

        if let Err(err) = terminal.draw(|frame| ui::draw(frame, &mut app)) {
            break Err(err);
        }

        if app.needs_connect {
            app.connect();
        }

        if app.should_quit {
            break Ok(());
        }

        match event::poll(Duration::from_millis(120)) {
            Ok(true) => match event::read() {
                Ok(Event::Key(key)) => app.handle_key_event(key),
                Ok(_) => {}
                Err(err) => break Err(err),
            },
            Ok(false) => {}
            Err(err) => break Err(err),
        }
    };

    app.shutdown().await;
    disable_raw_mode()?;
    terminal.backend_mut().execute(LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    result?;
    Ok(())
}

async fn run_command(command: Commands, settings: &Settings) -> Result<(), Box<dyn Error>> {
    let token = storage::read_token()
        .ok_or("No Toggl API token. Set TOGGL_API_TOKEN or run `toggl-now --login`.")?;
    let client = TogglClient::connect(token, settings.workspace_id).await?;
    let api: Arc<dyn TrackerApi> = Arc::new(client);
    let controller = TimerController::connect(api).await?;
    let display_settings = DisplaySettings {
        parse_markdown: settings.parse_markdown,
    };
    let duration_ticker = DurationTicker::new(SystemClock);

    match command {
        Commands::Status { json: true } => {
            println!("{}", serde_json::to_string_pretty(&controller.current())?);
        }
        Commands::Status { json: false } => {
            let state = controller.state();
            let view = display::timer_view(
                state.current(),
                duration_ticker.elapsed(&state),
                display_settings,
                &InlineMarkdown,
            );
            print_view(&view);
        }
        Commands::Start {
            description,
            project,
            tags,
        } => {
            let entry = controller.start(&description, project, &tags).await?;
            let view = display::timer_view(
                Some(&entry),
                Some(duration_ticker.elapsed_for(&entry)),
                display_settings,
                &InlineMarkdown,
            );
            println!("Started");
            print_view(&view);
        }
        Commands::Stop => {
            let entry = controller.stop().await?;
            let stopped_at = entry.entry.stop.unwrap_or_else(|| SystemClock.now());
            let seconds = ticker::elapsed_seconds(entry.entry.start, stopped_at);
            println!(
                "Stopped \"{}\" after {}",
                entry.description(),
                ticker::format_duration(seconds)
            );
        }
        Commands::Tui => {}
    }

    Ok(())
}

fn print_view(view: &TimerView) {
    let TimerView::Active(view) = view else {
        println!("{}", view.headline());
        return;
    };

    println!("{}  {}", view.elapsed, view.description);
    if let Some(project) = &view.project {
        match &project.client {
            Some(client) => println!("  {} ({}) · {client}", project.name, project.color),
            None => println!("  {} ({})", project.name, project.color),
        }
    }
    if !view.tags.is_empty() {
        println!("  tags: {}", view.tags.join(", "));
    }
}
