use ratatui::Frame;
use ratatui::layout::{Alignment, Constraint, Direction, Layout, Margin, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, BorderType, Borders, Clear, Paragraph, Wrap};

use crate::app::{App, Mode};
use crate::display::{ActiveTimerView, TimerView};
use crate::storage::ThemePreference;
use crate::timer::TimerState;

const PROJECT_AND_TAGS_HINT: &str =
    "Project and tags: toggl-now start \"DESCRIPTION\" --project ID --tag ID";

pub fn draw(frame: &mut Frame, app: &mut App) {
    let size = frame.area();
    let theme = theme_from(app.settings.theme);
    draw_background(frame, size, &theme);
    draw_dashboard(frame, app, size, &theme);

    match app.mode {
        Mode::Loading => draw_overlay(frame, size, "Loading data from Toggl...", &theme),
        Mode::Error => draw_overlay(
            frame,
            size,
            &format!(
                "{}\n\nPress r to retry, q to quit",
                app.status.as_deref().unwrap_or("Unknown error")
            ),
            &theme,
        ),
        Mode::Login => draw_login(frame, app, size, &theme),
        Mode::DescriptionInput => draw_description_input(frame, app, size, &theme),
        Mode::Dashboard => {}
    }

    if app.mode == Mode::Dashboard && !app.show_help {
        if let Some(toast) = app.active_toast() {
            draw_toast(frame, size, &toast.message, toast.is_error, &theme);
        }
    }

    if app.show_help {
        draw_help(frame, app, size, &theme);
    }
}

fn draw_dashboard(frame: &mut Frame, app: &mut App, area: Rect, theme: &Theme) {
    let content = area.inner(Margin {
        vertical: 1,
        horizontal: 2,
    });

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0), Constraint::Length(2)])
        .split(content);

    let header = Paragraph::new(header_line(app, theme))
        .alignment(Alignment::Left)
        .block(
            Block::default()
                .borders(Borders::BOTTOM)
                .border_style(theme.border_style())
                .style(theme.panel_style()),
        );
    frame.render_widget(header, chunks[0]);

    let lines = match app.timer_view() {
        TimerView::Empty => vec![
            Line::from(""),
            Line::from(Span::styled(
                crate::display::NO_ACTIVE_ENTRY,
                theme.muted_style(),
            )),
            Line::from(""),
            Line::from(Span::styled("Press s to start a timer", theme.muted_style())),
        ],
        TimerView::Active(view) => timer_lines(&view, theme),
    };

    let title = match app.timer_state() {
        Some(TimerState::Starting) => "Starting...",
        Some(TimerState::Stopping { .. }) => "Stopping...",
        _ => "Current Timer",
    };
    let timer = Paragraph::new(lines)
        .alignment(Alignment::Center)
        .block(panel_block(title, theme))
        .wrap(Wrap { trim: true });
    frame.render_widget(timer, chunks[1]);

    let footer = Paragraph::new(footer_line(app, theme))
        .alignment(Alignment::Left)
        .block(
            Block::default()
                .borders(Borders::TOP)
                .border_style(theme.border_style())
                .style(theme.panel_style()),
        );
    frame.render_widget(footer, chunks[2]);
}

fn timer_lines(view: &ActiveTimerView, theme: &Theme) -> Vec<Line<'static>> {
    let mut lines = vec![
        Line::from(""),
        Line::from(Span::styled(
            view.elapsed.clone(),
            Style::default().fg(theme.accent).add_modifier(Modifier::BOLD),
        )),
        Line::from(""),
        Line::from(Span::styled(
            view.description.clone(),
            Style::default().add_modifier(Modifier::BOLD),
        )),
    ];

    if let Some(project) = &view.project {
        let swatch = project
            .rgb()
            .map(|(r, g, b)| Color::Rgb(r, g, b))
            .unwrap_or(theme.accent);
        let mut spans = vec![
            Span::styled("● ", Style::default().fg(swatch)),
            Span::styled(project.name.clone(), Style::default().fg(swatch)),
        ];
        if let Some(client) = &project.client {
            spans.push(Span::styled(format!("  {client}"), theme.muted_style()));
        }
        lines.push(Line::from(spans));
    }

    if !view.tags.is_empty() {
        let mut spans = Vec::new();
        for (index, tag) in view.tags.iter().enumerate() {
            if index > 0 {
                spans.push(Span::raw(" "));
            }
            spans.push(Span::styled(
                format!("[{tag}]"),
                Style::default().fg(theme.highlight),
            ));
        }
        lines.push(Line::from(""));
        lines.push(Line::from(spans));
    }

    lines
}

fn header_line(app: &App, theme: &Theme) -> Line<'static> {
    let last_refresh = app
        .last_refresh
        .map(|dt| dt.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "Never".to_string());
    let markdown = if app.settings.parse_markdown {
        "on"
    } else {
        "off"
    };
    Line::from(vec![
        Span::styled("Toggl Now", theme.title_style()),
        Span::raw("  "),
        Span::styled("Last refresh", theme.muted_style()),
        Span::raw(": "),
        Span::raw(last_refresh),
        Span::raw("  "),
        Span::styled("Markdown", theme.muted_style()),
        Span::raw(": "),
        Span::raw(markdown),
    ])
}

fn footer_line(app: &App, theme: &Theme) -> Line<'static> {
    let running = app.current.is_some();
    let mut spans = vec![
        Span::styled(
            if running { "x stop" } else { "s start" },
            Style::default().fg(theme.accent).add_modifier(Modifier::BOLD),
        ),
        Span::raw(" · "),
        Span::styled("r refresh", theme.muted_style()),
        Span::raw(" · "),
        Span::styled("h help", theme.muted_style()),
        Span::raw(" · "),
        Span::styled("q quit", theme.muted_style()),
    ];
    if let Some(status) = app.status.as_ref().filter(|status| !status.is_empty()) {
        spans.push(Span::raw(format!("   |   {status}")));
    }
    Line::from(spans)
}

fn draw_overlay(frame: &mut Frame, area: Rect, message: &str, theme: &Theme) {
    let block = centered_rect(60, 20, area);
    frame.render_widget(Clear, block);
    let paragraph = Paragraph::new(message.to_string())
        .alignment(Alignment::Center)
        .block(panel_block("Status", theme))
        .wrap(Wrap { trim: true });
    frame.render_widget(paragraph, block);
}

fn draw_login(frame: &mut Frame, app: &App, area: Rect, theme: &Theme) {
    let block = centered_rect(70, 30, area);
    frame.render_widget(Clear, block);
    let mut lines = vec![
        Line::from("Enter your Toggl API token"),
        Line::from("Find it in https://track.toggl.com/profile"),
        Line::from(""),
        Line::from(vec![
            Span::styled("Token: ", Style::default().add_modifier(Modifier::BOLD)),
            Span::raw(mask_token(&app.input)),
        ]),
        Line::from(""),
        Line::from("Press Enter to save, Esc to quit"),
    ];

    if let Some(status) = &app.status {
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(
            status.clone(),
            Style::default().fg(theme.error),
        )));
    }

    let paragraph = Paragraph::new(lines)
        .alignment(Alignment::Left)
        .block(panel_block("Login", theme))
        .wrap(Wrap { trim: true });
    frame.render_widget(paragraph, block);
}

fn draw_description_input(frame: &mut Frame, app: &App, area: Rect, theme: &Theme) {
    let block = centered_rect(60, 25, area);
    frame.render_widget(Clear, block);

    let lines = vec![
        Line::from("What are you working on?"),
        Line::from(""),
        Line::from(vec![
            Span::styled("Description: ", Style::default().add_modifier(Modifier::BOLD)),
            Span::styled(app.input.clone(), Style::default().fg(theme.accent)),
        ]),
        Line::from(""),
        Line::from("Enter start • Esc cancel"),
        Line::from(Span::styled(PROJECT_AND_TAGS_HINT, theme.muted_style())),
    ];

    let paragraph = Paragraph::new(lines)
        .alignment(Alignment::Left)
        .block(panel_block("Start Timer", theme))
        .wrap(Wrap { trim: true });
    frame.render_widget(paragraph, block);
}

fn draw_help(frame: &mut Frame, app: &App, area: Rect, theme: &Theme) {
    let block = centered_rect(60, 60, area);
    frame.render_widget(Clear, block);

    let lines = help_lines(app.settings.theme, app.log_path.as_deref(), theme);
    let paragraph = Paragraph::new(lines)
        .alignment(Alignment::Left)
        .block(panel_block("Help", theme))
        .wrap(Wrap { trim: true });
    frame.render_widget(paragraph, block);
}

fn help_lines(
    theme_pref: ThemePreference,
    log_path: Option<&str>,
    theme: &Theme,
) -> Vec<Line<'static>> {
    let key = |label: &'static str| {
        Span::styled(
            format!("{label:<4}"),
            Style::default().fg(theme.accent).add_modifier(Modifier::BOLD),
        )
    };
    let mut lines = vec![
        Line::from(vec![key("s"), Span::raw("Start a timer (description only)")]),
        Line::from(vec![key("x"), Span::raw("Stop the running timer")]),
        Line::from(vec![key("r"), Span::raw("Refresh from Toggl")]),
        Line::from(vec![key("m"), Span::raw("Toggle markdown in descriptions")]),
        Line::from(vec![
            key("t"),
            Span::raw(format!("Theme ({})", theme_label(theme_pref))),
        ]),
        Line::from(vec![key("h"), Span::raw("Close help")]),
        Line::from(vec![key("q"), Span::raw("Quit")]),
        Line::from(""),
        Line::from(Span::styled(PROJECT_AND_TAGS_HINT, theme.muted_style())),
    ];
    if let Some(path) = log_path {
        lines.push(Line::from(""));
        lines.push(Line::from(Span::styled(
            format!("Log: {path}"),
            theme.muted_style(),
        )));
    }
    lines
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);
    let vertical = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1]);
    vertical[1]
}

fn draw_toast(frame: &mut Frame, area: Rect, message: &str, is_error: bool, theme: &Theme) {
    let width = (message.chars().count() as u16 + 6)
        .max(20)
        .min(area.width.saturating_sub(2));
    let height = 3;
    let x = area.x + area.width.saturating_sub(width + 1);
    let y = area.y + area.height.saturating_sub(height + 4);
    let rect = Rect::new(x, y, width, height);

    frame.render_widget(Clear, rect);
    let (style, title) = if is_error {
        (
            Style::default().fg(theme.error).add_modifier(Modifier::BOLD),
            "Error",
        )
    } else {
        (
            Style::default().fg(theme.success).add_modifier(Modifier::BOLD),
            "Done",
        )
    };
    let paragraph = Paragraph::new(Line::from(Span::styled(message.to_string(), style)))
        .alignment(Alignment::Center)
        .block(panel_block(title, theme));
    frame.render_widget(paragraph, rect);
}

fn draw_background(frame: &mut Frame, area: Rect, theme: &Theme) {
    let block = Block::default().style(Style::default().bg(theme.bg).fg(theme.text));
    frame.render_widget(block, area);
}

fn panel_block(title: &str, theme: &Theme) -> Block<'static> {
    Block::default()
        .borders(Borders::ALL)
        .border_type(BorderType::Rounded)
        .border_style(theme.border_style())
        .style(theme.panel_style())
        .title(Line::from(Span::styled(
            format!(" {} ", title),
            theme.title_style(),
        )))
}

fn mask_token(token: &str) -> String {
    let len = token.chars().count();
    if len <= 4 {
        return "•".repeat(len);
    }
    let tail: String = token.chars().skip(len - 4).collect();
    format!("{}{tail}", "•".repeat(len - 4))
}

#[derive(Clone, Copy)]
struct Theme {
    bg: Color,
    panel: Color,
    border: Color,
    text: Color,
    muted: Color,
    accent: Color,
    highlight: Color,
    success: Color,
    error: Color,
}

impl Theme {
    fn panel_style(&self) -> Style {
        Style::default().bg(self.panel).fg(self.text)
    }

    fn border_style(&self) -> Style {
        Style::default().fg(self.border)
    }

    fn title_style(&self) -> Style {
        Style::default().fg(self.accent).add_modifier(Modifier::BOLD)
    }

    fn muted_style(&self) -> Style {
        Style::default().fg(self.muted)
    }
}

fn theme_from(pref: ThemePreference) -> Theme {
    match pref {
        ThemePreference::Terminal => Theme {
            bg: Color::Reset,
            panel: Color::Reset,
            border: Color::DarkGray,
            text: Color::Reset,
            muted: Color::DarkGray,
            accent: Color::Magenta,
            highlight: Color::Yellow,
            success: Color::Green,
            error: Color::Red,
        },
        ThemePreference::Dark => Theme {
            bg: Color::Rgb(20, 16, 30),
            panel: Color::Rgb(30, 24, 44),
            border: Color::Rgb(72, 58, 100),
            text: Color::Rgb(232, 226, 245),
            muted: Color::Rgb(160, 150, 185),
            accent: Color::Rgb(226, 120, 210),
            highlight: Color::Rgb(255, 205, 120),
            success: Color::Rgb(120, 220, 140),
            error: Color::Rgb(255, 120, 120),
        },
        ThemePreference::Light => Theme {
            bg: Color::Rgb(246, 244, 250),
            panel: Color::Rgb(255, 255, 255),
            border: Color::Rgb(220, 212, 235),
            text: Color::Rgb(32, 26, 44),
            muted: Color::Rgb(110, 96, 135),
            accent: Color::Rgb(176, 60, 160),
            highlight: Color::Rgb(200, 120, 30),
            success: Color::Rgb(36, 150, 90),
            error: Color::Rgb(220, 60, 80),
        },
    }
}

fn theme_label(theme: ThemePreference) -> &'static str {
    match theme {
        ThemePreference::Terminal => "Terminal",
        ThemePreference::Dark => "Dusk",
        ThemePreference::Light => "Paper",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_token_keeps_last_four() {
        assert_eq!(mask_token(""), "");
        assert_eq!(mask_token("abc"), "•••");
        assert_eq!(mask_token("abcdef123"), "•••••f123");
    }

    #[test]
    fn tags_render_only_when_present() {
        let theme = theme_from(ThemePreference::Terminal);
        let mut view = ActiveTimerView {
            description: "Timer description".to_string(),
            project: None,
            tags: vec!["tag1".to_string(), "tag2".to_string()],
            elapsed: "0:01:00".to_string(),
        };
        let with_tags = timer_lines(&view, &theme);
        view.tags.clear();
        let without_tags = timer_lines(&view, &theme);

        assert_eq!(with_tags.len(), without_tags.len() + 2);
        let last = with_tags.last().unwrap().to_string();
        assert_eq!(last, "[tag1] [tag2]");
    }

    #[test]
    fn help_explains_project_and_tags_come_from_the_cli() {
        let theme = theme_from(ThemePreference::Terminal);
        let lines: Vec<String> = help_lines(ThemePreference::Dark, Some("/tmp/toggl-now.log"), &theme)
            .iter()
            .map(|line| line.to_string())
            .collect();

        assert!(lines.iter().any(|line| line.ends_with("Start a timer (description only)")));
        assert!(lines.iter().any(|line| line.contains("--project ID --tag ID")));
        assert!(lines.iter().any(|line| line == "t   Theme (Dusk)"));
        assert_eq!(lines.last().map(String::as_str), Some("Log: /tmp/toggl-now.log"));
    }
}
