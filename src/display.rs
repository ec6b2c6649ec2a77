use crate::enrich::EnrichedTimeEntry;
use crate::ticker::format_duration;

pub const NO_ACTIVE_ENTRY: &str = "No active time entry";
pub const NO_DESCRIPTION: &str = "No description";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplaySettings {
    pub parse_markdown: bool,
}

pub trait DescriptionRenderer {
    fn render(&self, text: &str) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InlineMarkdown;

impl DescriptionRenderer for InlineMarkdown {
    fn render(&self, text: &str) -> String {
        let mut output = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(ch) = rest.chars().next() {
            if ch == '\\' {
                let mut escaped = rest[1..].chars();
                if let Some(next) = escaped.next() {
                    output.push(next);
                    rest = escaped.as_str();
                } else {
                    output.push(ch);
                    rest = "";
                }
                continue;
            }
            if ch == '[' {
                if let Some((label, tail)) = split_link(rest) {
                    output.push_str(&self.render(label));
                    rest = tail;
                    continue;
                }
            }
            if !matches!(ch, '*' | '_' | '`' | '~') || is_intraword(&output, rest) {
                output.push(ch);
            }
            rest = &rest[ch.len_utf8()..];
        }
        output
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectBadge {
    pub name: String,
    pub color: String,
    pub client: Option<String>,
}

impl ProjectBadge {
    pub fn rgb(&self) -> Option<(u8, u8, u8)> {
        parse_hex_color(&self.color)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveTimerView {
    pub description: String,
    pub project: Option<ProjectBadge>,
    pub tags: Vec<String>,
    pub elapsed: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerView {
    Empty,
    Active(ActiveTimerView),
}

impl TimerView {
    pub fn headline(&self) -> &str {
        match self {
            TimerView::Empty => NO_ACTIVE_ENTRY,
            TimerView::Active(view) => &view.description,
        }
    }
}

pub fn timer_view(
    entry: Option<&EnrichedTimeEntry>,
    elapsed: Option<i64>,
    settings: DisplaySettings,
    renderer: &dyn DescriptionRenderer,
) -> TimerView {
    let Some(entry) = entry else {
        return TimerView::Empty;
    };

    let raw = entry.description().trim();
    let description = if raw.is_empty() {
        NO_DESCRIPTION.to_string()
    } else if settings.parse_markdown {
        renderer.render(raw)
    } else {
        raw.to_string()
    };

    let project = entry.project.as_ref().map(|project| ProjectBadge {
        name: project.project.name.clone(),
        color: project.project.color.clone(),
        client: project.client.as_ref().map(|client| client.name.clone()),
    });

    TimerView::Active(ActiveTimerView {
        description,
        project,
        tags: entry.tag_names.clone(),
        elapsed: format_duration(elapsed.unwrap_or(0)),
    })
}

pub fn parse_hex_color(value: &str) -> Option<(u8, u8, u8)> {
    let hex = value.trim().strip_prefix('#')?;
    if !hex.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return None;
    }
    let channel = |range: std::ops::Range<usize>| u8::from_str_radix(&hex[range], 16).ok();
    match hex.len() {
        6 => Some((channel(0..2)?, channel(2..4)?, channel(4..6)?)),
        3 => {
            let (r, g, b) = (channel(0..1)?, channel(1..2)?, channel(2..3)?);
            Some((r * 17, g * 17, b * 17))
        }
        _ => None,
    }
}

fn split_link(text: &str) -> Option<(&str, &str)> {
    let close = text.find("](")?;
    let label = &text[1..close];
    if label.contains('[') {
        return None;
    }
    let after = &text[close + 2..];
    let end = after.find(')')?;
    Some((label, &after[end + 1..]))
}

// `snake_case` and `2*3` keep their markers.
fn is_intraword(before: &str, rest: &str) -> bool {
    let prev = before.chars().next_back();
    let next = rest.chars().nth(1);
    matches!((prev, next), (Some(p), Some(n)) if p.is_alphanumeric() && n.is_alphanumeric())
}
