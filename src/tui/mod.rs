use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::Result;
use crossterm::event::{self, Event, KeyEvent, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use crossterm::{ExecutableCommand, execute};
use ratatui::backend::{Backend, CrosstermBackend};
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, Borders, List, ListItem, ListState, Paragraph, Wrap};
use ratatui::{Frame, Terminal};
use tracing::debug;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::config::Config;
use crate::db::HistoryStore;
use crate::preview::{ThumbnailRenderer, Viewer};

mod sanitize;
mod state;
mod worker;


use state::{BrowserState, Completion, Effect, Thumbnail};
use worker::Workers;

const IDLE_POLL: Duration = Duration::from_millis(100);
const DEFAULT_STATUS_HINT: &str =
    "type to filter  •  ↑/↓ move  •  Enter open  •  Tab sessions/generations  •  Ctrl-R refresh  •  Esc quit";

/// Browse recorded generations and sessions until the user quits.
///
/// # Errors
///
/// Returns an error if terminal IO fails.
pub fn run(
    store: Arc<HistoryStore>,
    config: &Config,
    renderer: Arc<dyn ThumbnailRenderer>,
    viewer: &dyn Viewer,
) -> Result<()> {
    let mut stdout = io::stdout();
    enable_raw_mode()?;
    execute!(stdout, crossterm::terminal::EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.clear()?;

    let mut state = BrowserState::new(config.browser.clone());
    let workers = Workers::spawn(store, renderer);
    let result = run_loop(&mut terminal, &mut state, &workers, viewer, read_key);
    workers.shutdown();

    disable_raw_mode()?;
    terminal
        .backend_mut()
        .execute(crossterm::terminal::LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    result
}

fn read_key(timeout: Duration) -> Result<Option<KeyEvent>> {
    if event::poll(timeout)?
        && let Event::Key(key) = event::read()?
        && key.kind != KeyEventKind::Release
    {
        return Ok(Some(key));
    }
    Ok(None)
}

/// Drive the browser: draw, fold in finished background work, dispatch new
/// work, then wait briefly for input. `next_key` blocks for at most the
/// timeout it is given.
fn run_loop<B, K>(
    terminal: &mut Terminal<B>,
    state: &mut BrowserState,
    workers: &Workers,
    viewer: &dyn Viewer,
    mut next_key: K,
) -> Result<()>
where
    B: Backend,
    K: FnMut(Duration) -> Result<Option<KeyEvent>>,
{
    loop {
        let now = Instant::now();
        while let Ok(completion) = workers.completions().try_recv() {
            if !state.apply(completion, now) {
                debug!("discarded stale browser result");
            }
        }
        state.tick(now);
        for effect in state.take_effects() {
            match effect {
                Effect::Open { path } => {
                    let result = viewer.open(&path).map_err(|err| err.to_string());
                    state.apply(Completion::Opened { path, result }, now);
                }
                other => workers.dispatch(other),
            }
        }

        terminal.draw(|frame| draw(frame, state))?;
        if state.should_quit {
            return Ok(());
        }

        let timeout = state
            .debounce_remaining(Instant::now())
            .map_or(IDLE_POLL, |remaining| remaining.min(IDLE_POLL));
        if let Some(key) = next_key(timeout)? {
            state.handle_key(key, Instant::now());
        }
    }
}

fn draw(frame: &mut Frame<'_>, state: &mut BrowserState) {
    let vertical = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(3),
            Constraint::Length(3),
        ])
        .split(frame.area());
    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(vertical[1]);

    state.set_page_size(usize::from(columns[0].height.saturating_sub(2)));

    draw_query(frame, vertical[0], state);
    draw_entries(frame, columns[0], state);
    draw_preview(frame, columns[1], state);
    draw_status(frame, vertical[2], state);
}

fn draw_query(frame: &mut Frame<'_>, area: Rect, state: &BrowserState) {
    let mut spans = vec![
        Span::styled("> ", Style::default().fg(Color::Cyan)),
        Span::styled(
            state.query.clone(),
            Style::default().add_modifier(Modifier::BOLD),
        ),
    ];
    if state.is_busy() {
        spans.push(Span::styled("  …", Style::default().fg(Color::DarkGray)));
    }
    let title = format!(
        "{} ({}/{})",
        state.view.title(),
        state.visible.len(),
        state.candidates.len()
    );
    let paragraph =
        Paragraph::new(Line::from(spans)).block(Block::default().title(title).borders(Borders::ALL));
    frame.render_widget(paragraph, area);
}

fn draw_entries(frame: &mut Frame<'_>, area: Rect, state: &BrowserState) {
    let width = usize::from(area.width.saturating_sub(4));
    let items = state
        .visible_entries()
        .skip(state.window_start)
        .take(state.page_size)
        .map(|entry| {
            let style = if entry.failed {
                Style::default().fg(Color::Red)
            } else {
                Style::default()
            };
            ListItem::new(Line::from(Span::styled(truncate(&entry.title, width), style)))
        })
        .collect::<Vec<_>>();

    let title = if state.applied_query.is_empty() {
        "Results".to_string()
    } else {
        format!("Results for \"{}\"", state.applied_query)
    };
    let list = List::new(items)
        .block(Block::default().title(title).borders(Borders::ALL))
        .highlight_style(Style::default().fg(Color::Black).bg(Color::Cyan))
        .highlight_symbol("▶ ");
    let mut list_state = ListState::default();
    if !state.visible.is_empty() {
        list_state.select(Some(state.index.saturating_sub(state.window_start)));
    }
    frame.render_stateful_widget(list, area, &mut list_state);
}

fn draw_preview(frame: &mut Frame<'_>, area: Rect, state: &BrowserState) {
    let Some(entry) = state.selected() else {
        let paragraph = Paragraph::new("No matching entries")
            .style(Style::default().fg(Color::DarkGray))
            .block(Block::default().title("Preview").borders(Borders::ALL));
        frame.render_widget(paragraph, area);
        return;
    };

    let detail_height = u16::try_from(entry.details.len())
        .unwrap_or(u16::MAX)
        .saturating_add(2);
    let sections = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(detail_height), Constraint::Min(3)])
        .split(area);

    let details = entry
        .details
        .iter()
        .map(|line| Line::from(line.as_str()))
        .collect::<Vec<_>>();
    let paragraph = Paragraph::new(details)
        .block(Block::default().title("Details").borders(Borders::ALL))
        .wrap(Wrap { trim: true });
    frame.render_widget(paragraph, sections[0]);

    let thumbnail = state
        .thumbnail
        .as_ref()
        .filter(|(key, _)| *key == entry.key)
        .map(|(_, thumbnail)| thumbnail);
    let (body, style): (Text<'static>, Style) = match thumbnail {
        Some(Thumbnail::Rendered(text)) => match &text.styled {
            Some(styled) => (styled.clone(), Style::default()),
            None => (
                Text::from(text.lines.join("\n")),
                Style::default(),
            ),
        },
        Some(Thumbnail::Unavailable(reason)) => (
            Text::from(format!("Preview unavailable: {reason}")),
            Style::default().fg(Color::Yellow),
        ),
        Some(Thumbnail::NoImage) => (
            Text::from("No image recorded"),
            Style::default().fg(Color::DarkGray),
        ),
        Some(Thumbnail::Loading) | None => (
            Text::from("Rendering…"),
            Style::default().fg(Color::DarkGray),
        ),
    };
    let paragraph = Paragraph::new(body)
        .style(style)
        .block(Block::default().title("Image").borders(Borders::ALL));
    frame.render_widget(paragraph, sections[1]);
}

fn draw_status(frame: &mut Frame<'_>, area: Rect, state: &BrowserState) {
    let (content, style) = match state.status_message(Instant::now()) {
        Some(text) if state.error.as_deref() == Some(text) => {
            (format!(" {text} "), Style::default().fg(Color::Red))
        }
        Some(text) => (format!(" {text} "), Style::default()),
        None => (
            format!(" {DEFAULT_STATUS_HINT} "),
            Style::default().fg(Color::DarkGray),
        ),
    };
    let paragraph = Paragraph::new(content)
        .style(style)
        .block(Block::default().borders(Borders::ALL));
    frame.render_widget(paragraph, area);
}

/// Cut `input` to at most `max` terminal columns.
fn truncate(input: &str, max: usize) -> String {
    if input.width() <= max {
        return input.to_string();
    }
    if max == 0 {
        return String::new();
    }
    let mut out = String::new();
    let mut used = 0;
    for ch in input.chars() {
        let width = ch.width().unwrap_or(0);
        if used + width + 1 > max {
            break;
        }
        used += width;
        out.push(ch);
    }
    out.push('…');
    out
}
