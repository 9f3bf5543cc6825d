use ansi_to_tui::IntoText;
use ratatui::text::Text;
use std::iter::Peekable;
use std::str::Chars;

/// Renderer output reduced to what the preview pane can draw.
#[derive(Debug, Clone)]
pub(crate) struct SanitizedText {
    pub lines: Vec<String>,
    pub styled: Option<Text<'static>>,
}

/// Keep SGR colour sequences and drop everything else a renderer may emit:
/// OSC/DCS/APC strings, cursor visibility toggles, and cursor movement.
pub(crate) fn sanitize_render(input: &str) -> SanitizedText {
    let mut sanitized = String::with_capacity(input.len());
    let mut iter = input.chars().peekable();

    while let Some(ch) = iter.next() {
        match ch {
            '\u{1b}' => match iter.peek().copied() {
                Some('[') => {
                    iter.next();
                    keep_sgr_only(&mut iter, &mut sanitized);
                }
                Some(']' | 'P' | '_' | '^' | 'X') => {
                    iter.next();
                    skip_control_string(&mut iter);
                }
                Some(_) => {
                    iter.next();
                }
                None => {}
            },
            '\u{9c}' | '\r' => {}
            _ => sanitized.push(ch),
        }
    }

    let lines = sanitized
        .lines()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    let styled = if sanitized.trim().is_empty() {
        None
    } else {
        sanitized.as_str().into_text().ok()
    };

    SanitizedText { lines, styled }
}

fn keep_sgr_only(iter: &mut Peekable<Chars<'_>>, out: &mut String) {
    let mut params = String::new();
    for ch in iter.by_ref() {
        if ('\u{40}'..='\u{7e}').contains(&ch) {
            if ch == 'm' {
                out.push_str("\u{1b}[");
                out.push_str(&params);
                out.push('m');
            }
            return;
        }
        params.push(ch);
    }
}

fn skip_control_string(iter: &mut Peekable<Chars<'_>>) {
    while let Some(ch) = iter.next() {
        match ch {
            '\x07' | '\u{9c}' => break,
            '\u{1b}' => {
                if matches!(iter.peek().copied(), Some('\\')) {
                    iter.next();
                    break;
                }
            }
            _ => {}
        }
    }
}
