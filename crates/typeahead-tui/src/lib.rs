use crossterm::event::{KeyCode, KeyEvent};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, List, ListItem};
use typeahead_core::{AutocompleteController, ListPresenter, ListRow};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

// ─── Redraw Flag ─────────────────────────────────────────────────────────────

/// Shared dirty flag registered as the controller's list presenter.
///
/// The controller pokes it synchronously during session lifecycle changes;
/// the host checks `take()` once per frame and re-syncs the dropdown. Kept
/// separate from [`CandidateDropdown`] so controller calls made from key
/// handling never re-enter the dropdown's `RefCell`.
#[derive(Debug, Default)]
pub struct RedrawFlag {
    dirty: bool,
}

impl RedrawFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether a redraw was requested, clearing the flag.
    pub fn take(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

impl ListPresenter for RedrawFlag {
    fn reload_list(&mut self) {
        self.dirty = true;
    }
}

// ─── Candidate Dropdown ──────────────────────────────────────────────────────

/// Terminal dropdown for the candidate list: a selection index over the
/// controller's visible rows, with wrapping navigation and a viewport
/// centered on the selection.
#[derive(Debug, Clone, Default)]
pub struct CandidateDropdown {
    rows: Vec<ListRow>,
    selected: usize,
    visible: bool,
}

impl CandidateDropdown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pull the latest rows and visibility from the controller. Call once
    /// per frame after the redraw flag fires.
    pub fn sync(&mut self, controller: &AutocompleteController) {
        self.rows = controller.visible_rows();
        self.visible = controller.is_active();
        if self.rows.is_empty() {
            self.selected = 0;
        } else {
            self.selected = self.selected.min(self.rows.len() - 1);
        }
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn rows(&self) -> &[ListRow] {
        &self.rows
    }

    pub fn selected_index(&self) -> usize {
        self.selected
    }

    pub fn selected_row(&self) -> Option<&ListRow> {
        self.rows.get(self.selected)
    }

    pub fn up(&mut self) {
        if self.selected > 0 {
            self.selected -= 1;
        } else if !self.rows.is_empty() {
            self.selected = self.rows.len() - 1;
        }
    }

    pub fn down(&mut self) {
        if !self.rows.is_empty() {
            self.selected = (self.selected + 1) % self.rows.len();
        }
    }

    /// Route a key event. Returns true when the dropdown consumed it.
    ///
    /// Up/Down move the selection, Tab/Enter commit the highlighted
    /// candidate, Esc dismisses the session.
    pub fn handle_key(&mut self, key: &KeyEvent, controller: &mut AutocompleteController) -> bool {
        if !controller.is_active() {
            return false;
        }
        match key.code {
            KeyCode::Up => {
                self.up();
                true
            }
            KeyCode::Down => {
                self.down();
                true
            }
            KeyCode::Esc => {
                controller.invalidate();
                true
            }
            KeyCode::Tab | KeyCode::Enter => {
                // No highlighted candidate means nothing to commit; leave
                // the key for the host.
                if controller.select_row(self.selected) {
                    controller.complete_selected();
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// Plain-text rendering for hosts without a widget tree. The viewport
    /// is centered on the selection.
    pub fn display_lines(&self, max_lines: usize) -> Vec<String> {
        let total = self.rows.len();
        if total == 0 {
            return vec!["no matches".to_string()];
        }
        let show = total.min(max_lines);
        let half = show / 2;
        let start = if self.selected <= half {
            0
        } else if self.selected + half >= total {
            total.saturating_sub(show)
        } else {
            self.selected - half
        };
        let end = (start + show).min(total);
        (start..end)
            .map(|i| {
                let marker = if i == self.selected { ">" } else { " " };
                match &self.rows[i].detail {
                    Some(detail) => format!("{marker} {}  {detail}", self.rows[i].text),
                    None => format!("{marker} {}", self.rows[i].text),
                }
            })
            .collect()
    }

    /// Bordered ratatui list with the selected row emphasized.
    pub fn to_list(&self, max_width: usize) -> List<'static> {
        let items: Vec<ListItem> = if self.rows.is_empty() {
            vec![ListItem::new(Line::from(Span::styled(
                "no matches",
                Style::default().fg(Color::DarkGray),
            )))]
        } else {
            self.rows
                .iter()
                .enumerate()
                .map(|(i, row)| {
                    let marker = if i == self.selected { "> " } else { "  " };
                    let mut spans = vec![Span::raw(format!(
                        "{marker}{}",
                        truncate_to_width(&row.text, max_width)
                    ))];
                    if let Some(detail) = &row.detail {
                        spans.push(Span::styled(
                            format!("  {detail}"),
                            Style::default().fg(Color::DarkGray),
                        ));
                    }
                    let mut line = Line::from(spans);
                    if i == self.selected {
                        line = line.style(Style::default().add_modifier(Modifier::BOLD));
                    }
                    ListItem::new(line)
                })
                .collect()
        };
        List::new(items).block(Block::bordered().title("completions"))
    }
}

/// Trim to a display-cell budget, appending an ellipsis when cut.
/// Zero budget means unlimited.
fn truncate_to_width(text: &str, max_width: usize) -> String {
    if max_width == 0 || text.width() <= max_width {
        return text.to_string();
    }
    let mut out = String::new();
    let mut used = 0;
    for ch in text.chars() {
        let w = ch.width().unwrap_or(0);
        if used + w + 1 > max_width {
            break;
        }
        out.push(ch);
        used += w;
    }
    out.push('…');
    out
}
