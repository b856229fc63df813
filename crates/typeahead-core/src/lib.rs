use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::rc::{Rc, Weak};

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    #[error("autocomplete prefix must be non-empty")]
    EmptyPrefix,
    #[error("input payload is not a string")]
    NotText,
    #[error("no text view is attached")]
    Unbound,
}

pub type Result<T> = std::result::Result<T, Error>;

// ─── Attributes & Buffer ─────────────────────────────────────────────────────

/// Attribute set carried by a run of buffer text.
///
/// `style` holds opaque styling key/values the host interprets (color, font,
/// whatever). `autocompleted` marks the run as having been produced by a
/// committed completion and carries that candidate's opaque context payload;
/// the edit-interception rules key off this marker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Attributes {
    pub style: BTreeMap<String, String>,
    pub autocompleted: Option<Value>,
}

impl Attributes {
    pub fn styled(pairs: &[(&str, &str)]) -> Self {
        Self {
            style: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            autocompleted: None,
        }
    }

    pub fn is_autocompleted(&self) -> bool {
        self.autocompleted.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Segment {
    text: String,
    attrs: Attributes,
}

impl Segment {
    fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// An ordered run-list of (text, attributes) segments with range-based
/// read/replace operations. All offsets are char offsets, ranges half-open.
///
/// Mutations inside a `begin_editing`/`end_editing` bracket coalesce into a
/// single revision bump, so observers see one consolidated change per
/// logical operation.
#[derive(Debug, Clone, Default)]
pub struct AttributedBuffer {
    segments: Vec<Segment>,
    revision: u64,
    edit_depth: u32,
    dirty: bool,
}

fn push_run(out: &mut Vec<Segment>, text: &str, attrs: &Attributes) {
    if text.is_empty() {
        return;
    }
    if let Some(last) = out.last_mut() {
        if last.attrs == *attrs {
            last.text.push_str(text);
            return;
        }
    }
    out.push(Segment {
        text: text.to_string(),
        attrs: attrs.clone(),
    });
}

impl AttributedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer length in chars.
    pub fn len(&self) -> usize {
        self.segments.iter().map(Segment::char_len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn text(&self) -> String {
        self.segments.iter().map(|s| s.text.as_str()).collect()
    }

    /// Revision counter; advances once per consolidated mutation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn begin_editing(&mut self) {
        self.edit_depth += 1;
    }

    pub fn end_editing(&mut self) {
        if self.edit_depth == 0 {
            return;
        }
        self.edit_depth -= 1;
        if self.edit_depth == 0 && self.dirty {
            self.dirty = false;
            self.revision += 1;
        }
    }

    fn touch(&mut self) {
        if self.edit_depth == 0 {
            self.revision += 1;
        } else {
            self.dirty = true;
        }
    }

    /// Attributes of the char at `pos`, or `None` past the end.
    pub fn attributes_at(&self, pos: usize) -> Option<&Attributes> {
        let mut start = 0;
        for seg in &self.segments {
            let end = start + seg.char_len();
            if pos < end {
                return Some(&seg.attrs);
            }
            start = end;
        }
        None
    }

    /// Plain-text copy of a char range. Out-of-range ends are clamped.
    pub fn slice(&self, range: Range<usize>) -> String {
        let mut out = Vec::new();
        self.copy_range(range, &mut out);
        out.into_iter().map(|s| s.text).collect()
    }

    fn copy_range(&self, range: Range<usize>, out: &mut Vec<Segment>) {
        let mut start = 0;
        for seg in &self.segments {
            let seg_len = seg.char_len();
            let seg_start = start;
            let seg_end = start + seg_len;
            start = seg_end;
            if seg_end <= range.start {
                continue;
            }
            if seg_start >= range.end {
                break;
            }
            let from = range.start.max(seg_start) - seg_start;
            let to = range.end.min(seg_end) - seg_start;
            let piece: String = seg.text.chars().skip(from).take(to - from).collect();
            push_run(out, &piece, &seg.attrs);
        }
    }

    /// Atomically replace a char range with `text` carrying `attrs`.
    ///
    /// Panics when the range falls outside the buffer: a caller computing
    /// such a range holds corrupted state and there is no sane recovery.
    pub fn replace_range(&mut self, range: Range<usize>, text: &str, attrs: &Attributes) {
        let len = self.len();
        assert!(
            range.start <= range.end && range.end <= len,
            "replace range {range:?} out of bounds (buffer length {len})"
        );
        let mut out = Vec::new();
        self.copy_range(0..range.start, &mut out);
        push_run(&mut out, text, attrs);
        self.copy_range(range.end..len, &mut out);
        self.segments = out;
        self.touch();
    }

    /// The maximal contiguous autocompleted span containing `pos`, together
    /// with its context payload. Adjacent spans committed from different
    /// candidates carry different payloads and are not merged.
    pub fn autocompleted_span_at(&self, pos: usize) -> Option<(Range<usize>, Value)> {
        let mut runs: Vec<(Range<usize>, &Attributes)> = Vec::new();
        let mut start = 0;
        for seg in &self.segments {
            let end = start + seg.char_len();
            runs.push((start..end, &seg.attrs));
            start = end;
        }
        let hit = runs
            .iter()
            .position(|(r, _)| r.start <= pos && pos < r.end)?;
        let ctx = runs[hit].1.autocompleted.as_ref()?;
        let mut lo = hit;
        while lo > 0 && runs[lo - 1].1.autocompleted.as_ref() == Some(ctx) {
            lo -= 1;
        }
        let mut hi = hit;
        while hi + 1 < runs.len() && runs[hi + 1].1.autocompleted.as_ref() == Some(ctx) {
            hi += 1;
        }
        Some((runs[lo].0.start..runs[hi].0.end, ctx.clone()))
    }
}

// ─── Text View ───────────────────────────────────────────────────────────────

/// Stand-in for the host text widget: a mutable attributed buffer plus an
/// insertion cursor and the attribute set applied to newly typed text.
///
/// The controller holds only a weak handle to this; the host owns it.
#[derive(Debug, Default)]
pub struct TextView {
    pub buffer: AttributedBuffer,
    cursor: usize,
    typing_attributes: Attributes,
}

impl TextView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(text: &str, attrs: Attributes) -> Self {
        let mut buffer = AttributedBuffer::new();
        buffer.replace_range(0..0, text, &attrs);
        let cursor = buffer.len();
        Self {
            buffer,
            cursor,
            typing_attributes: attrs,
        }
    }

    pub fn text(&self) -> String {
        self.buffer.text()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Move the insertion cursor, clamped to the buffer.
    pub fn set_cursor(&mut self, pos: usize) {
        self.cursor = pos.min(self.buffer.len());
    }

    pub fn typing_attributes(&self) -> &Attributes {
        &self.typing_attributes
    }

    pub fn set_typing_attributes(&mut self, attrs: Attributes) {
        self.typing_attributes = attrs;
    }
}

// ─── Candidates & Sessions ───────────────────────────────────────────────────

/// A selectable completion: replacement text plus an opaque context payload
/// the host attached (user id, file path, anything serializable).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub text: String,
    #[serde(default)]
    pub context: Value,
}

impl Candidate {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            context: Value::Null,
        }
    }

    pub fn with_context(text: impl Into<String>, context: Value) -> Self {
        Self {
            text: text.into(),
            context,
        }
    }
}

/// One in-progress completion attempt: the trigger prefix, where it sits in
/// the buffer, and the filter text typed after it.
///
/// Two sessions are equal iff they share prefix and range — that is what
/// "the same session is still active" means across reloads; filter and
/// selection state are deliberately ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    prefix: String,
    range: Range<usize>,
    filter: String,
    space_counter: i64,
    completion: Option<Candidate>,
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.prefix == other.prefix && self.range == other.range
    }
}

impl Session {
    fn new(prefix: String, range: Range<usize>, filter: String) -> Self {
        Self {
            prefix,
            range,
            filter,
            space_counter: 0,
            completion: None,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Half-open char span of the prefix itself.
    pub fn range(&self) -> Range<usize> {
        self.range.clone()
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    /// Net spaces typed minus spaces deleted since the session started.
    pub fn space_counter(&self) -> i64 {
        self.space_counter
    }

    pub fn completion(&self) -> Option<&Candidate> {
        self.completion.as_ref()
    }
}

// ─── Configuration ───────────────────────────────────────────────────────────

/// A class of chars that terminates an open session when typed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DelimiterClass {
    Whitespace,
    Newline,
    Char(char),
}

impl DelimiterClass {
    pub fn matches(&self, c: char) -> bool {
        match self {
            DelimiterClass::Whitespace => c.is_whitespace(),
            DelimiterClass::Newline => c == '\n' || c == '\r',
            DelimiterClass::Char(d) => c == *d,
        }
    }
}

fn is_plain_space(c: char) -> bool {
    c.is_whitespace() && c != '\n' && c != '\r'
}

/// Process-wide autocomplete configuration, set by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutocompleteConfig {
    prefixes: BTreeMap<String, Option<Attributes>>,
    delimiters: BTreeSet<DelimiterClass>,
    /// Case sensitivity of substring candidate filtering.
    pub case_sensitive: bool,
    /// Append a single default-attributed space after a committed completion.
    pub append_space_on_completion: bool,
    /// Keep the trigger prefix in front of the committed completion text.
    pub keep_prefix_on_completion: bool,
    /// Net spaces tolerated inside a session before it ends.
    pub max_space_count_during_completion: u32,
    /// Attributes for ordinary (non-completed) text.
    pub default_attributes: Attributes,
}

impl Default for AutocompleteConfig {
    fn default() -> Self {
        Self {
            prefixes: BTreeMap::new(),
            delimiters: [DelimiterClass::Whitespace, DelimiterClass::Newline]
                .into_iter()
                .collect(),
            case_sensitive: false,
            append_space_on_completion: true,
            keep_prefix_on_completion: true,
            max_space_count_during_completion: 0,
            default_attributes: Attributes::default(),
        }
    }
}

impl AutocompleteConfig {
    /// Register a trigger prefix, optionally with the attribute map applied
    /// to completions committed for it.
    pub fn register_prefix(
        &mut self,
        prefix: impl Into<String>,
        attributes: Option<Attributes>,
    ) -> Result<()> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(Error::EmptyPrefix);
        }
        self.prefixes.insert(prefix, attributes);
        Ok(())
    }

    pub fn unregister_prefix(&mut self, prefix: &str) {
        self.prefixes.remove(prefix);
    }

    pub fn prefixes(&self) -> impl Iterator<Item = &str> {
        self.prefixes.keys().map(String::as_str)
    }

    pub fn prefix_attributes(&self, prefix: &str) -> Option<&Attributes> {
        self.prefixes.get(prefix).and_then(|a| a.as_ref())
    }

    pub fn register_delimiter(&mut self, class: DelimiterClass) {
        self.delimiters.insert(class);
    }

    pub fn unregister_delimiter(&mut self, class: &DelimiterClass) {
        self.delimiters.remove(class);
    }

    pub fn is_delimiter(&self, c: char) -> bool {
        self.delimiters.iter().any(|d| d.matches(c))
    }
}

// ─── Collaborator Interfaces ─────────────────────────────────────────────────

/// A renderer-agnostic dropdown row; presenters turn these into widgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListRow {
    pub text: String,
    pub detail: Option<String>,
}

/// Supplies the candidate list per prefix and, optionally, custom rows.
pub trait CandidateSource {
    fn candidates(&self, prefix: &str) -> Vec<Candidate>;

    /// Row for the candidate at `index` of the visible list.
    fn cell(&self, session: &Session, candidate: &Candidate, index: usize) -> ListRow {
        let _ = (session, index);
        ListRow {
            text: candidate.text.clone(),
            detail: None,
        }
    }
}

/// Static per-prefix candidate lists, the common host setup.
#[derive(Debug, Clone, Default)]
pub struct StaticCandidateSource {
    by_prefix: BTreeMap<String, Vec<Candidate>>,
}

impl StaticCandidateSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_candidates(&mut self, prefix: impl Into<String>, candidates: Vec<Candidate>) {
        self.by_prefix.insert(prefix.into(), candidates);
    }
}

impl CandidateSource for StaticCandidateSource {
    fn candidates(&self, prefix: &str) -> Vec<Candidate> {
        self.by_prefix.get(prefix).cloned().unwrap_or_default()
    }
}

/// Synchronous lifecycle permissions and notifications. Every method has a
/// permissive default so hosts implement only what they care about.
pub trait AutocompleteDelegate {
    fn should_register(&mut self, prefix: &str, range: &Range<usize>) -> bool {
        let _ = (prefix, range);
        true
    }

    fn should_unregister(&mut self, prefix: &str) -> bool {
        let _ = prefix;
        true
    }

    fn should_complete(&mut self, prefix: &str, filter: &str) -> bool {
        let _ = (prefix, filter);
        true
    }

    fn visibility_changed(&mut self, visible: bool) {
        let _ = visible;
    }
}

/// Optional host veto over every proposed edit, consulted before any other
/// interception rule. Receives the full post-edit text.
pub trait EditValidator {
    fn can_change_text(&self, proposed: &str) -> bool;
}

/// Re-render trigger for the candidate list widget. Presenters pull
/// `visible_rows()` from the controller when they actually redraw.
pub trait ListPresenter {
    fn reload_list(&mut self);
}

// ─── Filter Engine ───────────────────────────────────────────────────────────

/// Candidates whose text contains `filter` as a substring, source order
/// preserved. An empty filter passes the list through untouched.
pub fn filter_candidates(
    candidates: Vec<Candidate>,
    filter: &str,
    case_sensitive: bool,
) -> Vec<Candidate> {
    if filter.is_empty() {
        return candidates;
    }
    if case_sensitive {
        candidates
            .into_iter()
            .filter(|c| c.text.contains(filter))
            .collect()
    } else {
        let needle = filter.to_lowercase();
        candidates
            .into_iter()
            .filter(|c| c.text.to_lowercase().contains(&needle))
            .collect()
    }
}

// ─── Prefix Scan ─────────────────────────────────────────────────────────────

/// Find the occurrence of a registered prefix nearest the cursor that is
/// followed only by delimiter-free text up to the cursor. Longer prefixes
/// win at the same position.
fn scan_for_prefix(
    chars: &[char],
    cursor: usize,
    prefixes: &[String],
    is_delimiter: impl Fn(char) -> bool,
) -> Option<(String, Range<usize>, String)> {
    let cursor = cursor.min(chars.len());
    let mut ordered: Vec<&String> = prefixes.iter().collect();
    ordered.sort_by(|a, b| b.chars().count().cmp(&a.chars().count()));
    for start in (0..cursor).rev() {
        for prefix in &ordered {
            let pc: Vec<char> = prefix.chars().collect();
            if start + pc.len() > cursor {
                continue;
            }
            if chars[start..start + pc.len()] != pc[..] {
                continue;
            }
            let body = &chars[start + pc.len()..cursor];
            if body.iter().copied().any(&is_delimiter) {
                continue;
            }
            return Some((
                prefix.to_string(),
                start..start + pc.len(),
                body.iter().collect(),
            ));
        }
    }
    None
}

// ─── Controller ──────────────────────────────────────────────────────────────

/// Outcome of edit interception for one proposed buffer change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditDecision {
    /// The host should apply the edit as proposed.
    Proceed,
    /// The controller rewrote the buffer itself; drop the proposed edit.
    Handled,
    /// The edit was vetoed; nothing changed.
    Rejected,
}

/// Single authority over the active completion session: watches buffer
/// changes, intercepts edits that touch autocompleted spans, and commits
/// chosen candidates back into the buffer.
///
/// Single-threaded by construction; every operation runs synchronously on
/// the host's event loop.
pub struct AutocompleteController {
    config: AutocompleteConfig,
    view: Weak<RefCell<TextView>>,
    source: Option<Rc<dyn CandidateSource>>,
    delegate: Option<Rc<RefCell<dyn AutocompleteDelegate>>>,
    validator: Option<Rc<dyn EditValidator>>,
    presenter: Option<Rc<RefCell<dyn ListPresenter>>>,
    session: Option<Session>,
    previous_session: Option<Session>,
}

impl AutocompleteController {
    pub fn new() -> Self {
        Self::with_config(AutocompleteConfig::default())
    }

    pub fn with_config(config: AutocompleteConfig) -> Self {
        Self {
            config,
            view: Weak::new(),
            source: None,
            delegate: None,
            validator: None,
            presenter: None,
            session: None,
            previous_session: None,
        }
    }

    pub fn config(&self) -> &AutocompleteConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut AutocompleteConfig {
        &mut self.config
    }

    /// Bind the host text view. The controller never owns its lifetime.
    pub fn attach_view(&mut self, view: &Rc<RefCell<TextView>>) {
        self.view = Rc::downgrade(view);
    }

    pub fn detach_view(&mut self) {
        self.view = Weak::new();
    }

    pub fn set_source(&mut self, source: Rc<dyn CandidateSource>) {
        self.source = Some(source);
    }

    pub fn set_delegate(&mut self, delegate: Rc<RefCell<dyn AutocompleteDelegate>>) {
        self.delegate = Some(delegate);
    }

    pub fn set_validator(&mut self, validator: Rc<dyn EditValidator>) {
        self.validator = Some(validator);
    }

    pub fn set_presenter(&mut self, presenter: Rc<RefCell<dyn ListPresenter>>) {
        self.presenter = Some(presenter);
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Whether the candidate list should currently be visible.
    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    fn upgrade_view(&self) -> Option<Rc<RefCell<TextView>>> {
        self.view.upgrade()
    }

    // ── session lifecycle ──

    /// Re-derive the active session from the buffer. Call after every
    /// buffer mutation.
    pub fn reload(&mut self) {
        let Some(view) = self.upgrade_view() else {
            return;
        };
        let (chars, cursor) = {
            let v = view.borrow();
            (v.buffer.text().chars().collect::<Vec<char>>(), v.cursor())
        };
        let prefixes: Vec<String> = self.config.prefixes.keys().cloned().collect();
        let delimiters = self.config.delimiters.clone();
        let found = scan_for_prefix(&chars, cursor, &prefixes, |c| {
            delimiters.iter().any(|d| d.matches(c))
        });

        match found {
            Some((prefix, range, filter)) => {
                let descriptor = Session::new(prefix, range, filter);
                let same = self.session.as_ref().is_some_and(|c| *c == descriptor);
                if self.session.is_none() {
                    self.register_session(descriptor);
                } else if same {
                    if let Some(current) = self.session.as_mut() {
                        current.filter = descriptor.filter;
                    }
                    self.notify_visibility(true);
                    self.reload_presenter();
                } else {
                    // Cursor jumped to a different trigger occurrence.
                    self.unregister_session();
                    if self.session.is_none() {
                        self.register_session(descriptor);
                    }
                }
            }
            None => {
                let tolerant = self.session.as_ref().and_then(|s| {
                    if s.space_counter <= i64::from(self.config.max_space_count_during_completion)
                    {
                        let own = vec![s.prefix.clone()];
                        scan_for_prefix(&chars, cursor, &own, |c| {
                            delimiters.iter().any(|d| d.matches(c)) && !is_plain_space(c)
                        })
                    } else {
                        None
                    }
                });
                match tolerant {
                    Some((_, _, filter)) => {
                        // Space-tolerant continuation of the active session.
                        if let Some(s) = self.session.as_mut() {
                            s.filter = filter;
                        }
                        self.notify_visibility(true);
                        self.reload_presenter();
                    }
                    None => self.unregister_session(),
                }
            }
        }
    }

    /// Unconditionally end the active session (host lost focus, etc.).
    pub fn invalidate(&mut self) {
        self.end_session();
    }

    /// Append an externally supplied payload to the buffer with default
    /// attributes, then reload. The payload must be a JSON string.
    pub fn handle_input(&mut self, payload: &Value) -> Result<()> {
        let text = payload.as_str().ok_or(Error::NotText)?;
        let view = self.upgrade_view().ok_or(Error::Unbound)?;
        {
            let mut v = view.borrow_mut();
            let len = v.buffer.len();
            let attrs = self.config.default_attributes.clone();
            v.buffer.replace_range(len..len, text, &attrs);
            let end = v.buffer.len();
            v.set_cursor(end);
        }
        self.reload();
        Ok(())
    }

    fn register_session(&mut self, descriptor: Session) {
        if !self.delegate_should_register(&descriptor) {
            return;
        }
        let restored = match self.previous_session.take() {
            Some(prev) if prev == descriptor => Some(prev),
            other => {
                self.previous_session = other;
                None
            }
        };
        // A matching just-ended session is restored with its in-flight
        // filter and selection intact.
        let session = restored.unwrap_or(descriptor);
        tracing::debug!(prefix = %session.prefix, range = ?session.range, filter = %session.filter, "session registered");
        self.session = Some(session);
        self.notify_visibility(true);
        self.reload_presenter();
    }

    fn unregister_session(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if !self.delegate_should_unregister(&session.prefix) {
            self.session = Some(session);
            return;
        }
        tracing::debug!(prefix = %session.prefix, "session unregistered");
        self.previous_session = Some(session);
        self.notify_visibility(false);
        self.reload_presenter();
    }

    /// End without asking the delegate: commit, interception, and
    /// invalidation all end the session as a fact, not a question.
    fn end_session(&mut self) {
        if let Some(session) = self.session.take() {
            tracing::debug!(prefix = %session.prefix, "session ended");
            self.previous_session = Some(session);
            self.notify_visibility(false);
            self.reload_presenter();
        }
    }

    // ── candidate list ──

    /// The filtered candidate list for the active session.
    pub fn visible_candidates(&self) -> Vec<Candidate> {
        let (Some(session), Some(source)) = (&self.session, &self.source) else {
            return Vec::new();
        };
        filter_candidates(
            source.candidates(&session.prefix),
            &session.filter,
            self.config.case_sensitive,
        )
    }

    /// Presenter-facing rows for the visible candidates.
    pub fn visible_rows(&self) -> Vec<ListRow> {
        let (Some(session), Some(source)) = (&self.session, &self.source) else {
            return Vec::new();
        };
        self.visible_candidates()
            .iter()
            .enumerate()
            .map(|(i, c)| source.cell(session, c, i))
            .collect()
    }

    /// Attach the indexed visible candidate as the session's selection.
    pub fn select_row(&mut self, index: usize) -> bool {
        let visible = self.visible_candidates();
        let Some(candidate) = visible.get(index).cloned() else {
            return false;
        };
        match self.session.as_mut() {
            Some(s) => {
                s.completion = Some(candidate);
                true
            }
            None => false,
        }
    }

    // ── commit ──

    /// Commit the session's selected candidate, if any.
    pub fn complete_selected(&mut self) -> bool {
        let Some(candidate) = self.session.as_ref().and_then(|s| s.completion.clone()) else {
            return false;
        };
        self.complete(candidate)
    }

    /// Rewrite the buffer with the chosen candidate and end the session.
    ///
    /// The replaced range covers the prefix plus the typed filter; the
    /// replacement re-inserts the prefix when `keep_prefix_on_completion`
    /// is set. The inserted span carries the per-prefix attribute map (or
    /// the defaults) plus the autocompleted marker with the candidate's
    /// context, all inside one editing bracket.
    pub fn complete(&mut self, candidate: Candidate) -> bool {
        let Some(view) = self.upgrade_view() else {
            return false;
        };
        let Some(session) = self.session.clone() else {
            return false;
        };
        if !self.delegate_should_complete(&session) {
            return false;
        }
        let prefix_len = session.prefix.chars().count();
        let filter_len = session.filter.chars().count();
        let replaced = session.range.start..session.range.start + prefix_len + filter_len;
        let mut text = String::new();
        if self.config.keep_prefix_on_completion {
            text.push_str(&session.prefix);
        }
        text.push_str(&candidate.text);
        let mut attrs = self
            .config
            .prefix_attributes(&session.prefix)
            .cloned()
            .unwrap_or_else(|| self.config.default_attributes.clone());
        attrs.autocompleted = Some(candidate.context.clone());
        {
            let mut v = view.borrow_mut();
            assert!(
                replaced.end <= v.buffer.len(),
                "completion range {replaced:?} exceeds buffer length {}",
                v.buffer.len()
            );
            v.buffer.begin_editing();
            v.buffer.replace_range(replaced.clone(), &text, &attrs);
            let mut cursor = replaced.start + text.chars().count();
            if self.config.append_space_on_completion {
                v.buffer
                    .replace_range(cursor..cursor, " ", &self.config.default_attributes);
                cursor += 1;
            }
            v.buffer.end_editing();
            v.set_cursor(cursor);
        }
        tracing::debug!(prefix = %session.prefix, completion = %candidate.text, "completion committed");
        if let Some(s) = self.session.as_mut() {
            s.completion = Some(candidate);
        }
        self.end_session();
        true
    }

    // ── edit interception ──

    /// Evaluate a proposed buffer edit before the host applies it.
    ///
    /// `Proceed` means the host should apply the edit itself; `Handled`
    /// means the controller already rewrote the buffer; `Rejected` means
    /// nothing may change.
    pub fn should_change_text(&mut self, range: Range<usize>, replacement: &str) -> EditDecision {
        let Some(view) = self.upgrade_view() else {
            return EditDecision::Proceed;
        };
        let buf_len = view.borrow().buffer.len();
        let range = clamp_range(&range, buf_len);

        // Host veto comes before everything else.
        if let Some(validator) = &self.validator {
            let proposed = {
                let v = view.borrow();
                let mut t = v.buffer.slice(0..range.start);
                t.push_str(replacement);
                t.push_str(&v.buffer.slice(range.end..buf_len));
                t
            };
            if !validator.can_change_text(&proposed) {
                tracing::debug!(range = ?range, "edit vetoed by validator");
                return EditDecision::Rejected;
            }
        }

        // Newly typed text never inherits autocompleted styling.
        view.borrow_mut()
            .set_typing_attributes(self.config.default_attributes.clone());

        if self.session.is_some() {
            let removed = view
                .borrow()
                .buffer
                .slice(range.clone())
                .chars()
                .filter(|c| *c == ' ')
                .count() as i64;
            let inserted = replacement.chars().filter(|c| *c == ' ').count() as i64;
            if let Some(s) = self.session.as_mut() {
                s.space_counter += inserted - removed;
            }
        }

        let cursor = view.borrow().cursor();

        // Marked spans intersecting the proposed range. Probing both ends
        // is enough: a span strictly inside the range is rewritten whole
        // by the edit itself and cannot leave a remnant.
        let touched: Vec<Range<usize>> = {
            let v = view.borrow();
            let mut spans = Vec::new();
            let last = if range.start < range.end {
                range.end - 1
            } else {
                range.start
            };
            for pos in [range.start, last] {
                if let Some((span, _)) = v.buffer.autocompleted_span_at(pos) {
                    if !spans.contains(&span) {
                        spans.push(span);
                    }
                }
            }
            spans
        };

        // Deletion overlapping autocompleted spans removes each whole span:
        // the rewrite covers the union of the range and every touched span.
        if replacement.is_empty()
            && range.start < range.end
            && range.start < cursor
            && !touched.is_empty()
        {
            let union = touched
                .iter()
                .fold(range.clone(), |acc, s| {
                    acc.start.min(s.start)..acc.end.max(s.end)
                });
            {
                let mut v = view.borrow_mut();
                v.buffer.begin_editing();
                v.buffer
                    .replace_range(union.clone(), "", &self.config.default_attributes);
                v.buffer.end_editing();
                v.set_cursor(union.start);
            }
            tracing::debug!(span = ?union, "autocompleted span deleted atomically");
            self.end_session();
            return EditDecision::Handled;
        }

        // Typing over or into autocompleted spans strips their marking
        // before the edit applies.
        if !touched.is_empty() {
            {
                let mut v = view.borrow_mut();
                v.buffer.begin_editing();
                for span in &touched {
                    let span_text = v.buffer.slice(span.clone());
                    v.buffer
                        .replace_range(span.clone(), &span_text, &self.config.default_attributes);
                }
                v.buffer
                    .replace_range(range.clone(), replacement, &self.config.default_attributes);
                v.buffer.end_editing();
                v.set_cursor(range.start + replacement.chars().count());
            }
            tracing::debug!(spans = ?touched, "autocompleted spans demoted by edit");
            self.end_session();
            return EditDecision::Handled;
        }

        EditDecision::Proceed
    }

    /// Host edit loop: interception, default application, reload.
    pub fn apply_edit(&mut self, range: Range<usize>, replacement: &str) -> EditDecision {
        let decision = self.should_change_text(range.clone(), replacement);
        match decision {
            EditDecision::Proceed => {
                if let Some(view) = self.upgrade_view() {
                    {
                        let mut v = view.borrow_mut();
                        let len = v.buffer.len();
                        let range = clamp_range(&range, len);
                        let attrs = v.typing_attributes().clone();
                        v.buffer.replace_range(range.clone(), replacement, &attrs);
                        v.set_cursor(range.start + replacement.chars().count());
                    }
                    self.reload();
                }
            }
            EditDecision::Handled => self.reload(),
            EditDecision::Rejected => {}
        }
        decision
    }

    /// Insert text at the cursor through the interception pipeline.
    pub fn insert_at_cursor(&mut self, text: &str) -> EditDecision {
        let Some(view) = self.upgrade_view() else {
            return EditDecision::Proceed;
        };
        let cursor = view.borrow().cursor();
        self.apply_edit(cursor..cursor, text)
    }

    /// Delete one char before the cursor through the interception pipeline.
    pub fn delete_backward(&mut self) -> EditDecision {
        let Some(view) = self.upgrade_view() else {
            return EditDecision::Proceed;
        };
        let cursor = view.borrow().cursor();
        if cursor == 0 {
            return EditDecision::Proceed;
        }
        self.apply_edit(cursor - 1..cursor, "")
    }

    // ── collaborators ──

    fn delegate_should_register(&self, session: &Session) -> bool {
        match &self.delegate {
            Some(d) => d
                .borrow_mut()
                .should_register(&session.prefix, &session.range),
            None => true,
        }
    }

    fn delegate_should_unregister(&self, prefix: &str) -> bool {
        match &self.delegate {
            Some(d) => d.borrow_mut().should_unregister(prefix),
            None => true,
        }
    }

    fn delegate_should_complete(&self, session: &Session) -> bool {
        match &self.delegate {
            Some(d) => d
                .borrow_mut()
                .should_complete(&session.prefix, &session.filter),
            None => true,
        }
    }

    fn notify_visibility(&self, visible: bool) {
        if let Some(d) = &self.delegate {
            d.borrow_mut().visibility_changed(visible);
        }
    }

    fn reload_presenter(&self) {
        if let Some(p) = &self.presenter {
            p.borrow_mut().reload_list();
        }
    }
}

impl Default for AutocompleteController {
    fn default() -> Self {
        Self::new()
    }
}

fn clamp_range(range: &Range<usize>, len: usize) -> Range<usize> {
    let start = range.start.min(len);
    let end = range.end.min(len).max(start);
    start..end
}

// ─── Tests ───────────────────────────────────────────────────────────────────
