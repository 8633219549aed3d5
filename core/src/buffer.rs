//! Source buffer capability used by the session.
//!
//! The session never owns text of its own. It asks a [`SourceBuffer`] for the
//! text of a region and registers trackers on regions it has sent to the
//! verifier; the buffer keeps those trackers aligned with edits and reports
//! which of them an edit touched or structurally modified.
//!
//! [`TextDocument`] is the in-memory implementation used by the CLI and the
//! tests. Editor hosts supply their own implementation backed by their native
//! marker API.

use std::collections::BTreeMap;

use crate::position::Position;
use crate::position::Range;

/// Opaque handle to a range registered with [`SourceBuffer::track`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TrackerId(pub u64);

/// How an edit affected one tracked range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeChange {
    pub tracker: TrackerId,
    /// The edit overlapped the tracked text or inserted into it. Edits that
    /// merely touch the boundary (typing right after the range) leave this
    /// false.
    pub text_changed: bool,
}

/// Text access plus range tracking, the minimum the session needs from a host.
pub trait SourceBuffer {
    /// Text of `range`, lines joined with `\n`. Out-of-bounds positions clamp.
    fn text_in_range(&self, range: Range) -> String;

    /// Position just past the last character of the buffer.
    fn end_position(&self) -> Position;

    /// Text of a single line without its terminator, `None` past the end.
    fn line_text(&self, line: u32) -> Option<String>;

    /// Starts tracking `range` across edits.
    fn track(&mut self, range: Range) -> TrackerId;

    /// Current extent of a tracked range, `None` once untracked.
    fn tracked_range(&self, tracker: TrackerId) -> Option<Range>;

    fn untrack(&mut self, tracker: TrackerId);

    /// Replaces `range` with `text` and reports every tracked range the edit
    /// touched.
    fn replace(&mut self, range: Range, text: &str) -> Vec<RangeChange>;

    /// Clamps a position into the buffer.
    fn clamp(&self, position: Position) -> Position {
        let end = self.end_position();
        if position >= end {
            return end;
        }
        match self.line_text(position.line) {
            Some(line) => {
                let width = line.chars().count() as u32;
                Position::new(position.line, position.column.min(width))
            }
            None => end,
        }
    }
}

/// Line-vector document with tracked ranges.
#[derive(Debug, Clone)]
pub struct TextDocument {
    lines: Vec<String>,
    trackers: BTreeMap<TrackerId, Range>,
    next_tracker: u64,
}

impl Default for TextDocument {
    fn default() -> Self {
        Self::from_text("")
    }
}

impl TextDocument {
    pub fn from_text(text: &str) -> Self {
        Self {
            lines: text.split('\n').map(str::to_string).collect(),
            trackers: BTreeMap::new(),
            next_tracker: 1,
        }
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    pub fn line_count(&self) -> usize {
        self.lines.len()
    }

    /// Number of live trackers.
    pub fn tracker_count(&self) -> usize {
        self.trackers.len()
    }

    fn line_width(&self, line: usize) -> u32 {
        self.lines
            .get(line)
            .map_or(0, |text| text.chars().count() as u32)
    }

    fn clamp_point(&self, position: Position) -> Position {
        let last = self.lines.len().saturating_sub(1);
        let line = (position.line as usize).min(last);
        if (position.line as usize) > last {
            return Position::new(last as u32, self.line_width(last));
        }
        Position::new(line as u32, position.column.min(self.line_width(line)))
    }

    fn split_at(&self, position: Position) -> (String, String) {
        let line = &self.lines[position.line as usize];
        let offset = byte_offset(line, position.column);
        (line[..offset].to_string(), line[offset..].to_string())
    }
}

impl SourceBuffer for TextDocument {
    fn text_in_range(&self, range: Range) -> String {
        let start = self.clamp_point(range.start);
        let end = self.clamp_point(range.end);
        if start.line == end.line {
            let line = &self.lines[start.line as usize];
            let from = byte_offset(line, start.column);
            let to = byte_offset(line, end.column);
            return line[from..to].to_string();
        }

        let mut text = String::new();
        let first = &self.lines[start.line as usize];
        text.push_str(&first[byte_offset(first, start.column)..]);
        for line in &self.lines[start.line as usize + 1..end.line as usize] {
            text.push('\n');
            text.push_str(line);
        }
        let last = &self.lines[end.line as usize];
        text.push('\n');
        text.push_str(&last[..byte_offset(last, end.column)]);
        text
    }

    fn end_position(&self) -> Position {
        let last = self.lines.len().saturating_sub(1);
        Position::new(last as u32, self.line_width(last))
    }

    fn line_text(&self, line: u32) -> Option<String> {
        self.lines.get(line as usize).cloned()
    }

    fn track(&mut self, range: Range) -> TrackerId {
        let id = TrackerId(self.next_tracker);
        self.next_tracker += 1;
        let range = Range::new(self.clamp_point(range.start), self.clamp_point(range.end));
        self.trackers.insert(id, range);
        id
    }

    fn tracked_range(&self, tracker: TrackerId) -> Option<Range> {
        self.trackers.get(&tracker).copied()
    }

    fn untrack(&mut self, tracker: TrackerId) {
        self.trackers.remove(&tracker);
    }

    fn replace(&mut self, range: Range, text: &str) -> Vec<RangeChange> {
        let start = self.clamp_point(range.start);
        let end = self.clamp_point(range.end);
        let edit = Range { start, end };

        let (prefix, _) = self.split_at(start);
        let (_, suffix) = self.split_at(end);
        let mut inserted: Vec<String> = text.split('\n').map(str::to_string).collect();
        let new_end = match inserted.len() {
            1 => Position::new(start.line, start.column + text.chars().count() as u32),
            n => Position::new(
                start.line + (n as u32 - 1),
                inserted[n - 1].chars().count() as u32,
            ),
        };
        inserted[0] = format!("{prefix}{}", inserted[0]);
        if let Some(last) = inserted.last_mut() {
            last.push_str(&suffix);
        }
        self.lines
            .splice(start.line as usize..=end.line as usize, inserted);

        let mut changes = Vec::new();
        for (id, tracked) in self.trackers.iter_mut() {
            if tracked.touches(&edit) {
                changes.push(RangeChange {
                    tracker: *id,
                    text_changed: modifies(*tracked, edit),
                });
            }
            *tracked = Range {
                start: shift(tracked.start, edit, new_end, Bias::Right),
                end: shift(tracked.end, edit, new_end, Bias::Left),
            };
        }
        changes
    }
}

/// An edit structurally modifies a tracked range when it starts before the
/// range ends and reaches its start. Inserting exactly at the start counts,
/// appending at the end does not.
fn modifies(tracked: Range, edit: Range) -> bool {
    edit.start < tracked.end && edit.end >= tracked.start
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Bias {
    Left,
    Right,
}

/// Moves `point` to where it lands after `edit` was replaced by text ending at
/// `new_end`.
fn shift(point: Position, edit: Range, new_end: Position, bias: Bias) -> Position {
    if point < edit.start {
        return point;
    }
    if point == edit.start && (!edit.is_empty() || bias == Bias::Left) {
        return point;
    }
    if point < edit.end {
        return match bias {
            Bias::Left => edit.start,
            Bias::Right => new_end,
        };
    }
    if point.line == edit.end.line {
        Position::new(new_end.line, new_end.column + (point.column - edit.end.column))
    } else {
        let line = i64::from(point.line) + i64::from(new_end.line) - i64::from(edit.end.line);
        Position::new(line as u32, point.column)
    }
}

fn byte_offset(line: &str, column: u32) -> usize {
    line.char_indices()
        .nth(column as usize)
        .map_or(line.len(), |(offset, _)| offset)
}
