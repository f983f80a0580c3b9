//! Trigger detection
//!
//! After an edit, rows and columns are concatenated and searched for the
//! trigger literals. A full scan looks at the whole grid; a windowed scan only
//! at lines within a radius of the edited cell, so its cost does not grow with
//! the grid (a literal crossing the window edge is missed).

use std::fmt;
use std::ops::Range;

use rayon::prelude::*;

use crate::canvas::constants::detection;
use crate::canvas::grid::{Grid, Line};

/// Effect-starting literal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trigger {
    Bomb,
    Fill,
}

impl Trigger {
    /// Detection priority order
    pub const ALL: [Trigger; 2] = [Trigger::Bomb, Trigger::Fill];

    pub fn literal(self) -> &'static str {
        match self {
            Trigger::Bomb => detection::BOMB_LITERAL,
            Trigger::Fill => detection::FILL_LITERAL,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.literal())
    }
}

/// How much of the grid a scan covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStrategy {
    Full,
    Windowed { radius: usize },
}

/// Which edits are scanned at all
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionGate {
    /// Scan after every edit
    Always,
    /// Scan only when the edited cell holds the trigger character
    TriggerChar,
}

impl DetectionGate {
    /// A client hint forces a scan either way
    pub fn should_scan(self, edited_cell: Option<&str>, hinted: bool) -> bool {
        hinted
            || match self {
                DetectionGate::Always => true,
                DetectionGate::TriggerChar => {
                    edited_cell.is_some_and(|cell| cell.contains(detection::TRIGGER_CHAR))
                }
            }
    }
}

/// A trigger literal found on one line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub trigger: Trigger,
    pub line: Line,
    /// Cells covered by the literal, `[start, end)` along the line
    pub span: Range<usize>,
}

/// Scans for triggers with a per-trigger strategy
#[derive(Debug, Clone, Copy)]
pub struct PatternDetector {
    bomb: ScanStrategy,
    fill: ScanStrategy,
}

impl PatternDetector {
    pub fn new(bomb: ScanStrategy, fill: ScanStrategy) -> Self {
        Self { bomb, fill }
    }

    pub fn strategy(&self, trigger: Trigger) -> ScanStrategy {
        match trigger {
            Trigger::Bomb => self.bomb,
            Trigger::Fill => self.fill,
        }
    }

    /// First trigger found around the edit at `(x, y)`.
    ///
    /// Bomb is looked for before fill and rows before columns; at most one
    /// detection is returned. The grid is never modified.
    pub fn detect(&self, grid: &Grid, x: usize, y: usize) -> Option<Detection> {
        Trigger::ALL.into_iter().find_map(|trigger| {
            scan(grid, trigger.literal(), self.strategy(trigger), x, y)
                .map(|(line, span)| Detection { trigger, line, span })
        })
    }
}

impl Default for PatternDetector {
    fn default() -> Self {
        Self::new(
            ScanStrategy::Windowed {
                radius: detection::SCAN_RADIUS,
            },
            ScanStrategy::Full,
        )
    }
}

/// Search rows, then columns, for `literal`
pub fn scan(
    grid: &Grid,
    literal: &str,
    strategy: ScanStrategy,
    x: usize,
    y: usize,
) -> Option<(Line, Range<usize>)> {
    let (rows, cols) = (grid.rows(), grid.cols());
    let (row_window, col_window) = match strategy {
        ScanStrategy::Full => (0..rows, 0..cols),
        ScanStrategy::Windowed { radius } => (
            x.saturating_sub(radius)..rows.min(x.saturating_add(radius)),
            y.saturating_sub(radius)..cols.min(y.saturating_add(radius)),
        ),
    };
    let parallel = strategy == ScanStrategy::Full;

    scan_lines(grid, literal, row_window.clone(), &col_window, Line::Row, parallel)
        .or_else(|| scan_lines(grid, literal, col_window, &row_window, Line::Column, parallel))
}

fn scan_lines(
    grid: &Grid,
    literal: &str,
    lines: Range<usize>,
    window: &Range<usize>,
    to_line: fn(usize) -> Line,
    parallel: bool,
) -> Option<(Line, Range<usize>)> {
    let probe = |i: usize| {
        let line = to_line(i);
        find_in_line(grid, line, window.clone(), literal).map(|span| (line, span))
    };

    if parallel {
        // find_map_first keeps the lowest index, same as the sequential scan
        lines.into_par_iter().find_map_first(probe)
    } else {
        lines.into_iter().find_map(probe)
    }
}

/// Concatenate the cells of `line` inside `window` and map a match back to cells
fn find_in_line(grid: &Grid, line: Line, window: Range<usize>, literal: &str) -> Option<Range<usize>> {
    let mut text = String::new();
    let mut starts = Vec::with_capacity(window.len());
    for cell in grid.line(line).skip(window.start).take(window.len()) {
        starts.push(text.len());
        text.push_str(cell);
    }

    let at = text.find(literal)?;
    let last_byte = at + literal.len() - 1;

    // Blank cells share their start with the next cell, so the last cell
    // starting at or before a byte is the one containing it.
    let first = starts.partition_point(|&s| s <= at) - 1;
    let last = starts.partition_point(|&s| s <= last_byte) - 1;

    Some(window.start + first..window.start + last + 1)
}
