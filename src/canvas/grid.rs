//! Shared grid store
//!
//! The grid is a fixed `rows x cols` array of short strings. `x` is the row
//! index and `y` the column index, matching the wire format.
//!
//! [`GridStore`] is the single writable owner of the grid. Readers get an
//! `Arc<Grid>` snapshot; writers go through one lock and copy-on-write, so a
//! snapshot handed out earlier never changes underneath its holder.

use std::ops::Range;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// A row or column of the grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line {
    Row(usize),
    Column(usize),
}

/// Errors for coordinates or shapes outside the configured grid
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BoundsError {
    #[error("cell ({x}, {y}) is outside the {rows}x{cols} grid")]
    Cell {
        x: usize,
        y: usize,
        rows: usize,
        cols: usize,
    },
    #[error("{line:?} is outside the {rows}x{cols} grid")]
    Line { line: Line, rows: usize, cols: usize },
    #[error("grid shape does not match the expected {rows}x{cols}")]
    Shape { rows: usize, cols: usize },
}

/// Row-major grid of cell values; `""` is a blank cell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Grid {
    cells: Vec<Vec<String>>,
}

impl Grid {
    /// Create a blank grid
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            cells: vec![vec![String::new(); cols]; rows],
        }
    }

    /// Wrap raw rows without checking their shape (see [`Grid::has_shape`])
    pub fn from_rows(cells: Vec<Vec<String>>) -> Self {
        Self { cells }
    }

    pub fn rows(&self) -> usize {
        self.cells.len()
    }

    pub fn cols(&self) -> usize {
        self.cells.first().map_or(0, Vec::len)
    }

    /// True if there are exactly `rows` rows of exactly `cols` cells
    pub fn has_shape(&self, rows: usize, cols: usize) -> bool {
        self.cells.len() == rows && self.cells.iter().all(|row| row.len() == cols)
    }

    pub fn cells(&self) -> &[Vec<String>] {
        &self.cells
    }

    pub fn get(&self, x: usize, y: usize) -> Option<&str> {
        self.cells.get(x).and_then(|row| row.get(y)).map(String::as_str)
    }

    pub fn set(&mut self, x: usize, y: usize, value: impl Into<String>) -> Result<(), BoundsError> {
        let (rows, cols) = (self.rows(), self.cols());
        let cell = self
            .cells
            .get_mut(x)
            .and_then(|row| row.get_mut(y))
            .ok_or(BoundsError::Cell { x, y, rows, cols })?;
        *cell = value.into();
        Ok(())
    }

    /// Blank every cell
    pub fn clear(&mut self) {
        for cell in self.cells.iter_mut().flatten() {
            cell.clear();
        }
    }

    pub fn is_blank(&self) -> bool {
        self.cells.iter().flatten().all(String::is_empty)
    }

    /// Iterate the cells of one row or column
    pub fn line(&self, line: Line) -> Box<dyn Iterator<Item = &str> + '_> {
        match line {
            Line::Row(x) => Box::new(
                self.cells
                    .get(x)
                    .into_iter()
                    .flatten()
                    .map(String::as_str),
            ),
            Line::Column(y) => Box::new(
                self.cells
                    .iter()
                    .filter_map(move |row| row.get(y))
                    .map(String::as_str),
            ),
        }
    }
}

/// Lock-guarded owner of the canvas grid
pub struct GridStore {
    rows: usize,
    cols: usize,
    grid: RwLock<Arc<Grid>>,
}

impl GridStore {
    /// Create a store holding a blank `rows x cols` grid
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            grid: RwLock::new(Arc::new(Grid::new(rows, cols))),
        }
    }

    /// Configured `(rows, cols)`
    pub fn dimensions(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Point-in-time snapshot of the grid
    pub fn read(&self) -> Arc<Grid> {
        self.grid.read().clone()
    }

    /// Swap in a whole new grid of the configured shape
    pub fn replace_all(&self, grid: impl Into<Arc<Grid>>) -> Result<(), BoundsError> {
        let grid = grid.into();
        if !grid.has_shape(self.rows, self.cols) {
            return Err(self.shape_error());
        }
        *self.grid.write() = grid;
        Ok(())
    }

    /// Set one cell. Out-of-range coordinates are rejected, never clamped.
    pub fn set_cell(&self, x: usize, y: usize, value: impl Into<String>) -> Result<(), BoundsError> {
        self.check_cell(x, y)?;
        let mut guard = self.grid.write();
        Arc::make_mut(&mut guard).set(x, y, value)
    }

    /// Blank every cell and return the resulting snapshot
    pub fn clear_all(&self) -> Arc<Grid> {
        let mut guard = self.grid.write();
        Arc::make_mut(&mut guard).clear();
        guard.clone()
    }

    /// Overwrite consecutive rows starting at `start` and return the resulting snapshot
    pub fn write_rows(&self, start: usize, rows: Vec<Vec<String>>) -> Result<Arc<Grid>, BoundsError> {
        if start + rows.len() > self.rows || rows.iter().any(|row| row.len() != self.cols) {
            return Err(self.shape_error());
        }
        let mut guard = self.grid.write();
        let grid = Arc::make_mut(&mut guard);
        for (offset, row) in rows.into_iter().enumerate() {
            grid.cells[start + offset] = row;
        }
        Ok(guard.clone())
    }

    /// Blank the cells `span` of one row or column
    pub fn clear_span(&self, line: Line, span: Range<usize>) -> Result<(), BoundsError> {
        let (index, extent, limit) = match line {
            Line::Row(x) => (x, self.rows, self.cols),
            Line::Column(y) => (y, self.cols, self.rows),
        };
        if index >= extent || span.end > limit || span.start > span.end {
            return Err(BoundsError::Line {
                line,
                rows: self.rows,
                cols: self.cols,
            });
        }

        let mut guard = self.grid.write();
        let grid = Arc::make_mut(&mut guard);
        for i in span {
            match line {
                Line::Row(x) => grid.cells[x][i].clear(),
                Line::Column(y) => grid.cells[i][y].clear(),
            }
        }
        Ok(())
    }

    fn check_cell(&self, x: usize, y: usize) -> Result<(), BoundsError> {
        if x < self.rows && y < self.cols {
            Ok(())
        } else {
            Err(BoundsError::Cell {
                x,
                y,
                rows: self.rows,
                cols: self.cols,
            })
        }
    }

    fn shape_error(&self) -> BoundsError {
        BoundsError::Shape {
            rows: self.rows,
            cols: self.cols,
        }
    }
}
