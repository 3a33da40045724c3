//! Spatial indexing for neighborhood queries over a toroidal plane.

use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors emitted by spatial index implementations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Indicates configuration values that cannot be used (e.g., non-positive cell size).
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The entity index is not present in the grid.
    #[error("unknown entity index {0}")]
    UnknownEntity(usize),
}

/// Wrap a coordinate into `[0, extent)`.
#[must_use]
pub fn wrap(value: f32, extent: f32) -> f32 {
    if extent <= 0.0 {
        return 0.0;
    }
    let mut v = value % extent;
    if v < 0.0 {
        v += extent;
    }
    v
}

/// Signed axis delta from `a` to `b`, taking the shortest path across the wrap boundary.
#[must_use]
pub fn toroidal_delta(a: f32, b: f32, extent: f32) -> f32 {
    let mut delta = b - a;
    if delta > extent * 0.5 {
        delta -= extent;
    } else if delta < -extent * 0.5 {
        delta += extent;
    }
    delta
}

/// Squared toroidal distance between two wrapped points.
#[must_use]
pub fn toroidal_distance_sq(a: (f32, f32), b: (f32, f32), width: f32, height: f32) -> f32 {
    let dx = toroidal_delta(a.0, b.0, width);
    let dy = toroidal_delta(a.1, b.1, height);
    dx * dx + dy * dy
}

/// Common behaviour exposed by neighborhood indices.
pub trait NeighborhoodIndex {
    /// Rebuild internal structures from entity positions. Positions are wrapped
    /// into the plane before bucketing.
    fn rebuild(&mut self, positions: &[(f32, f32)]) -> Result<(), IndexError>;

    /// Visit every stored entity whose toroidal distance to `query` is at most
    /// `radius`. When `include_center` is false, entities exactly at the query
    /// point are skipped. The visitor receives the entity's insertion index and
    /// its squared distance.
    fn neighbors_within(
        &self,
        query: (f32, f32),
        radius: f32,
        include_center: bool,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    );
}

/// Uniform grid over a toroidal rectangle. Cells wrap on both axes, so queries
/// near an edge see entities on the far side of the plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToroidalGrid {
    width: f32,
    height: f32,
    cell_size: f32,
    cols: usize,
    rows: usize,
    #[serde(skip)]
    buckets: Vec<Vec<usize>>,
    #[serde(skip)]
    positions: Vec<(f32, f32)>,
}

impl ToroidalGrid {
    /// Create a grid covering `width x height` with the given bucket edge length.
    pub fn new(cell_size: f32, width: f32, height: f32) -> Result<Self, IndexError> {
        if cell_size <= 0.0 {
            return Err(IndexError::InvalidConfig("cell_size must be positive"));
        }
        if width <= 0.0 || height <= 0.0 {
            return Err(IndexError::InvalidConfig(
                "plane dimensions must be positive",
            ));
        }
        let cols = (width / cell_size).ceil().max(1.0) as usize;
        let rows = (height / cell_size).ceil().max(1.0) as usize;
        Ok(Self {
            width,
            height,
            cell_size,
            cols,
            rows,
            buckets: vec![Vec::new(); cols * rows],
            positions: Vec::new(),
        })
    }

    /// Plane width in world units.
    #[must_use]
    pub const fn width(&self) -> f32 {
        self.width
    }

    /// Plane height in world units.
    #[must_use]
    pub const fn height(&self) -> f32 {
        self.height
    }

    /// Number of entities currently indexed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Returns true when no entities are indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Wrapped position of the entity at `index`, if present.
    #[must_use]
    pub fn position(&self, index: usize) -> Option<(f32, f32)> {
        self.positions.get(index).copied()
    }

    fn bucket_of(&self, pos: (f32, f32)) -> usize {
        let col = ((pos.0 / self.cell_size) as usize).min(self.cols - 1);
        let row = ((pos.1 / self.cell_size) as usize).min(self.rows - 1);
        row * self.cols + col
    }

    /// Insert a new entity at the next index, or relocate `entity` when it is
    /// already stored. The position is wrapped onto the plane first.
    pub fn place(&mut self, entity: usize, position: (f32, f32)) -> Result<(), IndexError> {
        if entity > self.positions.len() {
            return Err(IndexError::UnknownEntity(entity));
        }
        let wrapped = (wrap(position.0, self.width), wrap(position.1, self.height));
        if entity == self.positions.len() {
            self.positions.push(wrapped);
        } else {
            let old_bucket = self.bucket_of(self.positions[entity]);
            self.buckets[old_bucket].retain(|&idx| idx != entity);
            self.positions[entity] = wrapped;
        }
        let bucket = self.bucket_of(wrapped);
        self.buckets[bucket].push(entity);
        Ok(())
    }

    /// Apply a displacement to a stored entity, wrapping the result, and
    /// return the new position.
    pub fn move_by(
        &mut self,
        entity: usize,
        displacement: (f32, f32),
    ) -> Result<(f32, f32), IndexError> {
        let current = self
            .positions
            .get(entity)
            .copied()
            .ok_or(IndexError::UnknownEntity(entity))?;
        let target = (current.0 + displacement.0, current.1 + displacement.1);
        self.place(entity, target)?;
        Ok(self.positions[entity])
    }
}

impl NeighborhoodIndex for ToroidalGrid {
    fn rebuild(&mut self, positions: &[(f32, f32)]) -> Result<(), IndexError> {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
        self.positions.clear();
        self.positions.reserve(positions.len());
        for (idx, &(x, y)) in positions.iter().enumerate() {
            let wrapped = (wrap(x, self.width), wrap(y, self.height));
            let bucket = self.bucket_of(wrapped);
            self.buckets[bucket].push(idx);
            self.positions.push(wrapped);
        }
        Ok(())
    }

    fn neighbors_within(
        &self,
        query: (f32, f32),
        radius: f32,
        include_center: bool,
        visitor: &mut dyn FnMut(usize, OrderedFloat<f32>),
    ) {
        if radius < 0.0 || self.positions.is_empty() {
            return;
        }
        let query = (wrap(query.0, self.width), wrap(query.1, self.height));
        let radius_sq = radius * radius;
        let span = (radius / self.cell_size).ceil() as isize;
        let center_col = (query.0 / self.cell_size) as isize;
        let center_row = (query.1 / self.cell_size) as isize;
        let cols = self.cols as isize;
        let rows = self.rows as isize;

        // When the search span covers the whole grid the cell walk would repeat;
        // clamp it so each bucket is visited at most once.
        let col_span = span.min(cols / 2 + 1);
        let row_span = span.min(rows / 2 + 1);

        let mut seen_rows = 0;
        let mut row = center_row - row_span;
        while row <= center_row + row_span && seen_rows < rows {
            let wrapped_row = row.rem_euclid(rows) as usize;
            let mut seen_cols = 0;
            let mut col = center_col - col_span;
            while col <= center_col + col_span && seen_cols < cols {
                let wrapped_col = col.rem_euclid(cols) as usize;
                let bucket = wrapped_row * self.cols + wrapped_col;
                for &idx in &self.buckets[bucket] {
                    let pos = self.positions[idx];
                    let dist_sq = toroidal_distance_sq(query, pos, self.width, self.height);
                    if dist_sq > radius_sq {
                        continue;
                    }
                    if !include_center && dist_sq == 0.0 {
                        continue;
                    }
                    visitor(idx, OrderedFloat(dist_sq));
                }
                col += 1;
                seen_cols += 1;
            }
            row += 1;
            seen_rows += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(
        grid: &ToroidalGrid,
        query: (f32, f32),
        radius: f32,
        include_center: bool,
    ) -> Vec<usize> {
        let mut hits = Vec::new();
        grid.neighbors_within(query, radius, include_center, &mut |idx, _| hits.push(idx));
        hits.sort_unstable();
        hits
    }

    #[test]
    fn wrap_maps_into_half_open_interval() {
        assert_eq!(wrap(0.0, 100.0), 0.0);
        assert_eq!(wrap(100.0, 100.0), 0.0);
        assert_eq!(wrap(150.0, 100.0), 50.0);
        assert_eq!(wrap(-10.0, 100.0), 90.0);
        assert_eq!(wrap(5.0, 0.0), 0.0);
    }

    #[test]
    fn toroidal_delta_takes_shortest_path() {
        assert_eq!(toroidal_delta(10.0, 20.0, 100.0), 10.0);
        assert_eq!(toroidal_delta(95.0, 5.0, 100.0), 10.0);
        assert_eq!(toroidal_delta(5.0, 95.0, 100.0), -10.0);
    }

    #[test]
    fn distance_accounts_for_wraparound() {
        let d = toroidal_distance_sq((1.0, 1.0), (99.0, 99.0), 100.0, 100.0);
        assert!((d - 8.0).abs() < 1e-5);
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        assert!(ToroidalGrid::new(0.0, 100.0, 100.0).is_err());
        assert!(ToroidalGrid::new(10.0, -1.0, 100.0).is_err());
    }

    #[test]
    fn radius_query_finds_neighbors_across_the_boundary() {
        let mut grid = ToroidalGrid::new(10.0, 100.0, 100.0).expect("grid");
        grid.rebuild(&[(2.0, 50.0), (98.0, 50.0), (50.0, 50.0)])
            .expect("rebuild");
        let hits = collect(&grid, (0.0, 50.0), 5.0, true);
        assert_eq!(hits, vec![0, 1]);
    }

    #[test]
    fn include_center_controls_zero_distance_hits() {
        let mut grid = ToroidalGrid::new(10.0, 100.0, 100.0).expect("grid");
        grid.rebuild(&[(30.0, 30.0), (31.0, 30.0)])
            .expect("rebuild");
        assert_eq!(collect(&grid, (30.0, 30.0), 2.0, true), vec![0, 1]);
        assert_eq!(collect(&grid, (30.0, 30.0), 2.0, false), vec![1]);
    }

    #[test]
    fn queries_are_read_only() {
        let mut grid = ToroidalGrid::new(10.0, 100.0, 100.0).expect("grid");
        grid.rebuild(&[(10.0, 10.0)]).expect("rebuild");
        let before = grid.len();
        let _ = collect(&grid, (10.0, 10.0), 50.0, true);
        assert_eq!(grid.len(), before);
    }

    #[test]
    fn large_radius_visits_each_entity_once() {
        let mut grid = ToroidalGrid::new(10.0, 40.0, 40.0).expect("grid");
        let points: Vec<(f32, f32)> = (0..16)
            .map(|i| ((i % 4) as f32 * 10.0, (i / 4) as f32 * 10.0))
            .collect();
        grid.rebuild(&points).expect("rebuild");
        let mut hits = Vec::new();
        grid.neighbors_within((20.0, 20.0), 500.0, true, &mut |idx, _| hits.push(idx));
        hits.sort_unstable();
        let expected: Vec<usize> = (0..16).collect();
        assert_eq!(hits, expected);
    }

    #[test]
    fn place_inserts_and_relocates() {
        let mut grid = ToroidalGrid::new(10.0, 100.0, 100.0).expect("grid");
        grid.place(0, (5.0, 5.0)).expect("insert");
        grid.place(1, (50.0, 50.0)).expect("insert");
        assert!(grid.place(5, (0.0, 0.0)).is_err(), "gap insert rejected");
        assert_eq!(collect(&grid, (5.0, 5.0), 1.0, true), vec![0]);

        grid.place(0, (105.0, 50.0)).expect("relocate wraps");
        assert_eq!(grid.position(0), Some((5.0, 50.0)));
        assert_eq!(collect(&grid, (5.0, 5.0), 1.0, true), Vec::<usize>::new());
        assert_eq!(collect(&grid, (5.0, 50.0), 1.0, true), vec![0]);
    }

    #[test]
    fn move_by_applies_displacement_then_wraps() {
        let mut grid = ToroidalGrid::new(10.0, 100.0, 100.0).expect("grid");
        grid.rebuild(&[(95.0, 10.0)]).expect("rebuild");
        let next = grid.move_by(0, (10.0, -20.0)).expect("move");
        assert_eq!(next, (5.0, 90.0));
        assert_eq!(collect(&grid, (5.0, 90.0), 1.0, true), vec![0]);
        assert!(grid.move_by(7, (1.0, 1.0)).is_err());
    }

    #[test]
    fn rebuild_wraps_out_of_bounds_positions() {
        let mut grid = ToroidalGrid::new(10.0, 100.0, 100.0).expect("grid");
        grid.rebuild(&[(105.0, -5.0)]).expect("rebuild");
        assert_eq!(grid.position(0), Some((5.0, 95.0)));
    }
}
