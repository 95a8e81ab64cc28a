use geo::{Contains, Coord, MultiPolygon, Point, Rect};
use ndarray::Array2;
use rayon::prelude::*;
use rstar::AABB;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::geometry;
use crate::layer::Layer;
use crate::overlay::Overlay;

use super::{ConvergenceReport, EstimateSet, EstimateStatus, TargetEstimate};

/// Configuration for the pycnophylactic smoother.
///
/// Defaults follow the original method's common practice: relaxation 0.2,
/// convergence at a maximum per-cell change of 10⁻³ of the mean initial cell
/// value, and a 100-iteration hard budget. Finer `cell_size` approaches a
/// continuous density surface at a cost proportional to cell count ×
/// iteration count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PycnoConfig {
    /// Source attribute column to interpolate (extensive).
    pub column: String,
    /// Grid cell edge length, in the layers' linear unit.
    pub cell_size: f64,
    /// Fraction of the neighbor-mean correction applied per pass.
    pub relaxation: f64,
    /// Convergence threshold, relative to the mean initial cell value.
    pub tolerance: f64,
    /// Iteration budget (hard bound guaranteeing termination).
    pub max_iterations: usize,
}

impl PycnoConfig {
    pub fn new(column: impl Into<String>, cell_size: f64) -> Self {
        Self {
            column: column.into(),
            cell_size,
            relaxation: 0.2,
            tolerance: 1e-3,
            max_iterations: 100,
        }
    }
}

/// The regular lattice the smoother iterates over. Strictly local to one
/// estimator invocation; discarded after resampling to targets.
struct Grid {
    /// Per-cell value (so each source's cells sum to its attribute value).
    cells: Array2<f64>,
    /// Owning source index per cell, -1 for cells outside every source.
    owner: Array2<i32>,
    origin: Coord<f64>,
    cell_size: f64,
    nx: usize,
    ny: usize,
}

impl Grid {
    /// Lay a grid over the source extent and assign each cell to the source
    /// polygon containing its center. Each source's value is spread evenly
    /// over its cells.
    fn build(sources: &Layer, values: &[f64], bounds: Rect<f64>, cell_size: f64) -> Self {
        let nx = ((bounds.width() / cell_size).ceil() as usize).max(1);
        let ny = ((bounds.height() / cell_size).ceil() as usize).max(1);
        let origin = bounds.min();

        let mut owner = Array2::from_elem((ny, nx), -1i32);
        let mut counts = vec![0usize; sources.len()];
        for row in 0..ny {
            for col in 0..nx {
                let center = Point::new(
                    origin.x + (col as f64 + 0.5) * cell_size,
                    origin.y + (row as f64 + 0.5) * cell_size,
                );
                let envelope = AABB::from_corners([center.x(), center.y()], [center.x(), center.y()]);
                // Min index for determinism if boundaries graze the center.
                let source = sources.query(&envelope)
                    .filter(|&s| sources.feature(s).geometry.contains(&center))
                    .min();
                if let Some(s) = source {
                    owner[[row, col]] = s as i32;
                    counts[s] += 1;
                }
            }
        }

        for (s, &count) in counts.iter().enumerate() {
            if count == 0 && values[s] != 0.0 {
                warn!(
                    source = %sources.id(s),
                    "no grid cell center falls inside source; its value is not representable at this cell size"
                );
            }
        }

        let mut cells = Array2::zeros((ny, nx));
        for row in 0..ny {
            for col in 0..nx {
                let s = owner[[row, col]];
                if s >= 0 && counts[s as usize] > 0 {
                    cells[[row, col]] = values[s as usize] / counts[s as usize] as f64;
                }
            }
        }

        Self { cells, owner, origin, cell_size, nx, ny }
    }

    /// One smoothing pass: relaxed neighbor-mean, then per-source
    /// renormalization so every source's cells still sum to its value.
    /// Returns the maximum per-cell change.
    fn smooth_pass(&mut self, values: &[f64], relaxation: f64) -> f64 {
        let old = self.cells.clone();
        let mut next = old.clone();

        for row in 0..self.ny {
            for col in 0..self.nx {
                if self.owner[[row, col]] < 0 {
                    continue;
                }
                let mut sum = 0.0;
                let mut n = 0usize;
                let mut push = |r: isize, c: isize| {
                    if r >= 0 && c >= 0 && (r as usize) < self.ny && (c as usize) < self.nx
                        && self.owner[[r as usize, c as usize]] >= 0
                    {
                        sum += old[[r as usize, c as usize]];
                        n += 1;
                    }
                };
                push(row as isize - 1, col as isize);
                push(row as isize + 1, col as isize);
                push(row as isize, col as isize - 1);
                push(row as isize, col as isize + 1);

                if n > 0 {
                    let mean = sum / n as f64;
                    next[[row, col]] = old[[row, col]] + relaxation * (mean - old[[row, col]]);
                }
            }
        }

        // Mass conservation: rescale each source's cells back to its value.
        let mut sums = vec![0.0f64; values.len()];
        let mut counts = vec![0usize; values.len()];
        for row in 0..self.ny {
            for col in 0..self.nx {
                let s = self.owner[[row, col]];
                if s >= 0 {
                    sums[s as usize] += next[[row, col]];
                    counts[s as usize] += 1;
                }
            }
        }
        for row in 0..self.ny {
            for col in 0..self.nx {
                let s = self.owner[[row, col]];
                if s < 0 {
                    continue;
                }
                let s = s as usize;
                if sums[s].abs() > f64::EPSILON {
                    next[[row, col]] *= values[s] / sums[s];
                } else if counts[s] > 0 {
                    next[[row, col]] = values[s] / counts[s] as f64;
                }
            }
        }

        let mut delta: f64 = 0.0;
        for (a, b) in next.iter().zip(old.iter()) {
            delta = delta.max((a - b).abs());
        }
        self.cells = next;
        delta
    }

    /// Mean absolute initial cell value over owned cells (convergence scale).
    fn value_scale(&self) -> f64 {
        let mut sum = 0.0;
        let mut n = 0usize;
        for (cell, &owner) in self.cells.iter().zip(self.owner.iter()) {
            if owner >= 0 {
                sum += cell.abs();
                n += 1;
            }
        }
        if n > 0 && sum > 0.0 { sum / n as f64 } else { 1.0 }
    }

    /// Area-weighted aggregation of cell values onto targets: each cell
    /// hands each target the share of its value proportional to the
    /// intersected fraction of the cell.
    fn resample(&self, targets: &Layer) -> Vec<f64> {
        let cell_area = self.cell_size * self.cell_size;
        (0..targets.len())
            .into_par_iter()
            .map(|t| {
                let geom = &targets.feature(t).geometry;
                let Some(rect) = geo::BoundingRect::bounding_rect(geom) else { return 0.0 };

                let col0 = (((rect.min().x - self.origin.x) / self.cell_size).floor().max(0.0)) as usize;
                let row0 = (((rect.min().y - self.origin.y) / self.cell_size).floor().max(0.0)) as usize;
                let col1 = ((((rect.max().x - self.origin.x) / self.cell_size).ceil()) as usize).min(self.nx);
                let row1 = ((((rect.max().y - self.origin.y) / self.cell_size).ceil()) as usize).min(self.ny);

                let mut total = 0.0;
                for row in row0..row1 {
                    for col in col0..col1 {
                        if self.owner[[row, col]] < 0 {
                            continue;
                        }
                        let cell = MultiPolygon::new(vec![Rect::new(
                            Coord {
                                x: self.origin.x + col as f64 * self.cell_size,
                                y: self.origin.y + row as f64 * self.cell_size,
                            },
                            Coord {
                                x: self.origin.x + (col + 1) as f64 * self.cell_size,
                                y: self.origin.y + (row + 1) as f64 * self.cell_size,
                            },
                        ).to_polygon()]);
                        let shared = geometry::intersection_area(&cell, geom);
                        if shared > 0.0 {
                            total += self.cells[[row, col]] * shared / cell_area;
                        }
                    }
                }
                total
            })
            .collect()
    }
}

/// Tobler's mass-preserving smoothing interpolation: distribute each source's
/// value evenly over a grid, iteratively smooth while renormalizing every
/// pass so per-source mass is conserved, then resample the converged surface
/// onto the targets.
///
/// Exhausting the iteration budget fails with [`Error::Convergence`], whose
/// `last_iterate` holds the target values resampled from the final grid so
/// the caller may accept a partial answer.
pub(super) fn estimate(
    sources: &Layer,
    targets: &Layer,
    overlay: &Overlay,
    config: &PycnoConfig,
) -> Result<EstimateSet> {
    let values = sources.column(&config.column)?;
    let Some(bounds) = sources.bounds() else {
        let estimates = (0..targets.len())
            .map(|t| TargetEstimate {
                id: targets.id(t).clone(),
                value: 0.0,
                coverage: 0.0,
                uncertainty: None,
                status: EstimateStatus::Uncovered,
            })
            .collect();
        return Ok(EstimateSet { column: config.column.clone(), estimates, convergence: None });
    };

    let mut grid = Grid::build(sources, &values, bounds, config.cell_size);
    let threshold = config.tolerance * grid.value_scale();

    let mut converged = false;
    let mut iterations = 0;
    let mut delta = f64::INFINITY;
    for iteration in 1..=config.max_iterations {
        delta = grid.smooth_pass(&values, config.relaxation);
        iterations = iteration;
        debug!(iteration, delta, "smoothing pass");
        if delta <= threshold {
            converged = true;
            break;
        }
    }

    let resampled = grid.resample(targets);
    if !converged {
        return Err(Error::Convergence { iterations, delta, last_iterate: resampled });
    }

    let estimates = resampled.into_iter().enumerate()
        .map(|(t, value)| {
            let covered = overlay.entries_for_target(t).next().is_some();
            TargetEstimate {
                id: targets.id(t).clone(),
                value,
                coverage: overlay.coverage(t),
                uncertainty: None,
                status: if covered { EstimateStatus::Estimated } else { EstimateStatus::Uncovered },
            }
        })
        .collect();

    Ok(EstimateSet {
        column: config.column.clone(),
        estimates,
        convergence: Some(ConvergenceReport { converged, iterations, delta }),
    })
}
