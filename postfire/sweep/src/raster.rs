//! Synthetic spatial inputs written as ESRI ASCII grids.

use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
};

use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::RasterError;

/// Geo-referencing of a single-band grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridSpec {
    /// Number of columns.
    pub cols: usize,
    /// Number of rows.
    pub rows: usize,
    /// X of the lower-left corner.
    pub x_origin: f64,
    /// Y of the lower-left corner.
    pub y_origin: f64,
    /// Cell edge length in metres.
    pub cell_size: f64,
    /// Value marking missing data.
    pub nodata: f64,
}

impl Default for GridSpec {
    fn default() -> Self {
        Self {
            cols: 100,
            rows: 100,
            x_origin: 0.0,
            y_origin: 0.0,
            cell_size: 30.0,
            nodata: -9999.0,
        }
    }
}

impl GridSpec {
    /// Rejects empty grids and non-positive cell sizes.
    pub fn validate(&self) -> Result<(), RasterError> {
        if self.cols == 0 || self.rows == 0 {
            return Err(RasterError::InvalidGrid {
                reason: format!("{}x{} grid has no cells", self.cols, self.rows),
            });
        }
        if !(self.cell_size.is_finite() && self.cell_size > 0.0) {
            return Err(RasterError::InvalidGrid {
                reason: format!("cell size {} must be positive", self.cell_size),
            });
        }
        Ok(())
    }

    /// Number of cells.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.cols * self.rows
    }

    /// Whether the grid has no cells.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Centre coordinates of a cell; row 0 is the northern edge.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn cell_center(&self, col: usize, row: usize) -> (f64, f64) {
        let x = (col as f64 + 0.5).mul_add(self.cell_size, self.x_origin);
        let y = ((self.rows - row) as f64 - 0.5).mul_add(self.cell_size, self.y_origin);
        (x, y)
    }
}

/// A single-band grid, row-major with row 0 at the top.
#[derive(Debug, Clone, PartialEq)]
pub struct Raster {
    spec: GridSpec,
    values: Vec<f64>,
}

impl Raster {
    /// Creates a grid filled with `value`.
    pub fn filled(spec: GridSpec, value: f64) -> Result<Self, RasterError> {
        spec.validate()?;
        Ok(Self {
            values: vec![value; spec.len()],
            spec,
        })
    }

    /// Grid geometry.
    #[must_use]
    pub const fn spec(&self) -> &GridSpec {
        &self.spec
    }

    /// Cell values, row-major.
    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Value at a cell.
    #[must_use]
    pub fn get(&self, col: usize, row: usize) -> Option<f64> {
        if col >= self.spec.cols || row >= self.spec.rows {
            return None;
        }
        self.values.get(row * self.spec.cols + col).copied()
    }

    /// Overwrites a cell; out-of-range cells are ignored.
    pub fn set(&mut self, col: usize, row: usize, value: f64) {
        if col < self.spec.cols && row < self.spec.rows {
            self.values[row * self.spec.cols + col] = value;
        }
    }

    /// Renders the ESRI ASCII representation.
    #[must_use]
    pub fn to_ascii(&self) -> String {
        let spec = &self.spec;
        let mut out = String::with_capacity(spec.len() * 8 + 128);
        let _ = writeln!(out, "ncols {}", spec.cols);
        let _ = writeln!(out, "nrows {}", spec.rows);
        let _ = writeln!(out, "xllcorner {}", spec.x_origin);
        let _ = writeln!(out, "yllcorner {}", spec.y_origin);
        let _ = writeln!(out, "cellsize {}", spec.cell_size);
        let _ = writeln!(out, "NODATA_value {}", spec.nodata);
        for row in self.values.chunks(spec.cols) {
            let line: Vec<String> = row.iter().map(ToString::to_string).collect();
            out.push_str(&line.join(" "));
            out.push('\n');
        }
        out
    }

    /// Writes the grid to `path`.
    pub fn write_ascii(&self, path: impl AsRef<Path>) -> Result<(), RasterError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_ascii())?;
        Ok(())
    }

    /// Reads a grid written in ESRI ASCII format.
    pub fn read_ascii(path: impl AsRef<Path>) -> Result<Self, RasterError> {
        Self::parse_ascii(&std::fs::read_to_string(path)?)
    }

    /// Parses ESRI ASCII text. Accepts `xllcenter`/`yllcenter` as well as the
    /// corner form.
    pub fn parse_ascii(text: &str) -> Result<Self, RasterError> {
        let mut spec = GridSpec {
            cols: 0,
            rows: 0,
            ..GridSpec::default()
        };
        let mut centered = (false, false);
        let mut lines = text.lines().enumerate().peekable();

        while let Some((idx, line)) = lines.peek().copied() {
            let mut parts = line.split_whitespace();
            let Some(name) = parts.next() else {
                lines.next();
                continue;
            };
            if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
                break;
            }
            let malformed = |reason: String| RasterError::Malformed { line: idx + 1, reason };
            let raw = parts
                .next()
                .ok_or_else(|| malformed(format!("header '{name}' has no value")))?;
            let number = || {
                raw.parse::<f64>()
                    .map_err(|_| malformed(format!("header '{name}' holds '{raw}'")))
            };
            let count = || {
                raw.parse::<usize>()
                    .map_err(|_| malformed(format!("header '{name}' holds '{raw}'")))
            };
            match name.to_ascii_lowercase().as_str() {
                "ncols" => spec.cols = count()?,
                "nrows" => spec.rows = count()?,
                "xllcorner" => spec.x_origin = number()?,
                "yllcorner" => spec.y_origin = number()?,
                "xllcenter" => {
                    spec.x_origin = number()?;
                    centered.0 = true;
                }
                "yllcenter" => {
                    spec.y_origin = number()?;
                    centered.1 = true;
                }
                "cellsize" => spec.cell_size = number()?,
                "nodata_value" => spec.nodata = number()?,
                other => return Err(malformed(format!("unknown header '{other}'"))),
            }
            lines.next();
        }
        if centered.0 {
            spec.x_origin -= spec.cell_size / 2.0;
        }
        if centered.1 {
            spec.y_origin -= spec.cell_size / 2.0;
        }
        spec.validate()?;

        let mut values = Vec::with_capacity(spec.len());
        for (idx, line) in lines {
            for token in line.split_whitespace() {
                let value = token.parse::<f64>().map_err(|_| RasterError::Malformed {
                    line: idx + 1,
                    reason: format!("cell value '{token}' is not a number"),
                })?;
                values.push(value);
            }
        }
        if values.len() != spec.len() {
            return Err(RasterError::Malformed {
                line: text.lines().count(),
                reason: format!("expected {} cells, found {}", spec.len(), values.len()),
            });
        }
        Ok(Self { spec, values })
    }
}

/// Returns a fresh random seed.
#[must_use]
pub fn random_seed() -> u64 {
    rand::thread_rng().gen()
}

/// Returns a reproducible RNG.
#[must_use]
pub fn seeded_rng(seed: u64) -> SmallRng {
    SmallRng::seed_from_u64(seed)
}

/// Parameters of the synthetic landscape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RasterPlan {
    /// Grid geometry shared by every layer.
    pub grid: GridSpec,
    /// Seed; a random one is drawn (and reported) when absent.
    pub seed: Option<u64>,
    /// Number of ignition points.
    pub ignitions: usize,
    /// Burn radius around each ignition, in cells.
    pub burn_radius_cells: f64,
    /// Amplitude of uniform severity noise.
    pub severity_noise: f64,
    /// Elevation at the lower-left cell, metres.
    pub elevation_base: f64,
    /// Elevation gain per column, metres.
    pub elevation_gradient_x: f64,
    /// Elevation gain per row towards the north, metres.
    pub elevation_gradient_y: f64,
    /// Amplitude of uniform elevation noise, metres.
    pub elevation_noise: f64,
    /// Severity above which a cell is treated.
    pub treatment_threshold: f64,
    /// Seedlings planted per treated cell.
    pub seeding_intensity: f64,
    /// Invasive removal fraction per treated cell.
    pub removal_intensity: f64,
}

impl Default for RasterPlan {
    fn default() -> Self {
        Self {
            grid: GridSpec::default(),
            seed: None,
            ignitions: 3,
            burn_radius_cells: 25.0,
            severity_noise: 0.1,
            elevation_base: 900.0,
            elevation_gradient_x: 0.5,
            elevation_gradient_y: 4.0,
            elevation_noise: 15.0,
            treatment_threshold: 0.5,
            seeding_intensity: 8.0,
            removal_intensity: 0.12,
        }
    }
}

/// The four generated layers.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterSet {
    /// Seed the layers were generated from.
    pub seed: u64,
    /// Burn severity in `[0, 1]`.
    pub severity: Raster,
    /// Elevation in metres.
    pub elevation: Raster,
    /// Seeding intensity.
    pub seeding: Raster,
    /// Removal intensity.
    pub removal: Raster,
}

impl RasterSet {
    /// Layers paired with their file names.
    #[must_use]
    pub fn layers(&self) -> [(&'static str, &Raster); 4] {
        [
            ("fire_severity.asc", &self.severity),
            ("elevation.asc", &self.elevation),
            ("seeding_intensity.asc", &self.seeding),
            ("removal_intensity.asc", &self.removal),
        ]
    }

    /// Writes every layer into `dir` and returns the written paths.
    pub fn write_all(&self, dir: impl AsRef<Path>) -> Result<Vec<PathBuf>, RasterError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        self.layers()
            .into_iter()
            .map(|(name, raster)| {
                let path = dir.join(name);
                raster.write_ascii(&path)?;
                Ok(path)
            })
            .collect()
    }
}

impl RasterPlan {
    /// Generates all layers. Identical plans with identical seeds produce
    /// identical grids.
    #[allow(clippy::cast_precision_loss)]
    pub fn generate(&self) -> Result<RasterSet, RasterError> {
        let grid = self.grid;
        grid.validate()?;
        if self.burn_radius_cells <= 0.0 {
            return Err(RasterError::InvalidGrid {
                reason: format!("burn radius {} must be positive", self.burn_radius_cells),
            });
        }
        let seed = self.seed.unwrap_or_else(random_seed);
        let mut rng = seeded_rng(seed);

        let ignitions: Vec<(f64, f64)> = (0..self.ignitions)
            .map(|_| {
                (
                    rng.gen_range(0.0..grid.cols as f64),
                    rng.gen_range(0.0..grid.rows as f64),
                )
            })
            .collect();

        let mut severity = Raster::filled(grid, 0.0)?;
        let mut elevation = Raster::filled(grid, 0.0)?;
        let mut seeding = Raster::filled(grid, 0.0)?;
        let mut removal = Raster::filled(grid, 0.0)?;

        for row in 0..grid.rows {
            for col in 0..grid.cols {
                let (cx, cy) = (col as f64 + 0.5, row as f64 + 0.5);
                let burn = ignitions
                    .iter()
                    .map(|(ix, iy)| {
                        let dist2 = (cx - ix).powi(2) + (cy - iy).powi(2);
                        (-dist2 / self.burn_radius_cells.powi(2)).exp()
                    })
                    .fold(0.0_f64, f64::max);
                let noise = jitter(&mut rng, self.severity_noise);
                let burn = (burn + noise).clamp(0.0, 1.0);
                severity.set(col, row, burn);

                let northing = (grid.rows - 1 - row) as f64;
                let height = self.elevation_base
                    + self.elevation_gradient_x * col as f64
                    + self.elevation_gradient_y * northing
                    + jitter(&mut rng, self.elevation_noise);
                elevation.set(col, row, height);

                if burn > self.treatment_threshold {
                    seeding.set(col, row, self.seeding_intensity);
                    removal.set(col, row, self.removal_intensity);
                }
            }
        }

        Ok(RasterSet {
            seed,
            severity,
            elevation,
            seeding,
            removal,
        })
    }
}

fn jitter(rng: &mut SmallRng, amplitude: f64) -> f64 {
    if amplitude > 0.0 {
        rng.gen_range(-amplitude..=amplitude)
    } else {
        0.0
    }
}
