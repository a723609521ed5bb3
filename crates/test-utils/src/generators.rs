//! Synthetic snapshot generators.
//!
//! Snapshots are written as CDL text (the `ncdump` output format), which the
//! always-available `cdl` decoding backend reads. Tests therefore never need
//! the native NetCDF library.

use std::fmt::Write;

/// Fill value written for NaN entries.
pub const FILL_VALUE: f64 = -999.0;

/// Creates a test grid with predictable values.
///
/// Each cell value is `row * 10 + col`, so `grid[row * width + col]` can be
/// checked directly.
///
/// # Example
///
/// ```
/// use test_utils::create_test_grid;
///
/// let grid = create_test_grid(3, 2);
/// assert_eq!(grid, vec![0.0, 1.0, 2.0, 10.0, 11.0, 12.0]);
/// ```
pub fn create_test_grid(width: usize, height: usize) -> Vec<f64> {
    let mut data = Vec::with_capacity(width * height);
    for row in 0..height {
        for col in 0..width {
            data.push((row * 10 + col) as f64);
        }
    }
    data
}

/// Creates a grid with every cell set to `value`.
pub fn create_constant_grid(width: usize, height: usize, value: f64) -> Vec<f64> {
    vec![value; width * height]
}

/// Creates a test grid with NaN at the given `(row, col)` positions.
pub fn create_grid_with_nans(width: usize, height: usize, nan_positions: &[(usize, usize)]) -> Vec<f64> {
    let mut data = create_test_grid(width, height);
    for &(row, col) in nan_positions {
        if row < height && col < width {
            data[row * width + col] = f64::NAN;
        }
    }
    data
}

/// Hourly PM2.5-like values for one cell: a smooth daily cycle.
pub fn hourly_cycle(base: f64, amplitude: f64) -> Vec<f64> {
    (0..24)
        .map(|h| base + amplitude * ((h as f64) * std::f64::consts::PI / 12.0).sin())
        .collect()
}

/// How coordinates are laid out in a generated snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinateLayout {
    /// `lat(lat)` and `lon(lon)` axes.
    Axes,
    /// `lat2d(y, x)` and `lon2d(y, x)` per-cell arrays.
    Curvilinear,
}

/// Builder for a single CDL snapshot.
///
/// # Example
///
/// ```
/// use test_utils::SnapshotCdl;
///
/// let text = SnapshotCdl::new("CN-Reanalysis2013010100", vec![30.0, 31.0], vec![110.0, 111.0])
///     .variable("pm25", vec![1.0, 2.0, 3.0, 4.0])
///     .render();
/// assert!(text.starts_with("netcdf CN-Reanalysis2013010100 {"));
/// ```
#[derive(Debug, Clone)]
pub struct SnapshotCdl {
    name: String,
    lat: Vec<f64>,
    lon: Vec<f64>,
    layout: CoordinateLayout,
    variables: Vec<(String, Vec<f64>)>,
    scalars: Vec<(String, f64)>,
}

impl SnapshotCdl {
    pub fn new(name: impl Into<String>, lat: Vec<f64>, lon: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            lat,
            lon,
            layout: CoordinateLayout::Axes,
            variables: Vec::new(),
            scalars: Vec::new(),
        }
    }

    pub fn layout(mut self, layout: CoordinateLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Add a gridded variable, row-major over (lat, lon). NaN is written as
    /// the fill value.
    pub fn variable(mut self, name: &str, values: Vec<f64>) -> Self {
        self.variables.push((name.to_string(), values));
        self
    }

    /// Add a scalar variable.
    pub fn scalar(mut self, name: &str, value: f64) -> Self {
        self.scalars.push((name.to_string(), value));
        self
    }

    fn ny(&self) -> usize {
        self.lat.len()
    }

    fn nx(&self) -> usize {
        self.lon.len()
    }

    /// Render as CDL text.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let (ydim, xdim) = match self.layout {
            CoordinateLayout::Axes => ("lat", "lon"),
            CoordinateLayout::Curvilinear => ("y", "x"),
        };

        let _ = writeln!(out, "netcdf {} {{", self.name);
        let _ = writeln!(out, "dimensions:");
        let _ = writeln!(out, "\t{} = {} ;", ydim, self.ny());
        let _ = writeln!(out, "\t{} = {} ;", xdim, self.nx());

        let _ = writeln!(out, "variables:");
        match self.layout {
            CoordinateLayout::Axes => {
                let _ = writeln!(out, "\tdouble lat(lat) ;");
                let _ = writeln!(out, "\t\tlat:units = \"degrees_north\" ;");
                let _ = writeln!(out, "\tdouble lon(lon) ;");
                let _ = writeln!(out, "\t\tlon:units = \"degrees_east\" ;");
            }
            CoordinateLayout::Curvilinear => {
                let _ = writeln!(out, "\tdouble lat2d(y, x) ;");
                let _ = writeln!(out, "\tdouble lon2d(y, x) ;");
            }
        }
        for (name, _) in &self.variables {
            let _ = writeln!(out, "\tfloat {}({}, {}) ;", name, ydim, xdim);
            let _ = writeln!(out, "\t\t{}:_FillValue = {}f ;", name, FILL_VALUE);
        }
        for (name, _) in &self.scalars {
            let _ = writeln!(out, "\tfloat {} ;", name);
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "// global attributes:");
        let _ = writeln!(out, "\t\t:title = \"synthetic reanalysis snapshot\" ;");

        let _ = writeln!(out, "data:");
        match self.layout {
            CoordinateLayout::Axes => {
                write_values(&mut out, "lat", &self.lat);
                write_values(&mut out, "lon", &self.lon);
            }
            CoordinateLayout::Curvilinear => {
                let lat2d: Vec<f64> = self
                    .lat
                    .iter()
                    .flat_map(|y| std::iter::repeat(*y).take(self.nx()))
                    .collect();
                let lon2d: Vec<f64> = (0..self.ny()).flat_map(|_| self.lon.iter().copied()).collect();
                write_values(&mut out, "lat2d", &lat2d);
                write_values(&mut out, "lon2d", &lon2d);
            }
        }
        for (name, values) in &self.variables {
            write_values(&mut out, name, values);
        }
        for (name, value) in &self.scalars {
            write_values(&mut out, name, &[*value]);
        }
        let _ = writeln!(out, "}}");
        out
    }
}

fn write_values(out: &mut String, name: &str, values: &[f64]) {
    let rendered: Vec<String> = values
        .iter()
        .map(|v| if v.is_nan() { format!("{}", FILL_VALUE) } else { format!("{}", v) })
        .collect();
    let _ = writeln!(out);
    let _ = writeln!(out, " {} = {} ;", name, rendered.join(", "));
}
