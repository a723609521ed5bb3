//! Open dataset handles.
//!
//! A [`GridDataset`] wraps whatever a backend produced when it opened a
//! snapshot. Some backends keep reading from the underlying file until the
//! dataset is dropped; [`GridDataset::load`] copies every variable into owned
//! memory so the backing file can be removed.

use std::collections::BTreeMap;

use crate::error::{NetCdfError, NetCdfResult};

/// One decoded variable, flattened in row-major order.
///
/// Fill and missing values are already NaN and CF packing
/// (`scale_factor`/`add_offset`) has been applied.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    /// Dimension lengths, outermost first. Empty for scalars.
    pub shape: Vec<usize>,
    pub values: Vec<f64>,
}

impl Variable {
    pub fn new(name: impl Into<String>, shape: Vec<usize>, values: Vec<f64>) -> Self {
        Self {
            name: name.into(),
            shape,
            values,
        }
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Read access to an opened dataset.
///
/// Implemented by each backend; lazy readers go back to the file for every
/// call.
pub trait DatasetReader {
    /// Names of all numeric variables in the dataset.
    fn variable_names(&self) -> Vec<String>;

    /// Decode one variable.
    fn read_variable(&self, name: &str) -> NetCdfResult<Variable>;

    /// Whether every value already lives in owned memory.
    fn is_materialized(&self) -> bool {
        false
    }
}

/// A dataset whose variables are fully decoded into memory.
#[derive(Debug, Clone, Default)]
pub struct MaterializedDataset {
    variables: BTreeMap<String, Variable>,
}

impl MaterializedDataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, variable: Variable) {
        self.variables.insert(variable.name.clone(), variable);
    }

    pub fn with_variable(mut self, variable: Variable) -> Self {
        self.insert(variable);
        self
    }
}

impl DatasetReader for MaterializedDataset {
    fn variable_names(&self) -> Vec<String> {
        self.variables.keys().cloned().collect()
    }

    fn read_variable(&self, name: &str) -> NetCdfResult<Variable> {
        self.variables
            .get(name)
            .cloned()
            .ok_or_else(|| NetCdfError::MissingData(format!("{} variable", name)))
    }

    fn is_materialized(&self) -> bool {
        true
    }
}

/// An open, readable grid dataset.
pub struct GridDataset {
    backend: &'static str,
    source: String,
    reader: Box<dyn DatasetReader>,
}

impl GridDataset {
    pub fn new(backend: &'static str, source: impl Into<String>, reader: Box<dyn DatasetReader>) -> Self {
        Self {
            backend,
            source: source.into(),
            reader,
        }
    }

    /// Name of the backend that opened this dataset.
    pub fn backend(&self) -> &'static str {
        self.backend
    }

    /// Path or label the dataset was opened from.
    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn variable_names(&self) -> Vec<String> {
        self.reader.variable_names()
    }

    pub fn has_variable(&self, name: &str) -> bool {
        self.reader.variable_names().iter().any(|n| n == name)
    }

    pub fn variable(&self, name: &str) -> NetCdfResult<Variable> {
        self.reader.read_variable(name)
    }

    pub fn is_materialized(&self) -> bool {
        self.reader.is_materialized()
    }

    /// Eagerly decode every variable into owned memory.
    ///
    /// The returned dataset no longer touches the file it was opened from.
    pub fn load(self) -> NetCdfResult<GridDataset> {
        if self.reader.is_materialized() {
            return Ok(self);
        }

        let mut loaded = MaterializedDataset::new();
        for name in self.reader.variable_names() {
            loaded.insert(self.reader.read_variable(&name)?);
        }

        Ok(GridDataset {
            backend: self.backend,
            source: self.source,
            reader: Box::new(loaded),
        })
    }
}

impl std::fmt::Debug for GridDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GridDataset")
            .field("backend", &self.backend)
            .field("source", &self.source)
            .field("materialized", &self.reader.is_materialized())
            .finish()
    }
}
