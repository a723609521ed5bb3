//! Native NetCDF decoding through libnetcdf.
//!
//! Compiled only with the `native-netcdf` feature. The library wraps HDF5,
//! which is not safe for concurrent opens; callers serialize `open_path`.
//!
//! libnetcdf needs a file path, so [`NativeBackend`] does not read from
//! memory.

use std::path::Path;
use std::sync::Once;

use netcdf::types::NcVariableType;
use tracing::debug;

use crate::backend::{DecodeBackend, NATIVE_BACKEND_NAME};
use crate::dataset::{DatasetReader, GridDataset, Variable};
use crate::error::{NetCdfError, NetCdfResult};

/// Silence HDF5's automatic error printing to stderr.
///
/// HDF5 reports handled errors (for example a lookup of an optional
/// attribute) on stderr. Safe to call more than once.
pub fn silence_hdf5_errors() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        // SAFETY: H5Eset_auto2 with null handlers is the documented way to
        // disable automatic error output.
        unsafe {
            hdf5_metno_sys::h5e::H5Eset_auto2(
                hdf5_metno_sys::h5e::H5E_DEFAULT,
                None,
                std::ptr::null_mut(),
            );
        }
    });
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NativeBackend;

impl DecodeBackend for NativeBackend {
    fn name(&self) -> &'static str {
        NATIVE_BACKEND_NAME
    }

    fn is_available(&self) -> bool {
        true
    }

    fn open_path(&self, path: &Path) -> NetCdfResult<GridDataset> {
        silence_hdf5_errors();

        let file = netcdf::open(path)
            .map_err(|e| NetCdfError::InvalidFormat(format!("Failed to open NetCDF: {}", e)))?;
        debug!(path = %path.display(), "Opened with libnetcdf");

        Ok(GridDataset::new(
            self.name(),
            path.display().to_string(),
            Box::new(NativeReader { file }),
        ))
    }
}

struct NativeReader {
    file: netcdf::File,
}

impl DatasetReader for NativeReader {
    fn variable_names(&self) -> Vec<String> {
        self.file
            .variables()
            .filter(|v| matches!(v.vartype(), NcVariableType::Int(_) | NcVariableType::Float(_)))
            .map(|v| v.name())
            .collect()
    }

    fn read_variable(&self, name: &str) -> NetCdfResult<Variable> {
        let var = self
            .file
            .variable(name)
            .ok_or_else(|| NetCdfError::MissingData(format!("{} variable", name)))?;

        let shape: Vec<usize> = var.dimensions().iter().map(|d| d.len()).collect();

        let raw: Vec<f64> = var
            .get_values(..)
            .map_err(|e| NetCdfError::InvalidFormat(format!("Failed to read {}: {}", name, e)))?;

        let fill = get_f64_attr(&var, "_FillValue");
        let missing = get_f64_attr(&var, "missing_value");
        let scale = get_f64_attr(&var, "scale_factor").unwrap_or(1.0);
        let offset = get_f64_attr(&var, "add_offset").unwrap_or(0.0);

        let values = raw
            .into_iter()
            .map(|v| {
                if Some(v) == fill || Some(v) == missing {
                    f64::NAN
                } else {
                    v * scale + offset
                }
            })
            .collect();

        Ok(Variable::new(name, shape, values))
    }
}

/// Check for an attribute without triggering an HDF5 lookup error.
fn has_attr(var: &netcdf::Variable, name: &str) -> bool {
    var.attributes().any(|attr| attr.name() == name)
}

fn get_f64_attr(var: &netcdf::Variable, name: &str) -> Option<f64> {
    if !has_attr(var, name) {
        return None;
    }
    let attr_value = var.attribute_value(name)?.ok()?;
    f64::try_from(attr_value).ok()
}
