//! Decoding through the `ncdump` command-line tool.
//!
//! Slower than the native library but needs nothing linked into the process.
//! The header is read once at open time; each variable read runs
//! `ncdump -v <name>` and parses the CDL output.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use tracing::debug;

use crate::backend::DecodeBackend;
use crate::cdl::{self, CdlDocument};
use crate::dataset::{DatasetReader, GridDataset, Variable};
use crate::error::{NetCdfError, NetCdfResult};

/// Whether an `ncdump` executable can be spawned. Checked once per process.
pub fn ncdump_available() -> bool {
    static AVAILABLE: OnceLock<bool> = OnceLock::new();
    *AVAILABLE.get_or_init(|| {
        let found = Command::new("ncdump").output().is_ok();
        debug!(found, "Checked for ncdump executable");
        found
    })
}

fn run_ncdump(args: &[&str], path: &Path) -> NetCdfResult<String> {
    let output = Command::new("ncdump")
        .args(args)
        .arg(path)
        .output()
        .map_err(|e| NetCdfError::CommandError(format!("Failed to run ncdump: {}", e)))?;

    if !output.status.success() {
        return Err(NetCdfError::CommandError(format!(
            "ncdump failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NcdumpBackend;

impl DecodeBackend for NcdumpBackend {
    fn name(&self) -> &'static str {
        "ncdump"
    }

    fn is_available(&self) -> bool {
        ncdump_available()
    }

    fn open_path(&self, path: &Path) -> NetCdfResult<GridDataset> {
        if !path.exists() {
            return Err(NetCdfError::NotFound(path.display().to_string()));
        }

        let header = cdl::parse(&run_ncdump(&["-h"], path)?)?;
        debug!(
            path = %path.display(),
            variables = header.variables.len(),
            "Read header via ncdump"
        );

        Ok(GridDataset::new(
            self.name(),
            path.display().to_string(),
            Box::new(NcdumpReader {
                path: path.to_path_buf(),
                header,
            }),
        ))
    }
}

/// Lazy reader; keeps the file path and goes back to `ncdump` per variable.
struct NcdumpReader {
    path: PathBuf,
    header: CdlDocument,
}

impl DatasetReader for NcdumpReader {
    fn variable_names(&self) -> Vec<String> {
        self.header.numeric_variable_names()
    }

    fn read_variable(&self, name: &str) -> NetCdfResult<Variable> {
        if self.header.declaration(name).is_none() {
            return Err(NetCdfError::MissingData(format!("{} variable", name)));
        }
        let text = run_ncdump(&["-v", name], &self.path)?;
        cdl::parse(&text)?.decode_variable(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_not_found() {
        let err = NcdumpBackend
            .open_path(Path::new("/no/such/dir/snapshot.nc"))
            .unwrap_err();
        assert!(err.is_not_found_class());
    }

    #[test]
    fn test_bytes_unsupported() {
        assert!(!NcdumpBackend.supports_memory());
        let err = NcdumpBackend.open_bytes(b"", "x.nc").unwrap_err();
        assert!(matches!(err, NetCdfError::Unsupported { backend: "ncdump", .. }));
    }
}
