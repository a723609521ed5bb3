//! Decoding backends and their priority order.
//!
//! Each backend is a strategy with a capability check. Callers walk the
//! registry in order and stop at the first backend that opens the file.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::cdl::{self, CdlDataset};
use crate::dataset::GridDataset;
use crate::error::{NetCdfError, NetCdfResult};

/// A strategy for turning a snapshot file into a [`GridDataset`].
pub trait DecodeBackend: Send + Sync {
    /// Short module name used in logs and diagnostics.
    fn name(&self) -> &'static str;

    /// Whether the backend can run in this process.
    fn is_available(&self) -> bool;

    /// Whether [`DecodeBackend::open_bytes`] is supported.
    fn supports_memory(&self) -> bool {
        false
    }

    fn open_path(&self, path: &Path) -> NetCdfResult<GridDataset>;

    fn open_bytes(&self, _data: &[u8], _label: &str) -> NetCdfResult<GridDataset> {
        Err(NetCdfError::Unsupported {
            backend: self.name(),
            operation: "open_bytes",
        })
    }
}

/// Presence of one backend module in this build/process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendStatus {
    pub name: &'static str,
    pub available: bool,
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.available { "present" } else { "missing" };
        write!(f, "{}: {}", self.name, state)
    }
}

/// Ordered list of decoding backends.
#[derive(Clone)]
pub struct BackendRegistry {
    backends: Vec<Arc<dyn DecodeBackend>>,
}

impl BackendRegistry {
    pub fn new(backends: Vec<Arc<dyn DecodeBackend>>) -> Self {
        Self { backends }
    }

    /// `netcdf` (when compiled in), then `ncdump`, then `cdl`.
    pub fn with_defaults() -> Self {
        let mut backends: Vec<Arc<dyn DecodeBackend>> = Vec::new();
        #[cfg(feature = "native-netcdf")]
        backends.push(Arc::new(crate::native::NativeBackend));
        backends.push(Arc::new(crate::ncdump::NcdumpBackend));
        backends.push(Arc::new(CdlBackend));
        Self { backends }
    }

    /// Every registered backend in priority order, available or not.
    pub fn all(&self) -> &[Arc<dyn DecodeBackend>] {
        &self.backends
    }

    /// Backends whose capability check succeeds, in priority order.
    pub fn available(&self) -> Vec<Arc<dyn DecodeBackend>> {
        self.backends
            .iter()
            .filter(|b| b.is_available())
            .cloned()
            .collect()
    }

    /// Available backends that can decode from a byte buffer.
    pub fn memory_capable(&self) -> Vec<Arc<dyn DecodeBackend>> {
        self.available()
            .into_iter()
            .filter(|b| b.supports_memory())
            .collect()
    }

    /// Presence flags for every known backend module.
    ///
    /// The native module is listed even in builds without it so diagnostics
    /// show why it was not tried.
    pub fn availability(&self) -> Vec<BackendStatus> {
        let mut statuses: Vec<BackendStatus> = self
            .backends
            .iter()
            .map(|b| BackendStatus {
                name: b.name(),
                available: b.is_available(),
            })
            .collect();

        if !statuses.iter().any(|s| s.name == NATIVE_BACKEND_NAME) {
            statuses.insert(
                0,
                BackendStatus {
                    name: NATIVE_BACKEND_NAME,
                    available: false,
                },
            );
        }
        statuses
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.backends.iter().map(|b| b.name()))
            .finish()
    }
}

pub(crate) const NATIVE_BACKEND_NAME: &str = "netcdf";

/// Reads snapshots stored as CDL text.
#[derive(Debug, Clone, Copy, Default)]
pub struct CdlBackend;

impl DecodeBackend for CdlBackend {
    fn name(&self) -> &'static str {
        "cdl"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn supports_memory(&self) -> bool {
        true
    }

    fn open_path(&self, path: &Path) -> NetCdfResult<GridDataset> {
        let bytes = std::fs::read(path)?;
        let text = std::str::from_utf8(&bytes)
            .map_err(|_| NetCdfError::InvalidFormat(format!("{} is not CDL text", path.display())))?;
        let document = cdl::parse(text)?;
        Ok(GridDataset::new(
            self.name(),
            path.display().to_string(),
            Box::new(CdlDataset::new(document)),
        ))
    }

    fn open_bytes(&self, data: &[u8], label: &str) -> NetCdfResult<GridDataset> {
        let text = std::str::from_utf8(data)
            .map_err(|_| NetCdfError::InvalidFormat(format!("{} is not CDL text", label)))?;
        let document = cdl::parse(text)?;
        Ok(GridDataset::new(
            self.name(),
            label,
            Box::new(CdlDataset::new(document)),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TINY: &str = "netcdf t {\ndimensions:\n\tx = 2 ;\nvariables:\n\tfloat v(x) ;\ndata:\n v = 1, 2 ;\n}\n";

    #[test]
    fn test_cdl_backend_bytes() {
        let ds = CdlBackend.open_bytes(TINY.as_bytes(), "t.nc").unwrap();
        assert_eq!(ds.backend(), "cdl");
        assert_eq!(ds.variable("v").unwrap().values, vec![1.0, 2.0]);
    }

    #[test]
    fn test_cdl_backend_rejects_binary() {
        let err = CdlBackend.open_bytes(b"CDF\x01\x00\x00", "t.nc").unwrap_err();
        assert!(matches!(err, NetCdfError::InvalidFormat(_)));
    }

    #[test]
    fn test_cdl_backend_missing_file_is_not_found_class() {
        let err = CdlBackend
            .open_path(Path::new("/definitely/not/here.nc"))
            .unwrap_err();
        assert!(err.is_not_found_class());
    }

    #[test]
    fn test_registry_order_and_availability() {
        let registry = BackendRegistry::with_defaults();
        let names: Vec<_> = registry.all().iter().map(|b| b.name()).collect();
        assert_eq!(names.last(), Some(&"cdl"));

        let status = registry.availability();
        assert_eq!(status[0].name, "netcdf");
        assert!(status.iter().any(|s| s.name == "cdl" && s.available));
        assert!(!registry.memory_capable().is_empty());
    }
}
