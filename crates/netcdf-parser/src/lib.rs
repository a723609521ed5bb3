//! Decoding capability for gridded reanalysis snapshots.
//!
//! Snapshots are NetCDF files holding latitude/longitude arrays plus
//! pollutant and meteorological variables. This crate turns a snapshot
//! (on disk or in memory) into a [`GridDataset`] through an ordered list of
//! [`DecodeBackend`]s:
//!
//! - `netcdf`: libnetcdf via the `netcdf` crate (feature `native-netcdf`,
//!   needs libhdf5-dev and libnetcdf-dev)
//! - `ncdump`: the `ncdump` command-line tool, if installed
//! - `cdl`: CDL text as printed by `ncdump`, pure Rust
//!
//! # Thread safety
//!
//! libnetcdf and HDF5 are not safe for concurrent opens. Backends do not lock
//! on their own; callers that open from several threads must serialize
//! [`DecodeBackend::open_path`] and [`DecodeBackend::open_bytes`].

pub mod backend;
pub mod cdl;
pub mod dataset;
pub mod error;
pub mod ncdump;

#[cfg(feature = "native-netcdf")]
pub mod native;

pub use backend::{BackendRegistry, BackendStatus, CdlBackend, DecodeBackend};
pub use dataset::{DatasetReader, GridDataset, MaterializedDataset, Variable};
pub use error::{NetCdfError, NetCdfResult};
pub use ncdump::{ncdump_available, NcdumpBackend};

#[cfg(feature = "native-netcdf")]
pub use native::{silence_hdf5_errors, NativeBackend};
