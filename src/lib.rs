//! mltomo: maximum-likelihood classification and averaging of sub-tomograms
//!
//! Sub-volumes cut from electron tomograms miss a wedge, cone or pyramid of
//! Fourier space. This crate refines a small set of reference volumes by
//! expectation-maximization over the hidden class, orientation and offset of
//! every sub-volume, weighting each comparison by the frequencies that
//! sub-volume actually observed.
//!
//! # Modules
//! - `fft`: 3D FFT workspace using rustfft, Fourier phase shifts
//! - `geometry`: Euler angles, angular distance, volume rotation
//! - `sampling`: orientation search grid (full, perturbed, local)
//! - `missing`: missing-region descriptors and observability masks
//! - `translation`: Gaussian prior over integer offsets
//! - `reference`: reference volumes and mixture weights
//! - `em`: expectation, maximization, regularization, convergence
//! - `fsc`: half-set FSC, low-pass and solvent mask
//! - `spectra`: power-spectrum equalisation across tilt series
//! - `orchestrator`: the iteration driver
//! - `nifti_io`: volume I/O
//! - `config`: run parameters

// Core modules
pub mod error;
pub mod fft;
pub mod geometry;
pub mod simd_ops;
pub mod volume;

// Model
pub mod config;
pub mod missing;
pub mod reference;
pub mod sampling;
pub mod translation;

// Algorithm
pub mod em;
pub mod fsc;
pub mod orchestrator;
pub mod spectra;

// I/O
pub mod nifti_io;

pub use config::{load_config, AlgorithmMode, ImputationPolicy, MlTomoConfig, Symmetry};
pub use error::{Error, Result};
pub use missing::{MissingRegionDescriptor, MissingRegionId, MissingRegionKind, MissingRegionModel};
pub use orchestrator::{InitialReferences, IterationReport, IterationState, MlTomo, Phase, RunOutcome};
pub use reference::ReferenceSet;
pub use sampling::{AngleEntry, AngularSamplingGrid};
pub use volume::{Assignment, SubVolume};
