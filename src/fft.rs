//! 3D transforms using rustfft
//!
//! Volumes are stored in Fortran (column-major) order, `x + y*nx + z*nx*ny`,
//! and the spectrum is unshifted (DC at index 0).

use num_complex::Complex64;
use rustfft::{Fft, FftDirection, FftPlanner};
use std::f64::consts::PI;
use std::sync::Arc;

/// FFT workspace that caches plans and scratch buffers for reuse
///
/// One workspace is owned by each expectation worker. Workers clone a
/// common workspace, so plans are shared through `Arc` and scratch buffers
/// are not.
pub struct Fft3dWorkspace {
    nx: usize,
    ny: usize,
    nz: usize,
    n_total: usize,
    // Forward FFT plans
    fft_x: Arc<dyn Fft<f64>>,
    fft_y: Arc<dyn Fft<f64>>,
    fft_z: Arc<dyn Fft<f64>>,
    // Inverse FFT plans
    ifft_x: Arc<dyn Fft<f64>>,
    ifft_y: Arc<dyn Fft<f64>>,
    ifft_z: Arc<dyn Fft<f64>>,
    // Scratch buffers
    scratch_x: Vec<Complex64>,
    scratch_y: Vec<Complex64>,
    scratch_z: Vec<Complex64>,
    buffer_y: Vec<Complex64>,
    buffer_z: Vec<Complex64>,
}

impl Fft3dWorkspace {
    /// Create a new FFT workspace for the given dimensions
    pub fn new(nx: usize, ny: usize, nz: usize) -> Self {
        let mut planner = FftPlanner::new();

        let fft_x = planner.plan_fft(nx, FftDirection::Forward);
        let fft_y = planner.plan_fft(ny, FftDirection::Forward);
        let fft_z = planner.plan_fft(nz, FftDirection::Forward);

        let ifft_x = planner.plan_fft(nx, FftDirection::Inverse);
        let ifft_y = planner.plan_fft(ny, FftDirection::Inverse);
        let ifft_z = planner.plan_fft(nz, FftDirection::Inverse);

        let scratch_x = vec![Complex64::new(0.0, 0.0); fft_x.get_inplace_scratch_len().max(ifft_x.get_inplace_scratch_len())];
        let scratch_y = vec![Complex64::new(0.0, 0.0); fft_y.get_inplace_scratch_len().max(ifft_y.get_inplace_scratch_len())];
        let scratch_z = vec![Complex64::new(0.0, 0.0); fft_z.get_inplace_scratch_len().max(ifft_z.get_inplace_scratch_len())];

        Self {
            nx, ny, nz,
            n_total: nx * ny * nz,
            fft_x, fft_y, fft_z,
            ifft_x, ifft_y, ifft_z,
            scratch_x, scratch_y, scratch_z,
            buffer_y: vec![Complex64::new(0.0, 0.0); ny],
            buffer_z: vec![Complex64::new(0.0, 0.0); nz],
        }
    }

    /// Workspace for a cubic volume of edge `dim`
    pub fn cubic(dim: usize) -> Self {
        Self::new(dim, dim, dim)
    }

    /// Number of voxels handled by this workspace
    #[inline]
    pub fn len(&self) -> usize {
        self.n_total
    }

    /// Edge lengths `[nx, ny, nz]`
    #[inline]
    pub fn dims(&self) -> [usize; 3] {
        [self.nx, self.ny, self.nz]
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.n_total == 0
    }

    /// In-place forward 3D FFT
    pub fn fft3d(&mut self, data: &mut [Complex64]) {
        let (nx, ny, nz) = (self.nx, self.ny, self.nz);

        // Transform along x-axis
        for k in 0..nz {
            for j in 0..ny {
                let start = idx3d(0, j, k, nx, ny);
                self.fft_x.process_with_scratch(&mut data[start..start + nx], &mut self.scratch_x);
            }
        }

        // Transform along y-axis
        for k in 0..nz {
            for i in 0..nx {
                for j in 0..ny {
                    self.buffer_y[j] = data[idx3d(i, j, k, nx, ny)];
                }
                self.fft_y.process_with_scratch(&mut self.buffer_y, &mut self.scratch_y);
                for j in 0..ny {
                    data[idx3d(i, j, k, nx, ny)] = self.buffer_y[j];
                }
            }
        }

        // Transform along z-axis
        for j in 0..ny {
            for i in 0..nx {
                for k in 0..nz {
                    self.buffer_z[k] = data[idx3d(i, j, k, nx, ny)];
                }
                self.fft_z.process_with_scratch(&mut self.buffer_z, &mut self.scratch_z);
                for k in 0..nz {
                    data[idx3d(i, j, k, nx, ny)] = self.buffer_z[k];
                }
            }
        }
    }

    /// In-place inverse 3D FFT (with normalization)
    pub fn ifft3d(&mut self, data: &mut [Complex64]) {
        let (nx, ny, nz) = (self.nx, self.ny, self.nz);
        let n_total = self.n_total as f64;

        for k in 0..nz {
            for j in 0..ny {
                let start = idx3d(0, j, k, nx, ny);
                self.ifft_x.process_with_scratch(&mut data[start..start + nx], &mut self.scratch_x);
            }
        }

        for k in 0..nz {
            for i in 0..nx {
                for j in 0..ny {
                    self.buffer_y[j] = data[idx3d(i, j, k, nx, ny)];
                }
                self.ifft_y.process_with_scratch(&mut self.buffer_y, &mut self.scratch_y);
                for j in 0..ny {
                    data[idx3d(i, j, k, nx, ny)] = self.buffer_y[j];
                }
            }
        }

        for j in 0..ny {
            for i in 0..nx {
                for k in 0..nz {
                    self.buffer_z[k] = data[idx3d(i, j, k, nx, ny)];
                }
                self.ifft_z.process_with_scratch(&mut self.buffer_z, &mut self.scratch_z);
                for k in 0..nz {
                    data[idx3d(i, j, k, nx, ny)] = self.buffer_z[k];
                }
            }
        }

        // Normalize
        for val in data.iter_mut() {
            *val /= n_total;
        }
    }

    /// Forward transform of a real volume into `out`
    #[inline]
    pub fn forward_real(&mut self, x: &[f64], out: &mut [Complex64]) {
        for (c, &r) in out.iter_mut().zip(x.iter()) {
            *c = Complex64::new(r, 0.0);
        }
        self.fft3d(out);
    }

    /// Inverse transform returning the real part in `out`
    ///
    /// `buf` is clobbered.
    #[inline]
    pub fn inverse_real(&mut self, spectrum: &[Complex64], buf: &mut [Complex64], out: &mut [f64]) {
        buf.copy_from_slice(spectrum);
        self.ifft3d(buf);
        for (o, c) in out.iter_mut().zip(buf.iter()) {
            *o = c.re;
        }
    }
}

impl Clone for Fft3dWorkspace {
    /// Shares the plans and allocates fresh scratch buffers
    fn clone(&self) -> Self {
        Self {
            nx: self.nx,
            ny: self.ny,
            nz: self.nz,
            n_total: self.n_total,
            fft_x: Arc::clone(&self.fft_x),
            fft_y: Arc::clone(&self.fft_y),
            fft_z: Arc::clone(&self.fft_z),
            ifft_x: Arc::clone(&self.ifft_x),
            ifft_y: Arc::clone(&self.ifft_y),
            ifft_z: Arc::clone(&self.ifft_z),
            scratch_x: vec![Complex64::new(0.0, 0.0); self.scratch_x.len()],
            scratch_y: vec![Complex64::new(0.0, 0.0); self.scratch_y.len()],
            scratch_z: vec![Complex64::new(0.0, 0.0); self.scratch_z.len()],
            buffer_y: vec![Complex64::new(0.0, 0.0); self.ny],
            buffer_z: vec![Complex64::new(0.0, 0.0); self.nz],
        }
    }
}

/// Index into a 3D array stored in Fortran order (column-major)
/// index = x + y*nx + z*nx*ny
#[inline(always)]
pub fn idx3d(i: usize, j: usize, k: usize, nx: usize, ny: usize) -> usize {
    i + j * nx + k * nx * ny
}

/// Storage index of a signed (possibly negative) lattice offset, wrapped
/// periodically into `[0, n)`
#[inline]
pub fn wrap_index(v: i64, n: usize) -> usize {
    v.rem_euclid(n as i64) as usize
}

/// Sample frequencies of an unshifted transform of length `n` and spacing `d`
///
/// `[0, 1, ..., ceil(n/2)-1, -floor(n/2), ..., -1] / (n·d)`
pub fn fftfreq(n: usize, d: f64) -> Vec<f64> {
    let scale = 1.0 / (n as f64 * d);
    let half = (n + 1) / 2;
    (0..n)
        .map(|i| {
            let k = if i < half { i as f64 } else { i as f64 - n as f64 };
            k * scale
        })
        .collect()
}

/// Multiply a cubic spectrum by the phase ramp of a real-space shift
///
/// After the call, `spectrum` is the transform of the volume translated by
/// `offset` voxels: `F'(k) = F(k) * exp(-2πi k·o / n)`.
pub fn phase_shift_inplace(spectrum: &mut [Complex64], dim: usize, offset: [i64; 3]) {
    if offset == [0, 0, 0] {
        return;
    }
    let freq = fftfreq(dim, 1.0);
    let (ox, oy, oz) = (offset[0] as f64, offset[1] as f64, offset[2] as f64);
    for k in 0..dim {
        for j in 0..dim {
            let base = -2.0 * PI * (freq[j] * oy + freq[k] * oz);
            for i in 0..dim {
                let phase = base - 2.0 * PI * freq[i] * ox;
                spectrum[idx3d(i, j, k, dim, dim)] *= Complex64::from_polar(1.0, phase);
            }
        }
    }
}
