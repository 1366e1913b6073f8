//! Orientation geometry for sub-volume alignment
//!
//! Euler angles follow the ZYZ convention (rot, tilt, psi) in degrees, the
//! convention used by most tomography packages. Volumes rotate about their
//! logical centre `dim / 2`.

use nalgebra::{Matrix3, Vector3};

use crate::fft::idx3d;

/// Rotation matrix for ZYZ Euler angles given in degrees
///
/// `A = Rz(psi) * Ry(tilt) * Rz(rot)`
pub fn euler_to_matrix(rot: f64, tilt: f64, psi: f64) -> Matrix3<f64> {
    let (sa, ca) = rot.to_radians().sin_cos();
    let (sb, cb) = tilt.to_radians().sin_cos();
    let (sg, cg) = psi.to_radians().sin_cos();

    let cc = cb * ca;
    let cs = cb * sa;
    let sc = sb * ca;
    let ss = sb * sa;

    Matrix3::new(
        cg * cc - sg * sa, cg * cs + sg * ca, -cg * sb,
        -sg * cc - cg * sa, -sg * cs + cg * ca, sg * sb,
        sc, ss, cb,
    )
}

/// Angle in degrees of the relative rotation `aᵀ b`
pub fn angular_distance(a: &Matrix3<f64>, b: &Matrix3<f64>) -> f64 {
    let rel = a.transpose() * b;
    let cos = ((rel.trace() - 1.0) * 0.5).clamp(-1.0, 1.0);
    cos.acos().to_degrees()
}

/// Rotate a cubic volume about its centre with trilinear interpolation
///
/// Content at `q` moves to `R (q - c) + c`. Samples falling outside the
/// volume are zero.
///
/// # Arguments
/// * `src` - Input volume (dim³, Fortran order)
/// * `dim` - Edge length
/// * `rot` - Rotation applied to the content
/// * `out` - Output volume (dim³)
pub fn rotate_volume(src: &[f64], dim: usize, rot: &Matrix3<f64>, out: &mut [f64]) {
    if rot == &Matrix3::identity() {
        out.copy_from_slice(src);
        return;
    }

    let c = (dim / 2) as f64;
    let inv = rot.transpose();
    let max = dim as f64 - 1.0;

    for k in 0..dim {
        for j in 0..dim {
            for i in 0..dim {
                let p = Vector3::new(i as f64 - c, j as f64 - c, k as f64 - c);
                let q = inv * p;
                let (x, y, z) = (q.x + c, q.y + c, q.z + c);

                let idx = idx3d(i, j, k, dim, dim);
                if x < 0.0 || y < 0.0 || z < 0.0 || x > max || y > max || z > max {
                    out[idx] = 0.0;
                    continue;
                }
                out[idx] = trilinear(src, dim, x, y, z);
            }
        }
    }
}

#[inline]
fn trilinear(src: &[f64], dim: usize, x: f64, y: f64, z: f64) -> f64 {
    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let z0 = z.floor() as usize;
    let x1 = (x0 + 1).min(dim - 1);
    let y1 = (y0 + 1).min(dim - 1);
    let z1 = (z0 + 1).min(dim - 1);
    let fx = x - x0 as f64;
    let fy = y - y0 as f64;
    let fz = z - z0 as f64;

    let v = |i, j, k| src[idx3d(i, j, k, dim, dim)];

    let c00 = v(x0, y0, z0) * (1.0 - fx) + v(x1, y0, z0) * fx;
    let c10 = v(x0, y1, z0) * (1.0 - fx) + v(x1, y1, z0) * fx;
    let c01 = v(x0, y0, z1) * (1.0 - fx) + v(x1, y0, z1) * fx;
    let c11 = v(x0, y1, z1) * (1.0 - fx) + v(x1, y1, z1) * fx;

    let c0 = c00 * (1.0 - fy) + c10 * fy;
    let c1 = c01 * (1.0 - fy) + c11 * fy;

    c0 * (1.0 - fz) + c1 * fz
}
