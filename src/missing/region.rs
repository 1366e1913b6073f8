//! Missing-region descriptors
//!
//! A single-axis tilt series samples the Fourier planes that contain the tilt
//! axis and are normal to the (tilted) beam. The union of those planes over the
//! tilt range is the observed region; its complement is the missing wedge.
//! Dual-axis series leave a missing pyramid, conical series a missing cone.

use std::fmt;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Kind of missing region shared by all sub-volumes of a run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissingRegionKind {
    /// Full Fourier coverage, no descriptors allowed
    #[default]
    None,
    Wedge,
    Cone,
    Pyramid,
}

impl fmt::Display for MissingRegionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MissingRegionKind::None => "none",
            MissingRegionKind::Wedge => "wedge",
            MissingRegionKind::Cone => "cone",
            MissingRegionKind::Pyramid => "pyramid",
        };
        f.write_str(name)
    }
}

/// Handle of a descriptor in the [`super::MissingRegionModel`] table
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MissingRegionId(pub usize);

/// Observed-region geometry of one tilt series, angles in degrees
///
/// Tilt bounds are half-open: `[lower, upper)`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum MissingRegionDescriptor {
    /// Single-axis tilt about y
    WedgeY { thy0: f64, thy_f: f64 },
    /// Single-axis tilt about x
    WedgeX { thx0: f64, thx_f: f64 },
    /// Dual-axis tilt about y and x
    Pyramid { thy0: f64, thy_f: f64, thx0: f64, thx_f: f64 },
    /// Conical tilt with maximum tilt `theta_max`
    Cone { theta_max: f64 },
}

impl MissingRegionDescriptor {
    pub fn kind(&self) -> MissingRegionKind {
        match self {
            MissingRegionDescriptor::WedgeY { .. } | MissingRegionDescriptor::WedgeX { .. } => {
                MissingRegionKind::Wedge
            }
            MissingRegionDescriptor::Pyramid { .. } => MissingRegionKind::Pyramid,
            MissingRegionDescriptor::Cone { .. } => MissingRegionKind::Cone,
        }
    }

    /// Reject non-finite, inverted or out-of-range bounds
    pub fn validate(&self, id: usize) -> Result<()> {
        let check_range = |lo: f64, hi: f64, axis: &str| -> Result<()> {
            if !(lo.is_finite() && hi.is_finite()) {
                return Err(Error::InvalidMissingRegion {
                    id,
                    reason: format!("non-finite {axis} tilt bounds"),
                });
            }
            if lo < -90.0 || hi > 90.0 || lo >= hi {
                return Err(Error::InvalidMissingRegion {
                    id,
                    reason: format!("{axis} tilt range [{lo}, {hi}) must satisfy -90 <= lower < upper <= 90"),
                });
            }
            Ok(())
        };

        match *self {
            MissingRegionDescriptor::WedgeY { thy0, thy_f } => check_range(thy0, thy_f, "y"),
            MissingRegionDescriptor::WedgeX { thx0, thx_f } => check_range(thx0, thx_f, "x"),
            MissingRegionDescriptor::Pyramid { thy0, thy_f, thx0, thx_f } => {
                check_range(thy0, thy_f, "y")?;
                check_range(thx0, thx_f, "x")
            }
            MissingRegionDescriptor::Cone { theta_max } => {
                if theta_max.is_finite() && theta_max > 0.0 && theta_max <= 90.0 {
                    Ok(())
                } else {
                    Err(Error::InvalidMissingRegion {
                        id,
                        reason: format!("cone tilt {theta_max} must lie in (0, 90]"),
                    })
                }
            }
        }
    }

    /// Whether the image-frame frequency `k` was sampled by the tilt series
    pub fn observes(&self, k: &Vector3<f64>) -> bool {
        match *self {
            MissingRegionDescriptor::WedgeY { thy0, thy_f } => in_tilt_range(k.x, k.z, thy0, thy_f),
            MissingRegionDescriptor::WedgeX { thx0, thx_f } => in_tilt_range(k.y, k.z, thx0, thx_f),
            MissingRegionDescriptor::Pyramid { thy0, thy_f, thx0, thx_f } => {
                in_tilt_range(k.x, k.z, thy0, thy_f) || in_tilt_range(k.y, k.z, thx0, thx_f)
            }
            MissingRegionDescriptor::Cone { theta_max } => {
                let norm = k.norm();
                norm == 0.0 || k.z.abs() / norm <= theta_max.to_radians().sin()
            }
        }
    }
}

/// Tilt angle (degrees, in [-90, 90)) of the central section containing the
/// in-plane frequency `(u, z)`, tested against `[lo, hi)`
///
/// The section at tilt θ satisfies `u sinθ + z cosθ = 0`, so θ = atan(-z/u).
/// The formula is odd in (u, z), keeping masks Hermitian-symmetric.
#[inline]
fn in_tilt_range(u: f64, z: f64, lo: f64, hi: f64) -> bool {
    let theta = if u != 0.0 {
        (-z / u).atan().to_degrees()
    } else if z != 0.0 {
        -90.0
    } else {
        0.0
    };
    theta >= lo && theta < hi
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wedge_y_samples_untilted_plane() {
        let wedge = MissingRegionDescriptor::WedgeY { thy0: -60.0, thy_f: 60.0 };
        // z = 0 plane is the untilted projection
        assert!(wedge.observes(&Vector3::new(0.3, 0.1, 0.0)));
        // Pure kz is the centre of the missing wedge
        assert!(!wedge.observes(&Vector3::new(0.0, 0.0, 0.3)));
        // The tilt axis is always sampled
        assert!(wedge.observes(&Vector3::new(0.0, 0.4, 0.0)));
    }

    #[test]
    fn test_wedge_y_edge_angle() {
        let wedge = MissingRegionDescriptor::WedgeY { thy0: -45.0, thy_f: 45.0 };
        // theta = atan(-z/x) = -30
        let z = (30.0f64).to_radians().tan() * 0.2;
        assert!(wedge.observes(&Vector3::new(0.2, 0.0, z)));
        // theta = -60 is outside
        let z = (60.0f64).to_radians().tan() * 0.2;
        assert!(!wedge.observes(&Vector3::new(0.2, 0.0, z)));
    }

    #[test]
    fn test_wedge_is_point_symmetric() {
        let wedge = MissingRegionDescriptor::WedgeX { thx0: -50.0, thx_f: 35.0 };
        for &(x, y, z) in &[(0.1, 0.2, -0.3), (0.0, -0.25, 0.125), (0.4, 0.0, 0.1)] {
            let k = Vector3::new(x, y, z);
            assert_eq!(wedge.observes(&k), wedge.observes(&-k));
        }
    }

    #[test]
    fn test_complementary_wedges_partition() {
        let lower = MissingRegionDescriptor::WedgeY { thy0: -90.0, thy_f: 0.0 };
        let upper = MissingRegionDescriptor::WedgeY { thy0: 0.0, thy_f: 90.0 };
        let vals = [-0.5, -0.25, 0.0, 0.125, 0.375];
        for &x in &vals {
            for &z in &vals {
                let k = Vector3::new(x, 0.1, z);
                assert!(lower.observes(&k) ^ upper.observes(&k), "({}, {}) covered twice or never", x, z);
            }
        }
    }

    #[test]
    fn test_pyramid_is_union_of_wedges() {
        let pyr = MissingRegionDescriptor::Pyramid { thy0: -30.0, thy_f: 30.0, thx0: -30.0, thx_f: 30.0 };
        assert!(pyr.observes(&Vector3::new(0.3, 0.0, 0.05)));
        assert!(pyr.observes(&Vector3::new(0.0, 0.3, 0.05)));
        assert!(!pyr.observes(&Vector3::new(0.05, 0.05, 0.3)));
    }

    #[test]
    fn test_cone() {
        let cone = MissingRegionDescriptor::Cone { theta_max: 60.0 };
        assert!(cone.observes(&Vector3::new(0.0, 0.0, 0.0)));
        assert!(cone.observes(&Vector3::new(0.3, 0.0, 0.1)));
        assert!(!cone.observes(&Vector3::new(0.01, 0.0, 0.3)));
    }

    #[test]
    fn test_validate_bounds() {
        assert!(MissingRegionDescriptor::WedgeY { thy0: -60.0, thy_f: 60.0 }.validate(0).is_ok());
        assert!(MissingRegionDescriptor::WedgeY { thy0: 60.0, thy_f: -60.0 }.validate(0).is_err());
        assert!(MissingRegionDescriptor::WedgeX { thx0: -100.0, thx_f: 60.0 }.validate(0).is_err());
        assert!(MissingRegionDescriptor::Cone { theta_max: 0.0 }.validate(3).is_err());
        assert!(MissingRegionDescriptor::Pyramid { thy0: -60.0, thy_f: 60.0, thx0: f64::NAN, thx_f: 1.0 }
            .validate(1)
            .is_err());
    }
}
