//! NIfTI volume I/O
//!
//! Sub-volumes are read from `.nii` or `.nii.gz` (gzip is detected from the
//! content, not the file name) and must be cubic. References are written as
//! single-file NIfTI-1 with float32 voxels.

use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::debug;
use ndarray::Array;
use nifti::volume::ndarray::IntoNdArray;
use nifti::{InMemNiftiObject, NiftiObject};

use crate::error::{Error, Result};

/// A cubic volume read from disk
#[derive(Clone, Debug)]
pub struct CubicVolume {
    /// dim³ voxels in Fortran order
    pub data: Vec<f64>,
    pub dim: usize,
    /// Voxel edge (x, y, z)
    pub voxel_size: (f64, f64, f64),
}

fn is_gzip(bytes: &[u8]) -> bool {
    bytes.len() >= 2 && bytes[0] == 0x1f && bytes[1] == 0x8b
}

/// Short header summary for error messages
fn header_info(bytes: &[u8]) -> String {
    if bytes.len() < 348 {
        return format!("file too small ({} bytes, need at least 348)", bytes.len());
    }
    let sizeof_hdr = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let magic = String::from_utf8_lossy(&bytes[344..348]).to_string();
    let datatype = i16::from_le_bytes([bytes[70], bytes[71]]);
    format!("sizeof_hdr={}, magic='{}', datatype={}", sizeof_hdr, magic, datatype)
}

/// Read a cubic volume from NIfTI bytes
///
/// 4D inputs contribute their first volume.
pub fn load_volume(bytes: &[u8]) -> Result<CubicVolume> {
    let obj: InMemNiftiObject = if is_gzip(bytes) {
        InMemNiftiObject::from_reader(GzDecoder::new(Cursor::new(bytes)))?
    } else {
        InMemNiftiObject::from_reader(Cursor::new(bytes)).map_err(|e| {
            debug!("unreadable NIfTI header: {}", header_info(bytes));
            e
        })?
    };

    let header = obj.header();
    if (header.dim[0] as usize) < 3 {
        return Err(Error::NiftiFormat(format!("expected at least a 3D volume, got {}D", header.dim[0])));
    }
    let pixdim = header.pixdim;
    let voxel_size = (pixdim[1] as f64, pixdim[2] as f64, pixdim[3] as f64);

    let array: Array<f64, _> = obj.into_volume().into_ndarray()?;
    let shape = array.shape().to_vec();
    if shape.len() < 3 {
        return Err(Error::NiftiFormat(format!("expected at least a 3D array, got {}D", shape.len())));
    }

    let (nx, ny, nz) = (shape[0], shape[1], shape[2]);
    if nx != ny || ny != nz {
        return Err(Error::NotCubic { nx, ny, nz });
    }

    // x varies fastest: index = x + y*nx + z*nx*ny
    let mut data = Vec::with_capacity(nx * ny * nz);
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let v = if shape.len() == 3 { array[[i, j, k]] } else { array[[i, j, k, 0]] };
                data.push(v);
            }
        }
    }

    Ok(CubicVolume { data, dim: nx, voxel_size })
}

/// Read a cubic volume from a `.nii` / `.nii.gz` file
pub fn read_volume(path: &Path) -> Result<CubicVolume> {
    let bytes = fs::read(path)?;
    let vol = load_volume(&bytes)?;
    debug!("read {} ({}^3)", path.display(), vol.dim);
    Ok(vol)
}

/// Encode a cubic volume as uncompressed NIfTI-1 bytes
pub fn save_volume(data: &[f64], dim: usize, voxel_size: f64) -> Result<Vec<u8>> {
    let expected = dim * dim * dim;
    if data.len() != expected {
        return Err(Error::DimensionMismatch { index: 0, dim, expected, got: data.len() });
    }
    let edge = i16::try_from(dim)
        .map_err(|_| Error::NiftiFormat(format!("edge {} does not fit a NIfTI-1 header", dim)))?;

    let mut header = [0u8; 348];
    header[0..4].copy_from_slice(&348i32.to_le_bytes());

    let dims: [i16; 8] = [3, edge, edge, edge, 1, 1, 1, 1];
    for (i, &d) in dims.iter().enumerate() {
        let offset = 40 + i * 2;
        header[offset..offset + 2].copy_from_slice(&d.to_le_bytes());
    }

    // FLOAT32
    header[70..72].copy_from_slice(&16i16.to_le_bytes());
    header[72..74].copy_from_slice(&32i16.to_le_bytes());

    let vs = voxel_size as f32;
    let pixdim: [f32; 8] = [1.0, vs, vs, vs, 1.0, 1.0, 1.0, 1.0];
    for (i, &p) in pixdim.iter().enumerate() {
        let offset = 76 + i * 4;
        header[offset..offset + 4].copy_from_slice(&p.to_le_bytes());
    }

    // header + 4 extension bytes
    header[108..112].copy_from_slice(&352.0f32.to_le_bytes());
    header[112..116].copy_from_slice(&1.0f32.to_le_bytes());
    header[116..120].copy_from_slice(&0.0f32.to_le_bytes());

    // sform: isotropic scaling
    header[254..256].copy_from_slice(&1i16.to_le_bytes());
    for row in 0..3 {
        for col in 0..4 {
            let offset = 280 + row * 16 + col * 4;
            let v = if row == col { vs } else { 0.0 };
            header[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
        }
    }

    header[344..348].copy_from_slice(b"n+1\0");

    let mut buffer = Vec::with_capacity(352 + data.len() * 4);
    buffer.write_all(&header)?;
    buffer.write_all(&[0u8; 4])?;
    for &val in data {
        buffer.write_all(&(val as f32).to_le_bytes())?;
    }
    Ok(buffer)
}

/// Encode a cubic volume as gzipped NIfTI-1 bytes
pub fn save_volume_gz(data: &[f64], dim: usize, voxel_size: f64) -> Result<Vec<u8>> {
    let raw = save_volume(data, dim, voxel_size)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw)?;
    Ok(encoder.finish()?)
}

/// Write a cubic volume, gzipped when the file name ends in `.gz`
pub fn write_volume(path: &Path, data: &[f64], dim: usize, voxel_size: f64) -> Result<()> {
    let gz = path.extension().map_or(false, |e| e == "gz");
    let bytes = if gz {
        save_volume_gz(data, dim, voxel_size)?
    } else {
        save_volume(data, dim, voxel_size)?
    };
    fs::write(path, bytes)?;
    debug!("wrote {}", path.display());
    Ok(())
}
