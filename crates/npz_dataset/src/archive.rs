//! Decoding of per-sample `.npz` archives.
//!
//! Each archive holds three arrays in `numpy.savez` order:
//! - `arr_0`: raster, `[H, W, C]` (C in 1, 3, 4) or `[H, W]`, u8
//! - `arr_1`: boxes, `[N, 4]`
//! - `arr_2`: class ids, `[N]`

use crate::types::{DatasetError, DatasetResult};
use image::{DynamicImage, GrayImage, RgbImage, RgbaImage};
use ndarray::ArrayD;
use ndarray_npy::{NpzReader, ReadNpyError, ReadNpzError, ReadableElement};
use std::fs::File;
use std::path::Path;

pub const ARCHIVE_EXTENSION: &str = "npz";

const IMAGE_ARRAY: &str = "arr_0";
const BOXES_ARRAY: &str = "arr_1";
const LABELS_ARRAY: &str = "arr_2";

/// Raw contents of one archive before it becomes a `Sample`.
#[derive(Debug, Clone)]
pub struct ArchiveContents {
    pub image: RgbImage,
    pub boxes: Vec<[f32; 4]>,
    pub labels: Vec<i64>,
}

pub fn read_archive(path: &Path) -> DatasetResult<ArchiveContents> {
    let file = File::open(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            DatasetError::NotFound {
                path: path.to_path_buf(),
            }
        } else {
            DatasetError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    let mut npz = NpzReader::new(file).map_err(|source| DatasetError::Archive {
        path: path.to_path_buf(),
        source,
    })?;
    let names = npz.names().map_err(|source| DatasetError::Archive {
        path: path.to_path_buf(),
        source,
    })?;

    let image_name = resolve_entry(&names, IMAGE_ARRAY, path)?;
    let boxes_name = resolve_entry(&names, BOXES_ARRAY, path)?;
    let labels_name = resolve_entry(&names, LABELS_ARRAY, path)?;

    let raster: ArrayD<u8> = npz
        .by_name(&image_name)
        .map_err(|source| DatasetError::Archive {
            path: path.to_path_buf(),
            source,
        })?;
    let image = raster_to_rgb(raster, path)?;

    let boxes = read_boxes(&mut npz, &boxes_name, path)?;
    let labels = read_labels(&mut npz, &labels_name, path)?;

    Ok(ArchiveContents {
        image,
        boxes,
        labels,
    })
}

/// numpy stores `arr_0` as `arr_0.npy`; accept either spelling.
fn resolve_entry(names: &[String], wanted: &str, path: &Path) -> DatasetResult<String> {
    let with_ext = format!("{wanted}.npy");
    names
        .iter()
        .find(|n| n.as_str() == wanted || n.as_str() == with_ext)
        .cloned()
        .ok_or_else(|| DatasetError::Malformed {
            path: path.to_path_buf(),
            msg: format!("missing array {wanted} (found {names:?})"),
        })
}

fn raster_to_rgb(raster: ArrayD<u8>, path: &Path) -> DatasetResult<RgbImage> {
    let shape = raster.shape().to_vec();
    let (height, width, channels) = match shape.as_slice() {
        [h, w] => (*h, *w, 1),
        [h, w, c] => (*h, *w, *c),
        other => {
            return Err(DatasetError::Malformed {
                path: path.to_path_buf(),
                msg: format!("image array has shape {other:?}, expected [H, W] or [H, W, C]"),
            })
        }
    };
    // Logical (row-major) order regardless of how the array was stored.
    let raw: Vec<u8> = raster.iter().copied().collect();
    let (w, h) = (width as u32, height as u32);
    let malformed = || DatasetError::Malformed {
        path: path.to_path_buf(),
        msg: format!("image buffer does not match shape {shape:?}"),
    };
    let rgb = match channels {
        1 => DynamicImage::ImageLuma8(GrayImage::from_raw(w, h, raw).ok_or_else(malformed)?)
            .to_rgb8(),
        3 => RgbImage::from_raw(w, h, raw).ok_or_else(malformed)?,
        4 => DynamicImage::ImageRgba8(RgbaImage::from_raw(w, h, raw).ok_or_else(malformed)?)
            .to_rgb8(),
        c => {
            return Err(DatasetError::Malformed {
                path: path.to_path_buf(),
                msg: format!("unsupported channel count {c}"),
            })
        }
    };
    Ok(rgb)
}

type Decoded<T> = (Vec<usize>, Vec<T>);
type Reader<R, T> = fn(&mut NpzReader<R>, &str) -> Result<Decoded<T>, ReadNpzError>;

/// Try each numpy dtype in turn; the first one matching the header wins.
///
/// A descriptor mismatch moves on to the next dtype. Any other failure is
/// a broken archive and is returned as is.
fn read_any<R, T>(
    npz: &mut NpzReader<R>,
    name: &str,
    path: &Path,
    readers: &[(&str, Reader<R, T>)],
) -> DatasetResult<Decoded<T>>
where
    R: std::io::Read + std::io::Seek,
{
    let mut found = None;
    for (_, read) in readers {
        match read(npz, name) {
            Ok(decoded) => return Ok(decoded),
            Err(ReadNpzError::Npy(ReadNpyError::WrongDescriptor(descr))) => {
                found = Some(format!("{descr:?}"));
            }
            Err(source) => {
                return Err(DatasetError::Archive {
                    path: path.to_path_buf(),
                    source,
                })
            }
        }
    }
    let accepted: Vec<&str> = readers.iter().map(|(dtype, _)| *dtype).collect();
    Err(DatasetError::Malformed {
        path: path.to_path_buf(),
        msg: format!(
            "{name} has unsupported dtype {}, expected one of {accepted:?}",
            found.unwrap_or_else(|| "<unknown>".into())
        ),
    })
}

fn decode_as<R, E, T>(npz: &mut NpzReader<R>, name: &str) -> Result<Decoded<T>, ReadNpzError>
where
    R: std::io::Read + std::io::Seek,
    E: ReadableElement + Copy,
    T: FromElement<E>,
{
    let arr: ArrayD<E> = npz.by_name(name)?;
    let shape = arr.shape().to_vec();
    Ok((shape, arr.iter().map(|v| T::from_element(*v)).collect()))
}

trait FromElement<E> {
    fn from_element(v: E) -> Self;
}

macro_rules! from_element {
    ($target:ty: $($src:ty),*) => {
        $(impl FromElement<$src> for $target {
            fn from_element(v: $src) -> Self {
                v as $target
            }
        })*
    };
}

from_element!(f32: f32, f64, i8, i16, i32, i64, u8, u16, u32, u64);
from_element!(i64: f32, f64, i8, i16, i32, i64, u8, u16, u32, u64);

/// Every numeric dtype numpy writes by default, most common first.
/// Float class ids are truncated toward zero.
fn numeric_readers<R, T>() -> [(&'static str, Reader<R, T>); 10]
where
    R: std::io::Read + std::io::Seek,
    T: FromElement<f32>
        + FromElement<f64>
        + FromElement<i8>
        + FromElement<i16>
        + FromElement<i32>
        + FromElement<i64>
        + FromElement<u8>
        + FromElement<u16>
        + FromElement<u32>
        + FromElement<u64>,
{
    [
        ("f4", decode_as::<R, f32, T>),
        ("f8", decode_as::<R, f64, T>),
        ("i8", decode_as::<R, i64, T>),
        ("i4", decode_as::<R, i32, T>),
        ("i2", decode_as::<R, i16, T>),
        ("i1", decode_as::<R, i8, T>),
        ("u1", decode_as::<R, u8, T>),
        ("u2", decode_as::<R, u16, T>),
        ("u4", decode_as::<R, u32, T>),
        ("u8", decode_as::<R, u64, T>),
    ]
}

fn read_boxes<R: std::io::Read + std::io::Seek>(
    npz: &mut NpzReader<R>,
    name: &str,
    path: &Path,
) -> DatasetResult<Vec<[f32; 4]>> {
    let (shape, flat) = read_any::<R, f32>(npz, name, path, &numeric_readers())?;
    if flat.is_empty() {
        return Ok(Vec::new());
    }
    if shape.len() != 2 || shape[1] != 4 {
        return Err(DatasetError::Malformed {
            path: path.to_path_buf(),
            msg: format!("box array has shape {shape:?}, expected [N, 4]"),
        });
    }
    Ok(flat
        .chunks_exact(4)
        .map(|c| [c[0], c[1], c[2], c[3]])
        .collect())
}

fn read_labels<R: std::io::Read + std::io::Seek>(
    npz: &mut NpzReader<R>,
    name: &str,
    path: &Path,
) -> DatasetResult<Vec<i64>> {
    let (shape, labels) = read_any::<R, i64>(npz, name, path, &numeric_readers())?;
    if !labels.is_empty() && shape.len() > 1 {
        return Err(DatasetError::Malformed {
            path: path.to_path_buf(),
            msg: format!("label array has shape {shape:?}, expected [N]"),
        });
    }
    Ok(labels)
}
