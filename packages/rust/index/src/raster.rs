//! GeoTIFF reading and writing on top of the `tiff` crate.
//!
//! Bands are read either as interleaved samples of one image or as
//! successive pages of a multi-page file. Georeferencing is carried as the
//! raw GeoTIFF tags so an output raster lands exactly where its source did.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use burnwatch_shared::{BurnwatchError, Result};
use ndarray::Array2;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{TiffEncoder, colortype, compression::Lzw};
use tiff::tags::Tag;

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const MODEL_TRANSFORMATION: u16 = 34264;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GEO_DOUBLE_PARAMS: u16 = 34736;
const GEO_ASCII_PARAMS: u16 = 34737;

fn tag(code: u16) -> Tag {
    Tag::from_u16_exhaustive(code)
}

/// GeoTIFF georeferencing tags: geotransform plus CRS definition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeoTags {
    pub pixel_scale: Option<Vec<f64>>,
    pub tiepoint: Option<Vec<f64>>,
    pub transformation: Option<Vec<f64>>,
    pub key_directory: Option<Vec<u16>>,
    pub double_params: Option<Vec<f64>>,
    pub ascii_params: Option<String>,
}

impl GeoTags {
    /// Whether the raster carries any georeferencing at all.
    pub fn is_empty(&self) -> bool {
        self.pixel_scale.is_none()
            && self.tiepoint.is_none()
            && self.transformation.is_none()
            && self.key_directory.is_none()
    }

    fn read<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>) -> tiff::TiffResult<Self> {
        let f64_tag = |decoder: &mut Decoder<R>, code| -> tiff::TiffResult<Option<Vec<f64>>> {
            match decoder.find_tag(tag(code))? {
                Some(value) => value.into_f64_vec().map(Some),
                None => Ok(None),
            }
        };

        let pixel_scale = f64_tag(decoder, MODEL_PIXEL_SCALE)?;
        let tiepoint = f64_tag(decoder, MODEL_TIEPOINT)?;
        let transformation = f64_tag(decoder, MODEL_TRANSFORMATION)?;
        let double_params = f64_tag(decoder, GEO_DOUBLE_PARAMS)?;

        let key_directory = match decoder.find_tag(tag(GEO_KEY_DIRECTORY))? {
            Some(value) => Some(
                value
                    .into_u32_vec()?
                    .into_iter()
                    .map(|v| v as u16)
                    .collect(),
            ),
            None => None,
        };
        let ascii_params = match decoder.find_tag(tag(GEO_ASCII_PARAMS))? {
            Some(value) => Some(value.into_string()?),
            None => None,
        };

        Ok(Self {
            pixel_scale,
            tiepoint,
            transformation,
            key_directory,
            double_params,
            ascii_params,
        })
    }
}

/// A decoded multi-band raster.
#[derive(Debug, Clone)]
pub struct Raster {
    pub width: usize,
    pub height: usize,
    /// Bands as `(rows, cols)` arrays, in file order.
    pub bands: Vec<Array2<f32>>,
    pub geo: GeoTags,
}

impl Raster {
    /// Band `index` (0-based), or a raster error naming the file.
    pub fn band(&self, index: usize, path: &Path) -> Result<&Array2<f32>> {
        self.bands.get(index).ok_or_else(|| {
            BurnwatchError::raster(
                path,
                format!("expected at least {} bands, found {}", index + 1, self.bands.len()),
            )
        })
    }
}

fn samples_to_f32(result: DecodingResult) -> Option<Vec<f32>> {
    let values = match result {
        DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::U64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I64(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
        #[allow(unreachable_patterns)]
        _ => return None,
    };
    Some(values)
}

/// Read every band of a GeoTIFF as `f32`.
pub fn read_raster(path: &Path) -> Result<Raster> {
    let err = |e: tiff::TiffError| BurnwatchError::raster(path, e.to_string());

    let file = File::open(path).map_err(|e| BurnwatchError::io(path, e))?;
    let mut decoder = Decoder::new(BufReader::new(file))
        .map_err(err)?
        .with_limits(Limits::unlimited());

    let (width, height) = decoder.dimensions().map_err(err)?;
    let (width, height) = (width as usize, height as usize);
    if width == 0 || height == 0 {
        return Err(BurnwatchError::raster(path, "raster has no pixels"));
    }
    let geo = GeoTags::read(&mut decoder).map_err(err)?;

    let mut bands = Vec::new();
    loop {
        let (w, h) = decoder.dimensions().map_err(err)?;
        if (w as usize, h as usize) != (width, height) {
            tracing::debug!(path = %path.display(), "skipping page with different dimensions");
        } else {
            let samples = samples_to_f32(decoder.read_image().map_err(err)?)
                .ok_or_else(|| BurnwatchError::raster(path, "unsupported sample format"))?;
            bands.extend(split_samples(&samples, width, height, path)?);
        }

        if !decoder.more_images() {
            break;
        }
        decoder.next_image().map_err(err)?;
    }

    Ok(Raster {
        width,
        height,
        bands,
        geo,
    })
}

/// De-interleave chunky samples into one array per band.
fn split_samples(
    samples: &[f32],
    width: usize,
    height: usize,
    path: &Path,
) -> Result<Vec<Array2<f32>>> {
    let pixels = width * height;
    if samples.is_empty() || samples.len() % pixels != 0 {
        return Err(BurnwatchError::raster(
            path,
            format!("{} samples do not fill a {width}x{height} grid", samples.len()),
        ));
    }

    let per_pixel = samples.len() / pixels;
    (0..per_pixel)
        .map(|band| {
            let values: Vec<f32> = samples.iter().skip(band).step_by(per_pixel).copied().collect();
            Array2::from_shape_vec((height, width), values)
                .map_err(|e| BurnwatchError::raster(path, e.to_string()))
        })
        .collect()
}

/// Write a single-band `Float32` raster with LZW compression and the given georeferencing.
pub fn write_index_raster(path: &Path, data: &Array2<f32>, geo: &GeoTags) -> Result<()> {
    let err = |e: tiff::TiffError| BurnwatchError::raster(path, e.to_string());
    let (height, width) = data.dim();

    let file = File::create(path).map_err(|e| BurnwatchError::io(path, e))?;
    let mut encoder = TiffEncoder::new(BufWriter::new(file)).map_err(err)?;
    let mut image = encoder
        .new_image_with_compression::<colortype::Gray32Float, _>(
            width as u32,
            height as u32,
            Lzw::default(),
        )
        .map_err(err)?;

    {
        let dir = image.encoder();
        if let Some(v) = &geo.pixel_scale {
            dir.write_tag(tag(MODEL_PIXEL_SCALE), v.as_slice()).map_err(err)?;
        }
        if let Some(v) = &geo.tiepoint {
            dir.write_tag(tag(MODEL_TIEPOINT), v.as_slice()).map_err(err)?;
        }
        if let Some(v) = &geo.transformation {
            dir.write_tag(tag(MODEL_TRANSFORMATION), v.as_slice()).map_err(err)?;
        }
        if let Some(v) = &geo.key_directory {
            dir.write_tag(tag(GEO_KEY_DIRECTORY), v.as_slice()).map_err(err)?;
        }
        if let Some(v) = &geo.double_params {
            dir.write_tag(tag(GEO_DOUBLE_PARAMS), v.as_slice()).map_err(err)?;
        }
        if let Some(v) = &geo.ascii_params {
            dir.write_tag(tag(GEO_ASCII_PARAMS), v.as_str()).map_err(err)?;
        }
    }

    let values: Vec<f32> = data.iter().copied().collect();
    image.write_data(&values).map_err(err)?;
    Ok(())
}

/// `*.tif` / `*.tiff` files directly inside `dir`, sorted by name.
pub fn list_rasters(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| BurnwatchError::io(dir, e))?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && is_tiff(p))
        .collect();
    paths.sort();
    Ok(paths)
}

fn is_tiff(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("tif") || e.eq_ignore_ascii_case("tiff"))
}
