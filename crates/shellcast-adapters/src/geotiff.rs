//! Single-band north-up GeoTIFF rasters.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek};
use std::path::{Path, PathBuf};

use geo::{coord, BoundingRect, Intersects, MultiPolygon, Point, Rect};
use thiserror::Error;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

#[derive(Debug, Error)]
pub enum RasterError {
    #[error("opening raster {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("decoding raster {}: {source}", .path.display())]
    Tiff {
        path: PathBuf,
        #[source]
        source: tiff::TiffError,
    },
    #[error("raster {} carries no pixel scale / tie point georeference", .path.display())]
    MissingGeoreference { path: PathBuf },
    #[error("raster {} has an unsupported sample type", .path.display())]
    UnsupportedSampleType { path: PathBuf },
    #[error("raster {} holds {actual} samples, expected {expected}", .path.display())]
    SizeMismatch {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeoRaster {
    pub width: usize,
    pub height: usize,
    /// Upper-left corner of the upper-left pixel.
    pub origin_x: f64,
    pub origin_y: f64,
    pub pixel_width: f64,
    pub pixel_height: f64,
    pub nodata: Option<f64>,
    /// Row-major, north to south.
    pub data: Vec<f64>,
}

impl GeoRaster {
    pub fn read(path: &Path) -> Result<Self, RasterError> {
        let file = File::open(path).map_err(|source| RasterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::decode(BufReader::new(file), path)
    }

    fn decode<R: Read + Seek>(reader: R, path: &Path) -> Result<Self, RasterError> {
        let tiff_err = |source| RasterError::Tiff {
            path: path.to_path_buf(),
            source,
        };
        let mut decoder = Decoder::new(reader)
            .map_err(tiff_err)?
            .with_limits(Limits::unlimited());
        let (width, height) = decoder.dimensions().map_err(tiff_err)?;

        let scale = decoder
            .find_tag(Tag::ModelPixelScaleTag)
            .map_err(tiff_err)?
            .map(|v| v.into_f64_vec())
            .transpose()
            .map_err(tiff_err)?;
        let tiepoint = decoder
            .find_tag(Tag::ModelTiepointTag)
            .map_err(tiff_err)?
            .map(|v| v.into_f64_vec())
            .transpose()
            .map_err(tiff_err)?;
        let (Some(scale), Some(tiepoint)) = (scale, tiepoint) else {
            return Err(RasterError::MissingGeoreference {
                path: path.to_path_buf(),
            });
        };
        if scale.len() < 2 || tiepoint.len() < 6 {
            return Err(RasterError::MissingGeoreference {
                path: path.to_path_buf(),
            });
        }

        let nodata = match decoder.find_tag(Tag::GdalNodata).map_err(tiff_err)? {
            Some(value) => value
                .into_string()
                .ok()
                .and_then(|s| s.trim_matches(char::from(0)).trim().parse::<f64>().ok()),
            None => None,
        };

        let data: Vec<f64> = match decoder.read_image().map_err(tiff_err)? {
            DecodingResult::F32(v) => v.into_iter().map(f64::from).collect(),
            DecodingResult::F64(v) => v,
            DecodingResult::U8(v) => v.into_iter().map(f64::from).collect(),
            DecodingResult::U16(v) => v.into_iter().map(f64::from).collect(),
            DecodingResult::U32(v) => v.into_iter().map(f64::from).collect(),
            DecodingResult::I8(v) => v.into_iter().map(f64::from).collect(),
            DecodingResult::I16(v) => v.into_iter().map(f64::from).collect(),
            DecodingResult::I32(v) => v.into_iter().map(f64::from).collect(),
            _ => {
                return Err(RasterError::UnsupportedSampleType {
                    path: path.to_path_buf(),
                })
            }
        };

        let (width, height) = (width as usize, height as usize);
        if data.len() != width * height {
            return Err(RasterError::SizeMismatch {
                path: path.to_path_buf(),
                expected: width * height,
                actual: data.len(),
            });
        }

        // Tie point (I, J, K) -> (X, Y, Z).
        let (pixel_width, pixel_height) = (scale[0], scale[1]);
        Ok(Self {
            width,
            height,
            origin_x: tiepoint[3] - tiepoint[0] * pixel_width,
            origin_y: tiepoint[4] + tiepoint[1] * pixel_height,
            pixel_width,
            pixel_height,
            nodata,
            data,
        })
    }

    pub fn write(&self, path: &Path) -> Result<(), RasterError> {
        let io_err = |source| RasterError::Io {
            path: path.to_path_buf(),
            source,
        };
        let tiff_err = |source| RasterError::Tiff {
            path: path.to_path_buf(),
            source,
        };
        let file = File::create(path).map_err(io_err)?;
        let mut encoder = TiffEncoder::new(BufWriter::new(file)).map_err(tiff_err)?;
        let mut image = encoder
            .new_image::<colortype::Gray64Float>(self.width as u32, self.height as u32)
            .map_err(tiff_err)?;
        image
            .encoder()
            .write_tag(
                Tag::ModelPixelScaleTag,
                &[self.pixel_width, self.pixel_height, 0.0][..],
            )
            .map_err(tiff_err)?;
        image
            .encoder()
            .write_tag(
                Tag::ModelTiepointTag,
                &[0.0, 0.0, 0.0, self.origin_x, self.origin_y, 0.0][..],
            )
            .map_err(tiff_err)?;
        if let Some(nodata) = self.nodata {
            image
                .encoder()
                .write_tag(Tag::GdalNodata, nodata.to_string().as_str())
                .map_err(tiff_err)?;
        }
        image.write_data(&self.data).map_err(tiff_err)
    }

    /// Value at a pixel, `None` for nodata and non-finite samples.
    pub fn value(&self, col: usize, row: usize) -> Option<f64> {
        if col >= self.width || row >= self.height {
            return None;
        }
        let v = self.data[row * self.width + col];
        if !v.is_finite() || self.nodata.is_some_and(|nd| v == nd) {
            return None;
        }
        Some(v)
    }

    fn col_of(&self, x: f64) -> f64 {
        ((x - self.origin_x) / self.pixel_width).floor()
    }

    fn row_of(&self, y: f64) -> f64 {
        ((self.origin_y - y) / self.pixel_height).floor()
    }

    /// Value of the pixel containing `point`.
    pub fn sample(&self, point: &Point<f64>) -> Option<f64> {
        let col = self.col_of(point.x());
        let row = self.row_of(point.y());
        if col < 0.0 || row < 0.0 {
            return None;
        }
        self.value(col as usize, row as usize)
    }

    fn cell(&self, col: usize, row: usize) -> Rect<f64> {
        let x0 = self.origin_x + col as f64 * self.pixel_width;
        let y0 = self.origin_y - row as f64 * self.pixel_height;
        Rect::new(
            coord! { x: x0, y: y0 - self.pixel_height },
            coord! { x: x0 + self.pixel_width, y: y0 },
        )
    }

    /// Mean over every valid pixel whose cell touches `area`.
    pub fn zonal_mean(&self, area: &MultiPolygon<f64>) -> Option<f64> {
        let bounds = area.bounding_rect()?;
        let max_col = self.width as f64 - 1.0;
        let max_row = self.height as f64 - 1.0;
        let col_lo = self.col_of(bounds.min().x).max(0.0);
        let col_hi = self.col_of(bounds.max().x).min(max_col);
        let row_lo = self.row_of(bounds.max().y).max(0.0);
        let row_hi = self.row_of(bounds.min().y).min(max_row);
        if col_lo > col_hi || row_lo > row_hi {
            return None;
        }

        let (mut sum, mut count) = (0.0, 0usize);
        for row in row_lo as usize..=row_hi as usize {
            for col in col_lo as usize..=col_hi as usize {
                let Some(v) = self.value(col, row) else {
                    continue;
                };
                if area.intersects(&self.cell(col, row)) {
                    sum += v;
                    count += 1;
                }
            }
        }
        (count > 0).then(|| sum / count as f64)
    }
}
