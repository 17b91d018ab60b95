//! Raster storage seam.
//!
//! The segmenter only talks to pixels through the [`Raster`] trait, so disk-backed or remote
//! rasters can be plugged in. [`MemRaster`] is the in-memory implementation used for block
//! windows, tests and the default output raster.

use crate::arrays::Array2D;
use crate::error::RasterError;
use serde::{Deserialize, Serialize};

/// Sample type of one band. Values travel as `f64` and are coerced on write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BandType {
    U8,
    U16,
    U32,
    I16,
    I32,
    F32,
    F64,
}

impl BandType {
    /// Clamp and round `value` into the domain of this type.
    pub fn coerce(&self, value: f64) -> f64 {
        match self {
            BandType::U8 => value.round().clamp(0.0, u8::MAX as f64),
            BandType::U16 => value.round().clamp(0.0, u16::MAX as f64),
            BandType::U32 => value.round().clamp(0.0, u32::MAX as f64),
            BandType::I16 => value.round().clamp(i16::MIN as f64, i16::MAX as f64),
            BandType::I32 => value.round().clamp(i32::MIN as f64, i32::MAX as f64),
            BandType::F32 => value as f32 as f64,
            BandType::F64 => value,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandProperty {
    pub band_type: BandType,
    pub no_data_value: Option<f64>,
}

impl BandProperty {
    pub fn new(band_type: BandType, no_data_value: Option<f64>) -> Self {
        Self {
            band_type,
            no_data_value,
        }
    }

    /// Single band of segment labels, 0 reserved for background.
    pub fn labels() -> Self {
        Self::new(BandType::U32, Some(0.0))
    }
}

pub trait Raster: Send + Sync {
    fn rows(&self) -> usize;
    fn cols(&self) -> usize;
    fn band_count(&self) -> usize;
    fn band_property(&self, band: usize) -> Result<BandProperty, RasterError>;
    fn get(&self, col: usize, row: usize, band: usize) -> Result<f64, RasterError>;
    fn set(&mut self, col: usize, row: usize, band: usize, value: f64) -> Result<(), RasterError>;

    fn band_type(&self, band: usize) -> Result<BandType, RasterError> {
        Ok(self.band_property(band)?.band_type)
    }

    fn no_data_value(&self, band: usize) -> Option<f64> {
        self.band_property(band).ok().and_then(|p| p.no_data_value)
    }

    /// Read `out.len()` values of `row` starting at `col`.
    fn read_row_part(
        &self,
        col: usize,
        row: usize,
        band: usize,
        out: &mut [f64],
    ) -> Result<(), RasterError> {
        for (i, v) in out.iter_mut().enumerate() {
            *v = self.get(col + i, row, band)?;
        }
        Ok(())
    }
}

/// Read-only pixel access, implemented by every [`Raster`] and by the cached input side of
/// `RasterSynchronizer`.
pub trait PixelSource {
    fn value(&self, col: usize, row: usize, band: usize) -> Result<f64, RasterError>;
}

impl<R: Raster + ?Sized> PixelSource for R {
    #[inline]
    fn value(&self, col: usize, row: usize, band: usize) -> Result<f64, RasterError> {
        self.get(col, row, band)
    }
}

/// Creates rasters on the same grid as the input, used for the label output.
pub trait RasterFactory: Send + Sync {
    fn create(
        &self,
        rows: usize,
        cols: usize,
        bands: &[BandProperty],
    ) -> Result<Box<dyn Raster>, RasterError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MemRasterFactory;

impl RasterFactory for MemRasterFactory {
    fn create(
        &self,
        rows: usize,
        cols: usize,
        bands: &[BandProperty],
    ) -> Result<Box<dyn Raster>, RasterError> {
        Ok(Box::new(MemRaster::new(rows, cols, bands)))
    }
}

#[derive(Debug, Clone)]
pub struct MemRaster {
    bands: Vec<Array2D<f64>>,
    properties: Vec<BandProperty>,
    rows: usize,
    cols: usize,
}

impl MemRaster {
    /// Zero-initialized raster.
    pub fn new(rows: usize, cols: usize, bands: &[BandProperty]) -> Self {
        Self {
            bands: bands
                .iter()
                .map(|_| Array2D::from_fill(0f64, cols, rows))
                .collect(),
            properties: bands.to_vec(),
            rows,
            cols,
        }
    }

    pub fn from_fn<F>(rows: usize, cols: usize, bands: &[BandProperty], f: F) -> Self
    where
        F: Fn(usize, usize, usize) -> f64,
    {
        let mut raster = Self::new(rows, cols, bands);
        for (band_idx, (band, prop)) in raster
            .bands
            .iter_mut()
            .zip(raster.properties.iter())
            .enumerate()
        {
            for row in 0..rows {
                for (col, v) in band.get_row_mut(row).iter_mut().enumerate() {
                    *v = prop.band_type.coerce(f(col, row, band_idx));
                }
            }
        }
        raster
    }

    pub fn band(&self, band: usize) -> Option<&Array2D<f64>> {
        self.bands.get(band)
    }

    fn check(&self, col: usize, row: usize, band: usize) -> Result<(), RasterError> {
        if band >= self.bands.len() {
            return Err(RasterError::InvalidBand {
                band,
                bands: self.bands.len(),
            });
        }
        if col >= self.cols || row >= self.rows {
            return Err(RasterError::OutOfBounds { col, row });
        }
        Ok(())
    }
}

impl Raster for MemRaster {
    fn rows(&self) -> usize {
        self.rows
    }

    fn cols(&self) -> usize {
        self.cols
    }

    fn band_count(&self) -> usize {
        self.bands.len()
    }

    fn band_property(&self, band: usize) -> Result<BandProperty, RasterError> {
        self.properties
            .get(band)
            .copied()
            .ok_or(RasterError::InvalidBand {
                band,
                bands: self.properties.len(),
            })
    }

    #[inline]
    fn get(&self, col: usize, row: usize, band: usize) -> Result<f64, RasterError> {
        self.check(col, row, band)?;
        Ok(self.bands[band][(col, row)])
    }

    #[inline]
    fn set(&mut self, col: usize, row: usize, band: usize, value: f64) -> Result<(), RasterError> {
        self.check(col, row, band)?;
        let coerced = self.properties[band].band_type.coerce(value);
        self.bands[band][(col, row)] = coerced;
        Ok(())
    }

    fn read_row_part(
        &self,
        col: usize,
        row: usize,
        band: usize,
        out: &mut [f64],
    ) -> Result<(), RasterError> {
        if out.is_empty() {
            return Ok(());
        }
        self.check(col + out.len() - 1, row, band)?;
        out.copy_from_slice(self.bands[band].get_row_part(row, col, col + out.len() - 1));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_raster_bounds_and_coercion() {
        let mut r = MemRaster::new(2, 3, &[BandProperty::labels()]);
        assert_eq!(r.rows(), 2);
        assert_eq!(r.cols(), 3);
        assert_eq!(r.no_data_value(0), Some(0.0));
        r.set(2, 1, 0, 41.6).unwrap();
        assert_eq!(r.get(2, 1, 0).unwrap(), 42.0);
        r.set(0, 0, 0, -5.0).unwrap();
        assert_eq!(r.get(0, 0, 0).unwrap(), 0.0);
        assert_eq!(
            r.get(3, 0, 0).unwrap_err(),
            RasterError::OutOfBounds { col: 3, row: 0 }
        );
        assert_eq!(
            r.set(0, 0, 1, 1.0).unwrap_err(),
            RasterError::InvalidBand { band: 1, bands: 1 }
        );
    }

    #[test]
    fn read_row_part_matches_get() {
        let props = [BandProperty::new(BandType::F64, None); 2];
        let r = MemRaster::from_fn(4, 5, &props, |c, row, b| (c + 10 * row + 100 * b) as f64);
        let mut buf = [0f64; 3];
        r.read_row_part(1, 2, 1, &mut buf).unwrap();
        assert_eq!(buf, [121.0, 122.0, 123.0]);
        assert!(r.read_row_part(3, 2, 1, &mut buf).is_err());
    }

    #[test]
    fn factory_creates_zeroed_label_raster() {
        let out = MemRasterFactory
            .create(3, 4, &[BandProperty::labels()])
            .unwrap();
        assert_eq!(out.band_type(0).unwrap(), BandType::U32);
        assert_eq!(out.get(3, 2, 0).unwrap(), 0.0);
    }
}
