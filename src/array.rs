//! In-memory N-dimensional array payloads.
//!
//! An array owns its data and axes and carries the scaling pair that relates
//! stored values to physical values: `physical = bzero + bscale * stored`.
//! `israw = true` means the element values are stored (on-disk) values that
//! still need that scaling applied; `israw = false` means they are already
//! physical.
//!
//! Axis convention: `axes[0]` is the fastest-varying axis, matching the
//! on-disk (FITS/Fortran) order. The backing ndarray holds the shape
//! reversed into standard C order so that the memory layout coincides with
//! the file layout byte for byte.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use ndarray::{ArrayD, IxDyn, Slice};

use crate::error::{ExportError, Result};
use crate::types::{
    missing_f32, missing_f64, StoreType, MISSING_CHAR, MISSING_INT, MISSING_LONG, MISSING_SHORT,
};

#[derive(Debug, Clone)]
pub enum ArrayData {
    Char(ArrayD<i8>),
    Short(ArrayD<i16>),
    Int(ArrayD<i32>),
    Long(ArrayD<i64>),
    Float(ArrayD<f32>),
    Double(ArrayD<f64>),
}

/// Apply `$body` with `$arr` bound to the concrete ndarray inside an
/// `ArrayData`.
macro_rules! with_data {
    ($data:expr, $arr:ident => $body:expr) => {
        match $data {
            ArrayData::Char($arr) => $body,
            ArrayData::Short($arr) => $body,
            ArrayData::Int($arr) => $body,
            ArrayData::Long($arr) => $body,
            ArrayData::Float($arr) => $body,
            ArrayData::Double($arr) => $body,
        }
    };
}

impl ArrayData {
    fn element_type(&self) -> StoreType {
        match self {
            ArrayData::Char(_) => StoreType::Char,
            ArrayData::Short(_) => StoreType::Short,
            ArrayData::Int(_) => StoreType::Int,
            ArrayData::Long(_) => StoreType::Long,
            ArrayData::Float(_) => StoreType::Float,
            ArrayData::Double(_) => StoreType::Double,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DataArray {
    /// Declared store type. `Time` is backed by the `Double` variant.
    pub ty: StoreType,
    pub data: ArrayData,
    pub bzero: f64,
    pub bscale: f64,
    pub israw: bool,
    /// Offset of this array within its parent segment, per axis (store
    /// order). All zeros for a full read.
    pub start: Vec<usize>,
}

fn ndshape(axes: &[usize]) -> IxDyn {
    let mut rev: Vec<usize> = axes.to_vec();
    rev.reverse();
    IxDyn(&rev)
}

impl DataArray {
    /// A new array of the given type and axes, filled with the missing
    /// sentinel, already in physical units.
    pub fn filled_missing(ty: StoreType, axes: &[usize]) -> Result<DataArray> {
        let shape = ndshape(axes);
        let data = match ty {
            StoreType::Char => ArrayData::Char(ArrayD::from_elem(shape, MISSING_CHAR)),
            StoreType::Short => ArrayData::Short(ArrayD::from_elem(shape, MISSING_SHORT)),
            StoreType::Int => ArrayData::Int(ArrayD::from_elem(shape, MISSING_INT)),
            StoreType::Long => ArrayData::Long(ArrayD::from_elem(shape, MISSING_LONG)),
            StoreType::Float => ArrayData::Float(ArrayD::from_elem(shape, missing_f32())),
            StoreType::Double => ArrayData::Double(ArrayD::from_elem(shape, missing_f64())),
            StoreType::Time => ArrayData::Double(ArrayD::from_elem(shape, missing_f64())),
            StoreType::String | StoreType::Raw => {
                return Err(ExportError::Unsupported(format!(
                    "cannot allocate an array of type {}",
                    ty.name()
                )))
            }
        };

        Ok(DataArray {
            ty,
            data,
            bzero: 0.0,
            bscale: 1.0,
            israw: false,
            start: vec![0; axes.len()],
        })
    }

    /// Wrap a flat buffer laid out in on-disk order (axes[0] fastest).
    pub fn from_flat(ty: StoreType, axes: &[usize], data: ArrayFlat) -> Result<DataArray> {
        let shape = ndshape(axes);
        let n: usize = axes.iter().product();

        macro_rules! build {
            ($vec:expr, $variant:ident) => {{
                if $vec.len() != n {
                    return Err(ExportError::Internal(format!(
                        "array buffer holds {} elements, axes want {}",
                        $vec.len(),
                        n
                    )));
                }
                ArrayData::$variant(ArrayD::from_shape_vec(shape, $vec).map_err(|e| {
                    ExportError::Internal(format!("array shape error: {e}"))
                })?)
            }};
        }

        let data = match data {
            ArrayFlat::Char(v) => build!(v, Char),
            ArrayFlat::Short(v) => build!(v, Short),
            ArrayFlat::Int(v) => build!(v, Int),
            ArrayFlat::Long(v) => build!(v, Long),
            ArrayFlat::Float(v) => build!(v, Float),
            ArrayFlat::Double(v) => build!(v, Double),
        };

        if data.element_type() != ty && !(ty == StoreType::Time && matches!(data, ArrayData::Double(_))) {
            return Err(ExportError::Internal(
                "array buffer type does not match declared type".into(),
            ));
        }

        Ok(DataArray {
            ty,
            data,
            bzero: 0.0,
            bscale: 1.0,
            israw: false,
            start: vec![0; axes.len()],
        })
    }

    pub fn naxis(&self) -> usize {
        with_data!(&self.data, a => a.ndim())
    }

    /// Axis lengths in store order (axes[0] fastest-varying).
    pub fn axes(&self) -> Vec<usize> {
        let mut shape: Vec<usize> = with_data!(&self.data, a => a.shape().to_vec());
        shape.reverse();
        shape
    }

    pub fn len(&self) -> usize {
        with_data!(&self.data, a => a.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw element at flat (on-disk order) index, widened to f64 without
    /// scaling. Integer missing sentinels widen to NaN.
    pub fn raw_f64(&self, idx: usize) -> f64 {
        match &self.data {
            ArrayData::Char(a) => {
                let v = a.as_slice_memory_order().unwrap()[idx];
                if v == MISSING_CHAR { missing_f64() } else { v as f64 }
            }
            ArrayData::Short(a) => {
                let v = a.as_slice_memory_order().unwrap()[idx];
                if v == MISSING_SHORT { missing_f64() } else { v as f64 }
            }
            ArrayData::Int(a) => {
                let v = a.as_slice_memory_order().unwrap()[idx];
                if v == MISSING_INT { missing_f64() } else { v as f64 }
            }
            ArrayData::Long(a) => {
                let v = a.as_slice_memory_order().unwrap()[idx];
                if v == MISSING_LONG { missing_f64() } else { v as f64 }
            }
            ArrayData::Float(a) => a.as_slice_memory_order().unwrap()[idx] as f64,
            ArrayData::Double(a) => a.as_slice_memory_order().unwrap()[idx],
        }
    }

    /// The (min, max) of the array's physical values, skipping missing
    /// elements. `None` when every element is missing.
    pub fn physical_range(&self) -> Option<(f64, f64)> {
        let n = self.len();
        let mut lo = f64::INFINITY;
        let mut hi = f64::NEG_INFINITY;
        let mut seen = false;

        for i in 0..n {
            let mut v = self.raw_f64(i);
            if v.is_nan() {
                continue;
            }
            if self.israw {
                v = self.bzero + self.bscale * v;
            }
            if v < lo {
                lo = v;
            }
            if v > hi {
                hi = v;
            }
            seen = true;
        }

        if seen {
            Some((lo, hi))
        } else {
            None
        }
    }

    /// Convert to `dst` applying `physical = bzero + bscale * stored` to
    /// every element first. Missing stays missing; values that do not fit
    /// the destination become the destination's missing sentinel.
    pub fn convert_scaled(&self, dst: StoreType, bzero: f64, bscale: f64) -> Result<DataArray> {
        let axes = self.axes();
        let n = self.len();
        let mut out = DataArray::filled_missing(dst, &axes)?;

        macro_rules! fill_int {
            ($arr:expr, $t:ty, $missing:expr) => {{
                let slice = $arr.as_slice_memory_order_mut().unwrap();
                for i in 0..n {
                    let v = self.raw_f64(i);
                    if v.is_nan() {
                        continue;
                    }
                    let scaled = (bzero + bscale * v).round();
                    if scaled.is_finite()
                        && scaled > ($missing as f64)
                        && scaled <= (<$t>::MAX as f64)
                    {
                        slice[i] = scaled as $t;
                    }
                }
            }};
        }

        match &mut out.data {
            ArrayData::Char(a) => fill_int!(a, i8, MISSING_CHAR),
            ArrayData::Short(a) => fill_int!(a, i16, MISSING_SHORT),
            ArrayData::Int(a) => fill_int!(a, i32, MISSING_INT),
            ArrayData::Long(a) => fill_int!(a, i64, MISSING_LONG),
            ArrayData::Float(a) => {
                let slice = a.as_slice_memory_order_mut().unwrap();
                for i in 0..n {
                    let v = self.raw_f64(i);
                    if v.is_nan() {
                        continue;
                    }
                    slice[i] = (bzero + bscale * v) as f32;
                }
            }
            ArrayData::Double(a) => {
                let slice = a.as_slice_memory_order_mut().unwrap();
                for i in 0..n {
                    let v = self.raw_f64(i);
                    if v.is_nan() {
                        continue;
                    }
                    slice[i] = bzero + bscale * v;
                }
            }
        }

        out.start = self.start.clone();
        Ok(out)
    }

    /// Extract the sub-array `start..=end` (store-order axes, inclusive
    /// bounds, the I/O engine's convention).
    pub fn slice(&self, start: &[usize], end: &[usize]) -> Result<DataArray> {
        let axes = self.axes();
        if start.len() != axes.len() || end.len() != axes.len() {
            return Err(ExportError::BadRequest(
                "slice rank does not match array rank".into(),
            ));
        }
        for i in 0..axes.len() {
            if start[i] > end[i] || end[i] >= axes[i] {
                return Err(ExportError::BadRequest(format!(
                    "slice [{}..={}] outside axis {} of length {}",
                    start[i], end[i], i, axes[i]
                )));
            }
        }

        let naxis = axes.len();
        let data = with_data_clone_slice(&self.data, |nd_axis: usize| {
            // ndarray axes are reversed relative to store order
            let store_axis = naxis - 1 - nd_axis;
            Slice::from(start[store_axis] as isize..=end[store_axis] as isize)
        });

        Ok(DataArray {
            ty: self.ty,
            data,
            bzero: self.bzero,
            bscale: self.bscale,
            israw: self.israw,
            start: start.to_vec(),
        })
    }

    /// Drop a trailing length-1 axis (store order), as a TAS slice read does
    /// with the record axis.
    pub fn drop_trailing_axis(&mut self) -> Result<()> {
        let axes = self.axes();
        match axes.last() {
            Some(1) => {}
            _ => {
                return Err(ExportError::Internal(
                    "trailing axis is not of length 1".into(),
                ))
            }
        }

        // The trailing store axis is ndarray axis 0.
        with_data!(&mut self.data, a => {
            let squeezed = a.index_axis(ndarray::Axis(0), 0).to_owned();
            *a = squeezed;
        });
        self.start.pop();
        Ok(())
    }

    /// Serialize the payload big-endian in on-disk order.
    pub fn to_be_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.len() * self.ty.size().max(1));
        match &self.data {
            ArrayData::Char(a) => {
                for v in a.as_slice_memory_order().unwrap() {
                    buf.push(*v as u8);
                }
            }
            ArrayData::Short(a) => {
                for v in a.as_slice_memory_order().unwrap() {
                    buf.write_i16::<BigEndian>(*v).unwrap();
                }
            }
            ArrayData::Int(a) => {
                for v in a.as_slice_memory_order().unwrap() {
                    buf.write_i32::<BigEndian>(*v).unwrap();
                }
            }
            ArrayData::Long(a) => {
                for v in a.as_slice_memory_order().unwrap() {
                    buf.write_i64::<BigEndian>(*v).unwrap();
                }
            }
            ArrayData::Float(a) => {
                for v in a.as_slice_memory_order().unwrap() {
                    buf.write_f32::<BigEndian>(*v).unwrap();
                }
            }
            ArrayData::Double(a) => {
                for v in a.as_slice_memory_order().unwrap() {
                    buf.write_f64::<BigEndian>(*v).unwrap();
                }
            }
        }
        buf
    }

    /// Deserialize a big-endian payload of `ty` elements into an array with
    /// the given axes.
    pub fn from_be_bytes(ty: StoreType, axes: &[usize], bytes: &[u8]) -> Result<DataArray> {
        let n: usize = axes.iter().product();
        let want = n * ty.size();
        if bytes.len() < want {
            return Err(ExportError::FitsFormat(format!(
                "payload holds {} bytes, need {}",
                bytes.len(),
                want
            )));
        }

        let mut rd = std::io::Cursor::new(bytes);
        let flat = match ty {
            StoreType::Char => {
                ArrayFlat::Char(bytes[..n].iter().map(|b| *b as i8).collect())
            }
            StoreType::Short => {
                let mut v = vec![0i16; n];
                rd.read_i16_into::<BigEndian>(&mut v)?;
                ArrayFlat::Short(v)
            }
            StoreType::Int => {
                let mut v = vec![0i32; n];
                rd.read_i32_into::<BigEndian>(&mut v)?;
                ArrayFlat::Int(v)
            }
            StoreType::Long => {
                let mut v = vec![0i64; n];
                rd.read_i64_into::<BigEndian>(&mut v)?;
                ArrayFlat::Long(v)
            }
            StoreType::Float => {
                let mut v = vec![0f32; n];
                rd.read_f32_into::<BigEndian>(&mut v)?;
                ArrayFlat::Float(v)
            }
            StoreType::Double | StoreType::Time => {
                let mut v = vec![0f64; n];
                rd.read_f64_into::<BigEndian>(&mut v)?;
                ArrayFlat::Double(v)
            }
            StoreType::String | StoreType::Raw => {
                return Err(ExportError::Unsupported(format!(
                    "cannot decode a payload of type {}",
                    ty.name()
                )))
            }
        };

        DataArray::from_flat(ty, axes, flat)
    }
}

/// A flat, on-disk-order element buffer.
pub enum ArrayFlat {
    Char(Vec<i8>),
    Short(Vec<i16>),
    Int(Vec<i32>),
    Long(Vec<i64>),
    Float(Vec<f32>),
    Double(Vec<f64>),
}

fn with_data_clone_slice<F>(data: &ArrayData, f: F) -> ArrayData
where
    F: Fn(usize) -> Slice,
{
    macro_rules! go {
        ($a:expr, $variant:ident) => {{
            let view = $a.slice_each_axis(|ad| f(ad.axis().index()));
            // re-own into a standard-layout array so flat access stays valid
            let mut out = ArrayD::from_elem(view.raw_dim(), Default::default());
            out.assign(&view);
            ArrayData::$variant(out)
        }};
    }

    match data {
        ArrayData::Char(a) => go!(a, Char),
        ArrayData::Short(a) => go!(a, Short),
        ArrayData::Int(a) => go!(a, Int),
        ArrayData::Long(a) => go!(a, Long),
        ArrayData::Float(a) => go!(a, Float),
        ArrayData::Double(a) => go!(a, Double),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_layout_matches_disk_order() {
        // axes [3, 2]: axis 0 (length 3) varies fastest
        let arr = DataArray::from_flat(
            StoreType::Short,
            &[3, 2],
            ArrayFlat::Short(vec![1, 2, 3, 4, 5, 6]),
        )
        .unwrap();

        assert_eq!(arr.axes(), vec![3, 2]);
        assert_eq!(arr.to_be_bytes()[..4], [0, 1, 0, 2]);
    }

    #[test]
    fn convert_scaled_preserves_missing() {
        let arr = DataArray::from_flat(
            StoreType::Short,
            &[3],
            ArrayFlat::Short(vec![10, MISSING_SHORT, -10]),
        )
        .unwrap();

        let out = arr.convert_scaled(StoreType::Double, 100.0, 0.5).unwrap();
        assert_eq!(out.raw_f64(0), 105.0);
        assert!(out.raw_f64(1).is_nan());
        assert_eq!(out.raw_f64(2), 95.0);
    }

    #[test]
    fn convert_overflow_becomes_missing() {
        let arr = DataArray::from_flat(
            StoreType::Int,
            &[2],
            ArrayFlat::Int(vec![100_000, 5]),
        )
        .unwrap();

        let out = arr.convert_scaled(StoreType::Short, 0.0, 1.0).unwrap();
        assert!(out.raw_f64(0).is_nan());
        assert_eq!(out.raw_f64(1), 5.0);
    }

    #[test]
    fn slice_and_trailing_axis() {
        // axes [2, 3]: values v(i, j) = 10*j + i
        let arr = DataArray::from_flat(
            StoreType::Int,
            &[2, 3],
            ArrayFlat::Int(vec![0, 1, 10, 11, 20, 21]),
        )
        .unwrap();

        let mut sl = arr.slice(&[0, 1], &[1, 1]).unwrap();
        assert_eq!(sl.axes(), vec![2, 1]);
        assert_eq!(sl.raw_f64(0), 10.0);
        assert_eq!(sl.raw_f64(1), 11.0);

        sl.drop_trailing_axis().unwrap();
        assert_eq!(sl.axes(), vec![2]);
    }

    #[test]
    fn be_round_trip() {
        let arr = DataArray::from_flat(
            StoreType::Float,
            &[2, 2],
            ArrayFlat::Float(vec![1.0, -2.5, 0.0, 3.25]),
        )
        .unwrap();

        let bytes = arr.to_be_bytes();
        let back = DataArray::from_be_bytes(StoreType::Float, &[2, 2], &bytes).unwrap();
        assert_eq!(back.to_be_bytes(), bytes);
    }
}
