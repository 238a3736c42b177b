//! In-memory frames: aligned plane buffers plus named per-frame properties.
//!
//! The compiled routines require 32-byte row-stride alignment and enough
//! row-end padding that a full `LANES`-wide load at any `x < width` (and the
//! vector store at the last aligned `x`) stays inside the allocation. The
//! [`Plane`] allocator bakes that guarantee in: strides round up to 32 bytes
//! and the buffer carries a trailing guard region.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;

use crate::format::{SampleType, VideoFormat, VideoInfo};
use crate::fp16;

const ALIGNMENT: usize = 32;

/// One colour plane, 32-byte aligned with padded rows.
pub struct Plane {
    data: *mut u8,
    layout: Layout,
    stride: usize,
    width: i32,
    height: i32,
    bytes_per_sample: u32,
    sample_type: SampleType,
}

// The buffer is uniquely owned; sharing is read-only through &Plane.
unsafe impl Send for Plane {}
unsafe impl Sync for Plane {}

impl Plane {
    pub fn new(width: i32, height: i32, format: &VideoFormat) -> Plane {
        let row = width as usize * format.bytes_per_sample as usize;
        let stride = row.next_multiple_of(ALIGNMENT);
        // Trailing guard so LANES-wide loads near the right edge of the last
        // row stay in bounds.
        let size = stride * height as usize + ALIGNMENT;
        let layout = Layout::from_size_align(size, ALIGNMENT).expect("plane layout");
        let data = unsafe { alloc_zeroed(layout) };
        assert!(!data.is_null(), "plane allocation failed");
        Plane {
            data,
            layout,
            stride,
            width,
            height,
            bytes_per_sample: format.bytes_per_sample,
            sample_type: format.sample_type,
        }
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    /// Row stride in bytes.
    pub fn stride(&self) -> i32 {
        self.stride as i32
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.data
    }

    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data
    }

    fn sample_ptr(&self, x: i32, y: i32) -> *const u8 {
        debug_assert!((0..self.width).contains(&x) && (0..self.height).contains(&y));
        unsafe {
            self.data
                .add(y as usize * self.stride + x as usize * self.bytes_per_sample as usize)
        }
    }

    /// Scalar read of one pixel, widened to f32. This is the reference the
    /// vector loads are tested against, and what the interpreter's
    /// `pixel_get` uses.
    pub fn get_f32(&self, x: i32, y: i32) -> f32 {
        let p = self.sample_ptr(x, y);
        unsafe {
            match (self.sample_type, self.bytes_per_sample) {
                (SampleType::Integer, 1) => *p as f32,
                (SampleType::Integer, 2) => (p as *const u16).read_unaligned() as f32,
                (SampleType::Integer, 4) => (p as *const i32).read_unaligned() as f32,
                (SampleType::Float, 2) => fp16::to_f32((p as *const u16).read_unaligned()),
                (SampleType::Float, 4) => (p as *const f32).read_unaligned(),
                _ => unreachable!("unsupported sample format"),
            }
        }
    }

    /// Scalar write of one pixel from an f32 value, clamping and rounding
    /// like the compiled store path.
    pub fn set_f32(&mut self, x: i32, y: i32, v: f32) {
        let p = self.sample_ptr(x, y) as *mut u8;
        unsafe {
            match (self.sample_type, self.bytes_per_sample) {
                (SampleType::Integer, 1) => *p = v.round_ties_even().clamp(0.0, 255.0) as u8,
                (SampleType::Integer, 2) => (p as *mut u16)
                    .write_unaligned(v.round_ties_even().clamp(0.0, 65535.0) as u16),
                (SampleType::Integer, 4) => (p as *mut i32).write_unaligned(v as i32),
                (SampleType::Float, 2) => (p as *mut u16).write_unaligned(fp16::from_f32(v)),
                (SampleType::Float, 4) => (p as *mut f32).write_unaligned(v),
                _ => unreachable!("unsupported sample format"),
            }
        }
    }

    /// Byte-copy the picture region of `src` into this plane. Both planes
    /// must have identical geometry and sample size.
    pub fn copy_from(&mut self, src: &Plane) {
        assert_eq!((self.width, self.height), (src.width, src.height));
        assert_eq!(self.bytes_per_sample, src.bytes_per_sample);
        let row = self.width as usize * self.bytes_per_sample as usize;
        for y in 0..self.height as usize {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src.data.add(y * src.stride),
                    self.data.add(y * self.stride),
                    row,
                );
            }
        }
    }
}

impl Drop for Plane {
    fn drop(&mut self) {
        unsafe { dealloc(self.data, self.layout) }
    }
}

/// A frame property value as the host stores it.
#[derive(Clone, Debug, PartialEq)]
pub enum PropValue {
    Int(i64),
    Float(f64),
    Data(Vec<u8>),
}

impl PropValue {
    /// Numeric view used by expression evaluation: integers and floats
    /// convert directly, byte strings contribute their first byte.
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            PropValue::Int(v) => Some(*v as f32),
            PropValue::Float(v) => Some(*v as f32),
            PropValue::Data(d) => d.first().map(|&b| b as f32),
        }
    }
}

/// One video frame: planes plus named properties.
pub struct Frame {
    pub format: VideoFormat,
    planes: Vec<Plane>,
    pub props: HashMap<String, PropValue>,
}

impl Frame {
    /// Allocate a zeroed frame shaped by `vi`.
    pub fn new(vi: &VideoInfo) -> Frame {
        let planes = (0..vi.format.num_planes)
            .map(|p| {
                let (w, h) = vi.plane_dims(p);
                Plane::new(w, h, &vi.format)
            })
            .collect();
        Frame { format: vi.format.clone(), planes, props: HashMap::new() }
    }

    pub fn plane(&self, p: usize) -> &Plane {
        &self.planes[p]
    }

    pub fn plane_mut(&mut self, p: usize) -> &mut Plane {
        &mut self.planes[p]
    }

    pub fn num_planes(&self) -> usize {
        self.planes.len()
    }

    pub fn prop(&self, name: &str) -> Option<&PropValue> {
        self.props.get(name)
    }

    pub fn set_prop(&mut self, name: &str, value: PropValue) {
        self.props.insert(name.to_owned(), value);
    }
}
