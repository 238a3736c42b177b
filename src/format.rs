//! Clip format descriptors and the validation rules the filters apply to
//! their inputs.

use crate::error::{Error, Result};

/// How samples of a plane are interpreted.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SampleType {
    Integer,
    Float,
}

/// Pixel format of a clip: sample encoding plus plane geometry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct VideoFormat {
    pub sample_type: SampleType,
    pub bits_per_sample: u32,
    pub bytes_per_sample: u32,
    pub num_planes: usize,
    /// log2 horizontal subsampling of the chroma planes.
    pub sub_sampling_w: u32,
    /// log2 vertical subsampling of the chroma planes.
    pub sub_sampling_h: u32,
}

impl VideoFormat {
    pub fn new(sample_type: SampleType, bits_per_sample: u32, num_planes: usize) -> VideoFormat {
        VideoFormat {
            sample_type,
            bits_per_sample,
            bytes_per_sample: bits_per_sample.div_ceil(8),
            num_planes,
            sub_sampling_w: 0,
            sub_sampling_h: 0,
        }
    }

    /// Single-plane 8-bit integer, the workhorse of the test suite.
    pub fn gray8() -> VideoFormat {
        VideoFormat::new(SampleType::Integer, 8, 1)
    }

    pub fn gray16() -> VideoFormat {
        VideoFormat::new(SampleType::Integer, 16, 1)
    }

    pub fn grays() -> VideoFormat {
        VideoFormat::new(SampleType::Float, 32, 1)
    }

    pub fn grayh() -> VideoFormat {
        VideoFormat::new(SampleType::Float, 16, 1)
    }

    /// Sample formats the compiler can load and store: 8-16/32-bit integer,
    /// 16/32-bit float.
    pub fn is_supported(&self) -> bool {
        match self.sample_type {
            SampleType::Integer => {
                (8..=16).contains(&self.bits_per_sample) || self.bits_per_sample == 32
            }
            SampleType::Float => self.bits_per_sample == 16 || self.bits_per_sample == 32,
        }
    }

    /// Stable textual key used in routine-cache fingerprints.
    pub fn key(&self) -> String {
        let st = match self.sample_type {
            SampleType::Integer => "i",
            SampleType::Float => "f",
        };
        format!(
            "{st}{}p{}s{}x{}",
            self.bits_per_sample, self.num_planes, self.sub_sampling_w, self.sub_sampling_h
        )
    }
}

/// Constant per-clip metadata: format plus dimensions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoInfo {
    pub format: VideoFormat,
    pub width: i32,
    pub height: i32,
    pub num_frames: i32,
}

impl VideoInfo {
    pub fn new(format: VideoFormat, width: i32, height: i32, num_frames: i32) -> VideoInfo {
        VideoInfo { format, width, height, num_frames }
    }

    /// Dimensions of plane `p`, chroma subsampling applied.
    pub fn plane_dims(&self, p: usize) -> (i32, i32) {
        if p == 0 {
            (self.width, self.height)
        } else {
            (
                self.width >> self.format.sub_sampling_w,
                self.height >> self.format.sub_sampling_h,
            )
        }
    }
}

/// All inputs must agree in plane count, subsampling and dimensions, and use
/// a supported sample format.
pub(crate) fn validate_inputs(vi: &[VideoInfo]) -> Result<()> {
    let first = &vi[0];
    for info in vi {
        if info.format.num_planes != first.format.num_planes
            || info.format.sub_sampling_w != first.format.sub_sampling_w
            || info.format.sub_sampling_h != first.format.sub_sampling_h
            || info.width != first.width
            || info.height != first.height
        {
            return Err(Error::FormatMismatch(
                "All inputs must have the same number of planes and the same dimensions, subsampling included"
                    .into(),
            ));
        }
        if !info.format.is_supported() {
            return Err(Error::FormatMismatch(
                "Input clips must be 8-16/32 bit integer or 16/32 bit float format".into(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supported_formats() {
        assert!(VideoFormat::gray8().is_supported());
        assert!(VideoFormat::new(SampleType::Integer, 10, 1).is_supported());
        assert!(VideoFormat::new(SampleType::Integer, 32, 1).is_supported());
        assert!(!VideoFormat::new(SampleType::Integer, 24, 1).is_supported());
        assert!(VideoFormat::grayh().is_supported());
        assert!(!VideoFormat::new(SampleType::Float, 64, 1).is_supported());
    }

    #[test]
    fn mismatched_dimensions_rejected() {
        let a = VideoInfo::new(VideoFormat::gray8(), 64, 48, 10);
        let b = VideoInfo::new(VideoFormat::gray8(), 32, 48, 10);
        assert!(validate_inputs(&[a.clone(), a.clone()]).is_ok());
        assert!(validate_inputs(&[a, b]).is_err());
    }
}
