//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use vexpr::{Frame, VideoFormat, VideoInfo};

pub fn clip(format: VideoFormat, width: i32, height: i32) -> VideoInfo {
    VideoInfo::new(format, width, height, 100)
}

/// Build a single-plane frame from row-major values.
pub fn frame_from(vi: &VideoInfo, values: &[f32]) -> Frame {
    assert_eq!(values.len(), (vi.width * vi.height) as usize);
    let mut f = Frame::new(vi);
    for y in 0..vi.height {
        for x in 0..vi.width {
            f.plane_mut(0).set_f32(x, y, values[(y * vi.width + x) as usize]);
        }
    }
    f
}

/// Read a plane back as row-major values.
pub fn plane_values(f: &Frame, plane: usize) -> Vec<f32> {
    let p = f.plane(plane);
    let mut out = Vec::with_capacity((p.width() * p.height()) as usize);
    for y in 0..p.height() {
        for x in 0..p.width() {
            out.push(p.get_f32(x, y));
        }
    }
    out
}

/// Deterministic pseudo-random byte values.
pub fn noise(len: usize, seed: u64) -> Vec<f32> {
    let mut state = seed.wrapping_mul(0x9e3779b97f4a7c15).wrapping_add(1);
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 33) % 256) as f32
        })
        .collect()
}
