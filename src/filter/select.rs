//! The Select driver: per-frame expressions pick which source clip supplies
//! each output plane.

use crate::error::{Error, FilterError, Result};
use crate::format::{validate_inputs, VideoInfo};
use crate::frame::Frame;
use crate::interp::interpret;
use crate::ir::Op;
use crate::tokens::decode_expr;

use super::{prop_or_zero, replicate_exprs};

/// Frame-property-driven clip selection. Expressions run in extended mode
/// (`argmin`/`argmax`/`argsort` available) but cannot touch pixels.
#[derive(Debug)]
pub struct SelectFilter {
    vi: VideoInfo,
    num_src: usize,
    num_prop_src: usize,
    ops: Vec<Vec<Op>>,
}

impl SelectFilter {
    /// `src` describes the selectable clips, `num_prop_src` how many
    /// property-source clips feed the expressions.
    pub fn new(
        src: &[VideoInfo],
        num_prop_src: usize,
        exprs: &[&str],
    ) -> Result<SelectFilter, FilterError> {
        Self::create(src, num_prop_src, exprs).map_err(FilterError::wrap("Select"))
    }

    fn create(src: &[VideoInfo], num_prop_src: usize, exprs: &[&str]) -> Result<SelectFilter> {
        if src.is_empty() {
            return Err(Error::FormatMismatch("At least one src clip is required".into()));
        }
        validate_inputs(src)?;
        for vi in src {
            if vi.format != src[0].format {
                return Err(Error::FormatMismatch(
                    "All src inputs must have the same format".into(),
                ));
            }
            if vi.num_frames != src[0].num_frames {
                return Err(Error::FormatMismatch(
                    "all src inputs must be of the same length".into(),
                ));
            }
        }

        let vi = src[0].clone();
        let num_planes = vi.format.num_planes;
        let exprs = replicate_exprs(exprs, num_planes)?;

        let mut ops = Vec::with_capacity(num_planes);
        for expr in &exprs {
            let (plane_ops, _) = decode_expr(expr, true)?;
            // Dry run with throwing callbacks validates stack discipline,
            // variable initialisation and property-source indices.
            interpret(
                &plane_ops,
                0,
                vi.width,
                vi.height,
                -1,
                -1,
                &|_, _, _| {
                    Err(Error::PixelAccessNotAllowed(
                        "unable to use pixel values in Select".into(),
                    ))
                },
                &|index, _| {
                    if index >= num_prop_src {
                        return Err(Error::PropClipOutOfRange(
                            "property access clip out of range".into(),
                        ));
                    }
                    Ok(0.0)
                },
            )?;
            ops.push(plane_ops);
        }

        Ok(SelectFilter { vi, num_src: src.len(), num_prop_src, ops })
    }

    pub fn video_info(&self) -> &VideoInfo {
        &self.vi
    }

    /// Evaluate the per-plane expressions for frame `n` and return the
    /// chosen source-clip index per plane. Runtime errors select clip 0; the
    /// result is rounded and clamped into range.
    pub fn select(&self, n: i32, prop_frames: &[&Frame]) -> Vec<usize> {
        assert_eq!(prop_frames.len(), self.num_prop_src, "one frame per property source");
        self.ops
            .iter()
            .map(|ops| {
                let x = interpret(
                    ops,
                    n,
                    self.vi.width,
                    self.vi.height,
                    -1,
                    -1,
                    &|_, _, _| Ok(0.0),
                    &|index, name| Ok(prop_or_zero(prop_frames[index], name)),
                )
                .unwrap_or(0.0);
                (x.round() as i32).clamp(0, self.num_src as i32 - 1) as usize
            })
            .collect()
    }

    /// Assemble the output frame for frame `n`: each plane byte-copied from
    /// the selected source clip's frame.
    pub fn process(&self, n: i32, prop_frames: &[&Frame], src_frames: &[&Frame]) -> Frame {
        assert_eq!(src_frames.len(), self.num_src, "one frame per src clip");
        let selected = self.select(n, prop_frames);
        log::trace!("frame {n}: selected clips {selected:?}");
        let mut dst = Frame::new(&self.vi);
        for (plane, &sel) in selected.iter().enumerate() {
            dst.plane_mut(plane).copy_from(src_frames[sel].plane(plane));
        }
        dst.props = src_frames[selected[0]].props.clone();
        dst
    }
}
