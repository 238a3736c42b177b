//! The Expr driver: one expression per plane, compiled and run per frame.

use std::sync::Arc;

use crate::error::{Error, FilterError, Result};
use crate::format::{validate_inputs, VideoFormat, VideoInfo};
use crate::frame::{Frame, PropValue};
use crate::jit::{CompiledRoutine, ExprCompiler};

use super::{pack_consts, replicate_exprs, PlaneOp};

/// Construction options for [`ExprFilter`].
#[derive(Clone, Debug, Default)]
pub struct ExprOptions {
    /// Output sample format override; plane count and subsampling are
    /// inherited from the first input.
    pub format: Option<VideoFormat>,
    /// Bit 0 allows integer codegen; all other bits reserved.
    pub opt_mask: i32,
    /// Default boundary for relative pixel access: 0 = clamp, 1 = mirror.
    pub boundary: i32,
}

/// Per-pixel expression evaluation over up to 26 input clips.
pub struct ExprFilter {
    vi: VideoInfo,
    num_inputs: usize,
    plane_op: Vec<PlaneOp>,
    compiled: Vec<Option<Arc<CompiledRoutine>>>,
}

impl std::fmt::Debug for ExprFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExprFilter")
            .field("vi", &self.vi)
            .field("num_inputs", &self.num_inputs)
            .field("plane_op", &self.plane_op)
            .finish()
    }
}

impl ExprFilter {
    pub fn new(inputs: &[VideoInfo], exprs: &[&str], opts: &ExprOptions) -> Result<ExprFilter, FilterError> {
        Self::create(inputs, exprs, opts).map_err(FilterError::wrap("Expr"))
    }

    fn create(inputs: &[VideoInfo], exprs: &[&str], opts: &ExprOptions) -> Result<ExprFilter> {
        if inputs.is_empty() {
            return Err(Error::FormatMismatch("At least one input clip is required".into()));
        }
        validate_inputs(inputs)?;

        let mut vi = inputs[0].clone();
        if let Some(fmt) = &opts.format {
            if fmt.num_planes != vi.format.num_planes {
                return Err(Error::FormatMismatch(
                    "The number of planes in the inputs and output must match".into(),
                ));
            }
            vi.format = VideoFormat {
                sample_type: fmt.sample_type,
                bits_per_sample: fmt.bits_per_sample,
                bytes_per_sample: fmt.bytes_per_sample,
                num_planes: vi.format.num_planes,
                sub_sampling_w: vi.format.sub_sampling_w,
                sub_sampling_h: vi.format.sub_sampling_h,
            };
            if !vi.format.is_supported() {
                return Err(Error::FormatMismatch(
                    "Input clips must be 8-16/32 bit integer or 16/32 bit float format".into(),
                ));
            }
        }

        let num_planes = vi.format.num_planes;
        let exprs = replicate_exprs(exprs, num_planes)?;

        let mut plane_op = Vec::with_capacity(num_planes);
        let mut compiled = Vec::with_capacity(num_planes);
        for (plane, expr) in exprs.iter().enumerate() {
            if expr.is_empty() {
                let same = vi.format.bits_per_sample == inputs[0].format.bits_per_sample
                    && vi.format.sample_type == inputs[0].format.sample_type;
                let op = if same { PlaneOp::Copy } else { PlaneOp::Undefined };
                log::debug!("plane {plane}: {op:?}");
                plane_op.push(op);
                compiled.push(None);
                continue;
            }
            plane_op.push(PlaneOp::Process);
            let routine =
                ExprCompiler::new(expr, &vi, inputs, opts.opt_mask, opts.boundary != 0).compile()?;
            compiled.push(Some(routine));
        }

        Ok(ExprFilter { vi, num_inputs: inputs.len(), plane_op, compiled })
    }

    /// Output clip metadata.
    pub fn video_info(&self) -> &VideoInfo {
        &self.vi
    }

    /// Evaluate frame `n`. `sources` supplies one frame per input clip, in
    /// clip order; the compiled routines read pixels and frame properties
    /// from them.
    pub fn process(&self, n: i32, sources: &[&Frame]) -> Frame {
        assert_eq!(sources.len(), self.num_inputs, "one source frame per input clip");
        let mut dst = Frame::new(&self.vi);

        for plane in 0..self.vi.format.num_planes {
            match self.plane_op[plane] {
                PlaneOp::Undefined => {}
                PlaneOp::Copy => {
                    let (dst_plane, src_plane) = (dst.plane_mut(plane), sources[0].plane(plane));
                    dst_plane.copy_from(src_plane);
                }
                PlaneOp::Process => {
                    let routine = self.compiled[plane].as_ref().unwrap();

                    // Missing properties read as NaN rather than failing the
                    // frame.
                    let props: Vec<f32> = routine
                        .prop_access
                        .iter()
                        .map(|pa| {
                            sources[pa.clip]
                                .prop(&pa.name)
                                .and_then(PropValue::as_f32)
                                .unwrap_or(f32::NAN)
                        })
                        .collect();
                    let consts = pack_consts(n, &props);

                    let mut rwptrs: Vec<*mut u8> = Vec::with_capacity(self.num_inputs + 1);
                    let mut strides: Vec<i32> = Vec::with_capacity(self.num_inputs + 1);
                    {
                        let out = dst.plane_mut(plane);
                        rwptrs.push(out.as_mut_ptr());
                        strides.push(out.stride());
                    }
                    for src in sources {
                        let p = src.plane(plane);
                        rwptrs.push(p.as_ptr() as *mut u8);
                        strides.push(p.stride());
                    }

                    let out = dst.plane(plane);
                    let (w, h) = (out.width(), out.height());
                    unsafe {
                        routine.call(rwptrs.as_ptr(), strides.as_ptr(), consts.as_ptr(), w, h);
                    }
                }
            }
        }
        dst
    }
}
