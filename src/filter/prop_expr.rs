//! The PropExpr driver: per-frame expressions writing frame properties.

use crate::error::{Error, FilterError, Result};
use crate::format::VideoInfo;
use crate::frame::{Frame, PropValue};
use crate::interp::interpret;
use crate::ir::Op;
use crate::tokens::decode_expr;

use super::prop_or_zero;

/// One dictionary value: an expression (or literal) per frame-index residue
/// class. Frame `n` uses entry `n % len`.
#[derive(Clone, Debug)]
pub enum PropExprValue {
    Int(Vec<i64>),
    Float(Vec<f64>),
    Expr(Vec<String>),
}

impl PropExprValue {
    fn into_exprs(self) -> Vec<String> {
        match self {
            PropExprValue::Int(vs) => vs.iter().map(i64::to_string).collect(),
            PropExprValue::Float(vs) => vs.iter().map(f64::to_string).collect(),
            PropExprValue::Expr(vs) => vs,
        }
    }
}

/// Per-frame metadata computation. The output frame is the first input's
/// frame with the dictionary's properties rewritten.
#[derive(Debug)]
pub struct PropExprFilter {
    vi: VideoInfo,
    num_inputs: usize,
    ops: Vec<(String, Vec<Vec<Op>>)>,
}

impl PropExprFilter {
    /// `dict` maps property names to expressions; evaluation order follows
    /// the given order. An empty expression deletes the property.
    pub fn new(
        inputs: &[VideoInfo],
        dict: Vec<(String, PropExprValue)>,
    ) -> Result<PropExprFilter, FilterError> {
        Self::create(inputs, dict).map_err(FilterError::wrap("PropExpr"))
    }

    /// Like [`PropExprFilter::new`] but the dictionary comes from a callable
    /// (the host-facing shape); a callable error aborts construction.
    pub fn from_dict(
        inputs: &[VideoInfo],
        dict: impl FnOnce() -> std::result::Result<Vec<(String, PropExprValue)>, String>,
    ) -> Result<PropExprFilter, FilterError> {
        let dict = dict()
            .map_err(|msg| Error::DictEvaluation(msg))
            .map_err(FilterError::wrap("PropExpr"))?;
        Self::new(inputs, dict)
    }

    fn create(inputs: &[VideoInfo], dict: Vec<(String, PropExprValue)>) -> Result<PropExprFilter> {
        if inputs.is_empty() {
            return Err(Error::FormatMismatch("At least one input clip is required".into()));
        }
        let vi = inputs[0].clone();
        let num_inputs = inputs.len();

        let mut all_ops = Vec::with_capacity(dict.len());
        for (key, value) in dict {
            let exprs = value.into_exprs();
            let mut per_frame = Vec::with_capacity(exprs.len());
            for expr in &exprs {
                if expr.is_empty() {
                    per_frame.push(Vec::new());
                    continue;
                }
                let (ops, _) = decode_expr(expr, true)?;
                interpret(
                    &ops,
                    0,
                    vi.width,
                    vi.height,
                    -1,
                    -1,
                    &|_, _, _| {
                        Err(Error::PixelAccessNotAllowed(format!(
                            "{key}: unable to use pixel values in PropExpr"
                        )))
                    },
                    &|index, _| {
                        if index >= num_inputs {
                            return Err(Error::PropClipOutOfRange(format!(
                                "{key}: property access clip out of range"
                            )));
                        }
                        Ok(0.0)
                    },
                )?;
                per_frame.push(ops);
            }
            all_ops.push((key, per_frame));
        }

        Ok(PropExprFilter { vi, num_inputs, ops: all_ops })
    }

    pub fn video_info(&self) -> &VideoInfo {
        &self.vi
    }

    /// Evaluate frame `n`: the first input's frame with properties
    /// rewritten. A value equal to its integer truncation is written as an
    /// integer property, anything else as a float; runtime errors produce 0.
    pub fn process(&self, n: i32, frames: &[&Frame]) -> Frame {
        assert_eq!(frames.len(), self.num_inputs, "one frame per input clip");
        let mut dst = Frame::new(&self.vi);
        for plane in 0..self.vi.format.num_planes {
            dst.plane_mut(plane).copy_from(frames[0].plane(plane));
        }
        dst.props = frames[0].props.clone();

        // Evaluate everything against the incoming properties first, then
        // update, so one key's result never feeds another's expression.
        let vals: Vec<f32> = self
            .ops
            .iter()
            .map(|(_, per_frame)| {
                let ops = &per_frame[n as usize % per_frame.len()];
                interpret(
                    ops,
                    n,
                    self.vi.width,
                    self.vi.height,
                    -1,
                    -1,
                    &|_, _, _| Ok(0.0),
                    &|index, name| Ok(prop_or_zero(frames[index], name)),
                )
                .unwrap_or(0.0)
            })
            .collect();

        for ((name, per_frame), v) in self.ops.iter().zip(vals) {
            let ops = &per_frame[n as usize % per_frame.len()];
            dst.props.remove(name);
            if !ops.is_empty() {
                if v == (v as i64) as f32 {
                    dst.set_prop(name, PropValue::Int(v as i64));
                } else {
                    dst.set_prop(name, PropValue::Float(v as f64));
                }
            }
        }
        dst
    }
}
