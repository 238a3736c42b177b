//! The three drivers built on the expression core.
//!
//! *Expr* compiles one routine per processed plane and runs it per frame;
//! *Select* and *PropExpr* interpret their expressions once per frame. All
//! three validate expressions at construction so frame-time evaluation
//! cannot fail.

mod expr;
mod prop_expr;
mod select;

pub use expr::{ExprFilter, ExprOptions};
pub use prop_expr::{PropExprFilter, PropExprValue};
pub use select::SelectFilter;

use crate::error::{Error, Result};
use crate::frame::Frame;

/// What a plane of the Expr output gets.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum PlaneOp {
    Process,
    Copy,
    Undefined,
}

/// Expand the per-plane expression list: at most one entry per plane, the
/// last entry replicating to the remaining planes.
pub(crate) fn replicate_exprs(exprs: &[&str], num_planes: usize) -> Result<Vec<String>> {
    if exprs.len() > num_planes {
        return Err(Error::FormatMismatch(
            "More expressions given than there are planes".into(),
        ));
    }
    let Some(last) = exprs.last() else {
        return Err(Error::EmptyExpression("no expressions given".into()));
    };
    let mut out: Vec<String> = exprs.iter().map(|e| (*e).to_owned()).collect();
    out.resize(num_planes, (*last).to_owned());
    Ok(out)
}

/// `consts[]` layout: frame number as raw i32 bits, property values after.
pub(crate) fn pack_consts(n: i32, props: &[f32]) -> Vec<f32> {
    let mut consts = Vec::with_capacity(1 + props.len());
    consts.push(f32::from_bits(n as u32));
    consts.extend_from_slice(props);
    consts
}

/// Frame-time property read shared by Select/PropExpr: missing properties
/// read as 0.0.
pub(crate) fn prop_or_zero(frame: &Frame, name: &str) -> f32 {
    frame.prop(name).and_then(|p| p.as_f32()).unwrap_or(0.0)
}
