//! # vexpr
//!
//! A just-in-time compiler and runtime for a stack-based postfix arithmetic
//! mini-language over video clips. An expression describes, per output
//! pixel (Expr), per frame (Select) or per frame property (PropExpr), a
//! computation over up to 26 input clips; Expr expressions compile to
//! vectorised native code processing [`LANES`] pixels per step.
//!
//! ## Pipeline
//!
//! ```text
//! source text
//!     │  tokens::tokenize / decode_token
//!     ▼
//! flat op sequence (ir::Op)
//!     │  ir::finalize — dense property/variable indices
//!     ├───────────────► interp::interpret   (Select, PropExpr, validation)
//!     ▼
//! jit::ExprCompiler — Cranelift lowering, LANES-wide
//!     │  cache::get_or_compile — fingerprint → shared routine
//!     ▼
//! proc(rwptrs, strides, consts, width, height)
//! ```
//!
//! Compiled routines are pure functions of their arguments and re-entrant;
//! the host may run them concurrently across frames and planes. The routine
//! cache lives for the process and never evicts.
//!
//! ## Example
//!
//! ```
//! use vexpr::{ExprFilter, ExprOptions, Frame, VideoFormat, VideoInfo};
//!
//! let vi = VideoInfo::new(VideoFormat::gray8(), 4, 1, 1);
//! let filter = ExprFilter::new(&[vi.clone()], &["x x *"], &ExprOptions::default()).unwrap();
//!
//! let mut src = Frame::new(&vi);
//! for (x, v) in [1.0, 2.0, 3.0, 4.0].into_iter().enumerate() {
//!     src.plane_mut(0).set_f32(x as i32, 0, v);
//! }
//! let out = filter.process(0, &[&src]);
//! assert_eq!(out.plane(0).get_f32(2, 0), 9.0);
//! ```

pub mod error;
pub mod format;
pub mod fp16;
pub mod frame;
pub mod interp;
pub mod ir;
pub mod tokens;

mod cache;
mod filter;
mod sortnet;

pub mod jit;

pub use error::{Error, FilterError, Result};
pub use filter::{ExprFilter, ExprOptions, PropExprFilter, PropExprValue, SelectFilter};
pub use format::{SampleType, VideoFormat, VideoInfo};
pub use frame::{Frame, Plane, PropValue};

/// Pixels processed per inner-loop step by compiled routines.
pub const LANES: usize = 8;

/// Inner-loop unroll factor.
pub const UNROLL: usize = 1;

/// Capability report: which language features this backend supports, for
/// clients that gate on them.
#[derive(Clone, Debug)]
pub struct VersionInfo {
    pub expr_backend: &'static str,
    pub expr_features: Vec<&'static str>,
    pub select_features: Vec<&'static str>,
}

/// The exact capability strings are part of the external contract.
pub fn version() -> VersionInfo {
    VersionInfo {
        expr_backend: "cranelift",
        expr_features: vec![
            "x.property",
            "sin",
            "cos",
            "%",
            "clip",
            "clamp",
            "**",
            "N",
            "X",
            "Y",
            "pi",
            "width",
            "height",
            "trunc",
            "round",
            "floor",
            "var@",
            "var!",
            "x[x,y]",
            "x[x,y]:m",
            "drop",
            "sort",
            "x[]",
            "bitand",
            "bitor",
            "bitxor",
            "bitnot",
            "src0",
            "src26",
            "first-byte-of-bytes-property",
            "fp16",
        ],
        select_features: vec![
            "x.property",
            "sin",
            "cos",
            "%",
            "clip",
            "clamp",
            "**",
            "N",
            "pi",
            "width",
            "height",
            "trunc",
            "round",
            "floor",
            "var@",
            "var!",
            "drop",
            "sort",
            "bitand",
            "bitor",
            "bitxor",
            "bitnot",
            "src0",
            "src26",
            "first-byte-of-bytes-property",
            "argmin",
            "argmax",
            "argsort",
        ],
    }
}
