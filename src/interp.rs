//! Scalar expression interpreter.
//!
//! A stack-of-f32 evaluator over the same op sequence the JIT consumes.
//! Select and PropExpr run it once per frame; constructors run it with
//! throwing callbacks to validate expressions up front. Integer immediates
//! widen to f32 on push, so everything on the stack is a float.
//!
//! Semantics track the compiled code except where documented: transcendental
//! ops use the platform libm here but minimax polynomials in the JIT, and
//! `%` is the platform `fmod`.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::ir::{load_const, CmpOp, Op, OpKind};

/// Pixel callback: receives the memory-access op plus the current `(y, x)`.
/// Only Expr binds this to real plane data; Select/PropExpr bind it to an
/// error.
pub type PixelGet<'a> = &'a dyn Fn(&Op, i32, i32) -> Result<f32>;

/// Property callback: `(property_source_index, name)`.
pub type PropGet<'a> = &'a dyn Fn(usize, &str) -> Result<f32>;

fn check_stack(stack: &[f32], wanted: usize) -> Result<()> {
    if stack.len() < wanted {
        return Err(Error::underflow(wanted, stack.len()));
    }
    Ok(())
}

/// Evaluate `ops` once and return the single value left on the stack.
#[allow(clippy::too_many_arguments)]
pub fn interpret(
    ops: &[Op],
    n: i32,
    width: i32,
    height: i32,
    y: i32,
    x: i32,
    pixel_get: PixelGet<'_>,
    prop_get: PropGet<'_>,
) -> Result<f32> {
    let mut stack: Vec<f32> = Vec::new();
    let mut vars: HashMap<&str, f32> = HashMap::new();

    for op in ops {
        // The count-carrying stack helpers check depth against their
        // immediate; everything else against its fixed arity.
        match op.kind {
            OpKind::Dup | OpKind::Swap => check_stack(&stack, op.imm.u() as usize + 1)?,
            OpKind::Drop | OpKind::Sort | OpKind::ArgMin | OpKind::ArgMax | OpKind::ArgSort => {
                check_stack(&stack, op.imm.u() as usize)?
            }
            OpKind::MemLoad | OpKind::MemLoadVar => {}
            kind => check_stack(&stack, kind.arity())?,
        }

        match op.kind {
            OpKind::Dup => {
                stack.push(stack[stack.len() - 1 - op.imm.u() as usize]);
            }
            OpKind::Swap => {
                let top = stack.len() - 1;
                let other = top - op.imm.u() as usize;
                stack.swap(top, other);
            }
            OpKind::Drop => {
                let keep = stack.len() - op.imm.u() as usize;
                stack.truncate(keep);
            }

            OpKind::MemLoad | OpKind::MemLoadVar => stack.push(pixel_get(op, y, x)?),

            OpKind::ConstInt => stack.push(op.imm.i() as f32),
            OpKind::ConstFloat => stack.push(op.imm.f()),
            OpKind::ConstLoad => match op.imm.i() {
                load_const::N => stack.push(n as f32),
                load_const::X => stack.push(x as f32),
                load_const::Y => stack.push(y as f32),
                load_const::WIDTH => stack.push(width as f32),
                load_const::HEIGHT => stack.push(height as f32),
                idx => stack.push(prop_get((idx - load_const::RESERVED) as usize, &op.name)?),
            },

            OpKind::VarLoad => match vars.get(op.name.as_str()) {
                Some(&v) => stack.push(v),
                None => return Err(Error::UninitializedVariable(op.name.clone())),
            },
            OpKind::VarStore => {
                let v = stack.pop().unwrap();
                vars.insert(op.name.as_str(), v);
            }

            OpKind::Add => binary(&mut stack, |l, r| l + r),
            OpKind::Sub => binary(&mut stack, |l, r| l - r),
            OpKind::Mul => binary(&mut stack, |l, r| l * r),
            OpKind::Div => binary(&mut stack, |l, r| l / r),
            OpKind::Mod => binary(&mut stack, |l, r| l % r),
            OpKind::Sqrt => unary(&mut stack, |v| v.max(0.0).sqrt()),
            OpKind::Abs => unary(&mut stack, f32::abs),
            OpKind::Max => binary(&mut stack, f32::max),
            OpKind::Min => binary(&mut stack, f32::min),
            OpKind::Clamp => {
                let hi = stack.pop().unwrap();
                let lo = stack.pop().unwrap();
                let v = stack.pop().unwrap();
                stack.push(v.min(hi).max(lo));
            }
            OpKind::Cmp => {
                let cmp = CmpOp::from_imm(op.imm.u());
                binary(&mut stack, move |l, r| {
                    let res = match cmp {
                        CmpOp::Eq => l == r,
                        CmpOp::Lt => l < r,
                        CmpOp::Le => l <= r,
                        CmpOp::Neq => l != r,
                        CmpOp::Nlt => l >= r,
                        CmpOp::Nle => l > r,
                    };
                    res as i32 as f32
                });
            }

            OpKind::Trunc => unary(&mut stack, f32::trunc),
            OpKind::Round => unary(&mut stack, f32::round),
            OpKind::Floor => unary(&mut stack, f32::floor),

            OpKind::And => binary(&mut stack, |l, r| ((l > 0.0) & (r > 0.0)) as i32 as f32),
            OpKind::Or => binary(&mut stack, |l, r| ((l > 0.0) | (r > 0.0)) as i32 as f32),
            OpKind::Xor => binary(&mut stack, |l, r| ((l > 0.0) ^ (r > 0.0)) as i32 as f32),
            OpKind::Not => unary(&mut stack, |v| (v <= 0.0) as i32 as f32),

            OpKind::BitAnd => binary(&mut stack, |l, r| (round_i32(l) & round_i32(r)) as f32),
            OpKind::BitOr => binary(&mut stack, |l, r| (round_i32(l) | round_i32(r)) as f32),
            OpKind::BitXor => binary(&mut stack, |l, r| (round_i32(l) ^ round_i32(r)) as f32),
            OpKind::BitNot => unary(&mut stack, |v| !round_i32(v) as f32),

            OpKind::Exp => unary(&mut stack, f32::exp),
            OpKind::Log => unary(&mut stack, f32::ln),
            OpKind::Pow => binary(&mut stack, f32::powf),
            OpKind::Sin => unary(&mut stack, f32::sin),
            OpKind::Cos => unary(&mut stack, f32::cos),

            OpKind::Ternary => {
                let f = stack.pop().unwrap();
                let t = stack.pop().unwrap();
                let c = stack.pop().unwrap();
                stack.push(if c > 0.0 { t } else { f });
            }

            OpKind::Sort => {
                let off = stack.len() - op.imm.u() as usize;
                stack[off..].sort_by(|l, r| r.partial_cmp(l).unwrap_or(std::cmp::Ordering::Equal));
            }

            OpKind::ArgMin | OpKind::ArgMax => {
                let count = op.imm.u() as usize;
                let off = stack.len() - count;
                // Strict comparison: ties go to the smallest index.
                let mut best: Option<(usize, f32)> = None;
                for (i, &v) in stack[off..].iter().enumerate() {
                    best = match best {
                        None => Some((i, v)),
                        Some((_, cur))
                            if (op.kind == OpKind::ArgMin && v < cur)
                                || (op.kind == OpKind::ArgMax && v > cur) =>
                        {
                            Some((i, v))
                        }
                        keep => keep,
                    };
                }
                stack.truncate(off);
                stack.push(best.map_or(0.0, |(i, _)| i as f32));
            }
            OpKind::ArgSort => {
                let count = op.imm.u() as usize;
                let off = stack.len() - count;
                let mut idxs: Vec<usize> = (0..count).collect();
                idxs.sort_by(|&l, &r| {
                    stack[off + r]
                        .partial_cmp(&stack[off + l])
                        .unwrap_or(std::cmp::Ordering::Equal)
                });
                for (slot, idx) in stack[off..].iter_mut().zip(idxs) {
                    *slot = idx as f32;
                }
            }
        }
    }

    match stack.len() {
        0 => Err(Error::EmptyExpression(String::new())),
        1 => Ok(stack[0]),
        count => Err(Error::StackUnconsumed { count, expr: String::new() }),
    }
}

fn unary(stack: &mut Vec<f32>, f: impl FnOnce(f32) -> f32) {
    let x = stack.pop().unwrap();
    stack.push(f(x));
}

fn binary(stack: &mut Vec<f32>, f: impl FnOnce(f32, f32) -> f32) {
    let r = stack.pop().unwrap();
    let l = stack.pop().unwrap();
    stack.push(f(l, r));
}

/// `(int)std::round(x)` with the saturating cast Rust gives us.
fn round_i32(x: f32) -> i32 {
    x.round() as i32
}
