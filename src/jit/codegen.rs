//! Lowering of the op sequence into the plane-processing function.
//!
//! The emitted function walks the output plane row-major, `LANES` pixels per
//! inner step, translating each op by popping typed values off a
//! compile-time stack and pushing the lowered result. Mixed int/float
//! binaries dispatch on the operand tags so integer expressions stay in
//! integer lanes until a float is required.

use cranelift::codegen::ir::FuncRef;
use cranelift::prelude::*;

use crate::error::{Error, Result};
use crate::format::{SampleType, VideoFormat, VideoInfo};
use crate::ir::{load_const, BoundaryCondition, CmpOp, Op, OpKind, CONSTS_PROP_BASE};
use crate::jit::math;
use crate::jit::value::{ValueKind, VecValue};
use crate::sortnet;
use crate::{LANES, UNROLL};

/// Helper functions resolved into the routine under construction.
#[derive(Copy, Clone)]
pub(crate) struct HelperRefs {
    pub exp: FuncRef,
    pub log: FuncRef,
    pub sin: FuncRef,
    pub cos: FuncRef,
    pub pow: FuncRef,
}

/// Compilation inputs threaded through emission.
pub(crate) struct GenCtx<'a> {
    pub ops: &'a [Op],
    pub tokens: &'a [String],
    pub expr: &'a str,
    pub vo: &'a VideoInfo,
    pub vi: &'a [VideoInfo],
    pub force_float: bool,
    pub num_variables: usize,
}

/// Values and loop state live for the whole function body.
struct State {
    ptr_type: Type,
    /// `[0]` is the output plane, inputs follow.
    wptrs: Vec<Value>,
    strides: Vec<Value>,
    consts: Value,
    width: Value,
    height: Value,
    x: Variable,
    y: Variable,
    /// Lane index vector `[0..LANES)`.
    xvec: (Value, Value),
    variables: Vec<VecValue>,
    helpers: HelperRefs,
    force_float: bool,
    next_var: usize,
}

type B<'short, 'long> = &'short mut FunctionBuilder<'long>;

fn f_add(b: B, l: Value, r: Value) -> Value {
    b.ins().fadd(l, r)
}
fn f_sub(b: B, l: Value, r: Value) -> Value {
    b.ins().fsub(l, r)
}
fn f_mul(b: B, l: Value, r: Value) -> Value {
    b.ins().fmul(l, r)
}
fn f_div(b: B, l: Value, r: Value) -> Value {
    b.ins().fdiv(l, r)
}
/// `l - trunc(l / r) * r`; the backend has no vector remainder.
fn f_mod(b: B, l: Value, r: Value) -> Value {
    let q = b.ins().fdiv(l, r);
    let t = b.ins().trunc(q);
    let p = b.ins().fmul(t, r);
    b.ins().fsub(l, p)
}
fn f_min(b: B, l: Value, r: Value) -> Value {
    b.ins().fmin(l, r)
}
fn f_max(b: B, l: Value, r: Value) -> Value {
    b.ins().fmax(l, r)
}
fn i_add(b: B, l: Value, r: Value) -> Value {
    b.ins().iadd(l, r)
}
fn i_sub(b: B, l: Value, r: Value) -> Value {
    b.ins().isub(l, r)
}
fn i_mul(b: B, l: Value, r: Value) -> Value {
    b.ins().imul(l, r)
}
fn i_min(b: B, l: Value, r: Value) -> Value {
    b.ins().smin(l, r)
}
fn i_max(b: B, l: Value, r: Value) -> Value {
    b.ins().smax(l, r)
}

type HalfOp = for<'s, 'l> fn(B<'s, 'l>, Value, Value) -> Value;

impl State {
    fn new_var(&mut self, b: B, ty: Type) -> Variable {
        let var = Variable::new(self.next_var);
        self.next_var += 1;
        b.declare_var(var, ty);
        var
    }

    fn map2(&mut self, b: B, l: VecValue, r: VecValue, op: HalfOp, kind: ValueKind) -> VecValue {
        let lo = op(b, l.lo, r.lo);
        let hi = op(b, l.hi, r.hi);
        VecValue { lo, hi, kind, const_int: None }
    }

    fn ensure_float(&mut self, b: B, v: VecValue) -> VecValue {
        if v.is_float() {
            return v;
        }
        let lo = b.ins().fcvt_from_sint(types::F32X4, v.lo);
        let hi = b.ins().fcvt_from_sint(types::F32X4, v.hi);
        VecValue::float(lo, hi)
    }

    fn ensure_int(&mut self, b: B, v: VecValue) -> VecValue {
        if !v.is_float() {
            return v;
        }
        let lo = math::round_int(b, v.lo);
        let hi = math::round_int(b, v.hi);
        VecValue::int(lo, hi)
    }

    /// Four-way dispatch of a binary op on the operand tags.
    fn binary(
        &mut self,
        b: B,
        l: VecValue,
        r: VecValue,
        force_float: bool,
        fop: HalfOp,
        iop: HalfOp,
    ) -> VecValue {
        if l.is_float() || r.is_float() || force_float {
            let lf = self.ensure_float(b, l);
            let rf = self.ensure_float(b, r);
            self.map2(b, lf, rf, fop, ValueKind::Float)
        } else {
            self.map2(b, l, r, iop, ValueKind::Int)
        }
    }

    fn splat_int(&mut self, b: B, scalar: Value) -> VecValue {
        let v = b.ins().splat(types::I32X4, scalar);
        VecValue::int(v, v)
    }

    fn splat_float_scalar(&mut self, b: B, scalar: Value) -> VecValue {
        let v = b.ins().splat(types::F32X4, scalar);
        VecValue::float(v, v)
    }

    /// `(min, max)` of two stack slots with the usual promotion; used by the
    /// sorting-network comparators.
    fn min_max(&mut self, b: B, l: VecValue, r: VecValue) -> (VecValue, VecValue) {
        if l.is_float() || r.is_float() {
            let lf = self.ensure_float(b, l);
            let rf = self.ensure_float(b, r);
            let mn = self.map2(b, lf, rf, f_min, ValueKind::Float);
            let mx = self.map2(b, lf, rf, f_max, ValueKind::Float);
            (mn, mx)
        } else {
            let mn = self.map2(b, l, r, i_min, ValueKind::Int);
            let mx = self.map2(b, l, r, i_max, ValueKind::Int);
            (mn, mx)
        }
    }

    /// 0/1 truth mask (`v > 0`) for the logical operators.
    fn truth_mask(&mut self, b: B, v: VecValue) -> VecValue {
        let (lo, hi) = if v.is_float() {
            let zero = math::splat_f32(b, 0.0);
            (
                b.ins().fcmp(FloatCC::GreaterThan, v.lo, zero),
                b.ins().fcmp(FloatCC::GreaterThan, v.hi, zero),
            )
        } else {
            let zero = math::splat_i32(b, 0);
            (
                b.ins().icmp(IntCC::SignedGreaterThan, v.lo, zero),
                b.ins().icmp(IntCC::SignedGreaterThan, v.hi, zero),
            )
        };
        VecValue::int(lo, hi)
    }

    /// AND the all-ones comparison mask down to 0/1 lanes.
    fn mask_to_bool(&mut self, b: B, m: VecValue) -> VecValue {
        let one = math::splat_i32(b, 1);
        let lo = b.ins().band(m.lo, one);
        let hi = b.ins().band(m.hi, one);
        VecValue::int(lo, hi)
    }

    fn clamp_scalar(&mut self, b: B, v: Value, lo: Value, hi: Value) -> Value {
        let t = b.ins().smin(v, hi);
        b.ins().smax(t, lo)
    }

    /// Single-reflection mirror of a scalar index into `[0, limit)`.
    fn mirror_scalar(&mut self, b: B, v: Value, limit: Value) -> Value {
        let below = b.ins().icmp_imm(IntCC::SignedLessThan, v, 0);
        let refl_low = b.ins().irsub_imm(v, -1); // -1 - v
        let above = b.ins().icmp(IntCC::SignedGreaterThanOrEqual, v, limit);
        let twol = b.ins().iadd(limit, limit);
        let twol1 = b.ins().iadd_imm(twol, -1);
        let refl_high = b.ins().isub(twol1, v); // 2*limit - 1 - v
        let inner = b.ins().select(above, refl_high, v);
        b.ins().select(below, refl_low, inner)
    }

    /// Byte address of `(x, y)` in plane `idx` of the rwptrs table.
    fn plane_addr(&mut self, b: B, idx: usize, yv: Value, xv: Value, bytes: u32) -> Value {
        let row = b.ins().imul(yv, self.strides[idx]);
        let col = b.ins().imul_imm(xv, bytes as i64);
        let off = b.ins().iadd(row, col);
        let off = if self.ptr_type.bits() > 32 {
            b.ins().sextend(self.ptr_type, off)
        } else {
            off
        };
        b.ins().iadd(self.wptrs[idx], off)
    }

    /// Contiguous LANES-wide load, widened to i32 lanes (integer and f16
    /// sources) or f32 lanes.
    fn load_contiguous(&mut self, b: B, addr: Value, fmt: &VideoFormat) -> VecValue {
        let flags = MemFlags::new();
        match (fmt.sample_type, fmt.bytes_per_sample) {
            (SampleType::Integer, 1) => {
                let v64 = b.ins().load(types::I64, flags, addr, 0);
                let pair = b.ins().splat(types::I64X2, v64);
                let bytes = b.ins().bitcast(types::I8X16, MemFlags::new(), pair);
                let w16 = b.ins().uwiden_low(bytes);
                let lo = b.ins().uwiden_low(w16);
                let hi = b.ins().uwiden_high(w16);
                VecValue::int(lo, hi)
            }
            (SampleType::Integer, 2) => {
                let v = b.ins().load(types::I16X8, flags, addr, 0);
                let lo = b.ins().uwiden_low(v);
                let hi = b.ins().uwiden_high(v);
                VecValue::int(lo, hi)
            }
            (SampleType::Integer, _) => {
                let lo = b.ins().load(types::I32X4, flags, addr, 0);
                let hi = b.ins().load(types::I32X4, flags, addr, 16);
                VecValue::int(lo, hi)
            }
            (SampleType::Float, 2) => {
                let v = b.ins().load(types::I16X8, flags, addr, 0);
                let wlo = b.ins().uwiden_low(v);
                let whi = b.ins().uwiden_high(v);
                let lo = math::emit_fp16_to_f32(b, wlo);
                let hi = math::emit_fp16_to_f32(b, whi);
                VecValue::float(lo, hi)
            }
            (SampleType::Float, _) => {
                let lo = b.ins().load(types::F32X4, flags, addr, 0);
                let hi = b.ins().load(types::F32X4, flags, addr, 16);
                VecValue::float(lo, hi)
            }
        }
    }

    /// Per-lane gather: `base + offsets[lane]` scalar loads assembled into a
    /// vector (the backend has no gather primitive).
    fn gather(&mut self, b: B, base: Value, offsets: (Value, Value), fmt: &VideoFormat) -> VecValue {
        let flags = MemFlags::new();
        let is_f32 = fmt.sample_type == SampleType::Float && fmt.bytes_per_sample == 4;
        let vec_ty = if is_f32 { types::F32X4 } else { types::I32X4 };

        let mut halves = [offsets.0, offsets.1];
        for half in &mut halves {
            let offs = *half;
            let mut acc = if is_f32 {
                let z = b.ins().f32const(0.0);
                b.ins().splat(vec_ty, z)
            } else {
                let z = b.ins().iconst(types::I32, 0);
                b.ins().splat(vec_ty, z)
            };
            for lane in 0..4u8 {
                let off = b.ins().extractlane(offs, lane);
                let off = if self.ptr_type.bits() > 32 {
                    b.ins().sextend(self.ptr_type, off)
                } else {
                    off
                };
                let addr = b.ins().iadd(base, off);
                let scalar = match (fmt.sample_type, fmt.bytes_per_sample) {
                    (SampleType::Integer, 1) => b.ins().uload8(types::I32, flags, addr, 0),
                    (SampleType::Integer, 2) | (SampleType::Float, 2) => {
                        b.ins().uload16(types::I32, flags, addr, 0)
                    }
                    (SampleType::Integer, _) => b.ins().load(types::I32, flags, addr, 0),
                    (SampleType::Float, _) => b.ins().load(types::F32, flags, addr, 0),
                };
                acc = b.ins().insertlane(acc, scalar, lane);
            }
            *half = acc;
        }
        let [lo, hi] = halves;

        if fmt.sample_type == SampleType::Float && fmt.bytes_per_sample == 2 {
            let flo = math::emit_fp16_to_f32(b, lo);
            let fhi = math::emit_fp16_to_f32(b, hi);
            VecValue::float(flo, fhi)
        } else if is_f32 {
            VecValue::float(lo, hi)
        } else {
            VecValue::int(lo, hi)
        }
    }

    /// Compile-time lane permutation of a LANES-wide value.
    fn shuffle8(&mut self, b: B, v: VecValue, idx: [usize; LANES]) -> VecValue {
        let ty = if v.is_float() { types::F32X4 } else { types::I32X4 };
        let mut out = [v.lo, v.hi];
        for (half, out_half) in out.iter_mut().enumerate() {
            let mut acc = if v.is_float() {
                let z = b.ins().f32const(0.0);
                b.ins().splat(ty, z)
            } else {
                let z = b.ins().iconst(types::I32, 0);
                b.ins().splat(ty, z)
            };
            for j in 0..4usize {
                let src = idx[half * 4 + j];
                let src_vec = if src < 4 { v.lo } else { v.hi };
                let lane = b.ins().extractlane(src_vec, (src % 4) as u8);
                acc = b.ins().insertlane(acc, lane, j as u8);
            }
            *out_half = acc;
        }
        VecValue { lo: out[0], hi: out[1], kind: v.kind, const_int: None }
    }

    /// Edge fix-up for clamped relative loads: the contiguous load at the
    /// clamped base is correct except near the plane edges, where a
    /// compile-time permutation repairs the affected lanes. Dispatch is a
    /// branch chain on the aligned `x` (left edge) or on how far the loaded
    /// vector hangs past the width (right edge, from the clamped base
    /// `load_x`).
    fn relative_adjust(&mut self, b: B, op: &Op, v: VecValue, load_x: Value) -> VecValue {
        if op.dx == 0 || op.bc != BoundaryCondition::Clamped {
            return v;
        }
        let ty = if v.is_float() { types::F32X4 } else { types::I32X4 };
        let vlo = self.new_var(b, ty);
        let vhi = self.new_var(b, ty);
        b.def_var(vlo, v.lo);
        b.def_var(vhi, v.hi);
        let cont = b.create_block();

        if op.dx < 0 {
            let absx = op.dx.unsigned_abs() as usize;
            let xv = b.use_var(self.x);
            let mut base = 0usize;
            while base < absx {
                let hit = b.create_block();
                let miss = b.create_block();
                let c = b.ins().icmp_imm(IntCC::Equal, xv, base as i64);
                b.ins().brif(c, hit, &[], miss, &[]);

                b.switch_to_block(hit);
                b.seal_block(hit);
                let mut idx = [0usize; LANES];
                for (j, slot) in idx.iter_mut().enumerate() {
                    *slot = ((base as i64 + j as i64 + op.dx as i64).max(0) % LANES as i64) as usize;
                }
                let sv = self.shuffle8(b, v, idx);
                b.def_var(vlo, sv.lo);
                b.def_var(vhi, sv.hi);
                b.ins().jump(cont, &[]);

                b.switch_to_block(miss);
                b.seal_block(miss);
                base += LANES;
            }
            b.ins().jump(cont, &[]);
        } else {
            let xe = b.ins().iadd_imm(load_x, LANES as i64);
            let dist = b.ins().isub(xe, self.width);
            let chain = b.create_block();
            let c = b.ins().icmp_imm(IntCC::SignedGreaterThan, dist, 0);
            b.ins().brif(c, chain, &[], cont, &[]);
            b.switch_to_block(chain);
            b.seal_block(chain);

            for d in 1..LANES - 1 {
                let hit = b.create_block();
                let miss = b.create_block();
                let c = b.ins().icmp_imm(IntCC::Equal, dist, d as i64);
                b.ins().brif(c, hit, &[], miss, &[]);

                b.switch_to_block(hit);
                b.seal_block(hit);
                let mut idx = [0usize; LANES];
                for (j, slot) in idx.iter_mut().enumerate() {
                    *slot = if j + d < LANES { j } else { LANES - 1 - d };
                }
                let sv = self.shuffle8(b, v, idx);
                b.def_var(vlo, sv.lo);
                b.def_var(vhi, sv.hi);
                b.ins().jump(cont, &[]);

                b.switch_to_block(miss);
                b.seal_block(miss);
            }
            // Only lane 0 is still valid this close to the edge.
            let sv = self.shuffle8(b, v, [0; LANES]);
            b.def_var(vlo, sv.lo);
            b.def_var(vhi, sv.hi);
            b.ins().jump(cont, &[]);
        }

        b.switch_to_block(cont);
        b.seal_block(cont);
        let lo = b.use_var(vlo);
        let hi = b.use_var(vhi);
        VecValue { lo, hi, kind: v.kind, const_int: None }
    }

    fn emit_mem_load(&mut self, b: B, ctx: &GenCtx, op: &Op, tok: &str) -> Result<VecValue> {
        let clip = op.imm.i();
        if clip < 0 || clip as usize >= ctx.vi.len() {
            return Err(Error::UndefinedClip(tok.to_owned()));
        }
        let clip = clip as usize;
        let fmt = &ctx.vi[clip].format;
        let bytes = fmt.bytes_per_sample;
        let xv = b.use_var(self.x);
        let yv = b.use_var(self.y);
        let zero = b.ins().iconst(types::I32, 0);

        let v = if op.bc == BoundaryCondition::Clamped {
            let y = if op.dy != 0 {
                let sy = b.ins().iadd_imm(yv, op.dy as i64);
                let hm1 = b.ins().iadd_imm(self.height, -1);
                self.clamp_scalar(b, sy, zero, hm1)
            } else {
                yv
            };
            let x = if op.dx != 0 {
                let sx = b.ins().iadd_imm(xv, op.dx as i64);
                let wm1 = b.ins().iadd_imm(self.width, -1);
                self.clamp_scalar(b, sx, zero, wm1)
            } else {
                xv
            };
            let addr = self.plane_addr(b, clip + 1, y, x, bytes);
            let v = self.load_contiguous(b, addr, fmt);
            self.relative_adjust(b, op, v, x)
        } else {
            // Mirrored.
            let y = if op.dy != 0 {
                let negh = b.ins().ineg(self.height);
                let dy = b.ins().iconst(types::I32, op.dy as i64);
                let dy = self.clamp_scalar(b, dy, negh, self.height);
                let sy = b.ins().iadd(yv, dy);
                self.mirror_scalar(b, sy, self.height)
            } else {
                yv
            };
            if op.dx != 0 {
                let negw = b.ins().ineg(self.width);
                let dx = b.ins().iconst(types::I32, op.dx as i64);
                let cx = self.clamp_scalar(b, dx, negw, self.width);
                let wm1 = b.ins().iadd_imm(self.width, -1);
                let mut offsets = [zero, zero];
                for (half, out) in offsets.iter_mut().enumerate() {
                    let mut acc = b.ins().splat(types::I32X4, zero);
                    for lane in 0..4usize {
                        let i = (half * 4 + lane) as i64;
                        let t = b.ins().iadd_imm(xv, i);
                        let sx = b.ins().iadd(t, cx);
                        let xi = self.mirror_scalar(b, sx, self.width);
                        // Padding lanes past the last valid pixel can
                        // reflect out of the row; pin them to it.
                        let xi = self.clamp_scalar(b, xi, zero, wm1);
                        let off = b.ins().imul_imm(xi, bytes as i64);
                        acc = b.ins().insertlane(acc, off, lane as u8);
                    }
                    *out = acc;
                }
                let base = self.plane_addr(b, clip + 1, y, zero, bytes);
                self.gather(b, base, (offsets[0], offsets[1]), fmt)
            } else {
                let addr = self.plane_addr(b, clip + 1, y, xv, bytes);
                self.load_contiguous(b, addr, fmt)
            }
        };

        Ok(if fmt.sample_type == SampleType::Integer && self.force_float {
            self.ensure_float(b, v)
        } else {
            v
        })
    }

    fn emit_mem_load_var(
        &mut self,
        b: B,
        ctx: &GenCtx,
        op: &Op,
        tok: &str,
        absx: VecValue,
        absy: VecValue,
    ) -> Result<VecValue> {
        let clip = op.imm.i();
        if clip < 0 || clip as usize >= ctx.vi.len() {
            return Err(Error::UndefinedClip(tok.to_owned()));
        }
        let clip = clip as usize;
        let fmt = &ctx.vi[clip].format;

        let xi = self.ensure_int(b, absx);
        let yi = self.ensure_int(b, absy);
        let zero = math::splat_i32(b, 0);
        let wm1s = b.ins().iadd_imm(self.width, -1);
        let wm1 = b.ins().splat(types::I32X4, wm1s);
        let hm1s = b.ins().iadd_imm(self.height, -1);
        let hm1 = b.ins().splat(types::I32X4, hm1s);
        let stride = b.ins().splat(types::I32X4, self.strides[clip + 1]);
        let size = math::splat_i32(b, fmt.bytes_per_sample as i32);

        let mut offs = [xi.lo, xi.hi];
        for (half, out) in offs.iter_mut().enumerate() {
            let (xh, yh) = if half == 0 { (xi.lo, yi.lo) } else { (xi.hi, yi.hi) };
            let cx = b.ins().smin(xh, wm1);
            let cx = b.ins().smax(cx, zero);
            let cy = b.ins().smin(yh, hm1);
            let cy = b.ins().smax(cy, zero);
            let row = b.ins().imul(cy, stride);
            let col = b.ins().imul(cx, size);
            *out = b.ins().iadd(row, col);
        }

        let base = self.wptrs[clip + 1];
        let v = self.gather(b, base, (offs[0], offs[1]), fmt);
        Ok(if fmt.sample_type == SampleType::Integer && self.force_float {
            self.ensure_float(b, v)
        } else {
            v
        })
    }

    /// Power by squaring for a compile-time integer exponent.
    fn emit_pow_const(&mut self, b: B, base: VecValue, n: i32) -> VecValue {
        let one = math::splat_f32(b, 1.0);
        if n == 0 {
            return VecValue::float(one, one);
        }
        let basef = self.ensure_float(b, base);
        let mut acc = basef;
        let mut result: Option<VecValue> = None;
        let mut e = n.unsigned_abs();
        loop {
            if e & 1 != 0 {
                result = Some(match result {
                    None => acc,
                    Some(r) => self.map2(b, r, acc, f_mul, ValueKind::Float),
                });
            }
            e >>= 1;
            if e == 0 {
                break;
            }
            acc = self.map2(b, acc, acc, f_mul, ValueKind::Float);
        }
        let mut r = result.unwrap();
        if n < 0 {
            let ones = VecValue::float(one, one);
            r = self.map2(b, ones, r, f_div, ValueKind::Float);
        }
        r
    }

    fn call_helper1(&mut self, b: B, func: FuncRef, x: VecValue) -> VecValue {
        let xf = self.ensure_float(b, x);
        let call = b.ins().call(func, &[xf.lo, xf.hi]);
        let res = b.inst_results(call);
        VecValue::float(res[0], res[1])
    }

    fn call_pow(&mut self, b: B, l: VecValue, r: VecValue) -> VecValue {
        let lf = self.ensure_float(b, l);
        let rf = self.ensure_float(b, r);
        let pow = self.helpers.pow;
        let call = b.ins().call(pow, &[lf.lo, lf.hi, rf.lo, rf.hi]);
        let res = b.inst_results(call);
        VecValue::float(res[0], res[1])
    }

    fn emit_cmp(&mut self, b: B, op: &Op, l: VecValue, r: VecValue) -> VecValue {
        let cmp = CmpOp::from_imm(op.imm.u());
        let mask = if l.is_float() || r.is_float() {
            let lf = self.ensure_float(b, l);
            let rf = self.ensure_float(b, r);
            // The negated forms are "not less than"/"not less or equal":
            // true on unordered operands, like the SIMD compare predicates.
            let cc = match cmp {
                CmpOp::Eq => FloatCC::Equal,
                CmpOp::Lt => FloatCC::LessThan,
                CmpOp::Le => FloatCC::LessThanOrEqual,
                CmpOp::Neq => FloatCC::NotEqual,
                CmpOp::Nlt => FloatCC::UnorderedOrGreaterThanOrEqual,
                CmpOp::Nle => FloatCC::UnorderedOrGreaterThan,
            };
            VecValue::int(b.ins().fcmp(cc, lf.lo, rf.lo), b.ins().fcmp(cc, lf.hi, rf.hi))
        } else {
            let cc = match cmp {
                CmpOp::Eq => IntCC::Equal,
                CmpOp::Lt => IntCC::SignedLessThan,
                CmpOp::Le => IntCC::SignedLessThanOrEqual,
                CmpOp::Neq => IntCC::NotEqual,
                CmpOp::Nlt => IntCC::SignedGreaterThanOrEqual,
                CmpOp::Nle => IntCC::SignedGreaterThan,
            };
            VecValue::int(b.ins().icmp(cc, l.lo, r.lo), b.ins().icmp(cc, l.hi, r.hi))
        };
        self.mask_to_bool(b, mask)
    }

    fn emit_ternary(&mut self, b: B, c: VecValue, t: VecValue, f: VecValue) -> VecValue {
        let mask = self.truth_mask(b, c); // all-ones lanes from the compare
        if t.is_float() || f.is_float() {
            let tf = self.ensure_float(b, t);
            let ff = self.ensure_float(b, f);
            let tl = math::as_int(b, tf.lo);
            let th = math::as_int(b, tf.hi);
            let fl = math::as_int(b, ff.lo);
            let fh = math::as_int(b, ff.hi);
            let lo = b.ins().bitselect(mask.lo, tl, fl);
            let hi = b.ins().bitselect(mask.hi, th, fh);
            VecValue::float(math::as_float(b, lo), math::as_float(b, hi))
        } else {
            let lo = b.ins().bitselect(mask.lo, t.lo, f.lo);
            let hi = b.ins().bitselect(mask.hi, t.hi, f.hi);
            VecValue::int(lo, hi)
        }
    }

    /// Clamp, round and narrow the final value into the output plane.
    fn emit_store(&mut self, b: B, ctx: &GenCtx, res: VecValue) {
        let fmt = &ctx.vo.format;
        let xv = b.use_var(self.x);
        let yv = b.use_var(self.y);
        let addr = self.plane_addr(b, 0, yv, xv, fmt.bytes_per_sample);
        let flags = MemFlags::new();

        match fmt.sample_type {
            SampleType::Integer => {
                let bits = fmt.bits_per_sample;
                let v = if res.is_float() {
                    let maxf = if bits < 32 {
                        ((1u64 << bits) - 1) as f32
                    } else {
                        i32::MAX as f32
                    };
                    let zero = math::splat_f32(b, 0.0);
                    let maxv = math::splat_f32(b, maxf);
                    let clamped = VecValue::float(
                        {
                            let t = b.ins().fmax(res.lo, zero);
                            b.ins().fmin(t, maxv)
                        },
                        {
                            let t = b.ins().fmax(res.hi, zero);
                            b.ins().fmin(t, maxv)
                        },
                    );
                    self.ensure_int(b, clamped)
                } else if bits < 32 {
                    let zero = math::splat_i32(b, 0);
                    let maxv = math::splat_i32(b, ((1u64 << bits) - 1) as i32);
                    let lo = self.clamp_vec_int(b, res.lo, zero, maxv);
                    let hi = self.clamp_vec_int(b, res.hi, zero, maxv);
                    VecValue::int(lo, hi)
                } else {
                    res
                };
                match fmt.bytes_per_sample {
                    1 => {
                        let v16 = b.ins().unarrow(v.lo, v.hi);
                        let v8 = b.ins().unarrow(v16, v16);
                        let lanes64 = b.ins().bitcast(types::I64X2, MemFlags::new(), v8);
                        let low = b.ins().extractlane(lanes64, 0);
                        b.ins().store(flags, low, addr, 0);
                    }
                    2 => {
                        let v16 = b.ins().unarrow(v.lo, v.hi);
                        b.ins().store(flags, v16, addr, 0);
                    }
                    _ => {
                        b.ins().store(flags, v.lo, addr, 0);
                        b.ins().store(flags, v.hi, addr, 16);
                    }
                }
            }
            SampleType::Float => {
                let v = self.ensure_float(b, res);
                if fmt.bytes_per_sample == 2 {
                    let plo = math::emit_f32_to_fp16(b, v.lo);
                    let phi = math::emit_f32_to_fp16(b, v.hi);
                    let packed = b.ins().unarrow(plo, phi);
                    b.ins().store(flags, packed, addr, 0);
                } else {
                    b.ins().store(flags, v.lo, addr, 0);
                    b.ins().store(flags, v.hi, addr, 16);
                }
            }
        }
    }

    fn clamp_vec_int(&mut self, b: B, v: Value, lo: Value, hi: Value) -> Value {
        let t = b.ins().smin(v, hi);
        b.ins().smax(t, lo)
    }

    /// Translate the whole op sequence once and store the result.
    fn emit_one_iter(&mut self, b: B, ctx: &GenCtx) -> Result<()> {
        let mut stack: Vec<VecValue> = Vec::new();

        for (op, tok) in ctx.ops.iter().zip(ctx.tokens) {
            // Depth checks before any emission.
            match op.kind {
                OpKind::Dup | OpKind::Swap if op.imm.u() as usize >= stack.len() => {
                    return Err(Error::StackUnderflow(tok.clone()));
                }
                OpKind::Drop | OpKind::Sort if op.imm.u() as usize > stack.len() => {
                    return Err(Error::StackUnderflow(tok.clone()));
                }
                kind if stack.len() < kind.arity() => {
                    return Err(Error::StackUnderflow(tok.clone()));
                }
                _ => {}
            }

            match op.kind {
                OpKind::Dup => {
                    let v = stack[stack.len() - 1 - op.imm.u() as usize];
                    stack.push(v);
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
                OpKind::Sort => {
                    let net = sortnet::build(op.imm.u() as usize);
                    for (a, bslot) in net {
                        let ia = stack.len() - 1 - a;
                        let ib = stack.len() - 1 - bslot;
                        let (mn, mx) = self.min_max(b, stack[ia], stack[ib]);
                        stack[ia] = mn;
                        stack[ib] = mx;
                    }
                }

                OpKind::MemLoad => {
                    let v = self.emit_mem_load(b, ctx, op, tok)?;
                    stack.push(v);
                }
                OpKind::MemLoadVar => {
                    let absy = stack.pop().unwrap();
                    let absx = stack.pop().unwrap();
                    let v = self.emit_mem_load_var(b, ctx, op, tok, absx, absy)?;
                    stack.push(v);
                }

                OpKind::ConstInt => {
                    let n = op.imm.i();
                    let s = math::splat_i32(b, n);
                    stack.push(VecValue::int_const(s, s, n));
                }
                OpKind::ConstFloat => {
                    let f = op.imm.f();
                    let as_i = f as i64;
                    if as_i as f32 == f && i32::try_from(as_i).is_ok() {
                        let s = math::splat_i32(b, as_i as i32);
                        stack.push(VecValue::int_const(s, s, as_i as i32));
                    } else {
                        let s = math::splat_f32(b, f);
                        stack.push(VecValue::float(s, s));
                    }
                }
                OpKind::ConstLoad => match op.imm.i() {
                    load_const::N => {
                        let n = b.ins().load(types::I32, MemFlags::new(), self.consts, 0);
                        let v = self.splat_int(b, n);
                        stack.push(v);
                    }
                    load_const::X => {
                        let xv = b.use_var(self.x);
                        let base = self.splat_int(b, xv);
                        let xvec = self.xvec;
                        let lo = b.ins().iadd(xvec.0, base.lo);
                        let hi = b.ins().iadd(xvec.1, base.hi);
                        stack.push(VecValue::int(lo, hi));
                    }
                    load_const::Y => {
                        let yv = b.use_var(self.y);
                        let v = self.splat_int(b, yv);
                        stack.push(v);
                    }
                    load_const::WIDTH => {
                        let w = self.width;
                        let v = self.splat_int(b, w);
                        stack.push(v);
                    }
                    load_const::HEIGHT => {
                        let h = self.height;
                        let v = self.splat_int(b, h);
                        stack.push(v);
                    }
                    idx => {
                        let slot = idx - load_const::RESERVED + CONSTS_PROP_BASE;
                        let scalar =
                            b.ins().load(types::F32, MemFlags::new(), self.consts, slot * 4);
                        let v = self.splat_float_scalar(b, scalar);
                        stack.push(v);
                    }
                },

                OpKind::VarLoad => stack.push(self.variables[op.imm.i() as usize]),
                OpKind::VarStore => {
                    let v = stack.pop().unwrap();
                    self.variables[op.imm.i() as usize] = v;
                }

                OpKind::Add | OpKind::Sub | OpKind::Mul => {
                    let r = stack.pop().unwrap();
                    let l = stack.pop().unwrap();
                    let (fop, iop): (HalfOp, HalfOp) = match op.kind {
                        OpKind::Add => (f_add, i_add),
                        OpKind::Sub => (f_sub, i_sub),
                        _ => (f_mul, i_mul),
                    };
                    let v = self.binary(b, l, r, false, fop, iop);
                    stack.push(v);
                }
                OpKind::Div | OpKind::Mod => {
                    // Inherently float, whatever the operand tags say.
                    let r = stack.pop().unwrap();
                    let l = stack.pop().unwrap();
                    let lf = self.ensure_float(b, l);
                    let rf = self.ensure_float(b, r);
                    let fop: HalfOp = if op.kind == OpKind::Div { f_div } else { f_mod };
                    let v = self.map2(b, lf, rf, fop, ValueKind::Float);
                    stack.push(v);
                }
                OpKind::Sqrt => {
                    let x = stack.pop().unwrap();
                    let xf = self.ensure_float(b, x);
                    let zero = math::splat_f32(b, 0.0);
                    let lo = b.ins().fmax(xf.lo, zero);
                    let lo = b.ins().sqrt(lo);
                    let hi = b.ins().fmax(xf.hi, zero);
                    let hi = b.ins().sqrt(hi);
                    stack.push(VecValue::float(lo, hi));
                }
                OpKind::Abs => {
                    let x = stack.pop().unwrap();
                    let v = if x.is_float() || self.force_float {
                        let xf = self.ensure_float(b, x);
                        VecValue::float(b.ins().fabs(xf.lo), b.ins().fabs(xf.hi))
                    } else {
                        VecValue::int(b.ins().iabs(x.lo), b.ins().iabs(x.hi))
                    };
                    stack.push(v);
                }
                OpKind::Max | OpKind::Min => {
                    let r = stack.pop().unwrap();
                    let l = stack.pop().unwrap();
                    let (fop, iop): (HalfOp, HalfOp) = if op.kind == OpKind::Max {
                        (f_max, i_max)
                    } else {
                        (f_min, i_min)
                    };
                    let force = self.force_float;
                    let v = self.binary(b, l, r, force, fop, iop);
                    stack.push(v);
                }
                OpKind::Clamp => {
                    let hi = stack.pop().unwrap();
                    let lo = stack.pop().unwrap();
                    let x = stack.pop().unwrap();
                    let v = if x.is_float() || lo.is_float() || hi.is_float() || self.force_float {
                        let xf = self.ensure_float(b, x);
                        let lof = self.ensure_float(b, lo);
                        let hif = self.ensure_float(b, hi);
                        let t = self.map2(b, xf, hif, f_min, ValueKind::Float);
                        self.map2(b, t, lof, f_max, ValueKind::Float)
                    } else {
                        let t = self.map2(b, x, hi, i_min, ValueKind::Int);
                        self.map2(b, t, lo, i_max, ValueKind::Int)
                    };
                    stack.push(v);
                }
                OpKind::Cmp => {
                    let r = stack.pop().unwrap();
                    let l = stack.pop().unwrap();
                    let v = self.emit_cmp(b, op, l, r);
                    stack.push(v);
                }

                OpKind::And | OpKind::Or | OpKind::Xor => {
                    let r = stack.pop().unwrap();
                    let l = stack.pop().unwrap();
                    let lm = self.truth_mask(b, l);
                    let rm = self.truth_mask(b, r);
                    let (lo, hi) = match op.kind {
                        OpKind::And => (b.ins().band(lm.lo, rm.lo), b.ins().band(lm.hi, rm.hi)),
                        OpKind::Or => (b.ins().bor(lm.lo, rm.lo), b.ins().bor(lm.hi, rm.hi)),
                        _ => (b.ins().bxor(lm.lo, rm.lo), b.ins().bxor(lm.hi, rm.hi)),
                    };
                    let v = self.mask_to_bool(b, VecValue::int(lo, hi));
                    stack.push(v);
                }
                OpKind::Not => {
                    let x = stack.pop().unwrap();
                    let mask = if x.is_float() {
                        let zero = math::splat_f32(b, 0.0);
                        VecValue::int(
                            b.ins().fcmp(FloatCC::LessThanOrEqual, x.lo, zero),
                            b.ins().fcmp(FloatCC::LessThanOrEqual, x.hi, zero),
                        )
                    } else {
                        let zero = math::splat_i32(b, 0);
                        VecValue::int(
                            b.ins().icmp(IntCC::SignedLessThanOrEqual, x.lo, zero),
                            b.ins().icmp(IntCC::SignedLessThanOrEqual, x.hi, zero),
                        )
                    };
                    let v = self.mask_to_bool(b, mask);
                    stack.push(v);
                }

                OpKind::BitAnd | OpKind::BitOr | OpKind::BitXor => {
                    let r = stack.pop().unwrap();
                    let l = stack.pop().unwrap();
                    let li = self.ensure_int(b, l);
                    let ri = self.ensure_int(b, r);
                    let (lo, hi) = match op.kind {
                        OpKind::BitAnd => (b.ins().band(li.lo, ri.lo), b.ins().band(li.hi, ri.hi)),
                        OpKind::BitOr => (b.ins().bor(li.lo, ri.lo), b.ins().bor(li.hi, ri.hi)),
                        _ => (b.ins().bxor(li.lo, ri.lo), b.ins().bxor(li.hi, ri.hi)),
                    };
                    stack.push(VecValue::int(lo, hi));
                }
                OpKind::BitNot => {
                    let x = stack.pop().unwrap();
                    let xi = self.ensure_int(b, x);
                    stack.push(VecValue::int(b.ins().bnot(xi.lo), b.ins().bnot(xi.hi)));
                }

                OpKind::Trunc | OpKind::Round | OpKind::Floor => {
                    let x = stack.pop().unwrap();
                    let xf = self.ensure_float(b, x);
                    let (lo, hi) = match op.kind {
                        OpKind::Trunc => (b.ins().trunc(xf.lo), b.ins().trunc(xf.hi)),
                        OpKind::Round => (b.ins().nearest(xf.lo), b.ins().nearest(xf.hi)),
                        _ => (b.ins().floor(xf.lo), b.ins().floor(xf.hi)),
                    };
                    stack.push(VecValue::float(lo, hi));
                }

                OpKind::Exp | OpKind::Log | OpKind::Sin | OpKind::Cos => {
                    let x = stack.pop().unwrap();
                    let func = match op.kind {
                        OpKind::Exp => self.helpers.exp,
                        OpKind::Log => self.helpers.log,
                        OpKind::Sin => self.helpers.sin,
                        _ => self.helpers.cos,
                    };
                    let v = self.call_helper1(b, func, x);
                    stack.push(v);
                }
                OpKind::Pow => {
                    let r = stack.pop().unwrap();
                    let l = stack.pop().unwrap();
                    let v = match (r.is_float(), r.const_int) {
                        (false, Some(n)) => self.emit_pow_const(b, l, n),
                        _ => self.call_pow(b, l, r),
                    };
                    stack.push(v);
                }

                OpKind::Ternary => {
                    let f = stack.pop().unwrap();
                    let t = stack.pop().unwrap();
                    let c = stack.pop().unwrap();
                    let v = self.emit_ternary(b, c, t, f);
                    stack.push(v);
                }

                OpKind::ArgMin | OpKind::ArgMax | OpKind::ArgSort => {
                    return Err(Error::InvalidToken(format!(
                        "{tok} is not supported in compiled expressions"
                    )));
                }
            }
        }

        match stack.len() {
            0 => Err(Error::EmptyExpression(ctx.expr.to_owned())),
            1 => {
                let res = stack.pop().unwrap();
                self.emit_store(b, ctx, res);
                Ok(())
            }
            count => Err(Error::StackUnconsumed { count, expr: ctx.expr.to_owned() }),
        }
    }
}

/// `[base, base+1, base+2, base+3]` as an i32x4 constant.
fn lane_indices(b: &mut FunctionBuilder, base: i32) -> Value {
    let z = b.ins().iconst(types::I32, 0);
    let mut acc = b.ins().splat(types::I32X4, z);
    for lane in 0..4u8 {
        let c = b.ins().iconst(types::I32, (base + lane as i32) as i64);
        acc = b.ins().insertlane(acc, c, lane);
    }
    acc
}

/// Build the whole `proc(rwptrs, strides, consts, width, height)` body into
/// `b`. The loop nest is the classic frontend pattern: header blocks with
/// `Variable`-carried induction values, body sealed as soon as its single
/// predecessor is known.
pub(crate) fn emit_proc(
    b: &mut FunctionBuilder,
    ctx: &GenCtx,
    helpers: HelperRefs,
    ptr_type: Type,
) -> Result<()> {
    let entry = b.create_block();
    b.append_block_params_for_function_params(entry);
    b.switch_to_block(entry);
    b.seal_block(entry);

    let params: Vec<Value> = b.block_params(entry).to_vec();
    let (rwptrs, strides_ptr, consts, width, height) =
        (params[0], params[1], params[2], params[3], params[4]);

    let num_inputs = ctx.vi.len();
    let mut state = State {
        ptr_type,
        wptrs: Vec::with_capacity(num_inputs + 1),
        strides: Vec::with_capacity(num_inputs + 1),
        consts,
        width,
        height,
        x: Variable::new(0),
        y: Variable::new(1),
        xvec: (lane_indices(b, 0), lane_indices(b, 4)),
        variables: Vec::new(),
        helpers,
        force_float: ctx.force_float,
        next_var: 2,
    };
    b.declare_var(state.x, types::I32);
    b.declare_var(state.y, types::I32);

    let flags = MemFlags::new();
    for i in 0..=num_inputs {
        let p = b.ins().load(ptr_type, flags, rwptrs, (i as u32 * ptr_type.bytes()) as i32);
        state.wptrs.push(p);
        let s = b.ins().load(types::I32, flags, strides_ptr, (i * 4) as i32);
        state.strides.push(s);
    }

    let zero_vec = math::splat_i32(b, 0);
    state.variables = vec![VecValue::int(zero_vec, zero_vec); ctx.num_variables];

    let y_header = b.create_block();
    let y_body = b.create_block();
    let x_header = b.create_block();
    let x_body = b.create_block();
    let x_done = b.create_block();
    let exit = b.create_block();

    let zero = b.ins().iconst(types::I32, 0);
    b.def_var(state.y, zero);
    b.ins().jump(y_header, &[]);

    b.switch_to_block(y_header);
    let yv = b.use_var(state.y);
    let more_rows = b.ins().icmp(IntCC::SignedLessThan, yv, height);
    b.ins().brif(more_rows, y_body, &[], exit, &[]);

    b.switch_to_block(y_body);
    b.seal_block(y_body);
    let zero = b.ins().iconst(types::I32, 0);
    b.def_var(state.x, zero);
    b.ins().jump(x_header, &[]);

    b.switch_to_block(x_header);
    let xv = b.use_var(state.x);
    let more_cols = b.ins().icmp(IntCC::SignedLessThan, xv, width);
    b.ins().brif(more_cols, x_body, &[], x_done, &[]);

    b.switch_to_block(x_body);
    b.seal_block(x_body);
    for _ in 0..UNROLL {
        state.emit_one_iter(b, ctx)?;
    }
    let xv = b.use_var(state.x);
    let xn = b.ins().iadd_imm(xv, (LANES * UNROLL) as i64);
    b.def_var(state.x, xn);
    b.ins().jump(x_header, &[]);
    b.seal_block(x_header);

    b.switch_to_block(x_done);
    b.seal_block(x_done);
    let yv = b.use_var(state.y);
    let yn = b.ins().iadd_imm(yv, 1);
    b.def_var(state.y, yn);
    b.ins().jump(y_header, &[]);
    b.seal_block(y_header);

    b.switch_to_block(exit);
    b.seal_block(exit);
    b.ins().return_(&[]);
    Ok(())
}
