//! Vector math kernels emitted into the JIT module.
//!
//! The transcendentals are defined as internal pure functions (`vexp`,
//! `vlog`, `vsin`, `vcos`, `vpow`) so call sites stay small and repeated
//! calls share code. Each body applies the scalar-minimax kernel below to
//! both 128-bit halves of a LANES-wide value; each helper reads its own
//! arguments. Polynomials are evaluated Horner-style with explicit
//! multiply-add; coefficients are carried as exact bit patterns.
//!
//! FP16 widening/narrowing is emitted inline at load/store sites; the
//! integer kernels here mirror `crate::fp16`.

use cranelift::prelude::*;
use cranelift_jit::JITModule;
use cranelift_module::{FuncId, Linkage, Module};

use crate::error::{Error, Result};

/// Function ids of the shared helpers inside one JIT module.
#[derive(Copy, Clone)]
pub(crate) struct HelperIds {
    pub exp: FuncId,
    pub log: FuncId,
    pub sin: FuncId,
    pub cos: FuncId,
    pub pow: FuncId,
}

pub(crate) fn splat_f32(b: &mut FunctionBuilder, v: f32) -> Value {
    let c = b.ins().f32const(v);
    b.ins().splat(types::F32X4, c)
}

pub(crate) fn splat_i32(b: &mut FunctionBuilder, v: i32) -> Value {
    let c = b.ins().iconst(types::I32, (v as u32) as i64);
    b.ins().splat(types::I32X4, c)
}

pub(crate) fn splat_bits(b: &mut FunctionBuilder, bits: u32) -> Value {
    splat_i32(b, bits as i32)
}

pub(crate) fn as_int(b: &mut FunctionBuilder, v: Value) -> Value {
    b.ins().bitcast(types::I32X4, MemFlags::new(), v)
}

pub(crate) fn as_float(b: &mut FunctionBuilder, v: Value) -> Value {
    b.ins().bitcast(types::F32X4, MemFlags::new(), v)
}

/// `a * x + c`, unfused. The coefficient sets below predate FMA and keep
/// their documented error bounds with separate rounding.
pub(crate) fn madd(b: &mut FunctionBuilder, a: Value, x: Value, c: Value) -> Value {
    let m = b.ins().fmul(a, x);
    b.ins().fadd(m, c)
}

/// Round to nearest-even integer lanes.
pub(crate) fn round_int(b: &mut FunctionBuilder, v: Value) -> Value {
    let r = b.ins().nearest(v);
    b.ins().fcvt_to_sint_sat(types::I32X4, r)
}

/// Vector shift by a constant amount (shift amounts are scalars in
/// Cranelift's vector shifts).
fn shl(b: &mut FunctionBuilder, v: Value, amt: i64) -> Value {
    let a = b.ins().iconst(types::I32, amt);
    b.ins().ishl(v, a)
}

fn sshr(b: &mut FunctionBuilder, v: Value, amt: i64) -> Value {
    let a = b.ins().iconst(types::I32, amt);
    b.ins().sshr(v, a)
}

fn ushr(b: &mut FunctionBuilder, v: Value, amt: i64) -> Value {
    let a = b.ins().iconst(types::I32, amt);
    b.ins().ushr(v, a)
}

/// exp(x) on one f32x4: clamp, two-part ln2 range reduction, degree-5
/// polynomial, scale by 2^k through the exponent field.
pub(crate) fn emit_exp(b: &mut FunctionBuilder, x: Value) -> Value {
    const EXP_HI: f32 = 88.3762626647949;
    const EXP_LO: f32 = -88.3762626647949;
    const LOG2E: f32 = 1.44269504088896341;
    const C1: f32 = 0.693359375;
    const C2: f32 = -2.12194440e-4;
    const P: [f32; 6] = [
        1.9875691500e-4,
        1.3981999507e-3,
        8.3334519073e-3,
        4.1665795894e-2,
        1.6666665459e-1,
        5.0000001201e-1,
    ];

    let hi = splat_f32(b, EXP_HI);
    let lo = splat_f32(b, EXP_LO);
    let mut x = b.ins().fmin(x, hi);
    x = b.ins().fmax(x, lo);

    let log2e = splat_f32(b, LOG2E);
    let half = splat_f32(b, 0.5);
    let mut fx = madd(b, log2e, x, half);

    // floor(fx): round, then subtract one where rounding went up.
    let emm0 = round_int(b, fx);
    let etmp = b.ins().fcvt_from_sint(types::F32X4, emm0);
    let gt = b.ins().fcmp(FloatCC::GreaterThan, etmp, fx);
    let one = splat_f32(b, 1.0);
    let one_bits = as_int(b, one);
    let mask_bits = b.ins().band(one_bits, gt);
    let mask = as_float(b, mask_bits);
    fx = b.ins().fsub(etmp, mask);

    let nc1 = splat_f32(b, -C1);
    x = madd(b, fx, nc1, x);
    let nc2 = splat_f32(b, -C2);
    x = madd(b, fx, nc2, x);

    let z = b.ins().fmul(x, x);
    let mut y = splat_f32(b, P[0]);
    for &p in &P[1..] {
        let c = splat_f32(b, p);
        y = madd(b, y, x, c);
    }
    y = madd(b, y, z, x);
    y = b.ins().fadd(y, one);

    let emm0 = round_int(b, fx);
    let bias = splat_i32(b, 0x7f);
    let emm0 = b.ins().iadd(emm0, bias);
    let emm0 = shl(b, emm0, 23);
    let scale = as_float(b, emm0);
    b.ins().fmul(y, scale)
}

/// ln(x) on one f32x4: exponent extraction, mantissa in [0.5, 1), range
/// split at sqrt(1/2), degree-8 polynomial, two-part ln2 recombination.
/// Non-positive inputs produce NaN lanes.
pub(crate) fn emit_log(b: &mut FunctionBuilder, x: Value) -> Value {
    const MIN_NORM_POS: u32 = 0x0080_0000;
    const INV_MANT_MASK: u32 = !0x7f80_0000;
    const SQRT_1_2: f32 = 0.707106781186547524;
    const P: [f32; 9] = [
        7.0376836292e-2,
        -1.1514610310e-1,
        1.1676998740e-1,
        -1.2420140846e-1,
        1.4249322787e-1,
        -1.6668057665e-1,
        2.0000714765e-1,
        -2.4999993993e-1,
        3.3333331174e-1,
    ];
    const Q1: f32 = -2.12194440e-4;
    const Q2: f32 = 0.693359375;

    let zero = splat_f32(b, 0.0);
    let invalid_mask = b.ins().fcmp(FloatCC::LessThanOrEqual, x, zero);

    let min_norm = splat_bits(b, MIN_NORM_POS);
    let min_norm = as_float(b, min_norm);
    let mut x = b.ins().fmax(x, min_norm);

    let xi = as_int(b, x);
    let mut emm0i = sshr(b, xi, 23);

    let mant_mask = splat_bits(b, INV_MANT_MASK);
    let xi = b.ins().band(xi, mant_mask);
    let half = splat_f32(b, 0.5);
    let half_bits = as_int(b, half);
    let xi = b.ins().bor(xi, half_bits);
    x = as_float(b, xi);

    let bias = splat_i32(b, 0x7f);
    emm0i = b.ins().isub(emm0i, bias);
    let mut emm0 = b.ins().fcvt_from_sint(types::F32X4, emm0i);
    let one = splat_f32(b, 1.0);
    emm0 = b.ins().fadd(emm0, one);

    let split = splat_f32(b, SQRT_1_2);
    let mask = b.ins().fcmp(FloatCC::LessThan, x, split);
    let x_bits = as_int(b, x);
    let etmp_bits = b.ins().band(mask, x_bits);
    let etmp = as_float(b, etmp_bits);
    x = b.ins().fsub(x, one);
    let one_bits = as_int(b, one);
    let maskf_bits = b.ins().band(mask, one_bits);
    let maskf = as_float(b, maskf_bits);
    emm0 = b.ins().fsub(emm0, maskf);
    x = b.ins().fadd(x, etmp);

    let z = b.ins().fmul(x, x);
    let mut y = splat_f32(b, P[0]);
    for &p in &P[1..] {
        let c = splat_f32(b, p);
        y = madd(b, y, x, c);
    }
    y = b.ins().fmul(y, x);
    y = b.ins().fmul(y, z);
    let q1 = splat_f32(b, Q1);
    y = madd(b, emm0, q1, y);
    let neg_half = splat_f32(b, -0.5);
    y = madd(b, z, neg_half, y);
    x = b.ins().fadd(x, y);
    let q2 = splat_f32(b, Q2);
    x = madd(b, emm0, q2, x);

    let x_bits = as_int(b, x);
    let out = b.ins().bor(invalid_mask, x_bits);
    as_float(b, out)
}

/// sin/cos on one f32x4: Cody-Waite 4-part pi range reduction, 4-term
/// minimax polynomial over [-pi/2, pi/2], parity of the quotient folded into
/// the sign.
pub(crate) fn emit_sincos(b: &mut FunctionBuilder, x: Value, is_sin: bool) -> Value {
    let f = f32::from_bits;
    let inv_pi = f(0x3ea2_f983);
    let pi1 = f(0x4049_0000);
    let pi2 = f(0x3a7d_a000);
    let pi3 = f(0x3422_2000);
    let pi4 = f(0x2cb4_611a);
    let sin_c3 = f(0xbe2a_aaa6);
    let sin_c5 = f(0x3c08_876a);
    let sin_c7 = f(0xb94f_b7ff);
    let sin_c9 = f(0x362e_def8);
    let cos_c2 = f(0xbeff_ffe2);
    let cos_c4 = f(0x3d2a_a73c);
    let cos_c6 = f(0xbab5_8d50);
    let cos_c8 = f(0x37c1_ad76);

    let mut sign = if is_sin {
        let xb = as_int(b, x);
        let signbit = splat_bits(b, 0x8000_0000);
        b.ins().band(xb, signbit)
    } else {
        splat_i32(b, 0)
    };

    let mut t1 = b.ins().fabs(x);

    // Range reduction by k = round(|x| / pi).
    let inv_pi = splat_f32(b, inv_pi);
    let t2 = b.ins().fmul(t1, inv_pi);
    let t2i = round_int(b, t2);
    let t4 = shl(b, t2i, 31);
    sign = b.ins().bxor(sign, t4);
    let t2 = b.ins().fcvt_from_sint(types::F32X4, t2i);

    for p in [pi1, pi2, pi3, pi4] {
        let c = splat_f32(b, -p);
        t1 = madd(b, t2, c, t1);
    }

    let t1 = if is_sin {
        // x + x * x^2 * (C3 + x^2 * (C5 + x^2 * (C7 + x^2 * C9)))
        let t2 = b.ins().fmul(t1, t1);
        let c9 = splat_f32(b, sin_c9);
        let c7 = splat_f32(b, sin_c7);
        let mut t3 = madd(b, t2, c9, c7);
        let c5 = splat_f32(b, sin_c5);
        t3 = madd(b, t3, t2, c5);
        let c3 = splat_f32(b, sin_c3);
        t3 = madd(b, t3, t2, c3);
        t3 = b.ins().fmul(t3, t2);
        t3 = b.ins().fmul(t3, t1);
        b.ins().fadd(t1, t3)
    } else {
        // 1 + x^2 * (C2 + x^2 * (C4 + x^2 * (C6 + x^2 * C8)))
        let t1sq = b.ins().fmul(t1, t1);
        let c8 = splat_f32(b, cos_c8);
        let c6 = splat_f32(b, cos_c6);
        let mut t2 = madd(b, t1sq, c8, c6);
        let c4 = splat_f32(b, cos_c4);
        t2 = madd(b, t2, t1sq, c4);
        let c2 = splat_f32(b, cos_c2);
        t2 = madd(b, t2, t1sq, c2);
        let one = splat_f32(b, 1.0);
        madd(b, t2, t1sq, one)
    };

    let t1b = as_int(b, t1);
    let out = b.ins().bxor(sign, t1b);
    as_float(b, out)
}

/// FP16 -> FP32 on one half: input is an i32x4 whose lanes hold raw u16
/// bits. Exponent rebias by magic multiply, INF/NaN fixed up by mask.
pub(crate) fn emit_fp16_to_f32(b: &mut FunctionBuilder, v: Value) -> Value {
    let magic = splat_bits(b, (254 - 15) << 23);
    let magic = as_float(b, magic);
    let inf16 = splat_bits(b, (127 + 16) << 23);
    let inf16 = as_float(b, inf16);

    let signmask = splat_i32(b, 0x8000);
    let sign = b.ins().band(v, signmask);
    let sign = shl(b, sign, 16);

    let mantmask = splat_i32(b, 0x7fff);
    let ti = b.ins().band(v, mantmask);
    let ti = shl(b, ti, 13);
    let tf = as_float(b, ti);
    let tf = b.ins().fmul(tf, magic);
    let ti = as_int(b, tf);

    let infmask = b.ins().fcmp(FloatCC::GreaterThanOrEqual, tf, inf16);
    let expfield = splat_i32(b, 255 << 23);
    let infmask = b.ins().band(infmask, expfield);

    let out = b.ins().bor(ti, infmask);
    let out = b.ins().bor(out, sign);
    as_float(b, out)
}

/// FP32 -> FP16 on one half: returns an i32x4 whose lanes hold the packed
/// u16 bits (in [0, 0xffff], ready for the saturating narrow). NaN payloads
/// pass through the mask select; the sign shift is logical so packed lanes
/// stay unsigned.
pub(crate) fn emit_f32_to_fp16(b: &mut FunctionBuilder, v: Value) -> Value {
    let f32_infty = splat_i32(b, 255 << 23);
    let f16max_bits = splat_bits(b, (127 + 16) << 23);
    let f16max = as_float(b, f16max_bits);
    let magic_bits = splat_bits(b, 15 << 23);
    let magic = as_float(b, magic_bits);
    let expinf = splat_i32(b, (255 ^ 31) << 23);

    let ti = as_int(b, v);
    let signmask = splat_bits(b, 0x8000_0000);
    let sign = b.ins().band(ti, signmask);
    let ti = b.ins().bxor(ti, sign);
    let sign = ushr(b, sign, 16);

    let exp = b.ins().band(ti, f32_infty);
    let nanmask = b.ins().icmp(IntCC::Equal, exp, f32_infty);
    let ifnan = b.ins().bxor(ti, expinf);

    let tif = as_float(b, ti);
    let clamped = b.ins().fmin(tif, f16max);
    let scaled = b.ins().fmul(clamped, magic);
    let normal = as_int(b, scaled);

    let packed = b.ins().bitselect(nanmask, ifnan, normal);
    let packed = ushr(b, packed, 13);
    b.ins().bor(packed, sign)
}

/// Declare and define the five helper functions in `module`. `proc` later
/// calls them through `declare_func_in_func`.
pub(crate) fn define_helpers(module: &mut JITModule) -> Result<HelperIds> {
    let err = |e: cranelift_module::ModuleError| Error::Backend(e.to_string());

    let mut sig1 = module.make_signature();
    for _ in 0..2 {
        sig1.params.push(AbiParam::new(types::F32X4));
        sig1.returns.push(AbiParam::new(types::F32X4));
    }
    let mut sig2 = module.make_signature();
    for _ in 0..4 {
        sig2.params.push(AbiParam::new(types::F32X4));
    }
    for _ in 0..2 {
        sig2.returns.push(AbiParam::new(types::F32X4));
    }

    let exp = module.declare_function("vexp", Linkage::Local, &sig1).map_err(err)?;
    let log = module.declare_function("vlog", Linkage::Local, &sig1).map_err(err)?;
    let sin = module.declare_function("vsin", Linkage::Local, &sig1).map_err(err)?;
    let cos = module.declare_function("vcos", Linkage::Local, &sig1).map_err(err)?;
    let pow = module.declare_function("vpow", Linkage::Local, &sig2).map_err(err)?;
    let ids = HelperIds { exp, log, sin, cos, pow };

    define_unary(module, exp, &sig1, |b, v| emit_exp(b, v))?;
    define_unary(module, log, &sig1, |b, v| emit_log(b, v))?;
    define_unary(module, sin, &sig1, |b, v| emit_sincos(b, v, true))?;
    define_unary(module, cos, &sig1, |b, v| emit_sincos(b, v, false))?;
    define_pow(module, &ids, &sig2)?;
    Ok(ids)
}

fn define_unary(
    module: &mut JITModule,
    id: FuncId,
    sig: &Signature,
    body: impl Fn(&mut FunctionBuilder, Value) -> Value,
) -> Result<()> {
    let mut ctx = module.make_context();
    ctx.func.signature = sig.clone();
    let mut fbc = FunctionBuilderContext::new();
    let mut b = FunctionBuilder::new(&mut ctx.func, &mut fbc);

    let entry = b.create_block();
    b.append_block_params_for_function_params(entry);
    b.switch_to_block(entry);
    b.seal_block(entry);

    let lo = b.block_params(entry)[0];
    let hi = b.block_params(entry)[1];
    let rlo = body(&mut b, lo);
    let rhi = body(&mut b, hi);
    b.ins().return_(&[rlo, rhi]);
    b.finalize();

    module.define_function(id, &mut ctx).map_err(|e| { eprintln!("DEBUG_FULL_ERR {}: {:?}", file!(), e); Error::Backend(e.to_string()) })?;
    module.clear_context(&mut ctx);
    Ok(())
}

/// pow(x, y) = exp(log(x) * y).
fn define_pow(module: &mut JITModule, ids: &HelperIds, sig: &Signature) -> Result<()> {
    let mut ctx = module.make_context();
    ctx.func.signature = sig.clone();
    let exp_ref = module.declare_func_in_func(ids.exp, &mut ctx.func);
    let log_ref = module.declare_func_in_func(ids.log, &mut ctx.func);
    let mut fbc = FunctionBuilderContext::new();
    let mut b = FunctionBuilder::new(&mut ctx.func, &mut fbc);

    let entry = b.create_block();
    b.append_block_params_for_function_params(entry);
    b.switch_to_block(entry);
    b.seal_block(entry);

    let params: Vec<Value> = b.block_params(entry).to_vec();
    let (xlo, xhi, ylo, yhi) = (params[0], params[1], params[2], params[3]);

    let call = b.ins().call(log_ref, &[xlo, xhi]);
    let logs: Vec<Value> = b.inst_results(call).to_vec();
    let mlo = b.ins().fmul(logs[0], ylo);
    let mhi = b.ins().fmul(logs[1], yhi);
    let call = b.ins().call(exp_ref, &[mlo, mhi]);
    let exps: Vec<Value> = b.inst_results(call).to_vec();
    b.ins().return_(&[exps[0], exps[1]]);
    b.finalize();

    module.define_function(ids.pow, &mut ctx).map_err(|e| { eprintln!("DEBUG_FULL_ERR {}: {:?}", file!(), e); Error::Backend(e.to_string()) })?;
    module.clear_context(&mut ctx);
    Ok(())
}
