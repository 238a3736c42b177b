//! The vectorising compiler.
//!
//! [`ExprCompiler`] turns an expression string plus the participating clip
//! formats into a native routine
//!
//! ```text
//! proc(rwptrs: *const *mut u8,  // [0] output plane, inputs follow
//!      strides: *const i32,
//!      consts:  *const f32,     // [0] frame number (raw i32 bits), props after
//!      width: i32, height: i32)
//! ```
//!
//! that processes one whole plane. Compilation goes through the process-wide
//! routine cache, so identical fingerprints share one routine.

mod codegen;
mod math;
mod value;

use std::sync::Arc;

use cranelift::prelude::*;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};

use crate::cache;
use crate::error::{Error, Result};
use crate::format::VideoInfo;
use crate::ir::{self, BoundaryCondition, PropAccess};
use crate::tokens::decode_expr;

use codegen::{GenCtx, HelperRefs};

/// Option-mask bit 0: allow integer lanes (off means force-float mode).
pub const FLAG_USE_INTEGER: i32 = 1 << 0;

/// Entry point of a compiled plane routine.
pub type ProcFn =
    unsafe extern "C" fn(*const *mut u8, *const i32, *const f32, i32, i32);

/// A compiled plane routine. Owns its JIT module; the code memory lives as
/// long as this value, and the cache keeps it for the process lifetime.
pub struct CompiledRoutine {
    _module: JITModule,
    entry: ProcFn,
    /// `(clip, property)` pairs in `consts[]` packing order.
    pub prop_access: Vec<PropAccess>,
}

// The module's code memory is immutable once `finalize_definitions` has run,
// and the entry point is a plain function pointer; concurrent calls are the
// intended use (one invocation per plane per thread).
unsafe impl Send for CompiledRoutine {}
unsafe impl Sync for CompiledRoutine {}

impl CompiledRoutine {
    /// Run the routine over one plane.
    ///
    /// # Safety
    ///
    /// Pointers must reference plane buffers satisfying the alignment and
    /// padding guarantees of [`crate::frame::Plane`], `rwptrs`/`strides`
    /// must hold one output and `numInputs` input entries, and `consts` must
    /// hold the frame number plus one value per `prop_access` entry.
    pub unsafe fn call(
        &self,
        rwptrs: *const *mut u8,
        strides: *const i32,
        consts: *const f32,
        width: i32,
        height: i32,
    ) {
        (self.entry)(rwptrs, strides, consts, width, height)
    }
}

/// One-shot compiler for a single plane expression.
pub struct ExprCompiler<'a> {
    expr: &'a str,
    vo: &'a VideoInfo,
    vi: &'a [VideoInfo],
    opt_mask: i32,
    mirror: bool,
}

impl<'a> ExprCompiler<'a> {
    pub fn new(
        expr: &'a str,
        vo: &'a VideoInfo,
        vi: &'a [VideoInfo],
        opt_mask: i32,
        mirror: bool,
    ) -> ExprCompiler<'a> {
        ExprCompiler { expr, vo, vi, opt_mask, mirror }
    }

    fn force_float(&self) -> bool {
        self.opt_mask & FLAG_USE_INTEGER == 0
    }

    /// Stable cache key: expression text, options and every format involved.
    pub fn fingerprint(&self) -> String {
        use std::fmt::Write;
        let mut key = format!(
            "n={}|opt={}|mirror={}|expr={}|vo={}",
            self.vi.len(),
            self.opt_mask,
            self.mirror as i32,
            self.expr,
            self.vo.format.key(),
        );
        for (i, vi) in self.vi.iter().enumerate() {
            let _ = write!(key, "|vi{}={}", i, vi.format.key());
        }
        key
    }

    /// Compile, or return the cached routine for an identical fingerprint.
    pub fn compile(&self) -> Result<Arc<CompiledRoutine>> {
        cache::get_or_compile(&self.fingerprint(), || self.build())
    }

    fn build(&self) -> Result<CompiledRoutine> {
        let (mut ops, tokens) = decode_expr(self.expr, false)?;
        let default_bc =
            if self.mirror { BoundaryCondition::Mirrored } else { BoundaryCondition::Clamped };
        for op in &mut ops {
            if op.bc == BoundaryCondition::Unspecified {
                op.bc = default_bc;
            }
        }
        let prop_access = ir::finalize(&mut ops, &tokens, self.vi.len())?;
        let num_variables = ir::num_variables(&ops);

        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", "speed")
            .map_err(|e| { eprintln!("DEBUG_FULL_ERR {}: {:?}", file!(), e); Error::Backend(e.to_string()) })?;
        let isa_builder =
            cranelift_native::builder().map_err(|e| { eprintln!("DEBUG_FULL_ERR {}: {:?}", file!(), e); Error::Backend(e.to_string()) })?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| { eprintln!("DEBUG_FULL_ERR {}: {:?}", file!(), e); Error::Backend(e.to_string()) })?;

        let builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        let mut module = JITModule::new(builder);
        let helper_ids = math::define_helpers(&mut module)?;

        let ptr_type = module.target_config().pointer_type();
        let mut ctx = module.make_context();
        for _ in 0..3 {
            ctx.func.signature.params.push(AbiParam::new(ptr_type));
        }
        for _ in 0..2 {
            ctx.func.signature.params.push(AbiParam::new(types::I32));
        }
        let proc_id = module
            .declare_function("proc_plane", Linkage::Local, &ctx.func.signature)
            .map_err(|e| { eprintln!("DEBUG_FULL_ERR {}: {:?}", file!(), e); Error::Backend(e.to_string()) })?;

        let helpers = HelperRefs {
            exp: module.declare_func_in_func(helper_ids.exp, &mut ctx.func),
            log: module.declare_func_in_func(helper_ids.log, &mut ctx.func),
            sin: module.declare_func_in_func(helper_ids.sin, &mut ctx.func),
            cos: module.declare_func_in_func(helper_ids.cos, &mut ctx.func),
            pow: module.declare_func_in_func(helper_ids.pow, &mut ctx.func),
        };

        let mut fbc = FunctionBuilderContext::new();
        let mut b = FunctionBuilder::new(&mut ctx.func, &mut fbc);
        let gen = GenCtx {
            ops: &ops,
            tokens: &tokens,
            expr: self.expr,
            vo: self.vo,
            vi: self.vi,
            force_float: self.force_float(),
            num_variables,
        };
        codegen::emit_proc(&mut b, &gen, helpers, ptr_type)?;
        b.finalize();

        module
            .define_function(proc_id, &mut ctx)
            .map_err(|e| { eprintln!("DEBUG_FULL_ERR: {:?}", e); Error::Backend(e.to_string()) })?;
        module.clear_context(&mut ctx);
        module
            .finalize_definitions()
            .map_err(|e| { eprintln!("DEBUG_FULL_ERR {}: {:?}", file!(), e); Error::Backend(e.to_string()) })?;

        let code = module.get_finalized_function(proc_id);
        // Entry points stay valid until the module is dropped; the routine
        // owns the module.
        let entry: ProcFn = unsafe { std::mem::transmute(code) };
        log::debug!(
            "compiled {:?}: {} ops, {} props, {} vars",
            self.expr,
            ops.len(),
            prop_access.len(),
            num_variables
        );
        Ok(CompiledRoutine { _module: module, entry, prop_access })
    }
}
