//! The flat IR shared by the interpreter and the JIT compiler.
//!
//! The language is postfix, so a program is just a `Vec<Op>` in source
//! order. Ops are immutable after [`finalize`] rewrites symbolic names into
//! dense indices; from then on the sequence can be shared freely.

use crate::error::{Error, Result};

/// Operation kinds, one per executable token.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum OpKind {
    // Terminals.
    MemLoad,
    MemLoadVar,
    ConstInt,
    ConstFloat,
    ConstLoad,
    VarLoad,
    VarStore,

    // Arithmetic primitives.
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Sqrt,
    Abs,
    Max,
    Min,
    Clamp,
    Cmp,

    // Integer conversions.
    Trunc,
    Round,
    Floor,

    // Logical operators.
    And,
    Or,
    Xor,
    Not,

    // Bitwise operators.
    BitAnd,
    BitOr,
    BitXor,
    BitNot,

    // Transcendental functions.
    Exp,
    Log,
    Pow,
    Sin,
    Cos,

    // Ternary operator.
    Ternary,

    // Stack helpers; the operand count rides in the immediate.
    Sort,
    Dup,
    Swap,
    Drop,

    // Extended operators, Select/PropExpr only.
    ArgMin,
    ArgMax,
    ArgSort,
}

impl OpKind {
    /// Fixed stack arity. The count-carrying stack helpers return 0 here and
    /// are depth-checked against their immediate instead.
    pub fn arity(self) -> usize {
        use OpKind::*;
        match self {
            MemLoad | ConstInt | ConstFloat | ConstLoad | VarLoad => 0,
            Sort | Dup | Swap | Drop | ArgMin | ArgMax | ArgSort => 0,
            VarStore | Sqrt | Abs | Trunc | Round | Floor | Not | BitNot | Exp | Log | Sin
            | Cos => 1,
            MemLoadVar | Add | Sub | Mul | Div | Mod | Max | Min | Cmp | And | Or | Xor
            | BitAnd | BitOr | BitXor | Pow => 2,
            Clamp | Ternary => 3,
        }
    }
}

/// Comparison subcodes carried in `Cmp`'s immediate.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum CmpOp {
    Eq = 0,
    Lt = 1,
    Le = 2,
    Neq = 4,
    Nlt = 5,
    Nle = 6,
}

impl CmpOp {
    pub fn from_imm(v: u32) -> CmpOp {
        match v {
            0 => CmpOp::Eq,
            1 => CmpOp::Lt,
            2 => CmpOp::Le,
            4 => CmpOp::Neq,
            5 => CmpOp::Nlt,
            _ => CmpOp::Nle,
        }
    }
}

/// Subcodes of `ConstLoad`. Values at `RESERVED` and above index the
/// per-frame property bundle.
pub mod load_const {
    pub const N: i32 = 0;
    pub const X: i32 = 1;
    pub const Y: i32 = 2;
    pub const WIDTH: i32 = 3;
    pub const HEIGHT: i32 = 4;
    /// First property subcode; `imm - RESERVED` is the property index after
    /// finalisation (the raw clip id before it).
    pub const RESERVED: i32 = 5;
}

/// Index into `consts[]` where property values start (`consts[0]` is the
/// frame number, stored as raw i32 bits).
pub const CONSTS_PROP_BASE: i32 = 1;

/// How pixel reads past the plane edge resolve.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum BoundaryCondition {
    #[default]
    Unspecified,
    Clamped,
    Mirrored,
}

/// 32-bit immediate, reinterpretable as signed, unsigned or float.
#[derive(Copy, Clone, Default)]
pub struct Imm(u32);

impl Imm {
    pub fn from_i32(v: i32) -> Imm {
        Imm(v as u32)
    }
    pub fn from_u32(v: u32) -> Imm {
        Imm(v)
    }
    pub fn from_f32(v: f32) -> Imm {
        Imm(v.to_bits())
    }
    pub fn i(self) -> i32 {
        self.0 as i32
    }
    pub fn u(self) -> u32 {
        self.0
    }
    pub fn f(self) -> f32 {
        f32::from_bits(self.0)
    }
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Debug for Imm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Imm(0x{:08x})", self.0)
    }
}

/// One IR instruction.
#[derive(Clone, Debug, Default)]
pub struct Op {
    pub kind: OpKind,
    pub imm: Imm,
    /// Variable or property name; empty otherwise.
    pub name: String,
    /// Relative pixel offsets.
    pub dx: i32,
    pub dy: i32,
    pub bc: BoundaryCondition,
}

impl Default for OpKind {
    fn default() -> Self {
        OpKind::ConstInt
    }
}

impl Op {
    pub fn new(kind: OpKind) -> Op {
        Op { kind, ..Default::default() }
    }

    pub fn with_i(kind: OpKind, v: i32) -> Op {
        Op { kind, imm: Imm::from_i32(v), ..Default::default() }
    }

    pub fn with_f(kind: OpKind, v: f32) -> Op {
        Op { kind, imm: Imm::from_f32(v), ..Default::default() }
    }

    pub fn named(kind: OpKind, v: i32, name: String) -> Op {
        Op { kind, imm: Imm::from_i32(v), name, ..Default::default() }
    }

    pub fn rel_pixel(clip: i32, dx: i32, dy: i32, bc: BoundaryCondition) -> Op {
        Op { kind: OpKind::MemLoad, imm: Imm::from_i32(clip), dx, dy, bc, ..Default::default() }
    }
}

// Boundary condition deliberately excluded: it is a compilation default, not
// part of the program's identity.
impl PartialEq for Op {
    fn eq(&self, other: &Op) -> bool {
        self.kind == other.kind
            && self.imm.raw() == other.imm.raw()
            && self.name == other.name
            && self.dx == other.dx
            && self.dy == other.dy
    }
}

/// A distinct `(clip, property)` pair referenced by an expression, in dense
/// index order. The host packs property values into `consts[]` in this
/// order, starting at [`CONSTS_PROP_BASE`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropAccess {
    pub clip: usize,
    pub name: String,
}

/// Rewrite property accesses and variable names into dense indices and
/// validate them. `tokens` parallels `ops` and supplies error context.
///
/// After this pass:
/// - every property `ConstLoad` has `imm = RESERVED + dense_index`;
/// - every `VarLoad`/`VarStore` has `imm = dense_index`;
/// - the returned list maps dense property indices back to `(clip, name)`.
pub fn finalize(ops: &mut [Op], tokens: &[String], num_inputs: usize) -> Result<Vec<PropAccess>> {
    let mut props: Vec<PropAccess> = Vec::new();
    for (op, tok) in ops.iter_mut().zip(tokens) {
        if op.kind != OpKind::ConstLoad || op.imm.i() < load_const::RESERVED {
            continue;
        }
        let clip = (op.imm.i() - load_const::RESERVED) as usize;
        if clip >= num_inputs {
            return Err(Error::UndefinedClip(tok.clone()));
        }
        let idx = props
            .iter()
            .position(|pa| pa.clip == clip && pa.name == op.name)
            .unwrap_or_else(|| {
                props.push(PropAccess { clip, name: op.name.clone() });
                props.len() - 1
            });
        op.imm = Imm::from_i32(load_const::RESERVED + idx as i32);
    }

    let mut vars: Vec<String> = Vec::new();
    for (op, tok) in ops.iter_mut().zip(tokens) {
        if op.kind != OpKind::VarLoad && op.kind != OpKind::VarStore {
            continue;
        }
        let idx = match vars.iter().position(|v| *v == op.name) {
            Some(idx) => idx,
            None if op.kind == OpKind::VarLoad => {
                return Err(Error::UninitializedVariable(tok.clone()));
            }
            None => {
                vars.push(op.name.clone());
                vars.len() - 1
            }
        };
        op.imm = Imm::from_i32(idx as i32);
    }
    Ok(props)
}

/// Number of distinct variables after finalisation.
pub fn num_variables(ops: &[Op]) -> usize {
    ops.iter()
        .filter(|op| matches!(op.kind, OpKind::VarLoad | OpKind::VarStore))
        .map(|op| op.imm.i() as usize + 1)
        .max()
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::{decode_token, tokenize};

    fn decode(expr: &str) -> (Vec<Op>, Vec<String>) {
        let toks = tokenize(expr);
        let ops = toks.iter().map(|t| decode_token(t, false).unwrap()).collect();
        (ops, toks)
    }

    #[test]
    fn props_are_densely_numbered_in_first_use_order() {
        let (mut ops, toks) = decode("x._A y._B x._A + +");
        let pa = finalize(&mut ops, &toks, 2).unwrap();
        assert_eq!(
            pa,
            vec![
                PropAccess { clip: 0, name: "_A".into() },
                PropAccess { clip: 1, name: "_B".into() }
            ]
        );
        assert_eq!(ops[0].imm.i(), load_const::RESERVED);
        assert_eq!(ops[1].imm.i(), load_const::RESERVED + 1);
        assert_eq!(ops[2].imm.i(), load_const::RESERVED);
    }

    #[test]
    fn prop_clip_out_of_range() {
        let (mut ops, toks) = decode("y._A");
        assert!(matches!(finalize(&mut ops, &toks, 1), Err(Error::UndefinedClip(_))));
    }

    #[test]
    fn variables_get_dense_indices() {
        let (mut ops, toks) = decode("1 a! 2 b! a@ b@ +");
        finalize(&mut ops, &toks, 0).unwrap();
        assert_eq!(num_variables(&ops), 2);
        assert_eq!(ops[1].imm.i(), 0);
        assert_eq!(ops[3].imm.i(), 1);
        assert_eq!(ops[4].imm.i(), 0);
        assert_eq!(ops[5].imm.i(), 1);
    }

    #[test]
    fn load_before_store_is_rejected() {
        let (mut ops, toks) = decode("a@ 1 +");
        assert!(matches!(finalize(&mut ops, &toks, 0), Err(Error::UninitializedVariable(_))));
    }

    #[test]
    fn op_equality_ignores_boundary() {
        let a = Op::rel_pixel(0, -1, 0, BoundaryCondition::Clamped);
        let b = Op::rel_pixel(0, -1, 0, BoundaryCondition::Mirrored);
        assert_eq!(a, b);
        let c = Op::rel_pixel(0, 1, 0, BoundaryCondition::Clamped);
        assert_ne!(a, c);
    }
}
