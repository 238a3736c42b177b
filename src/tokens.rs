//! Whitespace lexer and context-free token decoder.
//!
//! Each token maps to exactly one [`Op`]; decoding needs no neighbouring
//! tokens, only two pieces of ambient context (the filter-wide boundary
//! default is applied later by the compiler, and `extended` enables the
//! Select-only operators). Decode priority, first match wins:
//!
//! 1. the literal operator table;
//! 2. clip names (`a`-`z`, `srcN`);
//! 3. `name@` / `name!` variable access;
//! 4. count-suffixed stack ops (`dupN`, `swapN`, `dropN`, `sortN`, and in
//!    extended mode `argminN`, `argmaxN`, `argsortN`);
//! 5. `clip.prop`, `clip[dx,dy]`, `clip[dx,dy]:c|:m`, `clip[]`;
//! 6. numeric literals (base-autodetected integer first, then float).

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::ir::{load_const, BoundaryCondition, CmpOp, Imm, Op, OpKind};

/// Clips past `z` are spelled `src3`, `src4`, ... `src25`.
pub const CLIP_NAME_PREFIX: &str = "src";

/// Split an expression on whitespace.
pub fn tokenize(expr: &str) -> Vec<String> {
    expr.split_whitespace().map(str::to_owned).collect()
}

fn clip_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([a-z]|src[0-9]+)$").unwrap())
}

fn rel_pixel_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([a-z]|src[0-9]+)\[(-?[0-9]+),(-?[0-9]+)\](:[cm])?$").unwrap()
    })
}

fn abs_pixel_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([a-z]|src[0-9]+)\[\]$").unwrap())
}

fn frame_prop_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([a-z]|src[0-9]+)\.([^\[\]]*)$").unwrap())
}

/// `x`..`z` are clips 0..2, `a`..`w` are clips 3..25, `srcN` is clip N.
fn extract_clip_id(name: &str) -> Result<i32> {
    let b = name.as_bytes();
    if b.len() == 1 {
        let c = b[0];
        return Ok(if c >= b'x' { (c - b'x') as i32 } else { (c - b'a') as i32 + 3 });
    }
    name[CLIP_NAME_PREFIX.len()..]
        .parse::<i32>()
        .map_err(|_| Error::InvalidToken(format!("invalid clip name: {name}")))
}

/// Longest-prefix integer parse with C `strtoll` base-autodetect semantics:
/// `0x` hex, leading `0` octal, decimal otherwise. Returns the value and the
/// number of bytes consumed; overflow consumes nothing.
fn parse_int_prefix(s: &str) -> (i64, usize) {
    let b = s.as_bytes();
    let mut pos = 0usize;
    let mut neg = false;
    if pos < b.len() && (b[pos] == b'+' || b[pos] == b'-') {
        neg = b[pos] == b'-';
        pos += 1;
    }
    let (radix, digits_start) = if b.len() >= pos + 2
        && b[pos] == b'0'
        && (b[pos + 1] | 0x20) == b'x'
        && b.get(pos + 2).is_some_and(u8::is_ascii_hexdigit)
    {
        (16, pos + 2)
    } else if b.get(pos) == Some(&b'0') {
        (8, pos)
    } else {
        (10, pos)
    };

    let mut value: i64 = 0;
    let mut end = digits_start;
    while end < b.len() {
        let Some(d) = (b[end] as char).to_digit(radix) else { break };
        let Some(next) = value.checked_mul(radix as i64).and_then(|v| {
            if neg { v.checked_sub(d as i64) } else { v.checked_add(d as i64) }
        }) else {
            return (0, 0);
        };
        value = next;
        end += 1;
    }
    if end == digits_start {
        // No digits at all ("x" after a bare sign, or empty). A lone "0"
        // before a non-octal-digit still counts via the octal branch above.
        return (0, 0);
    }
    (value, end)
}

/// Longest-prefix float parse (`strtof` subject-sequence semantics, decimal
/// form). Returns the value and bytes consumed.
fn parse_float_prefix(s: &str) -> (f32, usize) {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^[+-]?(\d+(\.\d*)?|\.\d+)([eE][+-]?\d+)?").unwrap()
    });
    match re.find(s) {
        Some(m) => (m.as_str().parse::<f32>().unwrap_or(0.0), m.end()),
        None => (0.0, 0),
    }
}

fn decode_number(token: &str) -> Result<Op> {
    let (l, pos) = parse_int_prefix(token);
    if pos == token.len() {
        if l as i32 as i64 == l {
            return Ok(Op::with_i(OpKind::ConstInt, l as i32));
        } else if l as u32 as i64 == l {
            return Ok(Op { kind: OpKind::ConstInt, imm: Imm::from_u32(l as u32), ..Op::default() });
        }
        return Ok(Op::with_f(OpKind::ConstFloat, l as f32));
    }
    let (f, pos) = parse_float_prefix(token);
    if pos == token.len() {
        Ok(Op::with_f(OpKind::ConstFloat, f))
    } else if pos > 0 {
        Err(Error::InvalidToken(format!(
            "failed to convert '{token}' to float, not the whole token could be converted"
        )))
    } else {
        Err(Error::InvalidToken(format!("failed to convert '{token}' to float")))
    }
}

/// A decimal count that must consume the remainder of the token.
fn decode_counted(kind: OpKind, rest: &str, token: &str) -> Result<Op> {
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::InvalidToken(format!("illegal token: {token}")));
    }
    let count: i32 = rest
        .parse()
        .map_err(|_| Error::InvalidToken(format!("illegal token: {token}")))?;
    Ok(Op::with_i(kind, count))
}

/// Decode one token. `extended` admits the Select/PropExpr-only operators.
pub fn decode_token(token: &str, extended: bool) -> Result<Op> {
    use OpKind::*;

    let simple = |kind| Some(Op::new(kind));
    let cmp = |c: CmpOp| Some(Op::with_i(Cmp, c as u32 as i32));
    if let Some(op) = match token {
        "+" => simple(Add),
        "-" => simple(Sub),
        "*" => simple(Mul),
        "/" => simple(Div),
        "%" => simple(Mod),
        "sqrt" => simple(Sqrt),
        "abs" => simple(Abs),
        "max" => simple(Max),
        "min" => simple(Min),
        // `clip` kept for compatibility with AVS+ Expr.
        "clip" | "clamp" => simple(Clamp),
        "<" => cmp(CmpOp::Lt),
        ">" => cmp(CmpOp::Nle),
        "=" => cmp(CmpOp::Eq),
        ">=" => cmp(CmpOp::Nlt),
        "<=" => cmp(CmpOp::Le),
        "trunc" => simple(Trunc),
        "round" => simple(Round),
        "floor" => simple(Floor),
        "and" => simple(And),
        "or" => simple(Or),
        "xor" => simple(Xor),
        "not" => simple(Not),
        "bitand" => simple(BitAnd),
        "bitor" => simple(BitOr),
        "bitxor" => simple(BitXor),
        "bitnot" => simple(BitNot),
        "?" => simple(Ternary),
        "exp" => simple(Exp),
        "log" => simple(Log),
        "pow" | "**" => simple(Pow),
        "sin" => simple(Sin),
        "cos" => simple(Cos),
        "dup" => Some(Op::with_i(Dup, 0)),
        "swap" => Some(Op::with_i(Swap, 1)),
        "drop" => Some(Op::with_i(Drop, 1)),
        "pi" => Some(Op::with_f(ConstFloat, std::f32::consts::PI)),
        "N" => Some(Op::with_i(ConstLoad, load_const::N)),
        "X" => Some(Op::with_i(ConstLoad, load_const::X)),
        "Y" => Some(Op::with_i(ConstLoad, load_const::Y)),
        "width" => Some(Op::with_i(ConstLoad, load_const::WIDTH)),
        "height" => Some(Op::with_i(ConstLoad, load_const::HEIGHT)),
        _ => None,
    } {
        return Ok(op);
    }

    if clip_name_re().is_match(token) {
        return Ok(Op::with_i(MemLoad, extract_clip_id(token)?));
    }

    // 'name@' loads a named variable; 'name!' stores TOS into it.
    if token.len() >= 2 && (token.ends_with('@') || token.ends_with('!')) {
        let kind = if token.ends_with('@') { VarLoad } else { VarStore };
        return Ok(Op::named(kind, -1, token[..token.len() - 1].to_owned()));
    }

    if let Some(rest) = token.strip_prefix("dup") {
        return decode_counted(Dup, rest, token);
    }
    if let Some(rest) = token.strip_prefix("swap") {
        return decode_counted(Swap, rest, token);
    }
    if let Some(rest) = token.strip_prefix("drop") {
        return decode_counted(Drop, rest, token);
    }
    if let Some(rest) = token.strip_prefix("sort") {
        return decode_counted(Sort, rest, token);
    }
    if extended {
        if let Some(rest) = token.strip_prefix("argmin") {
            return decode_counted(ArgMin, rest, token);
        }
        if let Some(rest) = token.strip_prefix("argmax") {
            return decode_counted(ArgMax, rest, token);
        }
        if let Some(rest) = token.strip_prefix("argsort") {
            return decode_counted(ArgSort, rest, token);
        }
    }

    if let Some(caps) = frame_prop_re().captures(token) {
        let clip = extract_clip_id(caps.get(1).unwrap().as_str())?;
        return Ok(Op::named(
            ConstLoad,
            load_const::RESERVED + clip,
            caps.get(2).unwrap().as_str().to_owned(),
        ));
    }

    if let Some(caps) = rel_pixel_re().captures(token) {
        let clip = extract_clip_id(caps.get(1).unwrap().as_str())?;
        let dx: i32 = caps.get(2).unwrap().as_str().parse().map_err(|_| {
            Error::InvalidToken(format!("illegal token: {token}"))
        })?;
        let dy: i32 = caps.get(3).unwrap().as_str().parse().map_err(|_| {
            Error::InvalidToken(format!("illegal token: {token}"))
        })?;
        let bc = match caps.get(4).map(|m| m.as_str()) {
            None => BoundaryCondition::Unspecified,
            Some(":m") => BoundaryCondition::Mirrored,
            Some(_) => BoundaryCondition::Clamped,
        };
        return Ok(Op::rel_pixel(clip, dx, dy, bc));
    }

    if let Some(caps) = abs_pixel_re().captures(token) {
        let clip = extract_clip_id(caps.get(1).unwrap().as_str())?;
        return Ok(Op::with_i(MemLoadVar, clip));
    }

    decode_number(token)
}

/// Tokenise and decode a whole expression.
pub fn decode_expr(expr: &str, extended: bool) -> Result<(Vec<Op>, Vec<String>)> {
    let tokens = tokenize(expr);
    let mut ops = Vec::with_capacity(tokens.len());
    for tok in &tokens {
        ops.push(decode_token(tok, extended)?);
    }
    Ok((ops, tokens))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(tok: &str) -> Op {
        decode_token(tok, false).unwrap()
    }

    #[test]
    fn clip_letters() {
        assert_eq!(ok("x").imm.i(), 0);
        assert_eq!(ok("y").imm.i(), 1);
        assert_eq!(ok("z").imm.i(), 2);
        assert_eq!(ok("a").imm.i(), 3);
        assert_eq!(ok("w").imm.i(), 25);
        assert_eq!(ok("src0").imm.i(), 0);
        assert_eq!(ok("src17").imm.i(), 17);
        assert_eq!(ok("x").kind, OpKind::MemLoad);
    }

    #[test]
    fn operators_and_aliases() {
        assert_eq!(ok("clip").kind, OpKind::Clamp);
        assert_eq!(ok("clamp").kind, OpKind::Clamp);
        assert_eq!(ok("**").kind, OpKind::Pow);
        assert_eq!(ok(">").imm.u(), CmpOp::Nle as u32);
        assert_eq!(ok(">=").imm.u(), CmpOp::Nlt as u32);
        assert_eq!(ok("=").imm.u(), CmpOp::Eq as u32);
    }

    #[test]
    fn bare_stack_ops_have_default_counts() {
        assert_eq!((ok("dup").kind, ok("dup").imm.i()), (OpKind::Dup, 0));
        assert_eq!((ok("swap").kind, ok("swap").imm.i()), (OpKind::Swap, 1));
        assert_eq!((ok("drop").kind, ok("drop").imm.i()), (OpKind::Drop, 1));
        assert_eq!((ok("dup3").kind, ok("dup3").imm.i()), (OpKind::Dup, 3));
        assert_eq!((ok("sort8").kind, ok("sort8").imm.i()), (OpKind::Sort, 8));
    }

    #[test]
    fn malformed_counts_are_fatal() {
        assert!(decode_token("sort", false).is_err());
        assert!(decode_token("dup3x", false).is_err());
        assert!(decode_token("dropn", false).is_err());
    }

    #[test]
    fn variable_suffix_wins_over_count_prefix() {
        let op = ok("dup!");
        assert_eq!((op.kind, op.name.as_str()), (OpKind::VarStore, "dup"));
        let op = ok("sum@");
        assert_eq!((op.kind, op.name.as_str()), (OpKind::VarLoad, "sum"));
    }

    #[test]
    fn extended_ops_gated() {
        assert!(decode_token("argmin3", false).is_err());
        let op = decode_token("argmin3", true).unwrap();
        assert_eq!((op.kind, op.imm.i()), (OpKind::ArgMin, 3));
        let op = decode_token("argsort4", true).unwrap();
        assert_eq!((op.kind, op.imm.i()), (OpKind::ArgSort, 4));
    }

    #[test]
    fn pixel_access_shapes() {
        let op = ok("x[-1,2]:m");
        assert_eq!((op.kind, op.imm.i(), op.dx, op.dy), (OpKind::MemLoad, 0, -1, 2));
        assert_eq!(op.bc, BoundaryCondition::Mirrored);
        assert_eq!(ok("y[3,0]:c").bc, BoundaryCondition::Clamped);
        assert_eq!(ok("y[3,0]").bc, BoundaryCondition::Unspecified);
        assert_eq!(ok("src4[]").kind, OpKind::MemLoadVar);
        let op = ok("z._Combed");
        assert_eq!((op.kind, op.imm.i()), (OpKind::ConstLoad, load_const::RESERVED + 2));
        assert_eq!(op.name, "_Combed");
    }

    #[test]
    fn numeric_literals() {
        assert_eq!((ok("42").kind, ok("42").imm.i()), (OpKind::ConstInt, 42));
        assert_eq!(ok("-7").imm.i(), -7);
        assert_eq!(ok("0x10").imm.i(), 16);
        assert_eq!(ok("010").imm.i(), 8);
        assert_eq!(ok("0x80000000").imm.u(), 0x8000_0000);
        assert_eq!(ok("2.5").kind, OpKind::ConstFloat);
        assert_eq!(ok("2.5").imm.f(), 2.5);
        assert_eq!(ok(".5").imm.f(), 0.5);
        assert_eq!(ok("1e3").imm.f(), 1000.0);
        // i64-range integer that fits neither i32 nor u32 becomes a float.
        assert_eq!(ok("8589934592").kind, OpKind::ConstFloat);
        assert_eq!(ok("8589934592").imm.f(), 8589934592.0);
    }

    #[test]
    fn numeric_errors() {
        assert!(matches!(decode_token("2.5x", false), Err(Error::InvalidToken(_))));
        assert!(matches!(decode_token("q", false), Ok(_))); // clip letter
        assert!(matches!(decode_token("Q", false), Err(Error::InvalidToken(_))));
        assert!(matches!(decode_token("1e", false), Err(Error::InvalidToken(_))));
    }

    #[test]
    fn whitespace_tokenizer() {
        assert_eq!(tokenize("  x  y\t+\n"), vec!["x", "y", "+"]);
        assert!(tokenize("   ").is_empty());
    }
}
