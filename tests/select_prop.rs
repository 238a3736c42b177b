//! Select and PropExpr frame-time behaviour.

mod common;

use common::{clip, frame_from, plane_values};
use vexpr::{
    Frame, PropExprFilter, PropExprValue, PropValue, SelectFilter, VideoFormat, VideoInfo,
};

fn prop_frame(vi: &VideoInfo, props: &[(&str, PropValue)]) -> Frame {
    let mut f = Frame::new(vi);
    for (name, value) in props {
        f.set_prop(name, value.clone());
    }
    f
}

#[test]
fn select_picks_clip_by_property() {
    let vi = clip(VideoFormat::gray8(), 4, 2);
    let zeros = frame_from(&vi, &[0.0; 8]);
    let ones = frame_from(&vi, &[1.0; 8]);
    let props = prop_frame(&vi, &[("_Sel", PropValue::Int(1))]);

    let f = SelectFilter::new(&[vi.clone(), vi], 1, &["src0._Sel"]).unwrap();
    assert_eq!(f.select(0, &[&props]), vec![1]);
    let out = f.process(0, &[&props], &[&zeros, &ones]);
    assert_eq!(plane_values(&out, 0), vec![1.0; 8]);
}

#[test]
fn select_rounds_and_clamps_into_range() {
    let vi = clip(VideoFormat::gray8(), 4, 1);
    let f = SelectFilter::new(&[vi.clone(), vi.clone(), vi.clone()], 1, &["src0._Sel"]).unwrap();

    let cases = [
        (PropValue::Float(1.4), 1),
        (PropValue::Float(1.6), 2),
        (PropValue::Int(99), 2),
        (PropValue::Int(-5), 0),
    ];
    for (value, expect) in cases {
        let props = prop_frame(&vi, &[("_Sel", value.clone())]);
        assert_eq!(f.select(0, &[&props]), vec![expect], "{value:?}");
    }

    // Missing property reads as 0.
    let props = Frame::new(&vi);
    assert_eq!(f.select(0, &[&props]), vec![0]);
}

#[test]
fn select_extended_operators() {
    let vi = clip(VideoFormat::gray8(), 4, 1);
    let f = SelectFilter::new(
        &[vi.clone(), vi.clone()],
        2,
        &["src0._M src1._M argmax2"],
    )
    .unwrap();
    let a = prop_frame(&vi, &[("_M", PropValue::Float(3.0))]);
    let b = prop_frame(&vi, &[("_M", PropValue::Float(8.0))]);
    assert_eq!(f.select(0, &[&a, &b]), vec![1]);
    assert_eq!(f.select(0, &[&b, &a]), vec![0]);
}

#[test]
fn select_runtime_errors_pick_clip_zero() {
    let vi = clip(VideoFormat::gray8(), 4, 1);
    // The missing property reads as 0, so this divides by zero; the
    // infinite result rounds and clamps to the last clip.
    let f = SelectFilter::new(&[vi.clone(), vi.clone()], 1, &["1 src0._Zero /"]).unwrap();
    let props = Frame::new(&vi);
    assert_eq!(f.select(0, &[&props]), vec![1]);
}

#[test]
fn select_validation_errors() {
    let vi = clip(VideoFormat::gray8(), 4, 1);

    let err = SelectFilter::new(&[vi.clone()], 1, &["x"]).unwrap_err();
    assert_eq!(err.to_string(), "Select: unable to use pixel values in Select");

    let err = SelectFilter::new(&[vi.clone()], 1, &["src1._A"]).unwrap_err();
    assert_eq!(err.to_string(), "Select: property access clip out of range");

    let err = SelectFilter::new(&[vi.clone()], 1, &["argmin2"]).unwrap_err();
    assert!(err.to_string().starts_with("Select: stack underflow"));

    let b = clip(VideoFormat::gray16(), 4, 1);
    let err = SelectFilter::new(&[vi, b], 1, &["0"]).unwrap_err();
    assert!(err.to_string().contains("same format"));
}

#[test]
fn prop_expr_writes_doubled_frame_number() {
    let vi = clip(VideoFormat::gray8(), 4, 1);
    let f = PropExprFilter::new(
        &[vi.clone()],
        vec![("K".to_owned(), PropExprValue::Expr(vec!["N 2 *".to_owned()]))],
    )
    .unwrap();
    let src = Frame::new(&vi);
    for n in 0..5 {
        let out = f.process(n, &[&src]);
        assert_eq!(out.prop("K"), Some(&PropValue::Int(2 * n as i64)), "frame {n}");
    }
}

#[test]
fn prop_expr_float_and_int_results() {
    let vi = clip(VideoFormat::gray8(), 4, 1);
    let f = PropExprFilter::new(
        &[vi.clone()],
        vec![
            ("Half".to_owned(), PropExprValue::Expr(vec!["N 0.5 +".to_owned()])),
            ("Lit".to_owned(), PropExprValue::Float(vec![2.5])),
            ("Whole".to_owned(), PropExprValue::Int(vec![42])),
        ],
    )
    .unwrap();
    let src = Frame::new(&vi);
    let out = f.process(1, &[&src]);
    assert_eq!(out.prop("Half"), Some(&PropValue::Float(1.5)));
    assert_eq!(out.prop("Lit"), Some(&PropValue::Float(2.5)));
    assert_eq!(out.prop("Whole"), Some(&PropValue::Int(42)));
}

#[test]
fn prop_expr_array_cycles_by_frame() {
    let vi = clip(VideoFormat::gray8(), 4, 1);
    let f = PropExprFilter::new(
        &[vi.clone()],
        vec![(
            "Cycle".to_owned(),
            PropExprValue::Int(vec![10, 20, 30]),
        )],
    )
    .unwrap();
    let src = Frame::new(&vi);
    for (n, expect) in [(0, 10), (1, 20), (2, 30), (3, 10), (4, 20)] {
        let out = f.process(n, &[&src]);
        assert_eq!(out.prop("Cycle"), Some(&PropValue::Int(expect)), "frame {n}");
    }
}

#[test]
fn prop_expr_empty_expression_deletes() {
    let vi = clip(VideoFormat::gray8(), 4, 1);
    let f = PropExprFilter::new(
        &[vi.clone()],
        vec![("Doomed".to_owned(), PropExprValue::Expr(vec![String::new()]))],
    )
    .unwrap();
    let mut src = Frame::new(&vi);
    src.set_prop("Doomed", PropValue::Int(7));
    src.set_prop("Kept", PropValue::Int(8));
    let out = f.process(0, &[&src]);
    assert_eq!(out.prop("Doomed"), None);
    assert_eq!(out.prop("Kept"), Some(&PropValue::Int(8)));
}

#[test]
fn prop_expr_reads_input_properties() {
    let vi = clip(VideoFormat::gray8(), 4, 1);
    let f = PropExprFilter::new(
        &[vi.clone(), vi.clone()],
        vec![("Sum".to_owned(), PropExprValue::Expr(vec!["src0._A src1._B +".to_owned()]))],
    )
    .unwrap();
    let a = prop_frame(&vi, &[("_A", PropValue::Int(3))]);
    let b = prop_frame(&vi, &[("_B", PropValue::Int(4))]);
    let out = f.process(0, &[&a, &b]);
    assert_eq!(out.prop("Sum"), Some(&PropValue::Int(7)));
}

#[test]
fn prop_expr_copies_pixels_from_first_input() {
    let vi = clip(VideoFormat::gray8(), 4, 1);
    let src = frame_from(&vi, &[9.0, 8.0, 7.0, 6.0]);
    let f = PropExprFilter::new(
        &[vi.clone()],
        vec![("K".to_owned(), PropExprValue::Int(vec![1]))],
    )
    .unwrap();
    let out = f.process(0, &[&src]);
    assert_eq!(plane_values(&out, 0), vec![9.0, 8.0, 7.0, 6.0]);
}

#[test]
fn prop_expr_validation_errors() {
    let vi = clip(VideoFormat::gray8(), 4, 1);

    let err = PropExprFilter::new(
        &[vi.clone()],
        vec![("K".to_owned(), PropExprValue::Expr(vec!["x 2 *".to_owned()]))],
    )
    .unwrap_err();
    assert_eq!(err.to_string(), "PropExpr: K: unable to use pixel values in PropExpr");

    let err = PropExprFilter::new(
        &[vi.clone()],
        vec![("K".to_owned(), PropExprValue::Expr(vec!["src3._A".to_owned()]))],
    )
    .unwrap_err();
    assert_eq!(err.to_string(), "PropExpr: K: property access clip out of range");

    let err = PropExprFilter::from_dict(&[vi], || Err("boom".to_owned())).unwrap_err();
    assert_eq!(err.to_string(), "PropExpr: dict evaluation failed: boom");
}
