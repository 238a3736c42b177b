//! End-to-end Expr scenarios over small planes.

mod common;

use common::{clip, frame_from, plane_values};
use vexpr::{
    ExprFilter, ExprOptions, Frame, PropValue, SampleType, VideoFormat, VideoInfo,
};

fn run_u8(width: i32, values: &[f32], expr: &str) -> Vec<f32> {
    let vi = clip(VideoFormat::gray8(), width, 1);
    let src = frame_from(&vi, values);
    let f = ExprFilter::new(&[vi], &[expr], &ExprOptions::default()).unwrap();
    plane_values(&f.process(0, &[&src]), 0)
}

#[test]
fn square_each_pixel() {
    assert_eq!(run_u8(4, &[1.0, 2.0, 3.0, 4.0], "x x *"), vec![1.0, 4.0, 9.0, 16.0]);
}

#[test]
fn subtract_two_clips() {
    let vi = clip(VideoFormat::gray8(), 4, 1);
    let a = frame_from(&vi, &[10.0, 20.0, 30.0, 40.0]);
    let b = frame_from(&vi, &[1.0, 2.0, 3.0, 4.0]);
    let f = ExprFilter::new(&[vi.clone(), vi], &["x y -"], &ExprOptions::default()).unwrap();
    assert_eq!(plane_values(&f.process(0, &[&a, &b]), 0), vec![9.0, 18.0, 27.0, 37.0]);
}

#[test]
fn left_shift_clamped() {
    assert_eq!(run_u8(4, &[1.0, 2.0, 3.0, 4.0], "x[-1,0]:c"), vec![1.0, 1.0, 2.0, 3.0]);
}

#[test]
fn left_shift_mirrored() {
    assert_eq!(run_u8(4, &[1.0, 2.0, 3.0, 4.0], "x[-1,0]:m"), vec![1.0, 1.0, 2.0, 3.0]);
}

#[test]
fn right_shift_clamped() {
    assert_eq!(run_u8(4, &[1.0, 2.0, 3.0, 4.0], "x[1,0]:c"), vec![2.0, 3.0, 4.0, 4.0]);
}

#[test]
fn right_shift_mirrored() {
    assert_eq!(run_u8(4, &[1.0, 2.0, 3.0, 4.0], "x[1,0]:m"), vec![2.0, 3.0, 4.0, 4.0]);
}

#[test]
fn sort8_top_of_stack_is_smallest() {
    // After sorting, the smallest value sits on top; keep it.
    let out = run_u8(4, &[9.0; 4], "3 7 1 2 0 4 6 5 sort8 t! drop7 t@");
    assert_eq!(out, vec![0.0; 4]);
}

#[test]
fn sort8_deepest_is_largest() {
    let out = run_u8(4, &[9.0; 4], "3 7 1 2 0 4 6 5 sort8 drop7");
    assert_eq!(out, vec![7.0; 4]);
}

#[test]
fn pow_by_squaring() {
    assert_eq!(run_u8(4, &[5.0; 4], "x 2 **"), vec![25.0; 4]);
    assert_eq!(run_u8(4, &[3.0; 4], "x 4 **"), vec![81.0; 4]);
    // Negative constant exponents go through the reciprocal.
    assert_eq!(run_u8(4, &[2.0; 4], "x -1 ** 8 *"), vec![4.0; 4]);
}

#[test]
fn coordinate_and_plane_constants() {
    let vi = clip(VideoFormat::gray8(), 12, 3);
    let src = frame_from(&vi, &vec![0.0; 36]);
    let cases: [(&str, fn(i32, i32) -> f32); 5] = [
        ("X", |x, _y| x as f32),
        ("Y", |_x, y| y as f32),
        ("width", |_x, _y| 12.0),
        ("height", |_x, _y| 3.0),
        ("N", |_x, _y| 7.0),
    ];
    for (expr, expect) in cases {
        let f = ExprFilter::new(&[vi.clone()], &[expr], &ExprOptions::default()).unwrap();
        let out = f.process(7, &[&src]);
        for y in 0..3 {
            for x in 0..12 {
                assert_eq!(out.plane(0).get_f32(x, y), expect(x, y), "{expr} at ({x},{y})");
            }
        }
    }
}

#[test]
fn named_variables() {
    assert_eq!(run_u8(4, &[1.0, 2.0, 3.0, 4.0], "x v! v@ v@ +"), vec![2.0, 4.0, 6.0, 8.0]);
}

#[test]
fn stack_shuffles() {
    // swap turns x-y into y-x; dup squares.
    assert_eq!(run_u8(4, &[10.0; 4], "x 250 swap -"), vec![240.0; 4]);
    assert_eq!(run_u8(4, &[7.0; 4], "x dup *"), vec![49.0; 4]);
    assert_eq!(run_u8(4, &[7.0; 4], "x 1 2 drop2"), vec![7.0; 4]);
}

#[test]
fn absolute_pixel_access() {
    let values: Vec<f32> = (0..12).map(|v| v as f32 * 3.0).collect();
    let vi = clip(VideoFormat::gray8(), 12, 1);
    let src = frame_from(&vi, &values);

    let f = ExprFilter::new(&[vi.clone()], &["X Y x[]"], &ExprOptions::default()).unwrap();
    assert_eq!(plane_values(&f.process(0, &[&src]), 0), values);

    let f = ExprFilter::new(&[vi.clone()], &["3 0 x[]"], &ExprOptions::default()).unwrap();
    assert_eq!(plane_values(&f.process(0, &[&src]), 0), vec![9.0; 12]);

    // Out-of-range coordinates clamp to the plane.
    let f = ExprFilter::new(&[vi], &["99 5 x[]"], &ExprOptions::default()).unwrap();
    assert_eq!(plane_values(&f.process(0, &[&src]), 0), vec![33.0; 12]);
}

#[test]
fn ternary_and_comparisons() {
    let out = run_u8(8, &[10.0, 100.0, 200.0, 50.0, 128.0, 129.0, 0.0, 255.0], "x 128 > 255 0 ?");
    assert_eq!(out, vec![0.0, 0.0, 255.0, 0.0, 0.0, 255.0, 0.0, 255.0]);
}

#[test]
fn logic_and_bitwise() {
    assert_eq!(run_u8(4, &[6.0; 4], "x 3 bitand"), vec![2.0; 4]);
    assert_eq!(run_u8(4, &[6.0; 4], "x 3 bitor"), vec![7.0; 4]);
    assert_eq!(run_u8(4, &[6.0; 4], "x 0 and 9 +"), vec![9.0; 4]);
    assert_eq!(run_u8(4, &[6.0; 4], "x 0 or"), vec![1.0; 4]);
    assert_eq!(run_u8(4, &[0.0; 4], "x not"), vec![1.0; 4]);
}

#[test]
fn frame_properties_feed_consts() {
    let vi = clip(VideoFormat::gray8(), 4, 1);
    let mut src = frame_from(&vi, &[10.0, 20.0, 30.0, 40.0]);
    src.set_prop("_Gain", PropValue::Float(2.0));
    src.set_prop("_Off", PropValue::Int(5));
    src.set_prop("_Tag", PropValue::Data(b"A".to_vec())); // first byte = 65

    let f = ExprFilter::new(&[vi.clone()], &["x x._Gain * x._Off +"], &ExprOptions::default())
        .unwrap();
    assert_eq!(plane_values(&f.process(0, &[&src]), 0), vec![25.0, 45.0, 65.0, 85.0]);

    let f = ExprFilter::new(&[vi.clone()], &["x._Tag"], &ExprOptions::default()).unwrap();
    assert_eq!(plane_values(&f.process(0, &[&src]), 0), vec![65.0; 4]);

    // A missing property reads as NaN, which the integer store pins to 0.
    let f = ExprFilter::new(&[vi], &["x._Nope"], &ExprOptions::default()).unwrap();
    assert_eq!(plane_values(&f.process(0, &[&src]), 0), vec![0.0; 4]);
}

#[test]
fn integer_mode_clamps_at_store() {
    let vi = clip(VideoFormat::gray16(), 4, 1);
    let a = frame_from(&vi, &[40000.0; 4]);
    let b = frame_from(&vi, &[40000.0; 4]);
    let opts = ExprOptions { opt_mask: 1, ..Default::default() };
    let f = ExprFilter::new(&[vi.clone(), vi], &["x y +"], &opts).unwrap();
    assert_eq!(plane_values(&f.process(0, &[&a, &b]), 0), vec![65535.0; 4]);

    let vi10 = clip(VideoFormat::new(SampleType::Integer, 10, 1), 4, 1);
    let a = frame_from(&vi10, &[800.0; 4]);
    let b = frame_from(&vi10, &[800.0; 4]);
    let opts = ExprOptions { opt_mask: 1, ..Default::default() };
    let f = ExprFilter::new(&[vi10.clone(), vi10], &["x y +"], &opts).unwrap();
    assert_eq!(plane_values(&f.process(0, &[&a, &b]), 0), vec![1023.0; 4]);
}

#[test]
fn float_output_format_override() {
    let vi = clip(VideoFormat::gray8(), 4, 1);
    let src = frame_from(&vi, &[1.0, 2.0, 3.0, 4.0]);
    let opts = ExprOptions { format: Some(VideoFormat::grays()), ..Default::default() };
    let f = ExprFilter::new(&[vi], &["x 0.5 *"], &opts).unwrap();
    let out = f.process(0, &[&src]);
    assert_eq!(plane_values(&out, 0), vec![0.5, 1.0, 1.5, 2.0]);
}

#[test]
fn rounding_into_integer_output() {
    // Round-to-nearest-even at the store.
    let vi = clip(VideoFormat::gray8(), 4, 1);
    let src = frame_from(&vi, &[1.0, 3.0, 5.0, 7.0]);
    let f = ExprFilter::new(&[vi], &["x 2 /"], &ExprOptions::default()).unwrap();
    assert_eq!(plane_values(&f.process(0, &[&src]), 0), vec![0.0, 2.0, 2.0, 4.0]);
}

#[test]
fn fp16_pipeline() {
    let vi = clip(VideoFormat::grayh(), 8, 1);
    let values = [0.5, 1.0, -2.0, 1024.0, 0.0009765625, 65504.0, -0.0, 3.140625];
    let src = frame_from(&vi, &values);
    let f = ExprFilter::new(&[vi.clone()], &["x 2 *"], &ExprOptions::default()).unwrap();
    let out = f.process(0, &[&src]);
    for (x, v) in values.iter().enumerate() {
        let expect = vexpr::fp16::to_f32(vexpr::fp16::from_f32(v * 2.0));
        assert_eq!(out.plane(0).get_f32(x as i32, 0), expect, "lane {x}");
    }
}

#[test]
fn fp16_nan_payload_survives_passthrough() {
    let vi = clip(VideoFormat::grayh(), 8, 1);
    let mut src = Frame::new(&vi);
    // Raw half NaN with payload bits, written directly.
    let nan16: u16 = 0x7E09;
    for x in 0..8 {
        src.plane_mut(0).set_f32(x, 0, vexpr::fp16::to_f32(nan16));
    }
    let f = ExprFilter::new(&[vi], &["x"], &ExprOptions::default()).unwrap();
    let out = f.process(0, &[&src]);
    let p = out.plane(0);
    for x in 0..8usize {
        let raw = unsafe { *(p.as_ptr() as *const u16).add(x) };
        assert_eq!(raw, nan16, "lane {x}");
    }
}

#[test]
fn empty_expression_copies_matching_planes() {
    let fmt = VideoFormat::new(SampleType::Integer, 8, 3);
    let vi = VideoInfo::new(fmt, 4, 2, 10);
    let mut src = Frame::new(&vi);
    for plane in 0..3 {
        for y in 0..2 {
            for x in 0..4 {
                src.plane_mut(plane).set_f32(x, y, (plane * 10 + 1) as f32);
            }
        }
    }
    let f = ExprFilter::new(&[vi], &["x 2 *", ""], &ExprOptions::default()).unwrap();
    let out = f.process(0, &[&src]);
    assert_eq!(plane_values(&out, 0), vec![2.0; 8]);
    assert_eq!(plane_values(&out, 1), vec![11.0; 8]); // copied
    assert_eq!(plane_values(&out, 2), vec![21.0; 8]); // replicated empty -> copied
}

#[test]
fn construction_errors_carry_filter_prefix() {
    let vi = clip(VideoFormat::gray8(), 4, 1);
    let err = ExprFilter::new(&[vi.clone()], &["y"], &ExprOptions::default()).unwrap_err();
    assert_eq!(err.to_string(), "Expr: reference to undefined clip: y");

    let err = ExprFilter::new(&[vi.clone()], &["x x"], &ExprOptions::default()).unwrap_err();
    assert!(err.to_string().starts_with("Expr: 2 unconsumed values"));

    let err = ExprFilter::new(&[vi.clone()], &["v@"], &ExprOptions::default()).unwrap_err();
    assert!(err.to_string().contains("uninitialized variable"));

    let err = ExprFilter::new(&[vi.clone()], &["x #"], &ExprOptions::default()).unwrap_err();
    assert!(err.to_string().starts_with("Expr: failed to convert"));

    let err = ExprFilter::new(&[vi], &["x +"], &ExprOptions::default()).unwrap_err();
    assert!(err.to_string().contains("insufficient values on stack"));
}

#[test]
fn mismatched_inputs_rejected() {
    let a = clip(VideoFormat::gray8(), 4, 1);
    let b = clip(VideoFormat::gray8(), 8, 1);
    let err = ExprFilter::new(&[a, b], &["x y +"], &ExprOptions::default()).unwrap_err();
    assert!(err.to_string().starts_with("Expr: All inputs"));
}
