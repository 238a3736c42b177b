//! Compiled-plane throughput.

use criterion::{criterion_group, criterion_main, Criterion};
use vexpr::{ExprFilter, ExprOptions, Frame, VideoFormat, VideoInfo};

fn fill(frame: &mut Frame, seed: u64) {
    let (w, h) = (frame.plane(0).width(), frame.plane(0).height());
    let mut state = seed;
    for y in 0..h {
        for x in 0..w {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            frame.plane_mut(0).set_f32(x, y, ((state >> 33) % 256) as f32);
        }
    }
}

fn bench_planes(c: &mut Criterion) {
    let vi = VideoInfo::new(VideoFormat::gray8(), 640, 480, 1);
    let mut a = Frame::new(&vi);
    let mut b = Frame::new(&vi);
    fill(&mut a, 1);
    fill(&mut b, 2);

    let avg = ExprFilter::new(
        &[vi.clone(), vi.clone()],
        &["x y + 2 /"],
        &ExprOptions { opt_mask: 1, ..Default::default() },
    )
    .unwrap();
    c.bench_function("avg_640x480_u8_int", |bench| {
        bench.iter(|| avg.process(0, &[&a, &b]))
    });

    let blur = ExprFilter::new(
        &[vi.clone()],
        &["x[-1,0] x 2 * + x[1,0] + 4 /"],
        &ExprOptions::default(),
    )
    .unwrap();
    c.bench_function("blur3_640x480_u8", |bench| bench.iter(|| blur.process(0, &[&a])));

    let trig = ExprFilter::new(&[vi], &["x 0.0245 * sin 128 * 128 +"], &ExprOptions::default())
        .unwrap();
    c.bench_function("sin_640x480_u8", |bench| bench.iter(|| trig.process(0, &[&a])));
}

criterion_group!(benches, bench_planes);
criterion_main!(benches);
