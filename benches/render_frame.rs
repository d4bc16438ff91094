//! One sampling and render pass at the default width.
//! Run: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use ascii_deck::ascii_stage::{AsciiStage, StageSettings};
use ascii_deck::config::AsciiConfig;
use ascii_deck::source::SourceFrame;

fn gradient_frame(width: u32, height: u32) -> SourceFrame {
    let mut rgba = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            let r = (x * 255 / width.max(1)) as u8;
            let g = (y * 255 / height.max(1)) as u8;
            rgba.extend_from_slice(&[r, g, r ^ g, 255]);
        }
    }
    SourceFrame::new(width, height, rgba).expect("gradient frame")
}

fn bench_render_pass(c: &mut Criterion) {
    let frame = gradient_frame(640, 360);
    let mut group = c.benchmark_group("render_frame");
    group.sample_size(50);

    for (label, color) in [("mono_640x360_w120", false), ("color_640x360_w120", true)] {
        let mut stage = AsciiStage::from_settings(&StageSettings::default()).expect("stage");
        let config = AsciiConfig {
            color,
            ..AsciiConfig::default()
        };
        group.bench_function(label, |b| {
            b.iter(|| {
                stage
                    .render_frame(black_box(&frame), &config, 0.0)
                    .expect("render");
                black_box(stage.surface().data().len())
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_render_pass);
criterion_main!(benches);
