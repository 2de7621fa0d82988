//! Mixer Throughput Benchmark
//!
//! Measures one second of audio mixed down through `mix_chunk` for the
//! layouts the player sees most: stereo passthrough, stereo to mono and a
//! multi-voice source with one voice muted.

use anmp_ap::audio::{mix_chunk, SampleFormat, SongFormat, Voice};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

const RATE: u32 = 44_100;

fn ramp_i16(samples: usize) -> Vec<i16> {
    (0..samples).map(|n| (n % 2000) as i16 - 1000).collect()
}

fn bench_mix_layouts(c: &mut Criterion) {
    let mut group = c.benchmark_group("mix_chunk");
    group.throughput(Throughput::Elements(RATE as u64));

    let mut muted_band = vec![
        Voice::new("lead", 2),
        Voice::new("bass", 2),
        Voice::new("drums", 2),
    ];
    muted_band[1].muted = true;

    let layouts = [
        ("stereo_to_stereo", SongFormat::simple(RATE, SampleFormat::I16, 2), 2u16),
        ("stereo_to_mono", SongFormat::simple(RATE, SampleFormat::I16, 2), 1),
        ("three_voices_to_stereo", SongFormat::with_voices(RATE, SampleFormat::I16, muted_band), 2),
    ];

    for (name, format, out_channels) in layouts {
        let input = ramp_i16(RATE as usize * format.channels() as usize);
        let mut output = vec![0.0f32; RATE as usize * out_channels as usize];

        group.bench_with_input(BenchmarkId::new("i16_to_f32", name), &format, |b, format| {
            b.iter(|| {
                let frames = mix_chunk(black_box(&input), format, &mut output, out_channels, 0.8).unwrap();
                black_box(frames);
                black_box(&output);
            });
        });
    }

    group.finish();
}

fn bench_mix_to_i16(c: &mut Criterion) {
    let mut group = c.benchmark_group("mix_chunk");
    group.throughput(Throughput::Elements(RATE as u64));

    group.bench_function("f32_stereo_to_i16_stereo", |b| {
        let format = SongFormat::simple(RATE, SampleFormat::F32, 2);
        let input = vec![0.5f32; RATE as usize * 2];
        let mut output = vec![0i16; RATE as usize * 2];

        b.iter(|| {
            let frames = mix_chunk(black_box(&input), &format, &mut output, 2, 1.0).unwrap();
            black_box(frames);
            black_box(&output);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_mix_layouts, bench_mix_to_i16);
criterion_main!(benches);
