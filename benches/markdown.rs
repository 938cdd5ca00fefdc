//! Benchmarks for the two streaming-sensitive hot paths: Markdown
//! rendering and manifest hashing (§8's 31 MB streaming-hash property).

use std::io::Write;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use secureblog_rs::integrity::hash_file;
use secureblog_rs::markdown::{render_markdown, MarkdownOptions};

fn sample_markdown(paragraphs: usize) -> String {
    let mut out = String::new();
    for i in 0..paragraphs {
        out.push_str(&format!(
            "## Section {i}\n\nSome *emphasised* prose with a [link](https://example.com/{i}) and `code`.\n\n- one\n- two\n- three\n\n"
        ));
    }
    out
}

fn bench_render_markdown(c: &mut Criterion) {
    let mut group = c.benchmark_group("render_markdown");
    for size in [10, 100, 1_000] {
        let input = sample_markdown(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &input, |b, input| {
            b.iter(|| render_markdown(input, MarkdownOptions::default()));
        });
    }
    group.finish();
}

fn bench_hash_file(c: &mut Criterion) {
    let mut file = tempfile::NamedTempFile::new().expect("create temp file");
    let chunk = vec![b'x'; 1024 * 1024];
    for _ in 0..8 {
        file.write_all(&chunk).expect("write chunk");
    }
    file.flush().expect("flush");
    let path = file.path().to_path_buf();

    c.bench_function("hash_file_8mb", |b| {
        b.iter(|| hash_file(&path).expect("hash"));
    });
}

criterion_group!(benches, bench_render_markdown, bench_hash_file);
criterion_main!(benches);
