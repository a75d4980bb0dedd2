use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pharkit::codec::{get_codec, Codec, CompressionKind};
use pharkit::io_stream::ArchiveBuilder;
use pharkit::signature::SignatureAlgorithm;
use pharkit::Archive;

fn bench_compression(c: &mut Criterion) {
    let data: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 251) as u8).collect();

    for kind in CompressionKind::ALL {
        let codec = get_codec(kind);
        let packed = codec.compress(&data).unwrap();
        c.bench_function(&format!("{}_compress_1mb", kind.name()), |b| {
            b.iter(|| codec.compress(black_box(&data)).unwrap())
        });
        c.bench_function(&format!("{}_decompress_1mb", kind.name()), |b| {
            b.iter(|| codec.decompress(black_box(&packed), data.len()).unwrap())
        });
    }
}

fn bench_build_archive(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("bench.phar");
    let data = vec![42u8; 64 * 1024];

    for kind in [CompressionKind::Gz, CompressionKind::Bz2] {
        c.bench_function(&format!("build_16x64k_{}", kind.name()), |b| {
            b.iter(|| {
                let mut builder = ArchiveBuilder::new(SignatureAlgorithm::Sha1).unwrap();
                for i in 0..16 {
                    builder.add_entry(&format!("src/file_{}.php", i), black_box(data.clone()), kind).unwrap();
                }
                builder.finalize(&target).unwrap();
            })
        });
    }
}

fn bench_parse_and_verify(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let target = dir.path().join("parse.phar");
    let mut builder = ArchiveBuilder::new(SignatureAlgorithm::Sha256).unwrap();
    for i in 0..64 {
        builder.add_entry(&format!("lib/class_{}.php", i), vec![b'x'; 8 * 1024], CompressionKind::Gz).unwrap();
    }
    builder.finalize(&target).unwrap();
    let bytes = std::fs::read(&target).unwrap();

    c.bench_function("parse_64_entries_sha256", |b| {
        b.iter(|| Archive::parse(black_box(&bytes)).unwrap())
    });
}

criterion_group!(benches, bench_compression, bench_build_archive, bench_parse_and_verify);
criterion_main!(benches);
