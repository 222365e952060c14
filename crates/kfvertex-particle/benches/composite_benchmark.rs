use criterion::{black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use kfvertex_core::{TrackState, Vec3};
use kfvertex_particle::{CompositeParticleBuilder, DecayTree, ParticleId, ParticleState, UniformField};

const DAUGHTER_COUNTS: [usize; 3] = [2, 4, 8];
const PION: f64 = 0.13957;

fn random_pions(rng: &mut fastrand::Rng, tree: &mut DecayTree, n: usize) -> Vec<ParticleId> {
    let vertex = Vec3::new(rng.f64() - 0.5, rng.f64() - 0.5, rng.f64() * 20.0);
    (0..n)
        .map(|i| {
            let tx = rng.f64() * 0.4 - 0.2;
            let ty = rng.f64() * 0.4 - 0.2;
            let mut cov = [0.0; 15];
            cov[0] = 0.01;
            cov[2] = 0.01;
            cov[5] = 1e-6;
            cov[9] = 1e-6;
            cov[14] = 1e-6;
            let qp = if i % 2 == 0 { 0.5 } else { -0.5 };
            let track = TrackState::new(
                [
                    vertex.x - vertex.z * tx + (rng.f64() - 0.5) * 0.1,
                    vertex.y - vertex.z * ty + (rng.f64() - 0.5) * 0.1,
                    tx,
                    ty,
                    qp,
                ],
                cov,
                0.0,
            );
            tree.add_particle(ParticleState::from_track_with_charge_sign(&track, PION).unwrap())
        })
        .collect()
}

fn combine_benchmarks(c: &mut Criterion) {
    let mut rng = fastrand::Rng::with_seed(2024);
    let mut group = c.benchmark_group("combine_all");
    for (name, builder) in [
        ("zero_field", CompositeParticleBuilder::default()),
        ("dipole", CompositeParticleBuilder::new(UniformField::along_y(0.5))),
    ] {
        for n in DAUGHTER_COUNTS {
            let mut tree = DecayTree::new();
            let ids = random_pions(&mut rng, &mut tree, n);
            group.bench_with_input(BenchmarkId::new(name, n), &ids, |b, ids| {
                b.iter_batched(
                    || tree.clone(),
                    |mut tree| black_box(builder.combine_all(&mut tree, black_box(ids))),
                    BatchSize::SmallInput,
                )
            });
        }
    }
    group.finish();
}

fn distance_benchmark(c: &mut Criterion) {
    let mut rng = fastrand::Rng::with_seed(99);
    let mut tree = DecayTree::new();
    let ids = random_pions(&mut rng, &mut tree, 2);
    let builder = CompositeParticleBuilder::new(UniformField::along_y(0.5));
    let a = tree.get(ids[0]).unwrap().clone();
    let b = tree.get(ids[1]).unwrap().clone();
    c.bench_function("distance_to_particle", |bench| {
        bench.iter(|| black_box(builder.distance_to_particle(black_box(&a), black_box(&b))))
    });
}

criterion_group!(benches, combine_benchmarks, distance_benchmark);
criterion_main!(benches);
