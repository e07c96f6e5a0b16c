use admom::{AdaptiveMoments, Image, Quadrupole};
use criterion::{Criterion, criterion_group, criterion_main};
use itertools::iproduct;
use nalgebra::Point2;
use ndarray::Array2;
use ndarray_rand::{
    RandomExt,
    rand::{Rng, SeedableRng, rngs::StdRng},
    rand_distr::{Normal, Uniform},
};

const SIZE: usize = 512;
const GRID: usize = 12;

/// A noisy field of elliptical Gaussians on a regular grid, and their approximate centers.
fn field() -> (Array2<f64>, Vec<Point2<f64>>) {
    let mut rng = StdRng::seed_from_u64(42);
    let mut data = Array2::random_using((SIZE, SIZE), Normal::new(0., 1.).unwrap(), &mut rng);

    let spacing = SIZE as f64 / GRID as f64;
    let jitter = Uniform::new(-0.5, 0.5);
    let centers = iproduct!(0..GRID, 0..GRID)
        .map(|(i, j)| {
            Point2::new(
                (i as f64 + 0.5) * spacing + rng.sample(jitter),
                (j as f64 + 0.5) * spacing + rng.sample(jitter),
            )
        })
        .collect::<Vec<_>>();

    let shape = Quadrupole::new(4., 2.5, 0.8);
    let det = shape.determinant();
    for center in &centers {
        data.indexed_iter_mut().for_each(|((y, x), v)| {
            let (dx, dy) = (x as f64 - center.x, y as f64 - center.y);
            let expon =
                (shape.iyy * dx * dx - 2. * shape.ixy * dx * dy + shape.ixx * dy * dy) / det;
            if expon < 50. {
                *v += 200. * (-0.5 * expon).exp();
            }
        });
    }

    (data, centers)
}

fn measure_benchmark(c: &mut Criterion) {
    let mut measure = c.benchmark_group("measure");
    measure.sample_size(10);

    let (data, centers) = field();
    let image = Image::new(data.view());
    let moments = AdaptiveMoments::new();

    measure.bench_function("measure blocking", |b| {
        b.iter(|| moments.measure_all(&image, &centers))
    });

    measure.bench_function("measure parallel", |b| {
        b.iter(|| moments.measure_all_par(&image, &centers))
    });

    measure.bench_function("fixed moments flux", |b| {
        let shape = Quadrupole::new(4., 2.5, 0.8);
        b.iter(|| {
            centers
                .iter()
                .map(|c| moments.fixed_moments_flux(&image, *c, &shape))
                .collect::<Vec<_>>()
        })
    });
}

criterion_group!(benches, measure_benchmark);
criterion_main!(benches);
