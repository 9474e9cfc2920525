use criterion::{criterion_group, criterion_main, Criterion};

use lqdescent::control::{
    derive_gain, solve_care, solve_cdre, AffineCost, Cdre, CostWeights, DescentDirection, Horizon,
    LinearSystem, Lq, Lqr, SignSettings,
};
use lqdescent::ode::OdeSettings;
use nalgebra::{dmatrix, dvector, DMatrix};

fn care(b: &mut Criterion) {
    // cart-pole linearized about the upright position
    let a = dmatrix![
        0.0, 1.0, 0.0, 0.0;
        0.0, 0.0, -0.98, 0.0;
        0.0, 0.0, 0.0, 1.0;
        0.0, 0.0, 21.56, 0.0
    ];
    let bm = dmatrix![0.0; 1.0; 0.0; -2.0];
    let q = DMatrix::identity(4, 4);
    let r = dmatrix![0.1];
    let settings = SignSettings::default();

    b.bench_function("care", |b| b.iter(|| solve_care(&a, &bm, &q, &r, &settings).unwrap()));
}

fn cdre_lqr(b: &mut Criterion) {
    let system = LinearSystem::new(
        |t| dmatrix![0.0, 1.0; -1.0 - 0.5 * t.sin(), -0.2],
        |_| dmatrix![0.0; 1.0],
        0.0,
    )
    .unwrap();
    let cost = CostWeights::for_system(&system);
    let horizon = Horizon::new(0.0, 5.0).unwrap();
    let pb = DMatrix::identity(2, 2);
    let settings = OdeSettings::default();

    b.bench_function("cdre_lqr", |b| {
        b.iter(|| {
            let riccati = solve_cdre(&system, &cost, horizon, &pb, &settings).unwrap();
            derive_gain(&system, &cost, &riccati).unwrap()
        })
    });
}

fn descent_direction(b: &mut Criterion) {
    let system =
        LinearSystem::time_invariant(dmatrix![0.0, 1.0; 0.0, 0.0], dmatrix![0.0; 1.0]).unwrap();
    let cost = CostWeights::for_system(&system);
    let horizon = Horizon::new(0.0, 5.0).unwrap();

    b.bench_function("descent_direction", |b| {
        b.iter(|| {
            let cdre = Cdre::new(horizon, system.clone(), cost.clone()).unwrap();
            let affine =
                AffineCost::new(|t| dvector![t.cos(), 0.0], |_| dvector![0.1], dvector![0.0, 0.0]);
            let lq = Lq::new(Lqr::new(cdre), affine).unwrap();
            let descent = DescentDirection::new(lq).with_initial(dvector![1.0, 0.0]).unwrap();
            descent.direction().unwrap().times().unwrap().len()
        })
    });
}

criterion_group!(benches, care, cdre_lqr, descent_direction);
criterion_main!(benches);
