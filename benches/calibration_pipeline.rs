use aegis_decision_core::calibration::{disagreement_score, CalibrationInputs, ConfidenceCalibrator};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn bench_calibrate(c: &mut Criterion) {
    let calibrator = ConfidenceCalibrator::new();
    c.bench_function("calibrate_single_decision", |b| {
        b.iter(|| {
            let disagreement = disagreement_score(black_box(0.6), black_box(0.8), black_box(0.3));
            calibrator.calibrate(&CalibrationInputs {
                raw_confidence: black_box(0.82),
                detection_factors_count: black_box(2),
                network_evidence_count: black_box(1),
                behavioral_match_score: black_box(0.8),
                disagreement_score: disagreement,
            })
        })
    });
}

criterion_group!(benches, bench_calibrate);
criterion_main!(benches);
