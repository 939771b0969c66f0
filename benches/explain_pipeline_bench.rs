// Screening pipeline benchmark - preprocessing, Grad-CAM and overlay
//
// Run with: cargo bench --bench explain_pipeline_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use image::{ImageBuffer, Rgb, RgbImage};
use ndarray::{Array1, Array2, Array4};
use retina_screening::classifier::{ConvBackbone, ConvLayer, LinearHead};
use retina_screening::explainability::overlay;
use retina_screening::{
    generate_cam, DecodedImage, Preprocessor, ScreeningConfig, SeverityClassifier,
};

fn test_image(width: u32, height: u32) -> RgbImage {
    ImageBuffer::from_fn(width, height, |x, y| {
        Rgb([
            ((x + y) % 256) as u8,
            ((x * 2) % 256) as u8,
            ((y * 2) % 256) as u8,
        ])
    })
}

fn native_classifier(config: &ScreeningConfig) -> SeverityClassifier {
    let conv = |in_c: usize, out_c: usize| {
        let weight = Array4::from_shape_fn((out_c, in_c, 3, 3), |(o, c, y, x)| {
            ((o * 7 + c * 5 + y * 3 + x) % 11) as f32 * 0.02 - 0.1
        });
        ConvLayer::new(weight, Array1::from_elem(out_c, 0.01), 2, 1)
            .expect("valid conv layer")
    };
    let backbone = ConvBackbone::new("block3", vec![conv(3, 8), conv(8, 16), conv(16, 32)])
        .expect("valid backbone");
    let head = LinearHead::new(
        Array2::from_shape_fn((5, 32), |(c, k)| ((c + k) % 5) as f32 * 0.1 - 0.2),
        Array1::zeros(5),
    )
    .expect("valid head");
    SeverityClassifier::new(
        Box::new(backbone),
        head,
        config.severity_classes.clone(),
        config.input_size,
    )
    .expect("valid classifier")
}

/// Preprocessing at typical fundus camera resolutions
fn bench_preprocessing(c: &mut Criterion) {
    let mut group = c.benchmark_group("preprocessing");
    let preprocessor = Preprocessor::new(&ScreeningConfig::default());

    for (width, height, name) in [(640, 480, "640x480"), (2048, 1536, "2048x1536")] {
        let decoded = DecodedImage::new(test_image(width, height));
        group.bench_with_input(BenchmarkId::new("preprocess", name), &decoded, |b, img| {
            b.iter(|| black_box(preprocessor.preprocess(black_box(img))));
        });
        group.bench_with_input(BenchmarkId::new("visualize", name), &decoded, |b, img| {
            b.iter(|| black_box(preprocessor.visualize(black_box(img))));
        });
    }

    group.finish();
}

/// Grad-CAM on the native backbone and the overlay render
fn bench_explain(c: &mut Criterion) {
    let mut group = c.benchmark_group("explain");
    let config = ScreeningConfig::default();
    let classifier = native_classifier(&config);
    let preprocessor = Preprocessor::new(&config);

    let decoded = DecodedImage::new(test_image(640, 480));
    let tensor = preprocessor.preprocess(&decoded).expect("preprocess");
    let visual = preprocessor.visualize(&decoded).expect("visualize");

    group.bench_function("grad_cam_224", |b| {
        b.iter(|| black_box(generate_cam(&classifier, black_box(&tensor), None)));
    });

    let computed = generate_cam(&classifier, &tensor, None).expect("grad-cam");
    group.bench_function("overlay_224", |b| {
        b.iter(|| black_box(overlay(black_box(&computed.saliency), &visual, 0.5)));
    });

    group.finish();
}

criterion_group!(benches, bench_preprocessing, bench_explain);
criterion_main!(benches);
