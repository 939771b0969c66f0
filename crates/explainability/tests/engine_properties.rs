//! Behavioural tests for the Grad-CAM engine

use image::{Rgb, RgbImage};
use ndarray::{Array1, Array2, Array3, Array4};
use proptest::prelude::*;
use retina_classifier::{ConvBackbone, ConvLayer, LinearHead, SeverityClassifier};
use retina_common::{ModelTensor, VisualizationImage};
use retina_explainability::{explain, generate_cam, grad_cam, GradCam};
use std::sync::Arc;

/// 1x1 identity convolution: the target layer sees the (rectified) input
fn identity_classifier() -> SeverityClassifier {
    let weight = Array4::from_shape_fn((3, 3, 1, 1), |(o, i, _, _)| if o == i { 1.0 } else { 0.0 });
    let layer = ConvLayer::new(weight, Array1::zeros(3), 1, 0).unwrap();
    let backbone = ConvBackbone::new("identity", vec![layer]).unwrap();
    let head = LinearHead::new(Array2::eye(3), Array1::zeros(3)).unwrap();
    let classes = vec!["top-left".into(), "bottom-right".into(), "flat".into()];
    SeverityClassifier::new(Box::new(backbone), head, classes, 8).unwrap()
}

/// Channel 0 lit at the top-left, channel 1 at the bottom-right, channel 2 flat
fn two_spot_input() -> ModelTensor {
    ModelTensor::new(Array3::from_shape_fn((3, 8, 8), |(c, y, x)| match c {
        0 if (y, x) == (0, 0) => 1.0,
        1 if (y, x) == (7, 7) => 1.0,
        2 => 0.5,
        _ => 0.0,
    }))
    .unwrap()
}

#[test]
fn test_different_classes_highlight_different_regions() {
    let classifier = identity_classifier();
    let input = two_spot_input();

    let first = generate_cam(&classifier, &input, Some(0)).unwrap();
    let second = generate_cam(&classifier, &input, Some(1)).unwrap();

    assert_ne!(first.saliency, second.saliency);
    assert_eq!(first.saliency.values()[[0, 0]], 1.0);
    assert_eq!(second.saliency.values()[[7, 7]], 1.0);
    assert_eq!(first.saliency.values()[[7, 7]], 0.0);
}

#[test]
fn test_flat_evidence_is_degenerate_and_renders() {
    let classifier = identity_classifier();
    let computed = generate_cam(&classifier, &two_spot_input(), Some(2)).unwrap();
    assert!(computed.saliency.is_degenerate());

    let base = VisualizationImage::new(RgbImage::from_pixel(8, 8, Rgb([200, 200, 200])));
    let explanation = explain(&classifier, &two_spot_input(), &base, Some(2), 0.5).unwrap();
    let first = *explanation.blended.as_rgb().get_pixel(0, 0);
    assert!(explanation.blended.as_rgb().pixels().all(|p| *p == first));
}

#[test]
fn test_default_target_is_prediction() {
    let classifier = identity_classifier();
    let input = two_spot_input();

    let computed = generate_cam(&classifier, &input, None).unwrap();
    let prediction = classifier.predict(&input).unwrap();
    assert_eq!(computed.target_class, prediction.class_index);
}

#[test]
fn test_cam_upsamples_to_visualization_size() {
    let classifier = identity_classifier();
    let computed = generate_cam(&classifier, &two_spot_input(), None).unwrap();
    assert_eq!(computed.saliency.upsample(224, 224).dim(), (224, 224));
}

#[test]
fn test_concurrent_engines_do_not_interfere() {
    let classifier = Arc::new(identity_classifier());
    let expected = generate_cam(&classifier, &two_spot_input(), Some(1)).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let classifier = classifier.clone();
            std::thread::spawn(move || {
                let target = i % 2;
                let computed = GradCam::new(&classifier)
                    .hook()
                    .unwrap()
                    .forward(&two_spot_input(), Some(target))
                    .unwrap()
                    .backward()
                    .unwrap()
                    .compute()
                    .unwrap();
                (target, computed)
            })
        })
        .collect();

    for handle in handles {
        let (target, computed) = handle.join().unwrap();
        assert_eq!(computed.target_class, target);
        if target == 1 {
            assert_eq!(computed.saliency, expected.saliency);
        }
    }
}

/// Property: saliency values always lie in [0, 1]
#[test]
fn proptest_saliency_bounds() {
    proptest!(ProptestConfig::with_cases(64), |(
        channels in 1usize..5,
        height in 1usize..9,
        width in 1usize..9,
        seed in any::<u64>(),
    )| {
        let value = |i: usize, salt: u64| {
            let h = (i as u64 ^ salt ^ seed).wrapping_mul(0x9E37_79B9_7F4A_7C15);
            ((h >> 40) as f32 / (1u64 << 24) as f32) * 8.0 - 4.0
        };
        let n = channels * height * width;
        let activation = Array3::from_shape_vec(
            (channels, height, width),
            (0..n).map(|i| value(i, 1)).collect(),
        ).unwrap();
        let gradient = Array3::from_shape_vec(
            (channels, height, width),
            (0..n).map(|i| value(i, 2)).collect(),
        ).unwrap();

        let map = grad_cam(activation.view(), gradient.view()).unwrap();
        prop_assert_eq!(map.dim(), (height, width));
        prop_assert!(map.values().iter().all(|v| (0.0..=1.0).contains(v)));

        let up = map.upsample(17, 13);
        prop_assert_eq!(up.dim(), (13, 17));
        prop_assert!(up.values().iter().all(|v| (0.0..=1.0).contains(v)));
    });
}
