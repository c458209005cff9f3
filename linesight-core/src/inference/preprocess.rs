//! Tensor preparation and score decoding

use super::InputSpec;
use crate::config::{Normalization, TensorLayout};
use crate::error::{InspectionError, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::borrow::Cow;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Tolerance for treating model output as an already normalized distribution
const PROBABILITY_SUM_TOLERANCE: f32 = 1e-3;

/// Resize and normalize `pixels` into a flat tensor laid out per `spec`
pub fn to_tensor(pixels: &RgbImage, spec: &InputSpec) -> Vec<f32> {
    let image: Cow<'_, RgbImage> = if pixels.dimensions() == (spec.width, spec.height) {
        Cow::Borrowed(pixels)
    } else {
        Cow::Owned(imageops::resize(pixels, spec.width, spec.height, FilterType::Triangle))
    };

    let (w, h) = (spec.width as usize, spec.height as usize);
    let plane = w * h;
    let mut tensor = vec![0.0f32; plane * 3];

    for (i, pixel) in image.pixels().enumerate() {
        for c in 0..3 {
            let value = normalize(pixel[c], c, spec.normalization);
            let index = match spec.layout {
                TensorLayout::Nchw => c * plane + i,
                TensorLayout::Nhwc => i * 3 + c,
            };
            tensor[index] = value;
        }
    }
    tensor
}

fn normalize(value: u8, channel: usize, normalization: Normalization) -> f32 {
    let unit = value as f32 / 255.0;
    match normalization {
        Normalization::Unit => unit,
        Normalization::Signed => unit * 2.0 - 1.0,
        Normalization::Imagenet => (unit - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel],
    }
}

/// Numerically stable softmax
pub fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Index and confidence of the winning class.
///
/// Scores that already form a probability distribution are used as-is;
/// anything else is treated as logits. Ties resolve to the lowest index.
pub fn top_class(scores: &[f32]) -> Result<(usize, f32)> {
    if scores.is_empty() {
        return Err(InspectionError::Inference("Model returned no scores".to_string()));
    }
    if let Some(bad) = scores.iter().position(|s| !s.is_finite()) {
        return Err(InspectionError::Inference(format!(
            "Model output contains non-finite score {} at index {}",
            scores[bad], bad
        )));
    }

    let sum: f32 = scores.iter().sum();
    let is_distribution = scores.iter().all(|s| (0.0..=1.0).contains(s))
        && (sum - 1.0).abs() <= PROBABILITY_SUM_TOLERANCE;
    let probabilities = if is_distribution {
        scores.to_vec()
    } else {
        softmax(scores)
    };

    let mut best = 0;
    for (i, p) in probabilities.iter().enumerate().skip(1) {
        if *p > probabilities[best] {
            best = i;
        }
    }
    Ok((best, probabilities[best].clamp(0.0, 1.0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use proptest::prelude::*;

    fn spec(layout: TensorLayout, normalization: Normalization) -> InputSpec {
        InputSpec {
            width: 2,
            height: 1,
            layout,
            normalization,
        }
    }

    fn two_pixels() -> RgbImage {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([255, 0, 51]));
        img.put_pixel(1, 0, Rgb([0, 255, 102]));
        img
    }

    #[test]
    fn test_nchw_and_nhwc_layouts() {
        let nchw = to_tensor(&two_pixels(), &spec(TensorLayout::Nchw, Normalization::Unit));
        assert_eq!(nchw, vec![1.0, 0.0, 0.0, 1.0, 0.2, 0.4]);

        let nhwc = to_tensor(&two_pixels(), &spec(TensorLayout::Nhwc, Normalization::Unit));
        assert_eq!(nhwc, vec![1.0, 0.0, 0.2, 0.0, 1.0, 0.4]);
    }

    #[test]
    fn test_normalizations() {
        let signed = to_tensor(&two_pixels(), &spec(TensorLayout::Nhwc, Normalization::Signed));
        assert_eq!(signed[0], 1.0);
        assert_eq!(signed[1], -1.0);

        let imagenet = to_tensor(&two_pixels(), &spec(TensorLayout::Nhwc, Normalization::Imagenet));
        assert!((imagenet[0] - (1.0 - 0.485) / 0.229).abs() < 1e-5);
    }

    #[test]
    fn test_resizes_to_input() {
        let big = RgbImage::from_pixel(10, 10, Rgb([128, 128, 128]));
        let tensor = to_tensor(
            &big,
            &InputSpec {
                width: 4,
                height: 3,
                layout: TensorLayout::Nchw,
                normalization: Normalization::Unit,
            },
        );
        assert_eq!(tensor.len(), 36);
        assert!(tensor.iter().all(|v| (v - 128.0 / 255.0).abs() < 1e-3));
    }

    #[test]
    fn test_probabilities_pass_through() {
        let (index, confidence) = top_class(&[0.2, 0.7, 0.1]).unwrap();
        assert_eq!(index, 1);
        assert!((confidence - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_logits_go_through_softmax() {
        let (index, confidence) = top_class(&[1.0, 3.0]).unwrap();
        assert_eq!(index, 1);
        let expected = 1.0 / (1.0 + (-2.0f32).exp());
        assert!((confidence - expected).abs() < 1e-5);
    }

    #[test]
    fn test_ties_resolve_to_lowest_index() {
        assert_eq!(top_class(&[0.5, 0.5]).unwrap().0, 0);
        assert_eq!(top_class(&[2.0, 5.0, 5.0]).unwrap().0, 1);
    }

    #[test]
    fn test_invalid_scores() {
        assert!(top_class(&[]).is_err());
        assert!(top_class(&[0.3, f32::INFINITY]).is_err());
        assert!(top_class(&[f32::NAN]).is_err());
    }

    proptest! {
        #[test]
        fn prop_confidence_in_unit_range(scores in proptest::collection::vec(-50.0f32..50.0, 1..16)) {
            let (index, confidence) = top_class(&scores).unwrap();
            prop_assert!(index < scores.len());
            prop_assert!((0.0..=1.0).contains(&confidence));
            let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            prop_assert!(scores[index] >= max - 1e-4);
        }
    }
}
