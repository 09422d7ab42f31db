//! Turning raw logits into labeled class probabilities.

use candle_core::Tensor;

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("logits tensor has dims {0:?}, expected (1, N)")]
    BadLogits(Vec<usize>),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ClassScore {
    pub index: usize,
    pub label: String,
    pub probability: f32,
}

/// Softmax the logits and return the `top_k` classes, most probable
/// first. Missing labels fall back to `class_{i}`.
pub fn class_probabilities(
    logits: &Tensor,
    labels: &[String],
    top_k: usize,
) -> Result<Vec<ClassScore>, ReportError> {
    let dims = logits.dims();
    let values: Vec<f32> = match dims {
        [1, _] => logits.flatten_all()?.to_vec1()?,
        _ => return Err(ReportError::BadLogits(dims.to_vec())),
    };

    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = values.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exp.iter().sum();

    let mut scores: Vec<ClassScore> = exp
        .iter()
        .enumerate()
        .map(|(index, e)| ClassScore {
            index,
            label: labels
                .get(index)
                .cloned()
                .unwrap_or_else(|| format!("class_{index}")),
            probability: e / sum,
        })
        .collect();
    scores.sort_by(|a, b| {
        b.probability
            .partial_cmp(&a.probability)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    scores.truncate(top_k);
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn probabilities_are_softmaxed_and_sorted() {
        let logits =
            Tensor::from_vec(vec![0.0f32, 1.0, 2.0], (1, 3), &Device::Cpu).unwrap();
        let scores =
            class_probabilities(&logits, &labels(&["a", "b", "c"]), 3).unwrap();
        assert_eq!(scores[0].label, "c");
        assert_eq!(scores[2].label, "a");
        assert!(scores[0].probability > scores[1].probability);
        let sum: f32 = scores.iter().map(|s| s.probability).sum();
        assert!((sum - 1.0).abs() < 1e-6);
    }

    #[test]
    fn top_k_truncates_and_fills_missing_labels() {
        let logits =
            Tensor::from_vec(vec![5.0f32, 0.0, 0.0, 0.0], (1, 4), &Device::Cpu).unwrap();
        let scores = class_probabilities(&logits, &labels(&["only"]), 2).unwrap();
        assert_eq!(scores.len(), 2);
        assert_eq!(scores[0].label, "only");
        assert!(scores[1].label.starts_with("class_"));
    }

    #[test]
    fn non_batched_logits_are_rejected() {
        let logits = Tensor::from_vec(vec![1.0f32, 2.0], (2,), &Device::Cpu).unwrap();
        assert!(matches!(
            class_probabilities(&logits, &[], 1),
            Err(ReportError::BadLogits(_))
        ));
    }
}
