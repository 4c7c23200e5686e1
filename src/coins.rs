use thiserror::Error;

use crate::detector::Detection;

#[derive(Debug, Error, PartialEq)]
pub enum AggregateError {
    #[error("detected label {0:?} is not a coin value")]
    NonNumericLabel(String),
}

/// Adds up the coin denominations named by each detection label.
pub fn coin_sum(detections: &[Detection]) -> Result<u64, AggregateError> {
    detections.iter().try_fold(0u64, |sum, detection| {
        let value = detection
            .label
            .trim()
            .parse::<u64>()
            .map_err(|_| AggregateError::NonNumericLabel(detection.label.clone()))?;
        Ok(sum.saturating_add(value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::BoundingBox;

    fn coin(label: &str) -> Detection {
        Detection {
            label: label.to_string(),
            score: 0.9,
            class_id: 0,
            bbox: BoundingBox { x1: 0.0, y1: 0.0, x2: 1.0, y2: 1.0 },
        }
    }

    #[test]
    fn sums_denominations() {
        let found = [coin("100"), coin("200"), coin("50"), coin("50")];
        assert_eq!(coin_sum(&found), Ok(400));
    }

    #[test]
    fn empty_result_is_zero() {
        assert_eq!(coin_sum(&[]), Ok(0));
    }

    #[test]
    fn non_numeric_label_fails() {
        let found = [coin("10"), coin("button")];
        assert_eq!(
            coin_sum(&found),
            Err(AggregateError::NonNumericLabel("button".into()))
        );
    }
}
