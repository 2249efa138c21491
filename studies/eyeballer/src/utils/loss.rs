use burn::{ prelude::Backend, tensor::{ ElementConversion, Tensor } };

/// Clamp bound keeping `log` finite at saturated probabilities.
const EPSILON: f64 = 1e-7;

/// Binary cross-entropy on sigmoid outputs.
pub struct BinaryCrossEntropy;

impl BinaryCrossEntropy {
    pub fn new() -> Self {
        Self
    }

    /// `probabilities` and `targets` are `[batch, 1]`; targets hold 0.0 or 1.0.
    pub fn forward<B: Backend>(
        &self,
        probabilities: Tensor<B, 2>,
        targets: Tensor<B, 2>
    ) -> Tensor<B, 1> {
        let probabilities = probabilities.clamp(EPSILON, 1.0 - EPSILON);

        // y * log(p) + (1 - y) * log(1 - p)
        let positive = targets.clone() * probabilities.clone().log();
        let negative = targets.neg().add_scalar(1.0) * probabilities.neg().add_scalar(1.0).log();

        (positive + negative).neg().mean()
    }
}

/// Share of predictions on the same side of 0.5 as their targets, in [0, 1].
pub fn binary_accuracy<B: Backend>(probabilities: Tensor<B, 2>, targets: Tensor<B, 2>) -> f64 {
    let total = probabilities.dims()[0] as f64;
    let predictions = probabilities.greater_elem(0.5).int();
    let truth = targets.greater_elem(0.5).int();

    let corrects = predictions.equal(truth).int().sum().into_scalar().elem::<f64>();
    corrects / total
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{ libtorch::LibTorchDevice, LibTorch };
    use burn::tensor::TensorData;

    type B = LibTorch;

    fn column(values: Vec<f32>) -> Tensor<B, 2> {
        let rows = values.len();
        Tensor::from_data(TensorData::new(values, [rows, 1]), &LibTorchDevice::Cpu)
    }

    #[test]
    fn matches_hand_computed_loss() {
        let loss = BinaryCrossEntropy::new()
            .forward(column(vec![0.9, 0.2]), column(vec![1.0, 0.0]))
            .into_scalar()
            .elem::<f64>();
        let expected = -((0.9f64).ln() + (0.8f64).ln()) / 2.0;
        assert!((loss - expected).abs() < 1e-5, "{loss} != {expected}");
    }

    #[test]
    fn saturated_predictions_stay_finite() {
        let loss = BinaryCrossEntropy::new()
            .forward(column(vec![0.0, 1.0]), column(vec![1.0, 0.0]))
            .into_scalar()
            .elem::<f64>();
        assert!(loss.is_finite());
        assert!(loss > 10.0);
    }

    #[test]
    fn accuracy_thresholds_at_one_half() {
        let accuracy = binary_accuracy(
            column(vec![0.9, 0.4, 0.6, 0.1]),
            column(vec![1.0, 1.0, 0.0, 0.0])
        );
        assert!((accuracy - 0.5).abs() < 1e-9);
    }
}
