use std::fs;
use std::path::{ Path, PathBuf };

use anyhow::{ bail, Context, Result };
use burn::tensor::backend::AutodiffBackend;
use tracing::info;

use crate::data::DataLoader;
use crate::model::Model;
use crate::utils::display::{ confusion_matrix, print_confusion_matrix };

/// Probabilities above this are predicted as class 1.
pub const THRESHOLD: f32 = 0.5;

/// Prediction for one validation image.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub path: PathBuf,
    /// `<class>/<file>`, reused as the destination name
    pub filename: PathBuf,
    pub label: i64,
    pub predicted: i64,
    pub probability: f32,
}

impl Outcome {
    pub fn is_correct(&self) -> bool {
        self.label == self.predicted
    }
}

/// Binary confusion counts, class 1 being the positive class.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfusionResult {
    pub true_positive: usize,
    pub true_negative: usize,
    pub false_positive: usize,
    pub false_negative: usize,
    pub outcomes: Vec<Outcome>,
}

impl ConfusionResult {
    pub fn from_outcomes(outcomes: Vec<Outcome>) -> Self {
        let mut result = ConfusionResult::default();
        for outcome in &outcomes {
            match (outcome.label == 1, outcome.predicted == 1) {
                (true, true) => {
                    result.true_positive += 1;
                }
                (false, false) => {
                    result.true_negative += 1;
                }
                (false, true) => {
                    result.false_positive += 1;
                }
                (true, false) => {
                    result.false_negative += 1;
                }
            }
        }
        result.outcomes = outcomes;
        result
    }

    pub fn total(&self) -> usize {
        self.true_positive + self.true_negative + self.false_positive + self.false_negative
    }

    pub fn accuracy(&self) -> f64 {
        ((self.true_positive + self.true_negative) as f64) / (self.total() as f64)
    }

    /// `[label][prediction]` counts
    pub fn matrix(&self) -> Vec<Vec<usize>> {
        let predictions: Vec<i64> = self.outcomes
            .iter()
            .map(|o| o.predicted)
            .collect();
        let labels: Vec<i64> = self.outcomes
            .iter()
            .map(|o| o.label)
            .collect();
        confusion_matrix(&predictions, &labels, 2)
    }
}

/// Predicts every validation image, trailing partial batch included.
///
/// Each batch carries the dataset indices of its rows, so predictions are matched to
/// files within the same pass instead of relying on a second iteration repeating the order.
pub fn predict<B: AutodiffBackend>(
    model: &Model<B>,
    dataloader: &mut DataLoader<B::InnerBackend>
) -> Result<Vec<Outcome>> {
    let mut scored: Vec<(usize, f32)> = Vec::with_capacity(dataloader.len());
    info!("Evaluating {} images in {} batches", dataloader.len(), dataloader.len_batch());

    dataloader.reset();
    for batch in dataloader.by_ref() {
        let batch = batch?;
        let probabilities = model.predict(batch.images).into_data();
        scored.extend(batch.indices.into_iter().zip(probabilities.iter::<f32>()));
    }

    Ok(
        scored
            .into_iter()
            .map(|(idx, probability)| {
                let sample = dataloader.sample(idx);
                Outcome {
                    path: sample.path.clone(),
                    filename: sample.filename.clone(),
                    label: sample.label,
                    predicted: if probability > THRESHOLD { 1 } else { 0 },
                    probability,
                }
            })
            .collect()
    )
}

/// Runs the validation subset through the model and prints the confusion matrix.
pub fn evaluate<B: AutodiffBackend>(
    model: &Model<B>,
    dataloader: &mut DataLoader<B::InnerBackend>
) -> Result<ConfusionResult> {
    let result = ConfusionResult::from_outcomes(predict(model, dataloader)?);

    print_confusion_matrix(&result.matrix(), dataloader.get_classes());
    info!(
        "TP {} | TN {} | FP {} | FN {} | accuracy {:.2}%",
        result.true_positive,
        result.true_negative,
        result.false_positive,
        result.false_negative,
        result.accuracy() * 100.0
    );
    Ok(result)
}

/// Copies every evaluated image under `correct_dir` or `wrong_dir`, keeping its
/// `<class>/<file>` name. Both directories must already exist.
pub fn route_files(result: &ConfusionResult, correct_dir: &Path, wrong_dir: &Path) -> Result<()> {
    for dir in [correct_dir, wrong_dir] {
        if !dir.is_dir() {
            bail!("destination directory {} does not exist", dir.display());
        }
    }

    let mut copied = (0, 0);
    for outcome in &result.outcomes {
        let target = if outcome.is_correct() {
            copied.0 += 1;
            correct_dir.join(&outcome.filename)
        } else {
            copied.1 += 1;
            wrong_dir.join(&outcome.filename)
        };
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&outcome.path, &target).with_context(||
            format!("failed to copy {} to {}", outcome.path.display(), target.display())
        )?;
    }

    info!(
        "Copied {} images to {} and {} to {}",
        copied.0,
        correct_dir.display(),
        copied.1,
        wrong_dir.display()
    );
    Ok(())
}
