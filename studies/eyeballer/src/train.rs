use crate::data::DataLoader;
use crate::model::Model;
use crate::utils::loss::{ binary_accuracy, BinaryCrossEntropy };
use anyhow::Result;
use burn::module::AutodiffModule;
use burn::optim::{ GradientsParams, Optimizer, RmsPropConfig };
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::ElementConversion;
use serde::Serialize;
use tracing::{ debug, info, warn };

/// Metrics of one epoch. Accuracies are fractions in [0, 1]; values are NaN when
/// the subset was too small to fill a single batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
}

#[derive(Debug, Clone, Default)]
pub struct TrainingHistory {
    records: Vec<EpochRecord>,
}

impl TrainingHistory {
    pub fn push(&mut self, record: EpochRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[EpochRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// (epoch, value) pairs, as plotted
    pub fn series(&self, value: impl Fn(&EpochRecord) -> f64) -> Vec<(f64, f64)> {
        self.records
            .iter()
            .map(|record| (record.epoch as f64, value(record)))
            .collect()
    }
}

/// Running sums weighted by batch size.
#[derive(Debug, Default)]
struct Running {
    loss: f64,
    accuracy: f64,
    samples: usize,
}

impl Running {
    fn add(&mut self, loss: f64, accuracy: f64, batch: usize) {
        self.loss += loss * (batch as f64);
        self.accuracy += accuracy * (batch as f64);
        self.samples += batch;
    }

    fn finish(&self) -> (f64, f64) {
        let samples = self.samples as f64;
        (self.loss / samples, self.accuracy / samples)
    }
}

/// Fits the head for `n_epochs` and returns the trained model with its history.
///
/// Each epoch takes `steps()` full batches from the training loader, then measures
/// loss and accuracy over `steps()` validation batches with dropout disabled. Both
/// losses include the L2 penalty of the head.
pub fn train_model<B: AutodiffBackend>(
    mut model: Model<B>,
    dataloader_train: &mut DataLoader<B>,
    dataloader_val: &mut DataLoader<B::InnerBackend>,
    n_epochs: usize,
    learning_rate: f64
) -> Result<(Model<B>, TrainingHistory)> {
    let mut optim = RmsPropConfig::new().with_alpha(0.9).with_epsilon(1e-7).init();
    let bce = BinaryCrossEntropy::new();
    let mut history = TrainingHistory::default();

    let steps_train = dataloader_train.steps();
    let steps_val = dataloader_val.steps();
    info!(
        "Training {} epochs: {} steps per epoch, {} validation steps",
        n_epochs,
        steps_train,
        steps_val
    );
    if steps_train == 0 {
        warn!(
            "{} training images do not fill one batch, epochs will not update the model",
            dataloader_train.len()
        );
    }

    for e in 1..=n_epochs {
        let mut train = Running::default();

        dataloader_train.reset();
        for (i, batch) in dataloader_train.by_ref().take(steps_train).enumerate() {
            let batch = batch?;
            let size = batch.indices.len();

            let output = model.forward(batch.images);
            let loss = bce.forward(output.clone(), batch.labels.clone()) + model.head.l2_penalty();

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &model.head);
            model.head = optim.step(learning_rate, model.head, grads);

            let loss = loss.into_scalar().elem::<f64>();
            let acc = binary_accuracy(output, batch.labels);
            train.add(loss, acc, size);

            debug!(
                "[Train - Epoch {} - Batch {}] Loss {:.4} | Accuracy {:.2}%",
                e,
                i,
                loss,
                acc * 100.0
            );
        }
        let (train_loss, train_accuracy) = train.finish();

        let head = model.head.valid();
        let mut val = Running::default();

        dataloader_val.reset();
        for (i, batch) in dataloader_val.by_ref().take(steps_val).enumerate() {
            let batch = batch?;
            let size = batch.indices.len();

            let output = head.forward(model.backbone.forward(batch.images));
            let loss = bce.forward(output.clone(), batch.labels.clone()) + head.l2_penalty();

            let loss = loss.into_scalar().elem::<f64>();
            let acc = binary_accuracy(output, batch.labels);
            val.add(loss, acc, size);

            debug!(
                "[Validation - Epoch {} - Batch {}] Loss {:.4} | Accuracy {:.2}%",
                e,
                i,
                loss,
                acc * 100.0
            );
        }
        let (val_loss, val_accuracy) = val.finish();

        info!(
            "[Epoch {}/{}] loss {:.4} - acc {:.2}% - val_loss {:.4} - val_acc {:.2}%",
            e,
            n_epochs,
            train_loss,
            train_accuracy * 100.0,
            val_loss,
            val_accuracy * 100.0
        );

        history.push(EpochRecord {
            epoch: e,
            train_loss,
            train_accuracy,
            val_loss,
            val_accuracy,
        });
    }

    Ok((model, history))
}
