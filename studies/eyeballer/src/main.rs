use std::path::Path;

use anyhow::Result;
use burn::backend::{ libtorch::LibTorchDevice, Autodiff, LibTorch };
use clap::Parser;
use tracing::info;

use config::{ Settings, VALIDATION_SPLIT };
use data::{ DataLoader, Dataset, Subset };
use model::Model;
use utils::logging::init_logging;

mod config;
mod data;
mod eval;
mod model;
mod report;
mod train;
mod utils;

type Backend = Autodiff<LibTorch>;

fn main() -> Result<()> {
    let settings = Settings::parse();
    init_logging(settings.verbose);

    let device = LibTorchDevice::Cpu;
    let weights_file = settings.weights_file();
    if let (Some(requested), Some(used)) = (&settings.weights_path, &weights_file) {
        if requested != used {
            info!("Weights are stored as {} instead of {}", used.display(), requested.display());
        }
    }

    let model: Model<Backend> = Model::build(
        &settings.backbone_path,
        weights_file.as_deref(),
        &device
    )?;

    let dataset_train = Dataset::new(&settings.images_dir, Subset::Training, VALIDATION_SPLIT)?;
    let dataset_val = Dataset::new(&settings.images_dir, Subset::Validation, VALIDATION_SPLIT)?;
    dataset_train.print();
    dataset_val.print();

    let mut dataloader_train = DataLoader::<Backend>::new(
        dataset_train,
        settings.batch_size,
        true,
        true,
        device
    );
    let mut dataloader_val = DataLoader::<LibTorch>::new(
        dataset_val,
        settings.batch_size,
        false,
        false,
        device
    );

    let (model, history) = train::train_model(
        model,
        &mut dataloader_train,
        &mut dataloader_val,
        settings.epochs,
        settings.learning_rate
    )?;

    report::write_reports(&history, Path::new("."))?;
    report::save_weights(&model, weights_file.as_deref())?;

    let result = eval::evaluate(&model, &mut dataloader_val)?;
    eval::route_files(&result, &settings.correct_dir(), &settings.wrong_dir())?;

    info!("Done");
    Ok(())
}
