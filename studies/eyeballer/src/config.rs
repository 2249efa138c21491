use std::path::PathBuf;

use clap::Parser;

/// Fraction of every class directory held out for validation.
pub const VALIDATION_SPLIT: f64 = 0.2;
pub const IMAGE_WIDTH: usize = 224;
pub const IMAGE_HEIGHT: usize = 224;

/// Give those screenshots of yours a quick eyeballing
#[derive(Parser, Debug, Clone)]
#[command(name = "eyeballer", version, about)]
pub struct Settings {
    /// Weights file for input/output
    #[arg(long = "modelfile", value_name = "PATH")]
    pub weights_path: Option<PathBuf>,

    /// Batch size
    #[arg(long = "batchsize", default_value_t = 32, value_parser = parse_batch_size)]
    pub batch_size: usize,

    /// Number of epochs
    #[arg(long = "epochs", default_value_t = 20)]
    pub epochs: usize,

    /// Labeled images, one subdirectory per class
    #[arg(long = "images", value_name = "DIR", default_value = "images")]
    pub images_dir: PathBuf,

    /// Destination of the correct/ and wrong/ folders
    #[arg(long = "confusion", value_name = "DIR", default_value = "confusion")]
    pub confusion_dir: PathBuf,

    /// Pretrained MobileNet backbone (.mpk, .pt or .pth)
    #[arg(long = "backbone", value_name = "PATH", default_value = "weights/mobilenet.mpk")]
    pub backbone_path: PathBuf,

    /// RMSprop learning rate
    #[arg(long = "learning-rate", default_value_t = 1e-3)]
    pub learning_rate: f64,

    /// Log at debug level
    #[arg(short, long)]
    pub verbose: bool,
}

fn parse_batch_size(value: &str) -> Result<usize, String> {
    let size: usize = value.parse().map_err(|err| format!("{value} is not a number: {err}"))?;
    if size == 0 {
        return Err("batch size must be at least 1".to_string());
    }
    Ok(size)
}

impl Settings {
    /// Weights file as the recorder writes it. The recorder always uses the `.mpk`
    /// extension, so `weights.h5` is read from and written to `weights.mpk`.
    pub fn weights_file(&self) -> Option<PathBuf> {
        self.weights_path.as_ref().map(|path| path.with_extension("mpk"))
    }

    pub fn correct_dir(&self) -> PathBuf {
        self.confusion_dir.join("correct")
    }

    pub fn wrong_dir(&self) -> PathBuf {
        self.confusion_dir.join("wrong")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_original_script() {
        let settings = Settings::try_parse_from(["eyeballer"]).unwrap();
        assert_eq!(settings.batch_size, 32);
        assert_eq!(settings.epochs, 20);
        assert!(settings.weights_path.is_none());
        assert!(settings.weights_file().is_none());
        assert_eq!(settings.images_dir, PathBuf::from("images"));
        assert_eq!(settings.correct_dir(), PathBuf::from("confusion/correct"));
        assert_eq!(settings.wrong_dir(), PathBuf::from("confusion/wrong"));
    }

    #[test]
    fn parses_all_flags() {
        let settings = Settings::try_parse_from([
            "eyeballer",
            "--modelfile",
            "out/weights.h5",
            "--batchsize",
            "8",
            "--epochs",
            "0",
        ]).unwrap();
        assert_eq!(settings.batch_size, 8);
        assert_eq!(settings.epochs, 0);
        assert_eq!(settings.weights_file(), Some(PathBuf::from("out/weights.mpk")));
    }

    #[test]
    fn rejects_malformed_numbers() {
        assert!(Settings::try_parse_from(["eyeballer", "--batchsize", "0"]).is_err());
        assert!(Settings::try_parse_from(["eyeballer", "--batchsize", "many"]).is_err());
        assert!(Settings::try_parse_from(["eyeballer", "--epochs", "-1"]).is_err());
    }
}
