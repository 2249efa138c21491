use std::path::Path;

use anyhow::{ anyhow, bail, Result };
use burn::{
    module::AutodiffModule,
    nn::{
        conv::{ Conv2d, Conv2dConfig },
        pool::{ MaxPool2d, MaxPool2dConfig },
        BatchNorm,
        BatchNormConfig,
        Dropout,
        DropoutConfig,
        Linear,
        LinearConfig,
        PaddingConfig2d,
        Relu,
    },
    prelude::*,
    record::{ FullPrecisionSettings, NamedMpkFileRecorder, Recorder },
    tensor::{ activation::sigmoid, backend::AutodiffBackend },
};
use burn_import::pytorch::{ LoadArgs, PyTorchFileRecorder };
use tracing::info;

/// Strength of the L2 penalty on the head's convolution and hidden kernels.
pub const L2_FACTOR: f64 = 0.01;
const DROPOUT: f64 = 0.2;
const HIDDEN_UNITS: usize = 4;
const HIDDEN_LAYERS: usize = 3;
/// Channels of the last MobileNet feature map.
const FEATURES: usize = 1024;
/// 7x7 features -> 2x2 valid conv -> 6x6 -> 2x2 pooling -> 3x3, times 3 filters
const HEAD_FLAT: usize = 3 * 3 * 3;

/// (output channels, stride) of the 13 depthwise separable blocks of MobileNet v1
const BLOCKS: [(usize, usize); 13] = [
    (64, 1),
    (128, 2),
    (128, 1),
    (256, 2),
    (256, 1),
    (512, 2),
    (512, 1),
    (512, 1),
    (512, 1),
    (512, 1),
    (512, 1),
    (1024, 2),
    (1024, 1),
];

/// Blocks per stage in timm's `mobilenetv1_100` state dict (`blocks.<stage>.<index>`).
/// Flattened in order they line up with `BLOCKS`.
const TIMM_STAGES: [usize; 5] = [1, 2, 2, 6, 2];

/// Regex rules renaming a timm MobileNet v1 state dict onto `MobileNet`'s field paths.
///
/// Every source key matches exactly one rule and no renamed key matches any rule.
/// Batch norm `weight`/`bias` are mapped to `gamma`/`beta` by the importer itself.
pub fn timm_key_remap() -> Vec<(String, String)> {
    let mut rules = vec![
        (r"^conv_stem\.(.+)$".to_string(), "stem.conv.$1".to_string()),
        (r"^bn1\.(.+)$".to_string(), "stem.norm.$1".to_string())
    ];

    let mut flat = 0;
    for (stage, blocks) in TIMM_STAGES.iter().enumerate() {
        for index in 0..*blocks {
            for (timm, field) in [
                ("conv_dw", "depthwise.conv"),
                ("bn1", "depthwise.norm"),
                ("conv_pw", "pointwise.conv"),
                ("bn2", "pointwise.norm"),
            ] {
                rules.push((
                    format!(r"^blocks\.{stage}\.{index}\.{timm}\.(.+)$"),
                    format!("blocks.{flat}.{field}.$1"),
                ));
            }
            flat += 1;
        }
    }
    rules
}

/// Convolution, batch norm and ReLU6
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
}

impl<B: Backend> ConvBlock<B> {
    fn new(
        channels: [usize; 2],
        kernel: usize,
        stride: usize,
        groups: usize,
        device: &B::Device
    ) -> Self {
        let padding = if kernel == 1 {
            PaddingConfig2d::Valid
        } else {
            PaddingConfig2d::Explicit(kernel / 2, kernel / 2)
        };
        let conv = Conv2dConfig::new(channels, [kernel, kernel])
            .with_stride([stride, stride])
            .with_padding(padding)
            .with_groups(groups)
            .with_bias(false)
            .init(device);
        let norm = BatchNormConfig::new(channels[1]).with_epsilon(1e-3).init(device);

        Self { conv, norm }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.norm.forward(self.conv.forward(x)).clamp(0.0, 6.0)
    }
}

#[derive(Module, Debug)]
pub struct DepthwiseSeparable<B: Backend> {
    depthwise: ConvBlock<B>,
    pointwise: ConvBlock<B>,
}

impl<B: Backend> DepthwiseSeparable<B> {
    fn new(c_in: usize, c_out: usize, stride: usize, device: &B::Device) -> Self {
        Self {
            depthwise: ConvBlock::new([c_in, c_in], 3, stride, c_in, device),
            pointwise: ConvBlock::new([c_in, c_out], 1, 1, 1, device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.pointwise.forward(self.depthwise.forward(x))
    }
}

/// MobileNet v1 (alpha 1.0) without its classification top.
/// Maps `[batch, 224, 224, 3]` images to `[batch, 1024, 7, 7]` features.
#[derive(Module, Debug)]
pub struct MobileNet<B: Backend> {
    stem: ConvBlock<B>,
    blocks: Vec<DepthwiseSeparable<B>>,
}

impl<B: Backend> MobileNet<B> {
    /// Randomly initialized backbone.
    pub fn new(device: &B::Device) -> Self {
        let stem = ConvBlock::new([3, 32], 3, 2, 1, device);
        let mut c_in = 32;
        let mut blocks = Vec::with_capacity(BLOCKS.len());
        for (c_out, stride) in BLOCKS {
            blocks.push(DepthwiseSeparable::new(c_in, c_out, stride, device));
            c_in = c_out;
        }

        Self { stem, blocks }
    }

    /// Backbone with pretrained parameters, from a burn `.mpk` record or a timm
    /// MobileNet v1 `.pt`/`.pth` state dict. A PyTorch checkpoint is also written next
    /// to itself as `.mpk` the first time it is read.
    pub fn new_with_pretrained(device: &B::Device, path: &Path) -> Result<Self> {
        if !path.is_file() {
            bail!("pretrained backbone not found at {}", path.display());
        }

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or_default();
        let model = match extension {
            "pt" | "pth" => {
                let args = timm_key_remap()
                    .iter()
                    .fold(LoadArgs::new(path.to_path_buf()), |args, (pattern, replacement)| {
                        args.with_key_remap(pattern, replacement)
                    });
                let record: MobileNetRecord<B> = PyTorchFileRecorder::<FullPrecisionSettings>
                    ::default()
                    .load(args, device)
                    .map_err(|err| anyhow!("failed to load backbone {}: {err:?}", path.display()))?;
                let model = Self::new(device).load_record(record);

                let converted = path.with_extension("mpk");
                if !converted.exists() {
                    let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
                    model
                        .clone()
                        .save_file(converted.clone(), &recorder)
                        .map_err(|err|
                            anyhow!("failed to write {}: {err:?}", converted.display())
                        )?;
                    info!("Converted backbone written to {}", converted.display());
                }
                model
            }
            _ => {
                let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
                Self::new(device)
                    .load_file(path.to_path_buf(), &recorder, device)
                    .map_err(|err| anyhow!("failed to load backbone {}: {err:?}", path.display()))?
            }
        };
        info!("Loaded backbone from {}", path.display());

        Ok(model)
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = x.permute([0, 3, 1, 2]); // NHWC -> NCHW
        self.blocks.iter().fold(self.stem.forward(x), |x, block| block.forward(x))
    }
}

/// The trainable part: conv, pooling, three small dense layers and a sigmoid unit.
#[derive(Module, Debug)]
pub struct ClassifierHead<B: Backend> {
    conv: Conv2d<B>,
    pool: MaxPool2d,
    hidden: Vec<Linear<B>>,
    output: Linear<B>,
    dropout: Dropout,
    activation: Relu,
}

impl<B: Backend> ClassifierHead<B> {
    pub fn new(device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([FEATURES, 3], [2, 2]).init(device);
        let pool = MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init();

        let mut hidden = Vec::with_capacity(HIDDEN_LAYERS);
        let mut d_in = HEAD_FLAT;
        for _ in 0..HIDDEN_LAYERS {
            hidden.push(LinearConfig::new(d_in, HIDDEN_UNITS).init(device));
            d_in = HIDDEN_UNITS;
        }

        Self {
            conv,
            pool,
            hidden,
            output: LinearConfig::new(HIDDEN_UNITS, 1).init(device),
            dropout: DropoutConfig::new(DROPOUT).init(),
            activation: Relu::new(),
        }
    }

    /// `[batch, 1024, 7, 7]` features to `[batch, 1]` probabilities
    pub fn forward(&self, features: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.pool.forward(self.conv.forward(features));
        let x = self.dropout.forward(x);
        let x: Tensor<B, 2> = x.flatten(1, 3);

        let x = self.hidden
            .iter()
            .fold(x, |x, layer| self.dropout.forward(self.activation.forward(layer.forward(x))));

        sigmoid(self.output.forward(x))
    }

    /// `L2_FACTOR * sum(w^2)` over the regularized kernels (biases and output layer excluded)
    pub fn l2_penalty(&self) -> Tensor<B, 1> {
        let conv = self.conv.weight.val().powf_scalar(2.0).sum();
        self.hidden
            .iter()
            .fold(conv, |acc, layer| acc + layer.weight.val().powf_scalar(2.0).sum())
            .mul_scalar(L2_FACTOR)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        self.clone()
            .save_file(path.to_path_buf(), &recorder)
            .map_err(|err| anyhow!("failed to save weights to {}: {err:?}", path.display()))
    }

    pub fn load(self, path: &Path, device: &B::Device) -> Result<Self> {
        let recorder = NamedMpkFileRecorder::<FullPrecisionSettings>::new();
        self.load_file(path.to_path_buf(), &recorder, device).map_err(|err|
            anyhow!("failed to load weights from {}: {err:?}", path.display())
        )
    }
}

/// Frozen backbone plus trainable head.
///
/// The backbone lives on the inner (non-autodiff) backend: it never takes part in
/// the gradient graph and its batch norms always use their running statistics.
pub struct Model<B: AutodiffBackend> {
    pub backbone: MobileNet<B::InnerBackend>,
    pub head: ClassifierHead<B>,
}

impl<B: AutodiffBackend> Model<B> {
    pub fn new(backbone: MobileNet<B::InnerBackend>, device: &B::Device) -> Self {
        Self {
            backbone,
            head: ClassifierHead::new(device),
        }
    }

    /// Pretrained backbone, plus the head restored from `weights` when that file exists.
    pub fn build(backbone_path: &Path, weights: Option<&Path>, device: &B::Device) -> Result<Self> {
        let backbone = MobileNet::new_with_pretrained(device, backbone_path)?;
        let mut model = Self::new(backbone, device);

        if let Some(weights) = weights {
            if weights.is_file() {
                model.head = model.head.load(weights, device)?;
                info!("Loaded model from file {}", weights.display());
            } else {
                info!("No model to load from file {}", weights.display());
            }
        }

        info!("head {}", model.head);
        info!(
            "parameters: {} frozen, {} trainable",
            model.backbone.num_params(),
            model.head.num_params()
        );
        Ok(model)
    }

    /// Training forward pass; gradients only flow into the head.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let features = self.backbone.forward(images.inner());
        self.head.forward(Tensor::from_inner(features))
    }

    /// Inference without dropout and outside the autodiff graph.
    pub fn predict(&self, images: Tensor<B::InnerBackend, 4>) -> Tensor<B::InnerBackend, 2> {
        self.head.valid().forward(self.backbone.forward(images))
    }
}
