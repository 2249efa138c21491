use std::path::Path;

use anyhow::{ Context, Result };
use burn::{ prelude::Backend, tensor::{ Device, Tensor, TensorData } };
use image::{ imageops::FilterType, DynamicImage, Rgb, RgbImage };
use imageproc::geometric_transformations::{ warp, Interpolation, Projection };
use rand::Rng;

use crate::config::{ IMAGE_HEIGHT, IMAGE_WIDTH };

/// Maximum shear angle, in degrees.
const SHEAR_RANGE: f32 = 0.2;
const ZOOM_RANGE: f32 = 0.2;
/// Same extensions Keras' `flow_from_directory` accepts.
const VALID_EXT: [&str; 7] = ["png", "jpg", "jpeg", "bmp", "ppm", "tif", "tiff"];

pub fn is_image_file(path: &Path) -> bool {
    path.is_file() &&
        path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| VALID_EXT.contains(&ext.to_lowercase().as_str()))
            .unwrap_or(false)
}

/// Reads an image and turns it into a `[224, 224, 3]` tensor, rescaled to [0, 1]
/// and centered on its own mean. Shear and zoom are only drawn when `augmentation` is set.
pub fn load_image_and_resize224<B: Backend>(
    path: &Path,
    device: &Device<B>,
    augmentation: bool
) -> Result<Tensor<B, 3>> {
    let img = image::open(path).with_context(|| format!("failed to read image {}", path.display()))?;
    let img = resize224(&img);
    let img = if augmentation { random_transform(&img, &mut rand::thread_rng()) } else { img };

    Ok(pixels_to_tensor(standardize(&img), device))
}

pub fn resize224(img: &DynamicImage) -> RgbImage {
    img.resize_exact(IMAGE_WIDTH as u32, IMAGE_HEIGHT as u32, FilterType::Nearest).to_rgb8()
}

/// Random shear and zoom around the image center.
pub fn random_transform<R: Rng>(img: &RgbImage, rng: &mut R) -> RgbImage {
    let shear = rng.gen_range(-SHEAR_RANGE..=SHEAR_RANGE).to_radians();
    let zoom_x = rng.gen_range(1.0 - ZOOM_RANGE..=1.0 + ZOOM_RANGE);
    let zoom_y = rng.gen_range(1.0 - ZOOM_RANGE..=1.0 + ZOOM_RANGE);

    match affine(img.width(), img.height(), shear, zoom_x, zoom_y) {
        Some(projection) => warp(img, &projection, Interpolation::Nearest, Rgb([0, 0, 0])),
        None => img.clone(),
    }
}

fn affine(width: u32, height: u32, shear: f32, zoom_x: f32, zoom_y: f32) -> Option<Projection> {
    let (cx, cy) = ((width as f32) / 2.0, (height as f32) / 2.0);
    let shear = Projection::from_matrix([1.0, -shear.sin(), 0.0, 0.0, shear.cos(), 0.0, 0.0, 0.0, 1.0])?;

    Some(
        Projection::translate(cx, cy) *
            shear *
            Projection::scale(zoom_x, zoom_y) *
            Projection::translate(-cx, -cy)
    )
}

/// Rescale to [0, 1] then subtract the sample mean over every pixel and channel.
pub fn standardize(img: &RgbImage) -> Vec<f32> {
    let mut pixels: Vec<f32> = img
        .as_raw()
        .iter()
        .map(|&x| (x as f32) / 255.0)
        .collect();

    if !pixels.is_empty() {
        let mean = pixels.iter().sum::<f32>() / (pixels.len() as f32);
        pixels.iter_mut().for_each(|x| {
            *x -= mean;
        });
    }
    pixels
}

pub fn pixels_to_tensor<B: Backend>(pixels: Vec<f32>, device: &Device<B>) -> Tensor<B, 3> {
    let data = TensorData::new(pixels, [IMAGE_HEIGHT, IMAGE_WIDTH, 3]);
    Tensor::from_data(data, device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{ rngs::StdRng, SeedableRng };

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 128]))
    }

    #[test]
    fn standardized_pixels_have_zero_mean() {
        let pixels = standardize(&gradient(32, 16));
        assert_eq!(pixels.len(), 32 * 16 * 3);
        let mean = pixels.iter().sum::<f32>() / (pixels.len() as f32);
        assert!(mean.abs() < 1e-5, "mean was {mean}");
        assert!(pixels.iter().all(|x| x.abs() <= 1.0));
    }

    #[test]
    fn uniform_image_centers_to_zero() {
        let img = RgbImage::from_pixel(4, 4, Rgb([255, 255, 255]));
        assert!(standardize(&img).iter().all(|&x| x == 0.0));
    }

    #[test]
    fn resize_targets_model_input() {
        let img = DynamicImage::ImageRgb8(gradient(640, 400));
        let resized = resize224(&img);
        assert_eq!(resized.dimensions(), (IMAGE_WIDTH as u32, IMAGE_HEIGHT as u32));
    }

    #[test]
    fn random_transform_keeps_dimensions() {
        let mut rng = StdRng::seed_from_u64(7);
        let img = gradient(224, 224);
        for _ in 0..5 {
            let out = random_transform(&img, &mut rng);
            assert_eq!(out.dimensions(), img.dimensions());
        }
    }

    #[test]
    fn identity_affine_is_a_no_op() {
        let img = gradient(64, 48);
        let projection = affine(64, 48, 0.0, 1.0, 1.0).unwrap();
        let out = warp(&img, &projection, Interpolation::Nearest, Rgb([0, 0, 0]));
        assert_eq!(out, img);
    }

    #[test]
    fn filters_image_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let png = dir.path().join("shot.PNG");
        let ppm = dir.path().join("shot.ppm");
        let txt = dir.path().join("notes.txt");
        let gif = dir.path().join("anim.gif");
        for path in [&png, &ppm, &txt, &gif] {
            std::fs::write(path, b"").unwrap();
        }
        assert!(is_image_file(&png));
        assert!(is_image_file(&ppm));
        assert!(!is_image_file(&txt));
        assert!(!is_image_file(&gif));
        assert!(!is_image_file(dir.path()));
    }
}
