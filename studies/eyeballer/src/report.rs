//! Training charts, history export and weight persistence.
//!
//! Charts are PNG plots on a white background: title on top, "Epoch" under the x
//! axis, the metric name rotated along the y axis, tick values on both axes, train
//! curve in blue and validation curve in orange, and a "Train"/"Validation" legend
//! in the upper-left corner of the plot area.

use std::path::Path;

use ab_glyph::{ FontRef, PxScale };
use anyhow::{ anyhow, Context, Result };
use burn::tensor::backend::AutodiffBackend;
use image::{ imageops, Rgb, RgbImage };
use imageproc::{
    drawing::{
        draw_filled_circle_mut,
        draw_filled_rect_mut,
        draw_hollow_rect_mut,
        draw_line_segment_mut,
        draw_text_mut,
        text_size,
    },
    rect::Rect,
};
use tracing::{ info, warn };

use crate::model::Model;
use crate::train::TrainingHistory;

pub const ACCURACY_CHART: &str = "accuracy.png";
pub const LOSS_CHART: &str = "loss.png";
pub const HISTORY_CSV: &str = "history.csv";

/// Title and y axis caption of one chart.
#[derive(Debug, Clone, Copy)]
pub struct ChartLabels {
    pub title: &'static str,
    pub y_label: &'static str,
}

pub const ACCURACY_LABELS: ChartLabels = ChartLabels {
    title: "Model accuracy",
    y_label: "Accuracy",
};
pub const LOSS_LABELS: ChartLabels = ChartLabels { title: "Model loss", y_label: "Loss" };
const X_LABEL: &str = "Epoch";
const LEGEND: [&str; 2] = ["Train", "Validation"];

const FONT: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;
const LEFT: u32 = 80;
const RIGHT: u32 = 24;
const TOP: u32 = 48;
const BOTTOM: u32 = 64;
const MAX_X_TICKS: usize = 10;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const AXIS: Rgb<u8> = Rgb([44, 62, 80]);
const GRID: Rgb<u8> = Rgb([230, 230, 230]);
pub const TRAIN_COLOR: Rgb<u8> = Rgb([31, 119, 180]);
pub const VALIDATION_COLOR: Rgb<u8> = Rgb([255, 127, 14]);

/// Writes `accuracy.png`, `loss.png` and `history.csv` into `out_dir`, replacing older copies.
pub fn write_reports(history: &TrainingHistory, out_dir: &Path) -> Result<()> {
    if history.is_empty() {
        warn!("No epochs were run, charts will have no curves");
    }

    let accuracy = [
        history.series(|r| r.train_accuracy),
        history.series(|r| r.val_accuracy),
    ];
    let loss = [history.series(|r| r.train_loss), history.series(|r| r.val_loss)];

    save_chart(&accuracy, &ACCURACY_LABELS, &out_dir.join(ACCURACY_CHART))?;
    save_chart(&loss, &LOSS_LABELS, &out_dir.join(LOSS_CHART))?;
    write_history_csv(history, &out_dir.join(HISTORY_CSV))?;
    info!("{} epochs written to {}", history.len(), HISTORY_CSV);
    Ok(())
}

/// Persists the head when a weights file was requested.
pub fn save_weights<B: AutodiffBackend>(model: &Model<B>, weights: Option<&Path>) -> Result<()> {
    if let Some(path) = weights {
        info!("Saving model to {}", path.display());
        model.head.save(path)?;
        info!("Model saved");
    }
    Ok(())
}

pub fn write_history_csv(history: &TrainingHistory, path: &Path) -> Result<()> {
    let mut writer = csv::Writer
        ::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for record in history.records() {
        writer.serialize(record)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn save_chart(series: &[Vec<(f64, f64)>; 2], labels: &ChartLabels, path: &Path) -> Result<()> {
    render_chart(series, labels)?
        .save(path)
        .with_context(|| format!("failed to write chart {}", path.display()))?;
    info!("Chart written to {}", path.display());
    Ok(())
}

fn chart_font() -> Result<FontRef<'static>> {
    FontRef::try_from_slice(FONT).map_err(|err| anyhow!("invalid chart font: {err}"))
}

/// Tick spacing of the y axis and the number of divisions reaching `max`.
///
/// The spacing is 1, 2, 2.5 or 5 times a power of ten, so that at most five
/// divisions cover the data.
pub fn y_axis(max: f64) -> (f64, usize) {
    let max = if max.is_finite() && max > 0.0 { max } else { 1.0 };
    let raw = max / 5.0;
    let magnitude = (10f64).powf(raw.log10().floor());
    let step = [1.0, 2.0, 2.5, 5.0, 10.0]
        .into_iter()
        .map(|m| m * magnitude)
        .find(|step| *step >= raw * (1.0 - 1e-9))
        .unwrap_or(10.0 * magnitude);
    let divisions = (max / step - 1e-9).ceil().max(1.0) as usize;
    (step, divisions)
}

fn tick_label(value: f64) -> String {
    let text = format!("{value:.3}");
    let text = text.trim_end_matches('0').trim_end_matches('.');
    if text.is_empty() || text == "-" { "0".to_string() } else { text.to_string() }
}

/// Area of the legend, drawn over the curves.
pub fn legend_box() -> Rect {
    Rect::at((LEFT + 8) as i32, (TOP + 8) as i32).of_size(120, 44)
}

/// Plots the train and validation series. Non-finite points are left out.
pub fn render_chart(series: &[Vec<(f64, f64)>; 2], labels: &ChartLabels) -> Result<RgbImage> {
    let font = chart_font()?;
    let mut img = RgbImage::from_pixel(WIDTH, HEIGHT, BACKGROUND);

    let points: Vec<(f64, f64)> = series
        .iter()
        .flatten()
        .copied()
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .collect();
    let x_max = points
        .iter()
        .map(|(x, _)| *x)
        .fold(1.0, f64::max);
    let y_max = points
        .iter()
        .map(|(_, y)| *y)
        .fold(0.0, f64::max);
    let (y_step, y_divisions) = y_axis(y_max);
    let y_top = y_step * (y_divisions as f64);
    let x_span = (x_max - 1.0).max(1.0);

    let left = LEFT as f32;
    let right = (WIDTH - RIGHT) as f32;
    let top = TOP as f32;
    let bottom = (HEIGHT - BOTTOM) as f32;

    let small = PxScale::from(13.0);
    for i in 0..=y_divisions {
        let value = y_step * (i as f64);
        let y = bottom - ((value / y_top) as f32) * (bottom - top);
        draw_line_segment_mut(&mut img, (left, y), (right, y), GRID);
        draw_line_segment_mut(&mut img, (left - 4.0, y), (left, y), AXIS);

        let text = tick_label(value);
        let (w, h) = text_size(small, &font, &text);
        let (tx, ty) = ((LEFT as i32) - 8 - (w as i32), (y as i32) - (h as i32) / 2);
        draw_text_mut(&mut img, AXIS, tx, ty, small, &font, &text);
    }

    let x_every = ((x_max as usize) + MAX_X_TICKS - 1) / MAX_X_TICKS;
    let mut epoch = 1;
    while (epoch as f64) <= x_max {
        let x = left + (((epoch as f64) - 1.0) / x_span) as f32 * (right - left);
        draw_line_segment_mut(&mut img, (x, bottom), (x, bottom + 4.0), AXIS);

        let text = epoch.to_string();
        let (w, _) = text_size(small, &font, &text);
        let (tx, ty) = ((x as i32) - (w as i32) / 2, (bottom as i32) + 8);
        draw_text_mut(&mut img, AXIS, tx, ty, small, &font, &text);
        epoch += x_every.max(1);
    }

    draw_line_segment_mut(&mut img, (left, bottom), (right, bottom), AXIS);
    draw_line_segment_mut(&mut img, (left, top), (left, bottom), AXIS);

    let project = |(x, y): (f64, f64)| -> (f32, f32) {
        (
            left + (((x - 1.0) / x_span) as f32) * (right - left),
            bottom - ((y / y_top) as f32) * (bottom - top),
        )
    };

    for (values, color) in series.iter().zip([TRAIN_COLOR, VALIDATION_COLOR]) {
        let visible: Vec<(f32, f32)> = values
            .iter()
            .copied()
            .filter(|(x, y)| x.is_finite() && y.is_finite())
            .map(project)
            .collect();

        for pair in visible.windows(2) {
            draw_line_segment_mut(&mut img, pair[0], pair[1], color);
        }
        for &(x, y) in &visible {
            draw_filled_circle_mut(&mut img, (x as i32, y as i32), 3, color);
        }
    }

    let title = PxScale::from(20.0);
    let (w, _) = text_size(title, &font, labels.title);
    draw_text_mut(&mut img, AXIS, ((WIDTH - w) / 2) as i32, 14, title, &font, labels.title);

    let caption = PxScale::from(15.0);
    let (w, _) = text_size(caption, &font, X_LABEL);
    let x_center = LEFT + (WIDTH - LEFT - RIGHT) / 2;
    let (tx, ty) = ((x_center - w / 2) as i32, (HEIGHT - 28) as i32);
    draw_text_mut(&mut img, AXIS, tx, ty, caption, &font, X_LABEL);

    let (w, h) = text_size(caption, &font, labels.y_label);
    let mut y_caption = RgbImage::from_pixel(w + 4, h + 6, BACKGROUND);
    draw_text_mut(&mut y_caption, AXIS, 2, 2, caption, &font, labels.y_label);
    let y_caption = imageops::rotate270(&y_caption);
    let y_center = TOP + (HEIGHT - TOP - BOTTOM) / 2;
    let ty = (y_center as i64) - (y_caption.height() as i64) / 2;
    imageops::overlay(&mut img, &y_caption, 8, ty);

    let legend = legend_box();
    draw_filled_rect_mut(&mut img, legend, BACKGROUND);
    draw_hollow_rect_mut(&mut img, legend, GRID);
    for (i, (name, color)) in LEGEND.iter().zip([TRAIN_COLOR, VALIDATION_COLOR]).enumerate() {
        let row = legend.top() + 8 + (i as i32) * 18;
        let swatch = Rect::at(legend.left() + 8, row + 2).of_size(24, 10);
        draw_filled_rect_mut(&mut img, swatch, color);
        draw_text_mut(&mut img, AXIS, legend.left() + 40, row, small, &font, name);
    }

    Ok(img)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::train::EpochRecord;
    use image::GenericImageView;

    fn history(epochs: usize) -> TrainingHistory {
        let mut history = TrainingHistory::default();
        for epoch in 1..=epochs {
            history.push(EpochRecord {
                epoch,
                train_loss: 1.0 / (epoch as f64),
                train_accuracy: 0.5 + (epoch as f64) / 100.0,
                val_loss: 1.2 / (epoch as f64),
                val_accuracy: 0.5,
            });
        }
        history
    }

    fn count(img: &RgbImage, color: Rgb<u8>) -> usize {
        img.pixels()
            .filter(|p| **p == color)
            .count()
    }

    fn inside(rect: &Rect, x: u32, y: u32) -> bool {
        let (x, y) = (x as i32, y as i32);
        x >= rect.left() && x <= rect.right() && y >= rect.top() && y <= rect.bottom()
    }

    /// Pixels of `color` outside the legend.
    fn curve_pixels(img: &RgbImage, color: Rgb<u8>) -> usize {
        let legend = legend_box();
        img.enumerate_pixels()
            .filter(|(x, y, p)| **p == color && !inside(&legend, *x, *y))
            .count()
    }

    /// Non-background pixels inside `rect`.
    fn ink(img: &RgbImage, rect: Rect) -> usize {
        img.enumerate_pixels()
            .filter(|(x, y, p)| inside(&rect, *x, *y) && **p != BACKGROUND)
            .count()
    }

    #[test]
    fn empty_history_draws_no_curves() {
        let history = history(0);
        let img = render_chart(
            &[history.series(|r| r.train_loss), history.series(|r| r.val_loss)],
            &LOSS_LABELS
        ).unwrap();
        assert_eq!(img.dimensions(), (WIDTH, HEIGHT));
        assert_eq!(curve_pixels(&img, TRAIN_COLOR), 0);
        assert_eq!(curve_pixels(&img, VALIDATION_COLOR), 0);
        assert!(count(&img, TRAIN_COLOR) > 0, "legend swatch is always drawn");
    }

    #[test]
    fn both_curves_are_drawn() {
        let history = history(5);
        let img = render_chart(
            &[history.series(|r| r.train_accuracy), history.series(|r| r.val_accuracy)],
            &ACCURACY_LABELS
        ).unwrap();
        assert!(curve_pixels(&img, TRAIN_COLOR) > 0);
        assert!(curve_pixels(&img, VALIDATION_COLOR) > 0);
    }

    #[test]
    fn nan_points_are_skipped() {
        let nan = vec![(1.0, f64::NAN), (2.0, f64::NAN)];
        let img = render_chart(&[nan.clone(), nan], &LOSS_LABELS).unwrap();
        assert_eq!(curve_pixels(&img, TRAIN_COLOR), 0);
    }

    #[test]
    fn captions_and_ticks_are_rendered() {
        let history = history(3);
        let img = render_chart(
            &[history.series(|r| r.train_loss), history.series(|r| r.val_loss)],
            &LOSS_LABELS
        ).unwrap();

        let title_band = Rect::at(LEFT as i32, 0).of_size(WIDTH - LEFT - RIGHT, TOP - 8);
        let x_caption = Rect::at(LEFT as i32, (HEIGHT - 30) as i32)
            .of_size(WIDTH - LEFT - RIGHT, 28);
        let y_caption = Rect::at(0, TOP as i32).of_size(30, HEIGHT - TOP - BOTTOM);
        let y_ticks = Rect::at(30, TOP as i32).of_size(LEFT - 40, HEIGHT - TOP - BOTTOM);
        let x_ticks = Rect::at(LEFT as i32, (HEIGHT - BOTTOM + 6) as i32)
            .of_size(WIDTH - LEFT - RIGHT, 20);
        for (name, rect) in [
            ("title", title_band),
            ("x caption", x_caption),
            ("y caption", y_caption),
            ("y ticks", y_ticks),
            ("x ticks", x_ticks),
        ] {
            assert!(ink(&img, rect) > 0, "{name} missing");
        }
    }

    #[test]
    fn y_axis_follows_the_data() {
        // the largest loss reaches the top gridline instead of being squashed under 1.0
        let series = [vec![(1.0, 3.0), (2.0, 1.5)], vec![(1.0, 2.0), (2.0, 1.0)]];
        let img = render_chart(&series, &LOSS_LABELS).unwrap();
        let near_top = img
            .enumerate_pixels()
            .filter(|(_, y, p)| **p == TRAIN_COLOR && y.abs_diff(TOP) <= 3)
            .count();
        assert!(near_top > 0);

        let small = [vec![(1.0, 0.04)], vec![(1.0, 0.02)]];
        let img = render_chart(&small, &LOSS_LABELS).unwrap();
        let near_top = img
            .enumerate_pixels()
            .filter(|(x, y, p)| **p == TRAIN_COLOR && y.abs_diff(TOP) <= 3 && *x <= LEFT + 3)
            .count();
        assert!(near_top > 0);
    }

    #[test]
    fn y_axis_steps_are_round() {
        let (step, divisions) = y_axis(3.0);
        assert!((step - 1.0).abs() < 1e-12 && divisions == 3);
        let (step, divisions) = y_axis(1.2);
        assert!((step - 0.25).abs() < 1e-12 && divisions == 5);
        let (step, divisions) = y_axis(0.55);
        assert!((step - 0.2).abs() < 1e-12 && divisions == 3);
        let (step, divisions) = y_axis(f64::NAN);
        assert!((step - 0.2).abs() < 1e-12 && divisions == 5);
        assert_eq!(tick_label(0.25), "0.25");
        assert_eq!(tick_label(2.0), "2");
        assert_eq!(tick_label(0.0), "0");
    }

    #[test]
    fn zero_epochs_still_write_every_report() {
        let dir = tempfile::tempdir().unwrap();
        write_reports(&history(0), dir.path()).unwrap();

        assert!(dir.path().join(ACCURACY_CHART).is_file());
        assert!(dir.path().join(LOSS_CHART).is_file());
        let csv = std::fs::read_to_string(dir.path().join(HISTORY_CSV)).unwrap();
        assert!(csv.lines().count() <= 1);
    }

    #[test]
    fn reports_overwrite_fixed_file_names() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(LOSS_CHART), b"stale").unwrap();

        write_reports(&history(3), dir.path()).unwrap();

        for name in [ACCURACY_CHART, LOSS_CHART] {
            let img = image::open(dir.path().join(name)).unwrap();
            assert_eq!(img.width(), WIDTH);
        }
        let csv = std::fs::read_to_string(dir.path().join(HISTORY_CSV)).unwrap();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("epoch,train_loss,train_accuracy,val_loss,val_accuracy"));
        assert_eq!(lines.count(), 3);
    }
}
