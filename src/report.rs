use std::path::{Path, PathBuf};

use plotters::prelude::*;

use crate::error::{ErrorKind, Tagged};

const PLOT_SIZE: (u32, u32) = (800, 600);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochMetrics {
    /// 1-based.
    pub epoch: usize,
    pub train_accuracy: f64,
    pub train_loss: f64,
    pub valid_accuracy: f64,
    pub valid_loss: f64,
    /// Whether this epoch overwrote the checkpoint.
    pub checkpointed: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingReport {
    epochs: Vec<EpochMetrics>,
}

impl TrainingReport {
    pub fn push(&mut self, metrics: EpochMetrics) {
        self.epochs.push(metrics);
    }

    pub fn epochs(&self) -> &[EpochMetrics] {
        &self.epochs
    }

    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    pub fn train_accuracy(&self) -> Vec<f64> {
        self.series(|m| m.train_accuracy)
    }

    pub fn valid_accuracy(&self) -> Vec<f64> {
        self.series(|m| m.valid_accuracy)
    }

    pub fn train_loss(&self) -> Vec<f64> {
        self.series(|m| m.train_loss)
    }

    pub fn valid_loss(&self) -> Vec<f64> {
        self.series(|m| m.valid_loss)
    }

    /// Epoch with the highest validation accuracy, first one on ties.
    pub fn best_epoch(&self) -> Option<&EpochMetrics> {
        self.epochs
            .iter()
            .fold(None, |best: Option<&EpochMetrics>, m| match best {
                Some(b) if m.valid_accuracy <= b.valid_accuracy => Some(b),
                _ => Some(m),
            })
    }

    fn series(&self, f: impl Fn(&EpochMetrics) -> f64) -> Vec<f64> {
        self.epochs.iter().map(f).collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("nothing to plot: the report has no epochs")]
    Empty,
    #[error("failed to draw {path}: {message}")]
    Draw { path: PathBuf, message: String },
}

impl Tagged for ReportError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::InternalFailure
    }
}

struct Panel<'a> {
    title: &'a str,
    y_desc: &'a str,
    train_label: &'a str,
    valid_label: &'a str,
    train: Vec<f64>,
    valid: Vec<f64>,
}

/// Write two stacked charts (accuracy over loss) to `path` as PNG.
///
/// Titles, axes and legends need a system font; when none can be loaded the
/// curves are drawn unlabeled instead of failing the whole run.
pub fn save_plot(report: &TrainingReport, path: &Path) -> Result<(), ReportError> {
    if report.is_empty() {
        return Err(ReportError::Empty);
    }

    if let Err(err) = draw(report, path, true) {
        tracing::warn!("Falling back to an unlabeled plot: {err}");
        draw(report, path, false)?;
    }
    tracing::info!("Training history plot written to {}", path.display());
    Ok(())
}

fn draw(report: &TrainingReport, path: &Path, labeled: bool) -> Result<(), ReportError> {
    let draw_err = |err: &dyn std::fmt::Display| ReportError::Draw {
        path: path.to_path_buf(),
        message: err.to_string(),
    };

    let panels = [
        Panel {
            title: "Training and Validation Accuracy",
            y_desc: "Accuracy",
            train_label: "Training Accuracy",
            valid_label: "Validation Accuracy",
            train: report.train_accuracy(),
            valid: report.valid_accuracy(),
        },
        Panel {
            title: "Training and Validation Loss",
            y_desc: "Loss",
            train_label: "Training Loss",
            valid_label: "Validation Loss",
            train: report.train_loss(),
            valid: report.valid_loss(),
        },
    ];

    let root = BitMapBackend::new(path, PLOT_SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(|e| draw_err(&e))?;
    let areas = root.split_evenly((2, 1));

    let epochs = report.len() as f64;
    for (area, panel) in areas.iter().zip(panels.iter()) {
        let y_max = panel
            .train
            .iter()
            .chain(panel.valid.iter())
            .copied()
            .filter(|v| v.is_finite())
            .fold(1.0_f64, f64::max);

        let mut builder = ChartBuilder::on(area);
        builder.margin(10);
        if labeled {
            builder
                .caption(panel.title, ("sans-serif", 18))
                .x_label_area_size(30)
                .y_label_area_size(50);
        }
        let mut chart = builder
            .build_cartesian_2d(1.0..epochs.max(2.0), 0.0..y_max * 1.05)
            .map_err(|e| draw_err(&e))?;

        if labeled {
            chart
                .configure_mesh()
                .x_desc("Epoch")
                .y_desc(panel.y_desc)
                .draw()
                .map_err(|e| draw_err(&e))?;
        }

        for (values, label, color) in [
            (&panel.train, panel.train_label, BLUE),
            (&panel.valid, panel.valid_label, RED),
        ] {
            let series = chart
                .draw_series(LineSeries::new(
                    values
                        .iter()
                        .enumerate()
                        .map(|(idx, value)| (idx as f64 + 1.0, *value)),
                    color.stroke_width(2),
                ))
                .map_err(|e| draw_err(&e))?;
            if labeled {
                series
                    .label(label)
                    .legend(move |(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], color));
            }
        }

        if labeled {
            chart
                .configure_series_labels()
                .background_style(WHITE.mix(0.8))
                .border_style(BLACK)
                .draw()
                .map_err(|e| draw_err(&e))?;
        }
    }

    root.present().map_err(|e| draw_err(&e))
}
