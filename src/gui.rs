use std::{
    path::PathBuf,
    sync::mpsc::{self, Receiver, TryRecvError},
    thread,
    time::Duration,
};

use burn::tensor::backend::AutodiffBackend;
use eframe::{egui, App, Frame};
use egui::{load::SizedTexture, Color32, ColorImage, RichText, TextureHandle, TextureOptions};
use image::RgbImage;
use rfd::FileDialog;

use crate::{
    config::AppConfig,
    controller::{Command, LogEntry, LogLevel, Selection, Session},
    preprocess::TEST_IMAGE_EXTENSIONS,
    report::EpochMetrics,
    training::CHECKPOINT_EXTENSION,
};

pub const APP_TITLE: &str = "CNN Image Classifier";
pub const INITIAL_WINDOW_SIZE: [f32; 2] = [760.0, 620.0];

const RESULT_TEXT_SIZE: f32 = 14.0;

/// A command running on a worker thread; it owns the session until it ends.
struct Pending<B: AutodiffBackend> {
    label: String,
    is_training: bool,
    receiver: Receiver<(Session<B>, LogEntry)>,
}

pub struct ClassifierApp<B: AutodiffBackend> {
    session: Option<Session<B>>,
    pending: Option<Pending<B>>,
    progress: Receiver<EpochMetrics>,
    last_epoch: Option<EpochMetrics>,
    epochs: usize,
    epochs_requested: usize,
    min_epochs: usize,
    max_epochs: usize,
    log: Vec<LogEntry>,
    preview: Option<(PathBuf, TextureHandle)>,
    history: Option<TextureHandle>,
    show_history: bool,
}

impl<B: AutodiffBackend> ClassifierApp<B>
where
    Session<B>: Send + 'static,
{
    pub fn new(config: AppConfig, device: B::Device) -> Self {
        let (sink, progress) = mpsc::channel();
        let epochs = config.clamp_epochs(config.default_epochs);
        let (min_epochs, max_epochs) = (config.min_epochs, config.max_epochs);

        let mut session = Session::new(config, device);
        session.set_progress_sink(sink);

        Self {
            session: Some(session),
            pending: None,
            progress,
            last_epoch: None,
            epochs,
            epochs_requested: epochs,
            min_epochs,
            max_epochs,
            log: Vec::new(),
            preview: None,
            history: None,
            show_history: false,
        }
    }

    fn is_busy(&self) -> bool {
        self.pending.is_some()
    }

    fn run(&mut self, ctx: &egui::Context, command: Command) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let is_training = matches!(command, Command::Train { .. });

        if !command.is_long_running() {
            let entry = session.dispatch(command);
            self.finish(ctx, session, entry, is_training);
            return;
        }

        let label = match &command {
            Command::Train { epochs } => format!("Training for {epochs} epochs"),
            Command::LoadModel(_) => "Loading model".to_string(),
            _ => "Loading images".to_string(),
        };
        let (sender, receiver) = mpsc::channel();
        let repaint = ctx.clone();
        thread::spawn(move || {
            let entry = session.dispatch(command);
            let _ = sender.send((session, entry));
            repaint.request_repaint();
        });

        self.last_epoch = None;
        self.pending = Some(Pending {
            label,
            is_training,
            receiver,
        });
    }

    fn poll_pending(&mut self, ctx: &egui::Context) {
        if let Some(metrics) = self.progress.try_iter().last() {
            self.last_epoch = Some(metrics);
        }

        let Some(pending) = &self.pending else {
            return;
        };
        match pending.receiver.try_recv() {
            Ok((session, entry)) => {
                let is_training = pending.is_training;
                self.pending = None;
                self.finish(ctx, session, entry, is_training);
            }
            Err(TryRecvError::Empty) => ctx.request_repaint_after(Duration::from_millis(200)),
            Err(TryRecvError::Disconnected) => {
                // dispatch catches panics, so this only happens if the send itself failed
                tracing::error!("Worker thread ended without returning the session");
                self.pending = None;
                self.log.push(LogEntry::error("An unexpected error occurred."));
            }
        }
    }

    fn finish(&mut self, ctx: &egui::Context, session: Session<B>, entry: LogEntry, trained: bool) {
        self.refresh_preview(ctx, &session);
        if shows_history(trained, &entry) {
            self.refresh_history(ctx, &session);
        }
        self.session = Some(session);
        self.log.push(entry);
    }

    fn refresh_preview(&mut self, ctx: &egui::Context, session: &Session<B>) {
        let Some(sample) = session.test_sample() else {
            self.preview = None;
            return;
        };
        if matches!(&self.preview, Some((path, _)) if *path == sample.path) {
            return;
        }
        let texture = ctx.load_texture("test-image", color_image(&sample.preview), TextureOptions::LINEAR);
        self.preview = Some((sample.path.clone(), texture));
    }

    fn refresh_history(&mut self, ctx: &egui::Context, session: &Session<B>) {
        let Some(path) = session.view().plot.as_ref() else {
            return;
        };
        match image::open(path) {
            Ok(plot) => {
                let texture = ctx.load_texture(
                    "training-history",
                    color_image(&plot.to_rgb8()),
                    TextureOptions::LINEAR,
                );
                self.history = Some(texture);
                self.show_history = true;
            }
            Err(err) => tracing::warn!("Could not display {}: {err}", path.display()),
        }
    }

    fn create_model(&mut self, ctx: &egui::Context) {
        self.run(ctx, Command::CreateModel);
    }

    fn load_model(&mut self, ctx: &egui::Context) {
        // let the controller reject it before bothering the user with a dialog
        let check = Command::LoadModel(Selection::Cancelled);
        let rejected = self
            .session
            .as_ref()
            .is_some_and(|session| session.preflight(&check).is_err());
        if rejected {
            self.run(ctx, check);
            return;
        }
        let selection = FileDialog::new()
            .set_title("Open file")
            .add_filter("Burn model", &[CHECKPOINT_EXTENSION])
            .pick_file()
            .into();
        self.run(ctx, Command::LoadModel(selection));
    }

    fn load_training(&mut self, ctx: &egui::Context) {
        let selection = FileDialog::new()
            .set_title("Select training data directory")
            .pick_folder()
            .into();
        self.run(ctx, Command::LoadTrainingData(selection));
    }

    fn load_validation(&mut self, ctx: &egui::Context) {
        let selection = FileDialog::new()
            .set_title("Select test data directory")
            .pick_folder()
            .into();
        self.run(ctx, Command::LoadValidationData(selection));
    }

    fn load_test_image(&mut self, ctx: &egui::Context) {
        let mut dialog = FileDialog::new().set_title("Open file");
        for ext in TEST_IMAGE_EXTENSIONS {
            dialog = dialog.add_filter(format!("{} files", ext.to_uppercase()), &[ext]);
        }
        self.run(ctx, Command::LoadTestImage(dialog.pick_file().into()));
    }

    fn train(&mut self, ctx: &egui::Context) {
        self.epochs_requested = self.epochs;
        self.run(ctx, Command::Train { epochs: self.epochs });
    }

    fn classify(&mut self, ctx: &egui::Context) {
        self.run(ctx, Command::Classify);
    }

    fn draw_model_frame(&mut self, ui: &mut egui::Ui) {
        let enabled = !self.is_busy();
        section(ui, "Model", |ui| {
            ui.horizontal(|ui| {
                if ui.add_enabled(enabled, egui::Button::new("Create New Model")).clicked() {
                    self.create_model(ui.ctx());
                }
                if ui.add_enabled(enabled, egui::Button::new("Load Trained Model")).clicked() {
                    self.load_model(ui.ctx());
                }
                let text = self
                    .view_text(|session| session.view().loaded_model.map(|e| e.summary()));
                right_label(ui, text);
            });
        });
    }

    fn draw_dataset_frame(&mut self, ui: &mut egui::Ui) {
        let enabled = !self.is_busy();
        section(ui, "Training Images Dataset", |ui| {
            ui.horizontal(|ui| {
                if ui.add_enabled(enabled, egui::Button::new("Load Training")).clicked() {
                    self.load_training(ui.ctx());
                }
                if ui.add_enabled(enabled, egui::Button::new("Load Validation Dataset")).clicked() {
                    self.load_validation(ui.ctx());
                }
                let text = self.view_text(|session| session.view().trained.map(|e| e.summary()));
                right_label(ui, text);
            });
        });
    }

    fn draw_test_frame(&mut self, ui: &mut egui::Ui) {
        let enabled = !self.is_busy();
        section(ui, "Test Image", |ui| {
            ui.horizontal(|ui| {
                if ui.add_enabled(enabled, egui::Button::new("Load Testing Image")).clicked() {
                    self.load_test_image(ui.ctx());
                }
                if let Some((_, texture)) = &self.preview {
                    ui.add_space(30.0);
                    ui.add(egui::Image::from_texture(SizedTexture::from_handle(texture)));
                }
                let text = self.view_text(|session| {
                    session.view().prediction.map(|prediction| prediction.to_string())
                });
                right_label(ui, text);
            });
        });
    }

    fn draw_config_frame(&mut self, ui: &mut egui::Ui) {
        section(ui, "Configuration", |ui| {
            ui.horizontal(|ui| {
                ui.label("Epochs:");
                ui.add_enabled(
                    !self.is_busy(),
                    egui::DragValue::new(&mut self.epochs).range(self.min_epochs..=self.max_epochs),
                );
            });
        });
    }

    fn draw_actions(&mut self, ui: &mut egui::Ui) {
        let enabled = !self.is_busy();
        let size = egui::vec2(ui.available_width(), 28.0);
        if ui
            .add_enabled(enabled, egui::Button::new("Train Network").min_size(size))
            .clicked()
        {
            self.train(ui.ctx());
        }
        if ui
            .add_enabled(enabled, egui::Button::new("Classify Image").min_size(size))
            .clicked()
        {
            self.classify(ui.ctx());
        }

        if let Some(pending) = &self.pending {
            ui.horizontal(|ui| {
                ui.spinner();
                ui.label(&pending.label);
                if let (true, Some(metrics)) = (pending.is_training, self.last_epoch) {
                    ui.label(format!(
                        "epoch {}/{}: val_accuracy {:.4}, val_loss {:.4}",
                        metrics.epoch,
                        self.epochs_requested,
                        metrics.valid_accuracy,
                        metrics.valid_loss
                    ));
                }
            });
        }
    }

    fn draw_log(&self, ui: &mut egui::Ui) {
        egui::Frame::default()
            .fill(Color32::WHITE)
            .inner_margin(egui::Margin::same(6))
            .show(ui, |ui| {
                egui::ScrollArea::vertical()
                    .auto_shrink([false, false])
                    .stick_to_bottom(true)
                    .show(ui, |ui| {
                        for entry in &self.log {
                            let color = match entry.level {
                                LogLevel::Info => Color32::BLACK,
                                LogLevel::Error => Color32::from_rgb(170, 20, 20),
                            };
                            ui.label(RichText::new(&entry.message).size(RESULT_TEXT_SIZE).color(color));
                        }
                    });
            });
    }

    fn draw_history_window(&mut self, ctx: &egui::Context) {
        let Some(texture) = &self.history else {
            return;
        };
        egui::Window::new("Training History")
            .open(&mut self.show_history)
            .resizable(true)
            .show(ctx, |ui| {
                ui.add(egui::Image::from_texture(SizedTexture::from_handle(texture)).shrink_to_fit());
            });
    }

    fn view_text(&self, f: impl Fn(&Session<B>) -> Option<String>) -> String {
        self.session.as_ref().and_then(f).unwrap_or_default()
    }
}

impl<B: AutodiffBackend> App for ClassifierApp<B>
where
    Session<B>: Send + 'static,
{
    fn update(&mut self, ctx: &egui::Context, _frame: &mut Frame) {
        self.poll_pending(ctx);

        egui::CentralPanel::default().show(ctx, |ui| {
            self.draw_model_frame(ui);
            self.draw_dataset_frame(ui);
            self.draw_test_frame(ui);
            self.draw_config_frame(ui);
            ui.add_space(4.0);
            self.draw_actions(ui);
            ui.add_space(4.0);
            self.draw_log(ui);
        });

        self.draw_history_window(ctx);
    }
}

fn section(ui: &mut egui::Ui, title: &str, add_contents: impl FnOnce(&mut egui::Ui)) {
    ui.group(|ui| {
        ui.set_width(ui.available_width());
        ui.label(RichText::new(title).strong());
        add_contents(ui);
    });
}

fn right_label(ui: &mut egui::Ui, text: String) {
    ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
        ui.add_space(30.0);
        ui.label(RichText::new(text).size(RESULT_TEXT_SIZE));
    });
}

/// A failed run leaves the previous plot on disk; only a new one is shown.
fn shows_history(trained: bool, entry: &LogEntry) -> bool {
    trained && entry.level == LogLevel::Info
}

fn color_image(image: &RgbImage) -> ColorImage {
    let (width, height) = image.dimensions();
    ColorImage::from_rgb([width as usize, height as usize], image.as_raw())
}
