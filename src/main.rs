use std::path::Path;

use burn::backend::{wgpu::WgpuDevice, Autodiff, Wgpu};
use catdog_classifier::{
    config::{AppConfig, CONFIG_FILE},
    gui::{ClassifierApp, APP_TITLE, INITIAL_WINDOW_SIZE},
    logging,
};

fn main() -> eframe::Result<()> {
    type Backend = Wgpu<f32, i32>;
    type AutodiffBackend = Autodiff<Backend>;

    let (config, source) = AppConfig::load_or_default(Path::new(CONFIG_FILE));
    if let Err(err) = logging::init(&config.log_dir()) {
        eprintln!("Logging disabled: {err}");
    }
    source.report();

    let device = WgpuDevice::default();
    tracing::info!("Starting on {device:?}");

    let options = eframe::NativeOptions {
        viewport: eframe::egui::ViewportBuilder::default()
            .with_title(APP_TITLE)
            .with_inner_size(INITIAL_WINDOW_SIZE),
        ..Default::default()
    };

    eframe::run_native(
        APP_TITLE,
        options,
        Box::new(move |_cc| {
            Ok(Box::new(ClassifierApp::<AutodiffBackend>::new(config, device)))
        }),
    )
}
