use std::{fs, path::Path, sync::mpsc};

use burn::{
    backend::{Autodiff, NdArray},
    module::Module,
};
use catdog_classifier::{
    config::AppConfig,
    controller::{Command, LogEntry, LogLevel, Selection, Session, TRAINING_FAILURE},
    model::{build_model, CheckpointRecorder},
};
use image::{Rgb, RgbImage};
use tempfile::tempdir;

type TestBackend = Autodiff<NdArray>;

fn write_split(root: &Path) {
    for (class, color) in [("cats", [15, 15, 15]), ("dogs", [235, 235, 235])] {
        let dir = root.join(class);
        fs::create_dir_all(&dir).unwrap();
        for idx in 0..3 {
            RgbImage::from_pixel(40, 30, Rgb(color))
                .save(dir.join(format!("{class}.{idx}.png")))
                .unwrap();
        }
    }
}

#[test]
fn create_train_reload_and_classify() {
    let dir = tempdir().unwrap();
    write_split(&dir.path().join("train"));
    write_split(&dir.path().join("validation"));
    let image = dir.path().join("pet.png");
    RgbImage::from_pixel(200, 150, Rgb([200, 190, 180]))
        .save(&image)
        .unwrap();

    let config = AppConfig::new()
        .with_artifact_dir(dir.path().join("artifacts").display().to_string())
        .with_train_workers(1);
    let mut session = Session::<TestBackend>::new(config, Default::default());
    let (sink, progress) = mpsc::channel();
    session.set_progress_sink(sink);

    assert_eq!(
        session.dispatch(Command::CreateModel),
        LogEntry::info("New classification model created.")
    );
    assert_eq!(
        session.dispatch(Command::LoadTrainingData(Selection::Picked(
            dir.path().join("train")
        ))),
        LogEntry::info("Training images loaded successfully.")
    );
    assert_eq!(
        session.dispatch(Command::LoadValidationData(Selection::Picked(
            dir.path().join("validation")
        ))),
        LogEntry::info("Validation set loaded successfully.")
    );

    let entry = session.dispatch(Command::Train { epochs: 1 });
    assert_eq!(entry.level, LogLevel::Info);
    assert!(entry.message.starts_with("Training complete with loss: "));

    let epochs: Vec<_> = progress.try_iter().map(|m| m.epoch).collect();
    assert_eq!(epochs, vec![1]);

    let checkpoint = session.config().checkpoint_file();
    assert!(checkpoint.exists());
    assert!(session.config().plot_path().exists());
    let trained = session.view().trained.unwrap();
    assert!(session.view().loaded_model.is_none());
    assert_eq!(session.view().report.as_ref().map(|r| r.len()), Some(1));

    assert_eq!(
        session.dispatch(Command::LoadModel(Selection::Picked(checkpoint))),
        LogEntry::info("Classification model loaded successfully.")
    );
    let loaded = session.view().loaded_model.unwrap();
    // one epoch means the checkpoint is the final model
    assert!((loaded.accuracy - trained.accuracy).abs() < 1e-9);
    assert!((loaded.loss - trained.loss).abs() < 1e-4);

    session.dispatch(Command::LoadTestImage(Selection::Picked(image)));
    let entry = session.dispatch(Command::Classify);
    assert_eq!(entry.level, LogLevel::Info);
    assert!(entry.message.starts_with("Image classified as: "));
    assert!(session.view().prediction.is_some());
}

#[test]
fn commands_fail_without_prerequisites() {
    let dir = tempdir().unwrap();
    let config = AppConfig::new().with_artifact_dir(dir.path().display().to_string());
    let mut session = Session::<TestBackend>::new(config, Default::default());

    let entries = [
        session.dispatch(Command::Train { epochs: 10 }),
        session.dispatch(Command::Classify),
        session.dispatch(Command::LoadModel(Selection::Picked(
            dir.path().join("model_best.mpk"),
        ))),
    ];
    assert!(entries.iter().all(|entry| entry.level == LogLevel::Error));
    assert!(session.model().is_none());
    assert!(session.view().trained.is_none());
}

#[test]
fn training_replaces_loaded_model_metrics() {
    let dir = tempdir().unwrap();
    write_split(&dir.path().join("train"));
    write_split(&dir.path().join("validation"));
    let saved = dir.path().join("saved").join("untrained");
    fs::create_dir_all(saved.parent().unwrap()).unwrap();
    build_model::<TestBackend>(&Default::default())
        .save_file(&saved, &CheckpointRecorder::new())
        .unwrap();

    let config = AppConfig::new()
        .with_artifact_dir(dir.path().join("artifacts").display().to_string())
        .with_train_workers(1);
    let mut session = Session::<TestBackend>::new(config, Default::default());

    session.dispatch(Command::LoadValidationData(Selection::Picked(
        dir.path().join("validation"),
    )));
    assert_eq!(
        session.dispatch(Command::LoadModel(Selection::Picked(
            saved.with_extension("mpk")
        ))),
        LogEntry::info("Classification model loaded successfully.")
    );
    let loaded = session.view().loaded_model;
    assert!(loaded.is_some());
    session.dispatch(Command::LoadTrainingData(Selection::Picked(
        dir.path().join("train"),
    )));

    // a rejected run keeps what is on display
    assert_eq!(
        session.dispatch(Command::Train { epochs: 0 }),
        LogEntry::error(TRAINING_FAILURE)
    );
    assert_eq!(session.view().loaded_model, loaded);
    assert!(session.view().trained.is_none());

    let entry = session.dispatch(Command::Train { epochs: 1 });
    assert_eq!(entry.level, LogLevel::Info);
    assert!(session.view().loaded_model.is_none());
    assert!(session.view().trained.is_some());
}
