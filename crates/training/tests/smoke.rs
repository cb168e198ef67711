use std::{fs, io::Write, path::Path};

use training::{Trainer, TrainingConfig, TrainingError};

const TRAIN_FOLDERS: &[&str] = &[
    "best2019-r31-with-label",
    "best2019-r32-with-label",
    "best2019-r33-with-label",
    "best2019-r34-with-label",
    "best2019-r35-with-label",
    "best2019-r36-with-label",
    "best2020-r31-with-label",
];

fn write_line_image(path: &Path, height: u32, width: u32, seed: u8) {
    let mut img = image::GrayImage::from_pixel(width, height, image::Luma([255u8]));
    for x in 0..width {
        let y = (height / 2 + (x + seed as u32) % 5) % height;
        img.put_pixel(x, y, image::Luma([0u8]));
    }
    img.save(path).unwrap();
}

fn build_corpus(root: &Path) {
    for folder in TRAIN_FOLDERS {
        fs::create_dir_all(root.join(folder)).unwrap();
        fs::File::create(root.join(folder).join("lines.label")).unwrap();
    }
    let folder = root.join(TRAIN_FOLDERS[0]);
    let mut manifest = fs::File::create(folder.join("lines.label")).unwrap();
    for (i, gt) in ["AB", "ABC", "BAC", "CAB"].iter().enumerate() {
        let file = format!("{:04}.png", i);
        writeln!(manifest, "{} {}", file, gt).unwrap();
        write_line_image(&folder.join(&file), 64, 320, i as u8);
    }
}

fn write_char_file(path: &Path) {
    let mut map = serde_json::Map::new();
    for (i, ch) in "ABC".chars().enumerate() {
        map.insert(ch.to_string(), serde_json::json!(i + 1));
    }
    let doc = serde_json::json!({ "char_to_idx": map });
    fs::write(path, doc.to_string()).unwrap();
}

fn write_config(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("cf_smoke.toml");
    let contents = r#"
name = "smoke"

[dataset]
root = "corpus"
img_height = 32
char_file = "chars.json"
identity_spaced = true

[model]
hidden_size = 16

[trainer]
save_dir = "runs"
max_steps = 2
batch_size = 2
log_every_n_steps = 1
save_every_n_steps = 100
seed = 7
"#;
    fs::write(&path, contents).unwrap();
    path
}

#[test]
fn train_checkpoint_resume_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    build_corpus(&dir.path().join("corpus"));
    write_char_file(&dir.path().join("chars.json"));
    let config_path = write_config(dir.path());

    let config = TrainingConfig::load(&config_path).unwrap();
    config.ensure_matches_filename(&config_path).unwrap();

    let mut trainer = Trainer::new(config.clone()).unwrap();
    trainer.ensure_fresh_run().unwrap();
    trainer.train().unwrap();

    assert_eq!(trainer.global_step(), 2);
    assert_eq!(trainer.history().len(), 2);

    let checkpoint_dir = trainer.run_dir().join("checkpoint-step-00000002");
    assert!(checkpoint_dir.join("model.safetensors").is_file());
    assert!(checkpoint_dir.join("optimizer.json").is_file());
    assert!(checkpoint_dir.join("config.json").is_file());
    assert!(checkpoint_dir.join("history.json").is_file());
    assert!(checkpoint_dir.join("manifest.json").is_file());

    // a finished run's directory cannot be reused for a fresh start
    match trainer.ensure_fresh_run() {
        Err(TrainingError::Initialization(msg)) => assert!(msg.contains("path already used")),
        other => panic!("expected a path-already-used failure, got {:?}", other),
    }

    let optimizer_before = fs::read(checkpoint_dir.join("optimizer.json")).unwrap();

    // resume restores progress, history, and bit-identical optimizer state
    let mut resumed = Trainer::new(config).unwrap();
    let descriptor = resumed.resume_from_latest().unwrap();
    assert_eq!(descriptor.manifest.progress.global_step, 2);
    assert_eq!(resumed.global_step(), 2);
    assert_eq!(resumed.history().len(), 2);

    // the step budget is already exhausted; training only rewrites the
    // final checkpoint
    resumed.train().unwrap();
    assert_eq!(resumed.global_step(), 2);
    let optimizer_after = fs::read(checkpoint_dir.join("optimizer.json")).unwrap();
    assert_eq!(optimizer_before, optimizer_after);
}

#[test]
fn shutdown_flag_checkpoints_after_one_step() {
    let dir = tempfile::tempdir().unwrap();
    build_corpus(&dir.path().join("corpus"));
    write_char_file(&dir.path().join("chars.json"));
    let config_path = write_config(dir.path());

    let config = TrainingConfig::load(&config_path).unwrap();
    let mut trainer = Trainer::new(config).unwrap();

    // stop immediately after the first completed step
    trainer.train_with_shutdown(|| true).unwrap();
    assert_eq!(trainer.global_step(), 1);
    let checkpoint_dir = trainer.run_dir().join("checkpoint-step-00000001");
    assert!(checkpoint_dir.join("manifest.json").is_file());
}

#[test]
fn resume_without_checkpoint_is_fatal_but_soft_resume_is_not() {
    let dir = tempfile::tempdir().unwrap();
    build_corpus(&dir.path().join("corpus"));
    write_char_file(&dir.path().join("chars.json"));
    let config_path = write_config(dir.path());

    let config = TrainingConfig::load(&config_path).unwrap();
    let mut trainer = Trainer::new(config).unwrap();
    assert!(trainer.resume_from_latest().is_err());
    assert!(trainer.soft_resume().unwrap().is_none());
    assert_eq!(trainer.global_step(), 0);
}
