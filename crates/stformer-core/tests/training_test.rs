//! Integration tests for stformer-core
//!
//! These tests drive the public API end to end:
//! - Train on a constant-velocity scene until the forecast converges
//! - Save and restore checkpoints through the trainer
//! - Decode every supported horizon with an exact step 0
//!
//! Run with: cargo test --test training_test -- --nocapture

use candle_core::{DType, Device, Tensor};
use stformer_core::config::ConvStage;
use stformer_core::schedule::ScheduleSpec;
use stformer_core::{
    average_displacement_error, build_model, constant_velocity_scene, parse_config,
    reconstruct_positions, ModelConfig, StError, TrainConfig, Trainer,
};

fn small_config(horizon: usize, seed: u64) -> ModelConfig {
    let mut config = ModelConfig::new(2, horizon, 2, 1);
    config.out_features = 2;
    config.sp_dk = 16;
    config.sp_enc_heads = 2;
    config.sp_num_encoders = 1;
    config.feat_embedding = 8;
    config.map_embedding = 4;
    config.map_size = 32;
    config.map_stages = vec![ConvStage::new(8, 5, 2), ConvStage::new(1, 5, 2)];
    config.spatial_mlp_hidden = 32;
    config.spatial_mlp_out = 16;
    config.rnn_hidden = 32;
    config.decoder_embedding = 16;
    config.dropout = 0.0;
    config.seed = Some(seed);
    config
}

fn train_config(lr: f64) -> TrainConfig {
    TrainConfig {
        schedule: ScheduleSpec::Fixed(lr),
        beta_1: 0.9,
        beta_2: 0.999,
        epsilon: 1e-7,
        ..Default::default()
    }
}

fn final_positions(pred: &Tensor) -> Vec<Vec<f32>> {
    let h = pred.dim(1).unwrap();
    pred.narrow(1, h - 1, 1)
        .unwrap()
        .squeeze(1)
        .unwrap()
        .squeeze(0)
        .unwrap()
        .to_vec2()
        .unwrap()
}

#[test]
fn test_constant_velocity_scene_converges() {
    let device = Device::Cpu;
    let model_config = small_config(4, 17);
    let mut trainer = Trainer::new(&model_config, &train_config(2e-3), &device).unwrap();
    let scene = constant_velocity_scene(&model_config, 1, 2, &[1.0, 1.0], &device).unwrap();

    let first_loss = trainer.train_step(&scene).unwrap();
    let mut last_loss = first_loss;
    for _ in 1..1000 {
        last_loss = trainer.train_step(&scene).unwrap();
    }
    assert!(last_loss < first_loss, "loss went from {first_loss} to {last_loss}");
    assert_eq!(trainer.step(), 1000);

    let pred = trainer.inference(&scene).unwrap();
    for neighbor in final_positions(&pred) {
        let dist = ((neighbor[0] - 3.0).powi(2) + (neighbor[1] - 3.0).powi(2)).sqrt();
        assert!(dist < 0.5, "final position {neighbor:?} is {dist} from [3, 3]");
    }
}

#[test]
fn test_checkpoint_round_trip_through_trainer() {
    let device = Device::Cpu;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trainer.safetensors");

    let model_config = small_config(3, 5);
    let scene = constant_velocity_scene(&model_config, 1, 2, &[0.5, -0.5], &device).unwrap();
    let mut source = Trainer::new(&model_config, &train_config(1e-3), &device).unwrap();
    for _ in 0..3 {
        source.train_step(&scene).unwrap();
    }
    source.save(&path).unwrap();

    let mut target = Trainer::new(&small_config(3, 99), &train_config(1e-3), &device).unwrap();
    target.restore(&path).unwrap();
    assert_eq!(target.step(), 3);

    let a: Vec<f32> = source.inference(&scene).unwrap().flatten_all().unwrap().to_vec1().unwrap();
    let b: Vec<f32> = target.inference(&scene).unwrap().flatten_all().unwrap().to_vec1().unwrap();
    assert_eq!(a, b);

    // Both continue identically since optimizer state came along
    let la = source.train_step(&scene).unwrap();
    let lb = target.train_step(&scene).unwrap();
    assert_eq!(la, lb);
}

#[test]
fn test_incompatible_checkpoint_leaves_trainer_untouched() {
    let device = Device::Cpu;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("wide.safetensors");

    let mut wide = small_config(3, 1);
    wide.rnn_hidden = 48;
    Trainer::new(&wide, &train_config(1e-3), &device)
        .unwrap()
        .save(&path)
        .unwrap();

    let model_config = small_config(3, 2);
    let scene = constant_velocity_scene(&model_config, 1, 2, &[1.0, 0.0], &device).unwrap();
    let mut trainer = Trainer::new(&model_config, &train_config(1e-3), &device).unwrap();
    trainer.train_step(&scene).unwrap();
    let before: Vec<f32> = trainer.inference(&scene).unwrap().flatten_all().unwrap().to_vec1().unwrap();

    let err = trainer.restore(&path).unwrap_err();
    assert!(matches!(err, StError::InvalidCheckpoint(_)));
    assert_eq!(trainer.step(), 1);
    let after: Vec<f32> = trainer.inference(&scene).unwrap().flatten_all().unwrap().to_vec1().unwrap();
    assert_eq!(before, after);
}

#[test]
fn test_every_horizon_keeps_length_and_step_zero() {
    let device = Device::Cpu;
    for horizon in [1usize, 2, 8, 30] {
        let config = small_config(horizon, 4);
        let (model, _) = build_model(&config, &device).unwrap();
        let mut scene = constant_velocity_scene(&config, 1, 3, &[0.25, 0.75], &device).unwrap();
        scene.future = (scene.future + 1.5).unwrap();

        let pred = model.forward(&scene, false).unwrap();
        assert_eq!(pred.dims(), &[1, horizon, 2, 2]);
        let step0: Vec<f32> = pred.narrow(1, 0, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let init: Vec<f32> = scene.future.narrow(1, 0, 1).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(step0, init, "horizon {horizon}");
    }
}

#[test]
fn test_same_seed_same_model() {
    let device = Device::Cpu;
    let config = small_config(3, 21);
    let scene = constant_velocity_scene(&config, 1, 2, &[1.0, 1.0], &device).unwrap();
    let (a, _) = build_model(&config, &device).unwrap();
    let (b, _) = build_model(&config, &device).unwrap();
    let pa: Vec<f32> = a.forward(&scene, false).unwrap().flatten_all().unwrap().to_vec1().unwrap();
    let pb: Vec<f32> = b.forward(&scene, false).unwrap().flatten_all().unwrap().to_vec1().unwrap();
    assert_eq!(pa, pb);
}

#[test]
fn test_trainer_from_config_file() {
    let toml = r#"
[model]
features_size = 2
seq_size = 3
neigh_size = 2
batch = 1
out_features = 2
sp_dk = 8
sp_enc_heads = 2
sp_num_encoders = 1
feat_embedding = 4
map_embedding = 2
map_size = 16
map_stages = [{ out_channels = 1, kernel = 4, stride = 2 }]
spatial_mlp_hidden = 8
spatial_mlp_out = 8
rnn_hidden = 8
decoder_embedding = 4
dropout = 0.0
temporal_encoder = "transformer"
tm_heads = 2
tm_num_encoders = 1
seed = 9

[training]
lr = 100
beta_1 = 0.9
beta_2 = 0.98
"#;
    let config = parse_config(toml).unwrap();
    let model_config = config.model_config().unwrap();
    let train = config.train_config().unwrap();
    assert_eq!(train.schedule, ScheduleSpec::Warmup { warmup_steps: 100 });

    let device = Device::Cpu;
    let mut trainer = Trainer::new(&model_config, &train, &device).unwrap();
    let scene = constant_velocity_scene(&model_config, 1, 4, &[1.0, -1.0], &device).unwrap();
    let loss = trainer.train_step(&scene).unwrap();
    assert!(loss.is_finite());
    // Warm-up rate at step 0: 8^-0.5 · 1 · 100^-1.5
    let expected = 8f64.powf(-0.5) * 100f64.powf(-1.5);
    assert!((trainer.learning_rate() - expected).abs() < 1e-12);
}

#[test]
fn test_reconstructed_ground_truth_has_zero_ade() {
    let device = Device::Cpu;
    let config = small_config(4, 3);
    let scene = constant_velocity_scene(&config, 1, 2, &[1.0, 2.0], &device).unwrap();

    // Per-step displacements of the ground truth rebuild the same track
    let future = &scene.future;
    let steps = (future.narrow(1, 1, 3).unwrap() - future.narrow(1, 0, 3).unwrap()).unwrap();
    let initial = future.narrow(1, 0, 1).unwrap().squeeze(1).unwrap();
    let rebuilt = reconstruct_positions(&steps, &initial, None).unwrap();
    assert_eq!(rebuilt.dims(), future.dims());

    // [b, h, n, d] → [b·n, h, d]
    let as_tracks = |t: &Tensor| t.permute((0, 2, 1, 3)).unwrap().reshape((2, 4, 2)).unwrap();
    let ade = average_displacement_error(&as_tracks(future), &as_tracks(&rebuilt)).unwrap();
    assert!(ade < 1e-6);

    let shifted = (rebuilt + 3.0).unwrap().to_dtype(DType::F32).unwrap();
    let ade = average_displacement_error(&as_tracks(future), &as_tracks(&shifted)).unwrap();
    assert!(ade > 1.0);
}
