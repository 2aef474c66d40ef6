//! Tests for checkpointing functionality

use anyhow::Result;
use candle_core::{Device, Tensor};
use ndarray::Array4;
use std::collections::HashMap;

use crate::config::ModelConfig;
use crate::engine::Engine;
use crate::error::Error;
use crate::model::{Crnn, Geometry, IMAGE_HEIGHT};
use crate::training::{CheckpointManager, CheckpointPointer, CrnnTrainer, POINTER_FILE};

use super::fixtures::{model_config, TrainingTestFixture, IMAGE_WIDTH};

fn geometry() -> Geometry {
    Geometry {
        max_image_width: IMAGE_WIDTH,
        num_classes: 3,
        max_char_count: 3,
    }
}

fn small_tensors(value: f32) -> Result<HashMap<String, Tensor>> {
    Ok(HashMap::from([(
        "w".to_string(),
        Tensor::new(&[value, value], &Device::Cpu)?,
    )]))
}

#[test]
fn test_checkpoint_manager_creation() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    let checkpoint_dir = temp_dir.path().join("nested").join("checkpoints");

    let manager = CheckpointManager::new(&checkpoint_dir, Some(3))?;

    assert!(checkpoint_dir.exists());
    assert!(checkpoint_dir.is_dir());
    assert!(manager.latest()?.is_none());
    Ok(())
}

#[test]
fn test_save_writes_pointer() -> Result<()> {
    let fixture = TrainingTestFixture::new()?;
    let manager = fixture.checkpoint_manager()?;

    let path = manager.save(7, geometry(), &small_tensors(1.0)?)?;
    assert_eq!(path, manager.checkpoint_path(7));
    assert!(path.is_file());

    let pointer: CheckpointPointer =
        serde_json::from_slice(&std::fs::read(fixture.checkpoint_dir.join(POINTER_FILE))?)?;
    assert_eq!(pointer.latest, "ckp-7.safetensors");
    assert_eq!(pointer.step, 7);
    assert_eq!(pointer.geometry, geometry());

    let latest = manager.latest()?.expect("latest checkpoint");
    assert_eq!(latest.step, 7);
    assert_eq!(latest.geometry, Some(geometry()));
    Ok(())
}

#[test]
fn test_retention_limit() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    let manager = CheckpointManager::new(temp_dir.path(), Some(2))?;

    for step in 0..4 {
        manager.save(step, geometry(), &small_tensors(step as f32)?)?;
    }

    let steps: Vec<usize> = manager
        .list_checkpoints()?
        .into_iter()
        .map(|(step, _)| step)
        .collect();
    assert_eq!(steps, vec![2, 3]);
    assert_eq!(manager.latest()?.map(|c| c.step), Some(3));
    Ok(())
}

#[test]
fn test_latest_without_pointer_scans_directory() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    let manager = CheckpointManager::new(temp_dir.path(), None)?;
    for step in [3, 12, 5] {
        manager.save(step, geometry(), &small_tensors(0.0)?)?;
    }

    // Pointer names ckp-5, which is not the highest step
    assert_eq!(manager.latest()?.map(|c| c.step), Some(5));

    std::fs::remove_file(temp_dir.path().join(POINTER_FILE))?;
    let latest = manager.latest()?.expect("scanned checkpoint");
    assert_eq!(latest.step, 12);
    assert_eq!(latest.geometry, None);
    Ok(())
}

#[test]
fn test_dangling_pointer_falls_back() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    let manager = CheckpointManager::new(temp_dir.path(), None)?;
    manager.save(0, geometry(), &small_tensors(0.0)?)?;
    let newest = manager.save(1, geometry(), &small_tensors(1.0)?)?;

    std::fs::remove_file(newest)?;
    assert_eq!(manager.latest()?.map(|c| c.step), Some(0));
    Ok(())
}

#[test]
fn test_load_validates_names_and_shapes() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    let manager = CheckpointManager::new(temp_dir.path(), None)?;
    let path = manager.save(0, geometry(), &small_tensors(2.0)?)?;

    let tensors = manager.load(&path, &[("w".to_string(), vec![2])], &Device::Cpu)?;
    assert_eq!(tensors["w"].to_vec1::<f32>()?, vec![2.0, 2.0]);

    let missing = manager.load(&path, &[("v".to_string(), vec![2])], &Device::Cpu);
    assert!(matches!(missing, Err(Error::Checkpoint(_))));

    let reshaped = manager.load(&path, &[("w".to_string(), vec![3])], &Device::Cpu);
    assert!(matches!(reshaped, Err(Error::Checkpoint(_))));
    Ok(())
}

#[test]
fn test_overwrite_goes_through_staging_file() -> Result<()> {
    let temp_dir = tempfile::tempdir()?;
    let manager = CheckpointManager::new(temp_dir.path(), None)?;
    let path = manager.save(0, geometry(), &small_tensors(1.0)?)?;

    // A write of the same step that died halfway
    let bytes = std::fs::read(&path)?;
    let staging = temp_dir.path().join("ckp-0.safetensors.tmp");
    std::fs::write(&staging, &bytes[..bytes.len() / 2])?;

    let latest = manager.latest()?.expect("checkpoint survives");
    let tensors = manager.load(&latest.path, &[("w".to_string(), vec![2])], &Device::Cpu)?;
    assert_eq!(tensors["w"].to_vec1::<f32>()?, vec![1.0, 1.0]);
    assert_eq!(manager.list_checkpoints()?.len(), 1);

    manager.save(0, geometry(), &small_tensors(2.0)?)?;
    assert!(!staging.exists());
    let tensors = manager.load(&path, &[("w".to_string(), vec![2])], &Device::Cpu)?;
    assert_eq!(tensors["w"].to_vec1::<f32>()?, vec![2.0, 2.0]);
    Ok(())
}

#[test]
fn test_restore_ignores_torn_staging_file() -> Result<()> {
    let fixture = TrainingTestFixture::new()?;
    let path = fixture.create_trainer(false)?.save_checkpoint()?;

    let bytes = std::fs::read(&path)?;
    std::fs::write(
        fixture.checkpoint_dir.join("ckp-0.safetensors.tmp"),
        &bytes[..bytes.len() / 2],
    )?;

    let restored = fixture.create_trainer(true)?;
    assert_eq!(restored.step(), 0);
    Ok(())
}

#[test]
fn test_save_restore_round_trip() -> Result<()> {
    let fixture = TrainingTestFixture::new()?;
    let mut images = Array4::<f32>::zeros((1, IMAGE_WIDTH, IMAGE_HEIGHT, 1));
    images[[0, 4, 10, 0]] = 1.0;
    images[[0, 9, 20, 0]] = 0.5;

    let (saved_step, before) = {
        let mut trainer = fixture.create_trainer(false)?;
        trainer.train(&fixture.data, 1)?;
        trainer.save_checkpoint()?;
        let logits = trainer.model().forward(&images, false)?;
        (trainer.step(), logits)
    };
    assert_eq!(saved_step, 1);

    let restored = fixture.create_trainer(true)?;
    assert_eq!(restored.step(), saved_step);
    let after = restored.model().forward(&images, false)?;

    let diff = (before - after)?.abs()?.max_all()?.to_scalar::<f32>()?;
    assert!(diff < 1e-6, "logits differ by {diff}");
    Ok(())
}

#[test]
fn test_geometry_mismatch_is_rejected() -> Result<()> {
    let fixture = TrainingTestFixture::new()?;
    {
        let mut trainer = fixture.create_trainer(false)?;
        trainer.train(&fixture.data, 1)?;
    }

    let wider = ModelConfig {
        max_image_width: 24,
        ..model_config()
    };
    let model = Crnn::new(&wider, Engine::with_device(Device::Cpu))?;
    let err = CrnnTrainer::new(model, fixture.training_config(true))
        .err()
        .expect("restore into a different geometry");
    assert!(matches!(err, Error::Checkpoint(_)));
    Ok(())
}
