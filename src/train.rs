//! 学習データを読み込み、学習用と検証用のバッチ生成器を用意するモジュール
//!
//! 重みの更新そのものは外部のフレームワークで行います。

use anyhow::{Context, Result};
use log::{info, warn};
use rand::Rng;

use crate::annotation::{check_labels, parse_annotation, Annotations};
use crate::batch_gen::BatchGenerator;
use crate::config::Config;
use crate::network::Architecture;

/// 検証データが指定されていない場合に学習データに残す割合
pub const TRAIN_SPLIT_RATIO: f32 = 0.8;

/// 学習用と検証用のバッチ生成器
pub struct Generators {
    pub train: BatchGenerator,
    pub valid: BatchGenerator,
}

/// 設定ファイルの `train` セクションからバッチ生成器を用意します。
///
/// # Args
/// * `config` - 設定
/// * `rng` - 学習データの分割に使う乱数生成器
///
/// # Return
/// * 生成器。設定したラベルのうち学習データ (分割前) に現れないものがあれば `None`
pub fn prepare_generators<R: Rng>(config: &Config, rng: &mut R) -> Result<Option<Generators>> {
    let train_config = config
        .train
        .as_ref()
        .context("config file has no 'train' section")?;

    let train_ann = parse_annotation(
        &train_config.train_annot_folder,
        &train_config.train_image_folder,
        &config.labels,
    )?;

    // 分割前の学習データ全体で確認する
    if !check_labels(&config.labels, &train_ann.seen_labels()) {
        return Ok(None);
    }

    let (train_ann, valid_ann) = match (
        &train_config.valid_annot_folder,
        &train_config.valid_image_folder,
    ) {
        (Some(ann_dir), Some(img_dir)) => {
            let valid_ann = parse_annotation(ann_dir, img_dir, &config.labels)?;
            (train_ann, valid_ann)
        }
        _ => {
            info!(
                "no validation set given, splitting training set {:.0}/{:.0}",
                TRAIN_SPLIT_RATIO * 100.,
                (1. - TRAIN_SPLIT_RATIO) * 100.
            );
            train_ann.split(TRAIN_SPLIT_RATIO, rng)
        }
    };

    if valid_ann.is_empty() {
        warn!("validation set is empty");
    }

    Ok(Some(Generators {
        train: generator(train_ann, config, config.jitter)?,
        valid: generator(valid_ann, config, false)?,
    }))
}

fn generator(annotations: Annotations, config: &Config, jitter: bool) -> Result<BatchGenerator> {
    let arch: Architecture = config.architecture.parse()?;
    let generator = BatchGenerator::new(annotations, config.generator_config()?, jitter)?
        .with_norm(move |img| arch.normalize(img));
    info!("{} batches of {}", generator.len(), config.batch_size);
    Ok(generator)
}
