//! JSON設定ファイルを読み込むモジュール

use std::{fs, path::Path, path::PathBuf};

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

use crate::anchor::Anchors;

/// 入力の一辺に対する出力グリッドの縮小率
pub const DOWNSAMPLE_RATIO: usize = 32;

/// 設定ファイルの内容
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// 特徴抽出器の名前
    #[serde(default = "default_architecture")]
    pub architecture: String,
    /// ネットワーク入力の一辺
    pub input_size: usize,
    /// 出力グリッドの一辺 (省略時は `input_size / 32`)
    #[serde(default)]
    pub grid_size: Option<usize>,
    /// アンカーの (幅, 高さ) を交互に並べた配列
    pub anchors: Vec<f32>,
    /// クラス名。インデックスがクラスIDになります
    pub labels: Vec<String>,
    /// 1枚あたりの正解ボックスバッファの容量
    pub max_box_per_image: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_threshold")]
    pub obj_threshold: f32,
    #[serde(default = "default_threshold")]
    pub nms_threshold: f32,
    /// 学習時に画像を揺らすかどうか
    #[serde(default = "default_jitter")]
    pub jitter: bool,
    /// 重みファイルのパス
    #[serde(default)]
    pub weights: Option<PathBuf>,
    /// 学習データの場所
    #[serde(default)]
    pub train: Option<TrainConfig>,
}

/// 学習データと検証データの場所
#[derive(Debug, Clone, Deserialize)]
pub struct TrainConfig {
    pub train_annot_folder: PathBuf,
    pub train_image_folder: PathBuf,
    /// 省略時は学習データの2割を検証に使います
    #[serde(default)]
    pub valid_annot_folder: Option<PathBuf>,
    #[serde(default)]
    pub valid_image_folder: Option<PathBuf>,
}

fn default_architecture() -> String {
    "GridPool".to_string()
}

fn default_batch_size() -> usize {
    8
}

fn default_threshold() -> f32 {
    0.3
}

fn default_jitter() -> bool {
    true
}

impl Config {
    /// 設定ファイルを読み込みます。
    ///
    /// # Args
    /// * `path` - JSONファイルのパス
    ///
    /// # Return
    /// * 検証済みの設定
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file '{}'", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config file '{}'", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// 値の整合性を確認します。
    pub fn validate(&self) -> Result<()> {
        ensure!(self.input_size > 0, "input_size must be positive");
        ensure!(self.grid_size() > 0, "grid_size must be positive");
        ensure!(!self.labels.is_empty(), "labels must not be empty");
        ensure!(self.max_box_per_image > 0, "max_box_per_image must be positive");
        ensure!(self.batch_size > 0, "batch_size must be positive");
        ensure!(
            (0.0..=1.0).contains(&self.obj_threshold) && (0.0..=1.0).contains(&self.nms_threshold),
            "thresholds must be in [0, 1]"
        );
        Anchors::from_flat(&self.anchors)?;
        Ok(())
    }

    pub fn grid_size(&self) -> usize {
        self.grid_size.unwrap_or(self.input_size / DOWNSAMPLE_RATIO)
    }

    pub fn nb_classes(&self) -> usize {
        self.labels.len()
    }

    pub fn anchors(&self) -> Result<Anchors> {
        Anchors::from_flat(&self.anchors)
    }

    /// バッチ生成に必要な値をまとめます。
    pub fn generator_config(&self) -> Result<GeneratorConfig> {
        Ok(GeneratorConfig {
            input_size: self.input_size,
            grid_size: self.grid_size(),
            anchors: self.anchors()?,
            labels: self.labels.clone(),
            batch_size: self.batch_size,
            max_box_per_image: self.max_box_per_image,
        })
    }
}

/// バッチ生成器の設定
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub input_size: usize,
    pub grid_size: usize,
    pub anchors: Anchors,
    pub labels: Vec<String>,
    pub batch_size: usize,
    pub max_box_per_image: usize,
}

impl GeneratorConfig {
    pub fn nb_box(&self) -> usize {
        self.anchors.len()
    }

    pub fn nb_classes(&self) -> usize {
        self.labels.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_filled() {
        let config: Config = serde_json::from_str(
            r#"{
                "input_size": 416,
                "anchors": [0.57, 0.67, 1.87, 2.06],
                "labels": ["raccoon"],
                "max_box_per_image": 10
            }"#,
        )
        .unwrap();
        config.validate().unwrap();

        assert_eq!(config.grid_size(), 13);
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.architecture, "GridPool");
        assert!(config.jitter);
        assert_eq!(config.generator_config().unwrap().nb_box(), 2);
    }

    #[test]
    fn rejects_bad_anchors() {
        let config: Config = serde_json::from_str(
            r#"{
                "input_size": 416,
                "anchors": [0.57, 0.67, 1.87],
                "labels": ["raccoon"],
                "max_box_per_image": 10
            }"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn missing_keys_fail_to_parse() {
        assert!(serde_json::from_str::<Config>(r#"{"input_size": 416}"#).is_err());
    }
}
