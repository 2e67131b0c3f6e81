//! ネットワークとデコーダをまとめて物体検出を行うモジュール

use std::path::Path;

use anyhow::{ensure, Result};
use image::DynamicImage;
use log::info;
use ndarray::ArrayView3;
use rand::Rng;

use crate::anchor::Anchors;
use crate::bbox::BoundBox;
use crate::config::Config;
use crate::decoder::YoloDecoder;
use crate::img_proc;
use crate::network::{create_feature_extractor, FeatureExtractor, GridPool, Network, YoloNetwork};

/// YOLOv2の物体検出器
pub struct Yolo<N> {
    network: N,
    decoder: YoloDecoder,
    labels: Vec<String>,
}

impl<N: Network> Yolo<N> {
    /// 新しい `Yolo` インスタンスを作成します。
    ///
    /// # Args
    /// * `network` - ネットワーク
    /// * `labels` - クラス名
    /// * `anchors` - アンカー
    /// * `nms_threshold` - NMSの閾値
    /// * `obj_threshold` - 確信度の閾値
    pub fn new(
        network: N,
        labels: Vec<String>,
        anchors: Anchors,
        nms_threshold: f32,
        obj_threshold: f32,
    ) -> Self {
        let decoder = YoloDecoder::new(anchors, nms_threshold, obj_threshold);
        Self {
            network,
            decoder,
            labels,
        }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn load_weights<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.network.load_weights(path.as_ref())
    }

    /// ネットワーク入力の大きさの画像テンソルから物体を検出します。
    ///
    /// # Args
    /// * `input` - `(S, S, 3)` の0..=255のRGBテンソル
    ///
    /// # Return
    /// * 正規化座標の検出結果
    pub fn start(&self, input: ArrayView3<f32>) -> Result<Vec<BoundBox>> {
        let netout = self.network.forward(input)?;
        self.decoder.run(netout.view())
    }

    /// 画像から物体を検出します。
    ///
    /// # Args
    /// * `img` - 入力画像 (任意の大きさ)
    ///
    /// # Return
    /// * 入力画像のピクセル座標の検出結果
    pub fn predict(&self, img: &DynamicImage) -> Result<Vec<BoundBox>> {
        let input = img_proc::resize_to_tensor(img, self.network.input_size() as u32);
        let boxes = self
            .start(input.view())?
            .iter()
            .map(|b| b.scale(img.width() as f32, img.height() as f32))
            .collect();
        Ok(boxes)
    }
}

/// 設定ファイルの内容から検出器を組み立てます。重みが指定されていれば読み込みます。
///
/// # Args
/// * `config` - 設定
/// * `rng` - 検出ヘッドの初期化に使う乱数生成器
pub fn create_yolo<R: Rng>(config: &Config, rng: &mut R) -> Result<Yolo<YoloNetwork<GridPool>>> {
    let backbone = create_feature_extractor(&config.architecture, config.input_size)?;
    let anchors = config.anchors()?;
    ensure!(
        backbone.output_grid_size() == config.grid_size(),
        "backbone grid {} does not match configured grid {}",
        backbone.output_grid_size(),
        config.grid_size()
    );

    let network = YoloNetwork::new(
        backbone,
        config.input_size,
        anchors.len(),
        config.nb_classes(),
        rng,
    );
    let mut yolo = Yolo::new(
        network,
        config.labels.clone(),
        anchors,
        config.nms_threshold,
        config.obj_threshold,
    );

    if let Some(weights) = &config.weights {
        yolo.load_weights(weights)?;
    } else {
        info!("no weights given, detection head is randomly initialized");
    }
    Ok(yolo)
}
