//! 特徴抽出器と検出ヘッドからなるネットワークのモジュール
//!
//! バックボーンのCNNは `FeatureExtractor` として外部から差し込みます。
//! このクレートには学習済みパラメータを持たない `GridPool` だけが含まれます。

use std::{
    fs::File,
    io::Read,
    path::Path,
    str::FromStr,
};

use anyhow::{bail, ensure, Context, Result};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use log::{info, warn};
use ndarray::{s, Array1, Array2, Array3, Array4, ArrayView3, Axis};
use rand::Rng;
use rand_distr::StandardNormal;

use crate::config::DOWNSAMPLE_RATIO;

/// 特徴抽出器 (バックボーン) のインターフェース
pub trait FeatureExtractor {
    /// 正規化済みの `(S, S, 3)` 画像から `(G, G, D)` の特徴マップを計算します。
    fn extract(&self, input: ArrayView3<f32>) -> Result<Array3<f32>>;

    /// 出力グリッドの一辺 `G`
    fn output_grid_size(&self) -> usize;

    /// 特徴マップのチャネル数 `D`
    fn feature_depth(&self) -> usize;

    /// 0..=255 のRGB画像をこの特徴抽出器の入力範囲に正規化します。
    fn normalize(&self, image: Array3<f32>) -> Array3<f32>;
}

/// 設定ファイルで選択できる特徴抽出器の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    FullYolo,
    TinyYolo,
    MobileNet,
    SqueezeNet,
    Inception3,
    Vgg16,
    ResNet50,
    GridPool,
}

impl FromStr for Architecture {
    type Err = anyhow::Error;

    fn from_str(name: &str) -> Result<Self> {
        let arch = match name {
            "Full Yolo" => Self::FullYolo,
            "Tiny Yolo" => Self::TinyYolo,
            "MobileNet" => Self::MobileNet,
            "SqueezeNet" => Self::SqueezeNet,
            "Inception3" => Self::Inception3,
            "VGG16" => Self::Vgg16,
            "ResNet50" => Self::ResNet50,
            "GridPool" => Self::GridPool,
            _ => bail!("architecture '{}' is not supported", name),
        };
        Ok(arch)
    }
}

/// ImageNetのBGR平均値
const BGR_MEAN: [f32; 3] = [103.939, 116.779, 123.68];

impl Architecture {
    /// 0..=255 のRGB画像を、このアーキテクチャの学習時と同じ範囲に正規化します。
    pub fn normalize(&self, image: Array3<f32>) -> Array3<f32> {
        match self {
            Self::FullYolo | Self::TinyYolo | Self::GridPool => image / 255.,
            Self::MobileNet | Self::Inception3 => (image / 255. - 0.5) * 2.,
            Self::SqueezeNet | Self::Vgg16 | Self::ResNet50 => {
                // RGB -> BGR にして平均を引く
                let mut bgr = image.slice(s![.., .., ..;-1]).to_owned();
                for (c, mean) in BGR_MEAN.iter().enumerate() {
                    bgr.index_axis_mut(Axis(2), c).mapv_inplace(|v| v - mean);
                }
                bgr
            }
        }
    }
}

/// 特徴抽出器を作成します。
///
/// 学習済みCNNのバックボーンは外部のフレームワークで実装し、`FeatureExtractor` を通して渡してください。
///
/// # Args
/// * `architecture` - 特徴抽出器の名前
/// * `input_size` - ネットワーク入力の一辺
pub fn create_feature_extractor(architecture: &str, input_size: usize) -> Result<GridPool> {
    match architecture.parse::<Architecture>()? {
        Architecture::GridPool => GridPool::new(input_size),
        other => bail!(
            "{:?} backbone is not bundled, provide it as a FeatureExtractor",
            other
        ),
    }
}

/// セルごとに各チャネルの平均と標準偏差を計算するだけの特徴抽出器
#[derive(Debug, Clone)]
pub struct GridPool {
    input_size: usize,
    grid_size: usize,
}

impl GridPool {
    pub fn new(input_size: usize) -> Result<Self> {
        ensure!(
            input_size >= DOWNSAMPLE_RATIO && input_size % DOWNSAMPLE_RATIO == 0,
            "input_size {} must be a multiple of {}",
            input_size,
            DOWNSAMPLE_RATIO
        );
        Ok(Self {
            input_size,
            grid_size: input_size / DOWNSAMPLE_RATIO,
        })
    }
}

impl FeatureExtractor for GridPool {
    fn extract(&self, input: ArrayView3<f32>) -> Result<Array3<f32>> {
        ensure!(
            input.dim() == (self.input_size, self.input_size, 3),
            "input shape {:?} does not match ({}, {}, 3)",
            input.dim(),
            self.input_size,
            self.input_size
        );

        let cell = DOWNSAMPLE_RATIO;
        let mut features = Array3::zeros((self.grid_size, self.grid_size, 6));
        for gy in 0..self.grid_size {
            for gx in 0..self.grid_size {
                let patch = input.slice(s![
                    gy * cell..(gy + 1) * cell,
                    gx * cell..(gx + 1) * cell,
                    ..
                ]);
                for c in 0..3 {
                    let channel = patch.index_axis(Axis(2), c);
                    let mean = channel.mean().unwrap_or(0.);
                    features[[gy, gx, c]] = mean;
                    features[[gy, gx, 3 + c]] = channel.std(0.);
                }
            }
        }
        Ok(features)
    }

    fn output_grid_size(&self) -> usize {
        self.grid_size
    }

    fn feature_depth(&self) -> usize {
        6
    }

    fn normalize(&self, image: Array3<f32>) -> Array3<f32> {
        Architecture::GridPool.normalize(image)
    }
}

/// ネットワークのインターフェース
pub trait Network {
    /// `(S, S, 3)` の0..=255のRGB画像から `(G, G, A, 5 + C)` の生の出力を計算します。
    fn forward(&self, image: ArrayView3<f32>) -> Result<Array4<f32>>;

    /// 重みを読み込みます。
    fn load_weights(&mut self, path: &Path) -> Result<()>;

    /// 重みを保存します。
    fn save_weights(&self, path: &Path) -> Result<()>;

    /// ネットワーク入力の一辺
    fn input_size(&self) -> usize;

    /// 出力グリッドの一辺
    fn grid_size(&self) -> usize;
}

/// 特徴抽出器の上に1x1畳み込みの検出ヘッドを載せたYOLOv2ネットワーク
#[derive(Debug, Clone)]
pub struct YoloNetwork<F> {
    backbone: F,
    input_size: usize,
    nb_box: usize,
    nb_classes: usize,
    /// `(D, A * (5 + C))`
    weights: Array2<f32>,
    /// `(A * (5 + C))`
    biases: Array1<f32>,
}

impl<F: FeatureExtractor> YoloNetwork<F> {
    /// 新しいYoloNetworkを作成します。検出ヘッドは N(0, 1) / G^2 で初期化されます。
    ///
    /// # Args
    /// * `backbone` - 特徴抽出器
    /// * `input_size` - ネットワーク入力の一辺
    /// * `nb_box` - アンカー数
    /// * `nb_classes` - クラス数
    /// * `rng` - 初期化に使う乱数生成器
    pub fn new<R: Rng>(
        backbone: F,
        input_size: usize,
        nb_box: usize,
        nb_classes: usize,
        rng: &mut R,
    ) -> Self {
        let depth = backbone.feature_depth();
        let outputs = nb_box * (4 + 1 + nb_classes);
        let grid_size = backbone.output_grid_size();
        let scale = (grid_size * grid_size) as f32;

        let weights = Array2::from_shape_simple_fn((depth, outputs), || {
            rng.sample::<f32, _>(StandardNormal) / scale
        });
        let biases =
            Array1::from_shape_simple_fn(outputs, || rng.sample::<f32, _>(StandardNormal) / scale);

        Self {
            backbone,
            input_size,
            nb_box,
            nb_classes,
            weights,
            biases,
        }
    }

    pub fn backbone(&self) -> &F {
        &self.backbone
    }
}

impl<F: FeatureExtractor> Network for YoloNetwork<F> {
    fn forward(&self, image: ArrayView3<f32>) -> Result<Array4<f32>> {
        let normalized = self.backbone.normalize(image.to_owned());
        let features = self.backbone.extract(normalized.view())?;

        let (gh, gw, depth) = features.dim();
        ensure!(
            depth == self.weights.nrows(),
            "feature depth {} does not match head input {}",
            depth,
            self.weights.nrows()
        );
        let flat = features.into_shape((gh * gw, depth))?;
        let out = flat.dot(&self.weights) + &self.biases;
        Ok(out.into_shape((gh, gw, self.nb_box, 4 + 1 + self.nb_classes))?)
    }

    /// gzip圧縮したtarアーカイブから検出ヘッドの重みとバイアスを読み込みます。
    ///
    /// データはリトルエンディアンのf32として解釈されます。
    /// * ファイル名が "biases" で始まる場合、バイアスデータとして解釈されます。
    /// * ファイル名が "weights" で始まる場合、重みデータとして解釈されます。
    /// * それ以外のファイル名の場合、警告がログに出力され、そのファイルは無視されます。
    fn load_weights(&mut self, path: &Path) -> Result<()> {
        let file = File::open(path)
            .with_context(|| format!("failed to open weights '{}'", path.display()))?;
        let mut archive = tar::Archive::new(GzDecoder::new(file));

        let (mut weights, mut biases) = (None, None);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let name = entry
                .path()?
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            let mut buf = vec![];
            entry.read_to_end(&mut buf)?;
            let values = f32_from_le_bytes(&buf)
                .with_context(|| format!("malformed entry '{}'", name))?;

            if name.starts_with("weights") {
                weights = Some(values);
            } else if name.starts_with("biases") {
                biases = Some(values);
            } else {
                warn!("ignore unknown entry '{}' in '{}'", name, path.display());
            }
        }

        let weights = weights.context("weights entry not found")?;
        let biases = biases.context("biases entry not found")?;
        self.weights = Array2::from_shape_vec(self.weights.dim(), weights)
            .context("weights size does not match the network")?;
        self.biases = Array1::from_shape_vec(self.biases.dim(), biases)
            .context("biases size does not match the network")?;

        info!("weights loaded from '{}'", path.display());
        Ok(())
    }

    fn save_weights(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("failed to create weights '{}'", path.display()))?;
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));

        let entries = [
            ("weights", f32_to_le_bytes(self.weights.iter())),
            ("biases", f32_to_le_bytes(self.biases.iter())),
        ];
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, data.as_slice())?;
        }
        builder.into_inner()?.finish()?;
        Ok(())
    }

    fn input_size(&self) -> usize {
        self.input_size
    }

    fn grid_size(&self) -> usize {
        self.backbone.output_grid_size()
    }
}

fn f32_to_le_bytes<'a>(values: impl Iterator<Item = &'a f32>) -> Vec<u8> {
    values.flat_map(|v| v.to_le_bytes()).collect()
}

fn f32_from_le_bytes(buf: &[u8]) -> Result<Vec<f32>> {
    ensure!(buf.len() % 4 == 0, "length {} is not a multiple of 4", buf.len());
    Ok(buf
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}
