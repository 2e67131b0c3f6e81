//! 学習用のバッチ (入力画像, 正解ボックス, グリッドターゲット) を生成するモジュール

use std::path::Path;

use anyhow::{ensure, Context, Result};
use log::{debug, info};
use ndarray::{s, Array3, Array4, Array5};
use rand::{Rng, RngCore};

use crate::annotation::Annotations;
use crate::bbox::BoundBox;
use crate::config::GeneratorConfig;
use crate::img_proc;
use crate::label_gen::LabelBatchGenerator;

/// 画像を読み込み、ネットワーク入力の大きさに変換するコラボレータ
pub trait ImageLoader {
    /// 画像を読み込みます。
    ///
    /// # Args
    /// * `path` - 画像ファイルのパス
    /// * `boxes` - ピクセル座標の正解ボックス
    /// * `size` - 出力画像の一辺
    /// * `jitter` - データ拡張を行うか
    /// * `rng` - 乱数生成器
    ///
    /// # Return
    /// * (`(size, size, 3)` の画像テンソル, 変換後のボックス)
    fn load(
        &self,
        path: &Path,
        boxes: &[BoundBox],
        size: u32,
        jitter: bool,
        rng: &mut dyn RngCore,
    ) -> Result<(Array3<f32>, Vec<BoundBox>)>;
}

/// ファイルから画像を読み込む標準のImageLoader
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageReader;

impl ImageLoader for ImageReader {
    fn load(
        &self,
        path: &Path,
        boxes: &[BoundBox],
        size: u32,
        jitter: bool,
        rng: &mut dyn RngCore,
    ) -> Result<(Array3<f32>, Vec<BoundBox>)> {
        let (img, boxes) = img_proc::imread(path, boxes, size, size, jitter, rng)?;
        Ok((img_proc::to_tensor(&img), boxes))
    }
}

/// 1バッチ分のテンソル
#[derive(Debug, Clone)]
pub struct Batch {
    /// `(B, S, S, 3)`
    pub images: Array4<f32>,
    /// `(B, max_box_per_image, 4)`
    pub true_boxes: Array3<f32>,
    /// `(B, G, G, A, 5 + C)`
    pub targets: Array5<f32>,
}

type NormFn = Box<dyn Fn(Array3<f32>) -> Array3<f32>>;

/// アノテーションからバッチを生成する構造体
///
/// 1つのインスタンスを複数スレッドで共有しないでください。
/// 並列に読み込む場合はワーカーごとにインスタンスを作成します。
pub struct BatchGenerator<L = ImageReader> {
    annotations: Annotations,
    config: GeneratorConfig,
    label_generator: LabelBatchGenerator,
    loader: L,
    jitter: bool,
    norm: NormFn,
    counter: usize,
}

impl BatchGenerator<ImageReader> {
    /// ファイルから画像を読み込むBatchGeneratorを作成します。
    ///
    /// # Args
    /// * `annotations` - アノテーション
    /// * `config` - バッチ生成の設定
    /// * `jitter` - データ拡張を行うか
    ///
    /// # Return
    /// * バッチサイズ・グリッド・ボックスバッファのいずれかが0の場合はエラー
    pub fn new(annotations: Annotations, config: GeneratorConfig, jitter: bool) -> Result<Self> {
        Self::with_loader(annotations, config, jitter, ImageReader)
    }
}

impl<L: ImageLoader> BatchGenerator<L> {
    pub fn with_loader(
        annotations: Annotations,
        config: GeneratorConfig,
        jitter: bool,
        loader: L,
    ) -> Result<Self> {
        ensure!(config.batch_size > 0, "batch_size must be positive");
        ensure!(config.grid_size > 0, "grid_size must be positive");
        ensure!(config.max_box_per_image > 0, "max_box_per_image must be positive");

        let label_generator = LabelBatchGenerator::from_config(&config);
        Ok(Self {
            annotations,
            config,
            label_generator,
            loader,
            jitter,
            norm: Box::new(|x| x),
            counter: 0,
        })
    }

    /// 画像テンソルに適用する正規化関数を設定します。
    pub fn with_norm<F>(mut self, norm: F) -> Self
    where
        F: Fn(Array3<f32>) -> Array3<f32> + 'static,
    {
        self.norm = Box::new(norm);
        self
    }

    /// バッチ数。最後のバッチが端数になる場合も1つと数えます。
    pub fn len(&self) -> usize {
        let n = self.annotations.len();
        (n + self.config.batch_size - 1) / self.config.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.annotations.is_empty()
    }

    /// 現在のエポックで取り出したバッチ数
    pub fn counter(&self) -> usize {
        self.counter
    }

    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    /// `idx` 番目のバッチを生成します。
    ///
    /// 最後のバッチが端数になる場合、足りない分は先頭のアノテーションで埋めます。
    ///
    /// # Args
    /// * `idx` - バッチのインデックス (`0..len()`)
    /// * `rng` - データ拡張に使う乱数生成器
    ///
    /// # Return
    /// * 生成したバッチ。画像が読めない場合はエラー
    pub fn get_batch<R: Rng>(&mut self, idx: usize, rng: &mut R) -> Result<Batch> {
        ensure!(
            idx < self.len(),
            "batch index {} out of range for {} batches",
            idx,
            self.len()
        );

        let batch_size = self.config.batch_size;
        let size = self.config.input_size;
        let (g, _, a, d) = self.label_generator.target_shape();

        let mut images = Array4::zeros((batch_size, size, size, 3));
        let mut true_boxes = Array3::zeros((batch_size, self.config.max_box_per_image, 4));
        let mut targets = Array5::zeros((batch_size, g, g, a, d));

        for i in 0..batch_size {
            let ann_idx = (idx * batch_size + i) % self.annotations.len();
            let fname = self.annotations.fname(ann_idx);
            let boxes = self.annotations.boxes(ann_idx);
            let labels = self.annotations.code_labels(ann_idx);

            let (img, boxes) = self
                .loader
                .load(fname, &boxes, size as u32, self.jitter, rng)
                .with_context(|| format!("failed to load batch {} slot {}", idx, i))?;
            ensure!(
                img.dim() == (size, size, 3),
                "loaded image has shape {:?}, expected {:?}",
                img.dim(),
                (size, size, 3)
            );

            images.slice_mut(s![i, .., .., ..]).assign(&(self.norm)(img));
            self.label_generator.generate_into(
                &boxes,
                &labels,
                targets.slice_mut(s![i, .., .., .., ..]),
                true_boxes.slice_mut(s![i, .., ..]),
            )?;
        }
        debug!("batch {} generated", idx);

        self.counter += 1;
        Ok(Batch {
            images,
            true_boxes,
            targets,
        })
    }

    /// エポックの終わりに呼び出します。アノテーションをシャッフルし、カウンタを戻します。
    pub fn on_epoch_end<R: Rng>(&mut self, rng: &mut R) {
        info!("epoch end after {} batches, shuffling annotations", self.counter);
        self.annotations.shuffle(rng);
        self.counter = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchor::Anchors;
    use crate::annotation::{Annotation, Object};
    use rand::{rngs::StdRng, SeedableRng};
    use std::path::PathBuf;

    /// ファイルを読まずに一定値の画像を返すローダ
    struct ConstLoader;

    impl ImageLoader for ConstLoader {
        fn load(
            &self,
            path: &Path,
            boxes: &[BoundBox],
            size: u32,
            _jitter: bool,
            _rng: &mut dyn RngCore,
        ) -> Result<(Array3<f32>, Vec<BoundBox>)> {
            ensure!(!path.ends_with("broken.jpg"), "cannot read {}", path.display());
            let size = size as usize;
            Ok((Array3::from_elem((size, size, 3), 255.), boxes.to_vec()))
        }
    }

    fn config(batch_size: usize) -> GeneratorConfig {
        GeneratorConfig {
            input_size: 64,
            grid_size: 2,
            anchors: Anchors::from_flat(&[0.5, 0.5, 1.5, 1.5]).unwrap(),
            labels: vec!["a".into(), "b".into()],
            batch_size,
            max_box_per_image: 3,
        }
    }

    fn annotations(names: &[&str]) -> Annotations {
        let mut anns = Annotations::new(vec!["a".into(), "b".into()]);
        for (i, name) in names.iter().enumerate() {
            anns.add(Annotation {
                filename: PathBuf::from(name),
                width: 64,
                height: 64,
                objects: vec![Object {
                    name: if i % 2 == 0 { "a".into() } else { "b".into() },
                    xmin: 0.,
                    ymin: 0.,
                    xmax: 16.,
                    ymax: 16.,
                }],
            })
            .unwrap();
        }
        anns
    }

    #[test]
    fn batches_have_expected_shapes() {
        let anns = annotations(&["0.jpg", "1.jpg", "2.jpg"]);
        let mut gen = BatchGenerator::with_loader(anns, config(2), false, ConstLoader)
            .unwrap()
            .with_norm(|x| x / 255.);
        let mut rng = StdRng::seed_from_u64(1337);

        assert_eq!(gen.len(), 2);
        for idx in 0..gen.len() {
            let batch = gen.get_batch(idx, &mut rng).unwrap();
            assert_eq!(batch.images.dim(), (2, 64, 64, 3));
            assert_eq!(batch.true_boxes.dim(), (2, 3, 4));
            assert_eq!(batch.targets.dim(), (2, 2, 2, 2, 7));
            assert!(batch.images.iter().all(|&v| v == 1.));
        }
        assert_eq!(gen.counter(), 2);
    }

    #[test]
    fn slots_follow_annotation_order() {
        let anns = annotations(&["0.jpg", "1.jpg", "2.jpg"]);
        let mut gen = BatchGenerator::with_loader(anns, config(2), false, ConstLoader).unwrap();
        let mut rng = StdRng::seed_from_u64(0);

        let batch = gen.get_batch(0, &mut rng).unwrap();
        // 中心 (8, 8) px -> セル (0, 0)、0.5 セル -> アンカー0
        assert_eq!(batch.targets[[0, 0, 0, 0, 4]], 1.);
        assert_eq!(batch.targets[[0, 0, 0, 0, 5]], 1.);
        assert_eq!(batch.targets[[1, 0, 0, 0, 6]], 1.);

        // 端数のバッチは先頭から埋める
        let last = gen.get_batch(1, &mut rng).unwrap();
        assert_eq!(last.targets[[0, 0, 0, 0, 5]], 1.);
        assert_eq!(last.targets[[1, 0, 0, 0, 5]], 1.);
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        let anns = annotations(&["0.jpg"]);
        let mut gen = BatchGenerator::with_loader(anns, config(1), false, ConstLoader).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(gen.get_batch(1, &mut rng).is_err());
    }

    #[test]
    fn unreadable_image_propagates() {
        let anns = annotations(&["0.jpg", "broken.jpg"]);
        let mut gen = BatchGenerator::with_loader(anns, config(2), false, ConstLoader).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(gen.get_batch(0, &mut rng).is_err());
    }

    #[test]
    fn epoch_end_resets_counter() {
        let anns = annotations(&["0.jpg", "1.jpg", "2.jpg", "3.jpg"]);
        let mut gen = BatchGenerator::with_loader(anns, config(2), false, ConstLoader).unwrap();
        let mut rng = StdRng::seed_from_u64(0);

        gen.get_batch(0, &mut rng).unwrap();
        gen.on_epoch_end(&mut rng);
        assert_eq!(gen.counter(), 0);
        assert_eq!(gen.annotations().len(), 4);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        for (batch_size, max_box, grid) in [(0, 3, 2), (2, 0, 2), (2, 3, 0)] {
            let config = GeneratorConfig {
                max_box_per_image: max_box,
                grid_size: grid,
                ..config(batch_size)
            };
            let anns = annotations(&["0.jpg"]);
            assert!(BatchGenerator::with_loader(anns, config, false, ConstLoader).is_err());
        }
        let anns = annotations(&["0.jpg"]);
        assert!(BatchGenerator::new(anns, config(0), false).is_err());
    }
}
