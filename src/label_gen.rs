//! 正解ボックスをネットワーク出力と同じ形のテンソルに変換するモジュール

use anyhow::{bail, ensure, Result};
use log::debug;
use ndarray::{s, Array2, Array4, ArrayViewMut2, ArrayViewMut4};

use crate::anchor::Anchors;
use crate::bbox::{to_centroid, to_normalize, BoundBox, CentroidBox};
use crate::config::GeneratorConfig;

/// 1枚の画像の正解から (グリッドターゲット, 正解ボックスバッファ) を生成する構造体
#[derive(Debug, Clone)]
pub struct LabelBatchGenerator {
    input_size: usize,
    grid_size: usize,
    n_classes: usize,
    max_box_per_image: usize,
    anchors: Anchors,
}

impl LabelBatchGenerator {
    /// 新しいLabelBatchGeneratorを作成します。
    ///
    /// # Args
    /// * `input_size` - ネットワーク入力の一辺
    /// * `grid_size` - 出力グリッドの一辺
    /// * `n_classes` - クラス数
    /// * `max_box_per_image` - 正解ボックスバッファの容量
    /// * `anchors` - アンカー (グリッド単位)
    pub fn new(
        input_size: usize,
        grid_size: usize,
        n_classes: usize,
        max_box_per_image: usize,
        anchors: Anchors,
    ) -> Self {
        Self {
            input_size,
            grid_size,
            n_classes,
            max_box_per_image,
            anchors,
        }
    }

    pub fn from_config(config: &GeneratorConfig) -> Self {
        Self::new(
            config.input_size,
            config.grid_size,
            config.nb_classes(),
            config.max_box_per_image,
            config.anchors.clone(),
        )
    }

    pub fn anchors(&self) -> &Anchors {
        &self.anchors
    }

    /// グリッドターゲットの形 `(G, G, A, 5 + C)`
    pub fn target_shape(&self) -> (usize, usize, usize, usize) {
        (
            self.grid_size,
            self.grid_size,
            self.anchors.len(),
            4 + 1 + self.n_classes,
        )
    }

    /// ボックスを担当するアンカーのインデックスを返します。
    pub fn anchor_idx(&self, norm_box: &CentroidBox) -> usize {
        self.anchors.best_index(norm_box.w, norm_box.h)
    }

    /// 中心座標が属するセルのインデックス。グリッド外の中心は端のセルに寄せます。
    fn cell_index(&self, v: f32) -> usize {
        (v.max(0.).floor() as usize).min(self.grid_size - 1)
    }

    /// 1枚分の正解テンソルを生成します。
    ///
    /// # Args
    /// * `boxes` - ピクセル座標の正解ボックス (角形式)
    /// * `labels` - `boxes` と同じ長さのクラスID
    ///
    /// # Return
    /// * (グリッドターゲット `(G, G, A, 5 + C)`, 正解ボックスバッファ `(max_box_per_image, 4)`)
    pub fn generate(
        &self,
        boxes: &[BoundBox],
        labels: &[usize],
    ) -> Result<(Array4<f32>, Array2<f32>)> {
        let mut y = Array4::zeros(self.target_shape());
        let mut b = Array2::zeros((self.max_box_per_image, 4));
        self.generate_into(boxes, labels, y.view_mut(), b.view_mut())?;
        Ok((y, b))
    }

    /// `generate` と同じ処理を、確保済みのバッファに書き込みます。
    ///
    /// 同じセル・アンカーに複数のボックスが割り当てられた場合は、後のボックスで上書きします。
    ///
    /// # Args
    /// * `boxes` - ピクセル座標の正解ボックス (角形式)
    /// * `labels` - クラスID
    /// * `y` - グリッドターゲットの書き込み先 (in-place, ゼロ初期化済みであること)
    /// * `b` - 正解ボックスバッファの書き込み先 (in-place)
    pub fn generate_into(
        &self,
        boxes: &[BoundBox],
        labels: &[usize],
        mut y: ArrayViewMut4<f32>,
        mut b: ArrayViewMut2<f32>,
    ) -> Result<()> {
        ensure!(
            self.grid_size > 0 && self.max_box_per_image > 0,
            "grid_size and max_box_per_image must be positive"
        );
        ensure!(
            boxes.len() == labels.len(),
            "got {} boxes but {} labels",
            boxes.len(),
            labels.len()
        );
        ensure!(
            y.dim() == self.target_shape(),
            "target buffer shape {:?} does not match {:?}",
            y.dim(),
            self.target_shape()
        );
        ensure!(
            b.dim() == (self.max_box_per_image, 4),
            "true box buffer shape {:?} does not match {:?}",
            b.dim(),
            (self.max_box_per_image, 4)
        );
        if let Some(&label) = labels.iter().find(|&&l| l >= self.n_classes) {
            bail!("label {} out of range for {} classes", label, self.n_classes);
        }

        let norm_boxes = to_normalize(&to_centroid(boxes), self.input_size, self.grid_size);
        if norm_boxes.len() > self.max_box_per_image {
            debug!(
                "{} boxes exceed the true box buffer of {}, earlier entries are overwritten",
                norm_boxes.len(),
                self.max_box_per_image
            );
        }

        for (idx, (norm_box, &label)) in norm_boxes.iter().zip(labels).enumerate() {
            let best_anchor = self.anchor_idx(norm_box);
            let grid_x = self.cell_index(norm_box.cx);
            let grid_y = self.cell_index(norm_box.cy);

            let mut slot = y.slice_mut(s![grid_y, grid_x, best_anchor, ..]);
            if slot[4] != 0. {
                debug!(
                    "cell ({}, {}) anchor {} already assigned, overwritten",
                    grid_x, grid_y, best_anchor
                );
                slot.fill(0.);
            }
            slot[0] = norm_box.cx;
            slot[1] = norm_box.cy;
            slot[2] = norm_box.w;
            slot[3] = norm_box.h;
            slot[4] = 1.;
            slot[5 + label] = 1.;

            // バッファが一杯になったら先頭から上書き
            let true_box_index = idx % self.max_box_per_image;
            let mut row = b.row_mut(true_box_index);
            row[0] = norm_box.cx;
            row[1] = norm_box.cy;
            row[2] = norm_box.w;
            row[3] = norm_box.h;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn generator(max_box_per_image: usize) -> LabelBatchGenerator {
        let anchors = Anchors::from_flat(&[1., 1., 3., 3., 6., 6.]).unwrap();
        LabelBatchGenerator::new(416, 13, 3, max_box_per_image, anchors)
    }

    #[test]
    fn no_boxes_give_zero_tensors() {
        let (y, b) = generator(10).generate(&[], &[]).unwrap();
        assert_eq!(y.dim(), (13, 13, 3, 8));
        assert_eq!(b.dim(), (10, 4));
        assert!(y.iter().all(|&v| v == 0.));
        assert!(b.iter().all(|&v| v == 0.));
    }

    #[test]
    fn single_box_is_written_at_y_x_anchor() {
        // 中心 (112, 144) px -> セル (3, 4)、大きさ 3x3 セル -> アンカー1
        let boxes = [BoundBox::new(64., 96., 160., 192.)];
        let (y, b) = generator(10).generate(&boxes, &[2]).unwrap();

        assert_eq!(y[[4, 3, 1, 4]], 1.);
        assert_eq!(y[[4, 3, 1, 5 + 2]], 1.);
        assert_eq!(y.slice(s![.., .., .., 4]).iter().filter(|&&v| v != 0.).count(), 1);
        assert_abs_diff_eq!(y[[4, 3, 1, 0]], 3.5);
        assert_abs_diff_eq!(y[[4, 3, 1, 1]], 4.5);
        assert_abs_diff_eq!(y[[4, 3, 1, 2]], 3.);

        assert_abs_diff_eq!(b[[0, 0]], 3.5);
        assert_abs_diff_eq!(b[[0, 3]], 3.);
        assert!(b.slice(s![1.., ..]).iter().all(|&v| v == 0.));
    }

    #[test]
    fn boundary_floors_to_lower_cell() {
        // 中心がちょうど x = 4.0 セル
        let boxes = [BoundBox::new(112., 112., 144., 144.)];
        let (y, _) = generator(10).generate(&boxes, &[0]).unwrap();
        assert_eq!(y[[4, 4, 0, 4]], 1.);
    }

    #[test]
    fn colliding_boxes_last_write_wins() {
        let boxes = [
            BoundBox::new(100., 100., 124., 124.),
            BoundBox::new(104., 104., 126., 126.),
        ];
        let (y, _) = generator(10).generate(&boxes, &[0, 1]).unwrap();

        assert_eq!(y[[3, 3, 0, 4]], 1.);
        assert_eq!(y[[3, 3, 0, 5]], 0.);
        assert_eq!(y[[3, 3, 0, 6]], 1.);
        assert_abs_diff_eq!(y[[3, 3, 0, 0]], 115. * 13. / 416., epsilon = 1e-5);
    }

    #[test]
    fn true_box_buffer_wraps_around() {
        let boxes: Vec<_> = (0..3)
            .map(|i| {
                let x = 32. * (2 * i) as f32;
                BoundBox::new(x, 0., x + 32., 32.)
            })
            .collect();
        let (_, b) = generator(2).generate(&boxes, &[0, 0, 0]).unwrap();

        // 3つ目のボックスが先頭を上書きする
        assert_abs_diff_eq!(b[[0, 0]], 4.5);
        assert_abs_diff_eq!(b[[1, 0]], 2.5);
    }

    #[test]
    fn rejects_mismatched_labels() {
        let g = generator(2);
        assert!(g.generate(&[BoundBox::new(0., 0., 1., 1.)], &[]).is_err());
        assert!(g.generate(&[BoundBox::new(0., 0., 1., 1.)], &[3]).is_err());
    }
}
