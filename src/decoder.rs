//! ネットワークの生の出力を検出結果に変換するモジュール

use anyhow::{ensure, Result};
use log::debug;
use ndarray::{s, ArrayView1, ArrayView4};

use crate::anchor::Anchors;
use crate::bbox::BoundBox;
use crate::nms::nms_process;

fn sigmoid(x: f32) -> f32 {
    1. / (1. + (-x).exp())
}

/// 数値的に安定なsoftmax
fn softmax(logits: ArrayView1<f32>) -> Vec<f32> {
    let max = logits.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
    let exps: Vec<f32> = logits.iter().map(|&v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// YOLOv2の出力 `(G, G, A, 5 + C)` をデコードする構造体
#[derive(Debug, Clone)]
pub struct YoloDecoder {
    anchors: Anchors,
    nms_threshold: f32,
    obj_threshold: f32,
}

impl YoloDecoder {
    /// 新しいYoloDecoderを作成します。
    ///
    /// # Args
    /// * `anchors` - アンカー (グリッド単位)
    /// * `nms_threshold` - 非最大抑制（NMS）の閾値
    /// * `obj_threshold` - 確信度の閾値。これ未満のクラス確率は捨てられます
    pub fn new(anchors: Anchors, nms_threshold: f32, obj_threshold: f32) -> Self {
        Self {
            anchors,
            nms_threshold,
            obj_threshold,
        }
    }

    pub fn anchors(&self) -> &Anchors {
        &self.anchors
    }

    /// 出力テンソルをデコードします。
    ///
    /// # Args
    /// * `netout` - 1枚分のネットワーク出力 `(G, G, A, 5 + C)`
    ///
    /// # Return
    /// * 検出結果。座標は画像の幅・高さを1とした正規化座標です。検出がなければ空
    pub fn run(&self, netout: ArrayView4<f32>) -> Result<Vec<BoundBox>> {
        let (grid_h, grid_w, nb_box, depth) = netout.dim();
        ensure!(
            grid_h == grid_w && grid_h > 0,
            "netout grid must be square, got {}x{}",
            grid_h,
            grid_w
        );
        ensure!(
            nb_box == self.anchors.len(),
            "netout has {} anchors but decoder has {}",
            nb_box,
            self.anchors.len()
        );
        ensure!(depth > 5, "netout depth {} leaves no classes", depth);

        let grid_size = grid_h as f32;
        let nb_class = depth - 5;

        let mut boxes = vec![];
        for row in 0..grid_h {
            for col in 0..grid_w {
                for b in 0..nb_box {
                    let slot = netout.slice(s![row, col, b, ..]);

                    // 確信度 = 物体確率 * クラス確率
                    let objectness = sigmoid(slot[4]);
                    let classes: Vec<f32> = softmax(slot.slice(s![5..]))
                        .into_iter()
                        .map(|p| objectness * p)
                        .map(|c| if c >= self.obj_threshold { c } else { 0. })
                        .collect();
                    if classes.iter().all(|&c| c == 0.) {
                        continue;
                    }

                    let [anchor_w, anchor_h] = self.anchors.size(b);
                    let x = (col as f32 + sigmoid(slot[0])) / grid_size;
                    let y = (row as f32 + sigmoid(slot[1])) / grid_size;
                    let w = anchor_w * slot[2].exp() / grid_size;
                    let h = anchor_h * slot[3].exp() / grid_size;

                    boxes.push(BoundBox::with_scores(
                        x - w / 2.,
                        y - h / 2.,
                        x + w / 2.,
                        y + h / 2.,
                        objectness,
                        classes,
                    ));
                }
            }
        }
        debug!("{} candidate boxes above threshold", boxes.len());

        Ok(nms_process(boxes, nb_class, self.nms_threshold))
    }

    /// 出力テンソルをデコードし、`width` x `height` の画像のピクセル座標で返します。
    pub fn run_pixels(
        &self,
        netout: ArrayView4<f32>,
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundBox>> {
        Ok(self
            .run(netout)?
            .iter()
            .map(|b| b.scale(width as f32, height as f32))
            .collect())
    }
}
