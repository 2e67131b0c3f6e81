//! バウンディングボックスと座標変換に関するモジュール

/// 角 (xmin, ymin, xmax, ymax) 形式のバウンディングボックス
///
/// 座標系 (ピクセル・正規化・グリッド) は保持しません。
/// 異なる座標系のボックスを比較する前に、必ず明示的に変換してください。
#[derive(Debug, Clone, PartialEq)]
pub struct BoundBox {
    /// 左上のx
    pub xmin: f32,
    /// 左上のy
    pub ymin: f32,
    /// 右下のx
    pub xmax: f32,
    /// 右下のy
    pub ymax: f32,
    /// 物体確率 (検出結果のみ)
    pub objectness: Option<f32>,
    /// クラスごとの確率 (検出結果のみ)
    pub classes: Vec<f32>,
}

/// 中心 (cx, cy, w, h) 形式のバウンディングボックス
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CentroidBox {
    pub cx: f32,
    pub cy: f32,
    pub w: f32,
    pub h: f32,
}

impl BoundBox {
    /// スコアを持たない新しいBoundBoxを作成します。
    pub fn new(xmin: f32, ymin: f32, xmax: f32, ymax: f32) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
            objectness: None,
            classes: vec![],
        }
    }

    /// 物体確率とクラス確率を持つBoundBoxを作成します。
    ///
    /// # Args
    /// * `xmin`, `ymin`, `xmax`, `ymax` - ボックスの角の座標
    /// * `objectness` - 物体確率
    /// * `classes` - クラスごとの確率
    pub fn with_scores(
        xmin: f32,
        ymin: f32,
        xmax: f32,
        ymax: f32,
        objectness: f32,
        classes: Vec<f32>,
    ) -> Self {
        Self {
            xmin,
            ymin,
            xmax,
            ymax,
            objectness: Some(objectness),
            classes,
        }
    }

    pub fn width(&self) -> f32 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f32 {
        self.ymax - self.ymin
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.) * self.height().max(0.)
    }

    /// 最大の確率を持つクラスIDを返します。クラス確率を持たない場合はNoneです。
    pub fn label(&self) -> Option<usize> {
        self.classes
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(idx, _)| idx)
    }

    /// 最大のクラス確率を返します。
    pub fn score(&self) -> f32 {
        self.label().map(|idx| self.classes[idx]).unwrap_or(0.)
    }

    /// 中心形式に変換します。
    pub fn to_centroid(&self) -> CentroidBox {
        CentroidBox {
            cx: (self.xmin + self.xmax) / 2.,
            cy: (self.ymin + self.ymax) / 2.,
            w: self.xmax - self.xmin,
            h: self.ymax - self.ymin,
        }
    }

    /// x方向に `sx`、y方向に `sy` 倍します。スコアはそのまま引き継ぎます。
    pub fn scale(&self, sx: f32, sy: f32) -> Self {
        Self {
            xmin: self.xmin * sx,
            ymin: self.ymin * sy,
            xmax: self.xmax * sx,
            ymax: self.ymax * sy,
            ..self.clone()
        }
    }
}

impl CentroidBox {
    pub fn new(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self { cx, cy, w, h }
    }

    /// 角形式に変換します。
    pub fn to_corners(&self) -> BoundBox {
        BoundBox::new(
            self.cx - self.w / 2.,
            self.cy - self.h / 2.,
            self.cx + self.w / 2.,
            self.cy + self.h / 2.,
        )
    }

    /// 全要素を `ratio` 倍します。
    fn rescale(&self, ratio: f32) -> Self {
        Self {
            cx: self.cx * ratio,
            cy: self.cy * ratio,
            w: self.w * ratio,
            h: self.h * ratio,
        }
    }
}

impl From<&BoundBox> for CentroidBox {
    fn from(from: &BoundBox) -> Self {
        from.to_centroid()
    }
}

impl From<CentroidBox> for BoundBox {
    fn from(from: CentroidBox) -> Self {
        from.to_corners()
    }
}

/// 区間 [a0, a1] と [b0, b1] の重なりの長さ
fn interval_overlap(a0: f32, a1: f32, b0: f32, b1: f32) -> f32 {
    (a1.min(b1) - a0.max(b0)).max(0.)
}

/// 2つのボックスのIoU (Intersection over Union) を計算します。
///
/// # Args
/// * `a`, `b` - 同じ座標系のボックス
///
/// # Return
/// * 共通部分の面積 / 和集合の面積。重ならない場合は0
pub fn iou(a: &BoundBox, b: &BoundBox) -> f32 {
    let intersect = interval_overlap(a.xmin, a.xmax, b.xmin, b.xmax)
        * interval_overlap(a.ymin, a.ymax, b.ymin, b.ymax);
    let union = a.area() + b.area() - intersect;
    if union <= 0. {
        return 0.0;
    }
    intersect / union
}

/// 角形式のボックス列を中心形式に変換します。
pub fn to_centroid(boxes: &[BoundBox]) -> Vec<CentroidBox> {
    boxes.iter().map(BoundBox::to_centroid).collect()
}

/// 中心形式のボックス列を角形式に変換します。
pub fn to_corners(boxes: &[CentroidBox]) -> Vec<BoundBox> {
    boxes.iter().map(CentroidBox::to_corners).collect()
}

/// ピクセル座標の中心形式ボックスをグリッド単位に変換します。
///
/// 変換後の `cx`, `cy` の整数部はセルのインデックス、小数部はセル内のオフセットになります。
///
/// # Args
/// * `boxes` - ピクセル座標のボックス
/// * `input_size` - ネットワーク入力の一辺
/// * `grid_size` - 出力グリッドの一辺
pub fn to_normalize(
    boxes: &[CentroidBox],
    input_size: usize,
    grid_size: usize,
) -> Vec<CentroidBox> {
    let ratio = grid_size as f32 / input_size as f32;
    boxes.iter().map(|b| b.rescale(ratio)).collect()
}

/// `to_normalize` の逆変換です。グリッド単位のボックスをピクセル座標に戻します。
pub fn to_pixel(boxes: &[CentroidBox], input_size: usize, grid_size: usize) -> Vec<CentroidBox> {
    let ratio = input_size as f32 / grid_size as f32;
    boxes.iter().map(|b| b.rescale(ratio)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = BoundBox::new(0., 0., 10., 10.);
        let b = BoundBox::new(20., 20., 30., 30.);
        assert_eq!(iou(&a, &b), 0.);
    }

    #[test]
    fn iou_is_symmetric() {
        let a = BoundBox::new(0., 0., 10., 10.);
        let b = BoundBox::new(5., 5., 15., 20.);
        assert_abs_diff_eq!(iou(&a, &b), iou(&b, &a));
        // 25 / (100 + 150 - 25)
        assert_abs_diff_eq!(iou(&a, &b), 25. / 225., epsilon = 1e-6);
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = BoundBox::new(1., 2., 3., 5.);
        assert_abs_diff_eq!(iou(&a, &a), 1.);
    }

    #[test]
    fn iou_of_degenerate_boxes_is_zero() {
        let a = BoundBox::new(1., 1., 1., 1.);
        assert_eq!(iou(&a, &a), 0.);
    }

    #[test]
    fn centroid_round_trip() {
        let boxes = vec![
            BoundBox::new(12., 30., 96., 150.),
            BoundBox::new(0.5, 0.25, 1.75, 3.),
        ];
        let centroids = to_centroid(&boxes);
        let again = to_centroid(&to_corners(&centroids));
        for (a, b) in centroids.iter().zip(again.iter()) {
            assert_abs_diff_eq!(a.cx, b.cx, epsilon = 1e-5);
            assert_abs_diff_eq!(a.cy, b.cy, epsilon = 1e-5);
            assert_abs_diff_eq!(a.w, b.w, epsilon = 1e-5);
            assert_abs_diff_eq!(a.h, b.h, epsilon = 1e-5);
        }
    }

    #[test]
    fn normalize_to_grid_units() {
        let centroid = BoundBox::new(96., 128., 160., 192.).to_centroid();
        let norm = to_normalize(&[centroid], 416, 13)[0];
        // 416 / 13 = 32 px per cell
        assert_abs_diff_eq!(norm.cx, 4.);
        assert_abs_diff_eq!(norm.cy, 5.);
        assert_abs_diff_eq!(norm.w, 2.);
        assert_abs_diff_eq!(norm.h, 2.);

        let back = to_pixel(&[norm], 416, 13)[0];
        assert_abs_diff_eq!(back.cx, centroid.cx, epsilon = 1e-4);
        assert_abs_diff_eq!(back.h, centroid.h, epsilon = 1e-4);
    }

    #[test]
    fn label_picks_highest_class() {
        let b = BoundBox::with_scores(0., 0., 1., 1., 0.9, vec![0.1, 0.7, 0.2]);
        assert_eq!(b.label(), Some(1));
        assert_abs_diff_eq!(b.score(), 0.7);
        assert_eq!(BoundBox::new(0., 0., 1., 1.).label(), None);
    }
}
