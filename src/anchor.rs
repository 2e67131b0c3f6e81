//! アンカーボックスを扱うモジュール

use anyhow::{ensure, Result};

use crate::bbox::{iou, BoundBox};

/// 固定サイズのアンカーボックス列
///
/// 設定から一度だけ作成し、以降は参照で共有します。インデックスがアンカーIDです。
/// 幅と高さはグリッドセル単位です。
#[derive(Debug, Clone, PartialEq)]
pub struct Anchors {
    sizes: Vec<[f32; 2]>,
}

impl Anchors {
    /// `[w0, h0, w1, h1, ...]` 形式の配列からアンカーを作成します。
    ///
    /// # Args
    /// * `values` - 幅と高さを交互に並べた配列
    ///
    /// # Return
    /// * 新たなAnchorsインスタンス
    pub fn from_flat(values: &[f32]) -> Result<Self> {
        ensure!(!values.is_empty(), "anchors must not be empty");
        ensure!(
            values.len() % 2 == 0,
            "anchors must be (width, height) pairs, got {} values",
            values.len()
        );
        ensure!(
            values.iter().all(|v| v.is_finite() && *v > 0.),
            "anchor sizes must be positive: {:?}",
            values
        );

        let sizes = values.chunks(2).map(|wh| [wh[0], wh[1]]).collect();
        Ok(Self { sizes })
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }

    /// `idx` 番目のアンカーの (幅, 高さ)
    pub fn size(&self, idx: usize) -> [f32; 2] {
        self.sizes[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = &[f32; 2]> {
        self.sizes.iter()
    }

    /// 原点に置いたアンカーをBoundBoxとして返します。
    pub fn boxes(&self) -> Vec<BoundBox> {
        self.sizes
            .iter()
            .map(|&[w, h]| BoundBox::new(0., 0., w, h))
            .collect()
    }

    /// 与えられた大きさのボックスに最もよく合うアンカーのインデックスを返します。
    ///
    /// ボックスも原点に移動し、大きさだけでIoUを比較します。
    /// IoUが同じ場合は先に見つかった (小さい) インデックスが選ばれます。
    ///
    /// # Args
    /// * `w`, `h` - グリッド単位のボックスの幅と高さ
    ///
    /// # Return
    /// * `[0, len())` のアンカーインデックス
    pub fn best_index(&self, w: f32, h: f32) -> usize {
        let shifted = BoundBox::new(0., 0., w, h);

        let mut best_anchor = 0;
        let mut max_iou = -1.;
        for (idx, anchor) in self.boxes().iter().enumerate() {
            let overlap = iou(&shifted, anchor);
            if max_iou < overlap {
                best_anchor = idx;
                max_iou = overlap;
            }
        }
        best_anchor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VOC_ANCHORS: [f32; 10] = [
        1.08, 1.19, 3.42, 4.41, 6.63, 11.38, 9.42, 5.11, 16.62, 10.52,
    ];

    #[test]
    fn rejects_odd_length() {
        assert!(Anchors::from_flat(&[1., 2., 3.]).is_err());
        assert!(Anchors::from_flat(&[]).is_err());
        assert!(Anchors::from_flat(&[1., -2.]).is_err());
    }

    #[test]
    fn best_index_is_in_range_and_maximal() {
        let anchors = Anchors::from_flat(&VOC_ANCHORS).unwrap();
        assert_eq!(anchors.len(), 5);

        let sizes = [
            (0.3, 0.4),
            (3.5, 4.0),
            (7.0, 10.0),
            (12.0, 6.0),
            (20.0, 12.0),
            (1.0, 9.0),
        ];
        for &(w, h) in &sizes {
            let idx = anchors.best_index(w, h);
            assert!(idx < anchors.len());

            let shifted = BoundBox::new(0., 0., w, h);
            let best = iou(&shifted, &anchors.boxes()[idx]);
            for anchor in anchors.boxes() {
                assert!(best >= iou(&shifted, &anchor));
            }
        }
    }

    #[test]
    fn ties_go_to_lowest_index() {
        let anchors = Anchors::from_flat(&[2., 2., 2., 2., 1., 1.]).unwrap();
        assert_eq!(anchors.best_index(2., 2.), 0);
    }
}
