use crate::bbox::{iou, BoundBox};

/// 1つのクラスについてNon-Maximum Suppressionを行います。
///
/// 確率の高い順に見ていき、既に残したボックスとのIoUが `nms_threshold` 以上のボックスは
/// そのクラスの確率を0にします (統合はしません)。
fn nms(boxes: &mut [BoundBox], class: usize, nms_threshold: f32) {
    let mut sorted: Vec<usize> = (0..boxes.len())
        .filter(|&i| boxes[i].classes[class] > 0.)
        .collect();
    sorted.sort_by(|&a, &b| boxes[b].classes[class].total_cmp(&boxes[a].classes[class]));

    for (ib, &i) in sorted.iter().enumerate() {
        if boxes[i].classes[class] == 0. {
            continue;
        }
        for &j in &sorted[ib + 1..] {
            if iou(&boxes[i], &boxes[j]) >= nms_threshold {
                boxes[j].classes[class] = 0.;
            }
        }
    }
}

/// クラスごとにNMSを適用し、どのクラスの確率も残らなかったボックスを取り除きます。
///
/// # Args
/// * `bb` - 検出結果。`classes` の長さは `cls_num` であること
/// * `cls_num` - クラスの数
/// * `nms_threshold` - 非最大抑制（NMS）の閾値
///
/// # Return
/// * 残ったボックス。元の並び順を保ちます
pub fn nms_process(bb: Vec<BoundBox>, cls_num: usize, nms_threshold: f32) -> Vec<BoundBox> {
    let mut boxes = bb;
    for class in 0..cls_num {
        nms(&mut boxes, class, nms_threshold);
    }
    boxes.retain(|b| b.classes.iter().any(|&p| p > 0.));
    boxes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(xmin: f32, xmax: f32, classes: Vec<f32>) -> BoundBox {
        BoundBox::with_scores(xmin, 0., xmax, 1., 1., classes)
    }

    #[test]
    fn overlapping_same_class_keeps_best() {
        // IoU = 0.8 / 1.2
        let boxes = vec![scored(0., 1., vec![0.6]), scored(0.2, 1.2, vec![0.9])];
        let kept = nms_process(boxes, 1, 0.3);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].classes[0], 0.9);
    }

    #[test]
    fn low_overlap_keeps_both() {
        // IoU = 0.1 / 1.9
        let boxes = vec![scored(0., 1., vec![0.6]), scored(0.9, 1.9, vec![0.9])];
        assert_eq!(nms_process(boxes, 1, 0.3).len(), 2);
    }

    #[test]
    fn different_classes_do_not_suppress() {
        let boxes = vec![scored(0., 1., vec![0.6, 0.]), scored(0., 1., vec![0., 0.9])];
        assert_eq!(nms_process(boxes, 2, 0.3).len(), 2);
    }

    #[test]
    fn suppressed_box_cannot_suppress_others() {
        // a > b > c。b は a に抑制され、c は b とだけ重なる
        let boxes = vec![
            scored(0., 1., vec![0.9]),
            scored(0.5, 1.5, vec![0.8]),
            scored(0.9, 1.9, vec![0.7]),
        ];
        let kept = nms_process(boxes, 1, 0.3);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[1].classes[0], 0.7);
    }
}
