//! YOLOの入力画像に関する画像処理モジュール

use std::path::Path;

use anyhow::{Context, Result};
use color_space::ToRgb;
use image::imageops::{self, FilterType};
use image::{DynamicImage, Pixel, Rgb, RgbImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;
use ndarray::Array3;
use rand::Rng;

use crate::bbox::BoundBox;

/// 画像を読み込み、`width` x `height` にリサイズします。ボックスも同じように変換します。
///
/// # Args
/// * `path` - 画像ファイルのパス
/// * `boxes` - ピクセル座標の正解ボックス
/// * `width`, `height` - リサイズ後のサイズ
/// * `jitter` - ランダムな拡大・平行移動・反転・明度変化を加えるか
/// * `rng` - 乱数生成器
///
/// # Return
/// * (リサイズ後の画像, 変換後のボックス)
pub fn imread<R: Rng + ?Sized>(
    path: &Path,
    boxes: &[BoundBox],
    width: u32,
    height: u32,
    jitter: bool,
    rng: &mut R,
) -> Result<(RgbImage, Vec<BoundBox>)> {
    let img = image::open(path)
        .with_context(|| format!("failed to read image '{}'", path.display()))?
        .to_rgb8();

    if jitter {
        Ok(jitter_img(&img, boxes, width, height, rng))
    } else {
        let sx = width as f32 / img.width() as f32;
        let sy = height as f32 / img.height() as f32;
        let resized = imageops::resize(&img, width, height, FilterType::Nearest);
        let boxes = boxes
            .iter()
            .map(|b| clip(&b.scale(sx, sy), width as f32, height as f32))
            .collect();
        Ok((resized, boxes))
    }
}

/// ランダムに拡大して切り出し、左右反転と明度変化を加えます。
fn jitter_img<R: Rng + ?Sized>(
    img: &RgbImage,
    boxes: &[BoundBox],
    width: u32,
    height: u32,
    rng: &mut R,
) -> (RgbImage, Vec<BoundBox>) {
    let (w, h) = img.dimensions();

    // 最大10%拡大した領域を切り出す
    let scale: f32 = rng.gen_range(1.0..1.1);
    let crop_w = ((w as f32 / scale) as u32).max(1);
    let crop_h = ((h as f32 / scale) as u32).max(1);
    let off_x = rng.gen_range(0..=w - crop_w);
    let off_y = rng.gen_range(0..=h - crop_h);

    let crop = imageops::crop_imm(img, off_x, off_y, crop_w, crop_h).to_image();
    let mut out = imageops::resize(&crop, width, height, FilterType::Nearest);

    let sx = width as f32 / crop_w as f32;
    let sy = height as f32 / crop_h as f32;
    let flip = rng.gen_bool(0.5);
    if flip {
        imageops::flip_horizontal_in_place(&mut out);
    }
    adjust_value(&mut out, rng.gen_range(0.8..1.2));

    let boxes = boxes
        .iter()
        .map(|b| {
            let mut moved = BoundBox::new(
                (b.xmin - off_x as f32) * sx,
                (b.ymin - off_y as f32) * sy,
                (b.xmax - off_x as f32) * sx,
                (b.ymax - off_y as f32) * sy,
            );
            if flip {
                let (xmin, xmax) = (width as f32 - moved.xmax, width as f32 - moved.xmin);
                moved.xmin = xmin;
                moved.xmax = xmax;
            }
            clip(&moved, width as f32, height as f32)
        })
        .collect();

    (out, boxes)
}

/// HSVの明度に `factor` を掛けます。
///
/// # Args
/// * `img` - 対象の画像 (in-place)
/// * `factor` - 明度の倍率
pub fn adjust_value(img: &mut RgbImage, factor: f64) {
    for pixel in img.pixels_mut() {
        let rgb = color_space::Rgb::new(pixel[0] as f64, pixel[1] as f64, pixel[2] as f64);
        let hsv = color_space::Hsv::from(rgb);
        let hsv = color_space::Hsv::new(hsv.h, hsv.s, (hsv.v * factor).clamp(0., 1.));
        let rgb = hsv.to_rgb();
        *pixel = Rgb([
            rgb.r.round().clamp(0., 255.) as u8,
            rgb.g.round().clamp(0., 255.) as u8,
            rgb.b.round().clamp(0., 255.) as u8,
        ]);
    }
}

/// ボックスを画像内に収めます。
fn clip(b: &BoundBox, width: f32, height: f32) -> BoundBox {
    BoundBox::new(
        b.xmin.clamp(0., width),
        b.ymin.clamp(0., height),
        b.xmax.clamp(0., width),
        b.ymax.clamp(0., height),
    )
}

/// RGB画像を `(H, W, 3)` のf32テンソルに変換します。値は 0..=255 のままです。
pub fn to_tensor(img: &RgbImage) -> Array3<f32> {
    let (w, h) = img.dimensions();
    Array3::from_shape_fn((h as usize, w as usize, 3), |(y, x, c)| {
        img.get_pixel(x as u32, y as u32)[c] as f32
    })
}

/// 画像をネットワーク入力の大きさにリサイズしてテンソルにします。
///
/// # Args
/// * `img` - 入力画像
/// * `size` - ネットワーク入力の一辺
pub fn resize_to_tensor(img: &DynamicImage, size: u32) -> Array3<f32> {
    let resized = imageops::resize(&img.to_rgb8(), size, size, FilterType::Nearest);
    to_tensor(&resized)
}

const COLORS: [[u8; 3]; 10] = [
    [255, 0, 0],
    [255, 255, 0],
    [0, 0, 255],
    [14, 23, 50],
    [28, 105, 80],
    [190, 159, 53],
    [46, 194, 148],
    [242, 30, 131],
    [97, 101, 198],
    [115, 11, 87],
];

/// 画像上に水平または垂直の線を描画します。
///
/// # Args
///
/// * `img` - 線を描画する画像 (in-place)
/// * `x1`, `y1`, `x2`, `y2` - 線の始点と終点の座標
/// * `thickness` - 線の太さ
/// * `color` - 線の色
fn draw_line(
    img: &mut RgbImage,
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
    thickness: f32,
    color: Rgb<u8>,
) {
    let (bx, by) = (x1 - (thickness / 2.).floor(), y1 - (thickness / 2.).floor());

    let (w, h) = if x1 == x2 {
        (thickness, (y2 - y1).abs() + thickness)
    } else {
        ((x2 - x1).abs() + thickness, thickness)
    };

    let rect = Rect::at(bx as i32, by as i32).of_size((w as u32).max(1), (h as u32).max(1));
    draw_filled_rect_mut(img, rect, color);
}

fn draw_rect(img: &mut RgbImage, b: &BoundBox, thickness: f32, color: Rgb<u8>) {
    let (x1, y1, x2, y2) = (b.xmin.round(), b.ymin.round(), b.xmax.round(), b.ymax.round());
    draw_line(img, x1, y1, x1, y2, thickness, color);
    draw_line(img, x1, y2, x2, y2, thickness, color);
    draw_line(img, x1, y1, x2, y1, thickness, color);
    draw_line(img, x2, y1, x2, y2, thickness, color);
}

/// 画像上にバウンディングボックスを描画します。色はクラスごとに変わります。
///
/// # Args
///
/// * `img` - バウンディングボックスを描画する画像 (in-place)
/// * `boxes` - ピクセル座標の検出結果
/// * `line_thickness` - バウンディングボックスの線の太さ
pub fn draw_bbox(img: &mut RgbImage, boxes: &[BoundBox], line_thickness: f32) {
    // 確信度の高いボックスが上に来るように、低い順に描画する
    let mut sorted = boxes.to_vec();
    sorted.sort_by(|a, b| a.score().total_cmp(&b.score()));

    for b in sorted.iter() {
        let class = b.label().unwrap_or(0);
        let color = *Rgb::from_slice(&COLORS[class % COLORS.len()]);
        draw_rect(img, b, line_thickness, color);
    }
}
