//! # YOLOv2 物体検出ライブラリ
//!
//! このクレートは、YOLOv2の学習データ生成と推論結果のデコードを行うRustライブラリです。
//!
//! ## 主な機能
//!
//! 1. **アノテーションの読み込み**: Pascal VOC形式のXMLから正解ボックスを読み込みます。
//! 2. **学習データの生成**: 画像と正解ボックスから、YOLOv2の学習に使うテンソルのバッチを作ります。
//! 3. **出力のデコード**: ネットワークの生の出力から確信度の高いボックスを取り出し、NMSをかけます。
//! 4. **物体検出**: 特徴抽出器と検出ヘッドを組み合わせて画像から物体を検出します。
//!
//! ## Example
//! ```no_run
//! # use rand::{rngs::StdRng, SeedableRng};
//! # fn main() -> anyhow::Result<()> {
//! let config = yolo_v2::config::Config::open("config.json")?;
//! let yolo = yolo_v2::yolo::create_yolo(&config, &mut StdRng::seed_from_u64(0))?;
//! let img = image::open("raccoon.jpg")?;
//! let boxes = yolo.predict(&img)?;
//! # Ok(())
//! # }
//! ```

pub mod anchor;
pub mod annotation;
pub mod batch_gen;
pub mod bbox;
pub mod config;
pub mod decoder;
pub mod img_proc;
pub mod label_gen;
pub mod network;
pub mod train;
pub mod yolo;

mod nms;
