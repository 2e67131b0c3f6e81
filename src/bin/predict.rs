use anyhow::{Context, Result};
use rand::{rngs::StdRng, SeedableRng};
use std::{
    path::{Path, PathBuf},
    time::Instant,
};
use structopt::StructOpt;

use yolo_v2::config::Config;
use yolo_v2::img_proc::draw_bbox;
use yolo_v2::yolo::create_yolo;

#[derive(Debug, Clone, StructOpt)]
/// Detect objects in an image with a trained YOLOv2 model
struct Args {
    #[structopt(short, long)]
    /// configuration file
    pub conf: PathBuf,
    #[structopt(short, long)]
    /// image to detect objects in
    pub input: PathBuf,
    #[structopt(short, long)]
    /// weights file, overrides the one in the configuration file
    pub weights: Option<PathBuf>,
}

/// `dir/name.ext` -> `dir/name_detected.ext`
fn detected_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match input.extension() {
        Some(ext) => format!("{}_detected.{}", stem, ext.to_string_lossy()),
        None => format!("{}_detected", stem),
    };
    input.with_file_name(name)
}

fn main() -> Result<()> {
    env_logger::init();

    let Args {
        conf,
        input,
        weights,
    } = Args::from_args();
    let config = Config::open(&conf)
        .with_context(|| format!("failed to load config file '{}'", conf.display()))?;

    // YOLOのモデルを初期化
    let mut yolo = create_yolo(&config, &mut StdRng::from_entropy())?;
    if let Some(weights) = &weights {
        yolo.load_weights(weights)?;
    }

    let img = image::open(&input)
        .with_context(|| format!("failed to open image '{}'", input.display()))?;

    let start = Instant::now();
    let boxes = yolo.predict(&img)?;
    let t = start.elapsed().as_secs_f64() * 1000.0;
    log::info!("Processing time:{:.03}ms", t);

    // BBox描画のためDynamicImageをRGB画像に変換
    let mut rgb_img = img.to_rgb8();
    draw_bbox(&mut rgb_img, &boxes, 3.);

    let output = detected_path(&input);
    rgb_img
        .save(&output)
        .with_context(|| format!("failed to save '{}'", output.display()))?;
    println!("{} boxes are detected. {} saved.", boxes.len(), output.display());

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_name_keeps_extension() {
        assert_eq!(
            detected_path(Path::new("imgs/raccoon-1.jpg")),
            PathBuf::from("imgs/raccoon-1_detected.jpg")
        );
        assert_eq!(detected_path(Path::new("noext")), PathBuf::from("noext_detected"));
    }
}
