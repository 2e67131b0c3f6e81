use anyhow::Result;
use rand::{rngs::StdRng, SeedableRng};
use std::time::Instant;

use yolo_v2::config::Config;
use yolo_v2::train::prepare_generators;

fn main() -> Result<()> {
    env_logger::init();

    // `train` セクションを持つ設定ファイル
    let config = Config::open("config.json")?;
    let mut rng = StdRng::seed_from_u64(0);

    let Some(mut generators) = prepare_generators(&config, &mut rng)? else {
        println!("Some labels have no images. Please revise the list of labels in config.json");
        return Ok(());
    };

    // 1エポック分のバッチを生成してみる
    let start = Instant::now();
    for idx in 0..generators.train.len() {
        let batch = generators.train.get_batch(idx, &mut rng)?;
        println!(
            "batch {}: images {:?}, true_boxes {:?}, targets {:?}",
            idx,
            batch.images.dim(),
            batch.true_boxes.dim(),
            batch.targets.dim()
        );
    }
    generators.train.on_epoch_end(&mut rng);

    let t = start.elapsed().as_secs_f64() * 1000.0;
    println!(
        "{} train / {} valid batches, epoch took {:.03}ms",
        generators.train.len(),
        generators.valid.len(),
        t
    );

    Ok(())
}
