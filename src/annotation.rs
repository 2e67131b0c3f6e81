//! アノテーション (正解ボックスとラベル) を扱うモジュール

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{ensure, Context, Result};
use log::{info, warn};
use rand::{seq::SliceRandom, Rng};
use serde::Deserialize;

use crate::bbox::BoundBox;

/// 1つの物体のアノテーション (ピクセル座標)
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    pub name: String,
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
}

/// 1枚の画像のアノテーション
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub filename: PathBuf,
    pub width: u32,
    pub height: u32,
    pub objects: Vec<Object>,
}

/// ラベル語彙とアノテーションの集合
#[derive(Debug, Clone)]
pub struct Annotations {
    labels: Vec<String>,
    components: Vec<Annotation>,
}

impl Annotations {
    /// 空の集合を作成します。
    ///
    /// # Args
    /// * `labels` - クラス名の語彙。インデックスがクラスIDになります
    pub fn new(labels: Vec<String>) -> Self {
        Self {
            labels,
            components: vec![],
        }
    }

    /// アノテーションを追加します。語彙にない物体名はエラーです。
    pub fn add(&mut self, annotation: Annotation) -> Result<()> {
        for obj in &annotation.objects {
            ensure!(
                self.labels.contains(&obj.name),
                "unknown label '{}' in '{}'",
                obj.name,
                annotation.filename.display()
            );
        }
        self.components.push(annotation);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn get(&self, i: usize) -> Option<&Annotation> {
        self.components.get(i)
    }

    pub fn fname(&self, i: usize) -> &Path {
        &self.components[i].filename
    }

    /// `i` 番目の画像の正解ボックス (ピクセル座標の角形式)
    pub fn boxes(&self, i: usize) -> Vec<BoundBox> {
        self.components[i]
            .objects
            .iter()
            .map(|o| BoundBox::new(o.xmin, o.ymin, o.xmax, o.ymax))
            .collect()
    }

    /// `i` 番目の画像のクラスID列
    pub fn code_labels(&self, i: usize) -> Vec<usize> {
        self.components[i]
            .objects
            .iter()
            .filter_map(|o| self.labels.iter().position(|l| *l == o.name))
            .collect()
    }

    /// 並び順をシャッフルします。
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.components.shuffle(rng);
    }

    /// クラス名ごとの物体数
    pub fn seen_labels(&self) -> BTreeMap<String, usize> {
        let mut seen = BTreeMap::new();
        for obj in self.components.iter().flat_map(|c| c.objects.iter()) {
            *seen.entry(obj.name.clone()).or_insert(0) += 1;
        }
        seen
    }

    /// シャッフルした後、先頭 `ratio` の割合を学習用、残りを検証用に分割します。
    pub fn split<R: Rng + ?Sized>(mut self, ratio: f32, rng: &mut R) -> (Self, Self) {
        self.shuffle(rng);
        let n_train = ((self.len() as f32) * ratio) as usize;
        let valid = self.components.split_off(n_train.min(self.len()));
        let valid = Self {
            labels: self.labels.clone(),
            components: valid,
        };
        (self, valid)
    }
}

#[derive(Debug, Deserialize)]
struct VocAnnotation {
    filename: String,
    size: VocSize,
    #[serde(default)]
    object: Vec<VocObject>,
}

#[derive(Debug, Deserialize)]
struct VocSize {
    width: u32,
    height: u32,
}

#[derive(Debug, Deserialize)]
struct VocObject {
    name: String,
    bndbox: VocBndBox,
}

#[derive(Debug, Deserialize)]
struct VocBndBox {
    xmin: f32,
    ymin: f32,
    xmax: f32,
    ymax: f32,
}

/// Pascal VOC形式のXMLを1つ読み込みます。
///
/// # Args
/// * `xml_content` - XML文字列
/// * `img_dir` - 画像ファイルのディレクトリ
/// * `labels` - 語彙。ここにない物体は無視されます
///
/// # Return
/// * 画像のアノテーション
pub fn parse_voc(xml_content: &str, img_dir: &Path, labels: &[String]) -> Result<Annotation> {
    let voc: VocAnnotation = serde_xml_rs::from_str(xml_content)?;

    let objects = voc
        .object
        .into_iter()
        .filter(|o| labels.is_empty() || labels.contains(&o.name))
        .map(|o| Object {
            name: o.name,
            xmin: o.bndbox.xmin,
            ymin: o.bndbox.ymin,
            xmax: o.bndbox.xmax,
            ymax: o.bndbox.ymax,
        })
        .collect();

    Ok(Annotation {
        filename: img_dir.join(voc.filename),
        width: voc.size.width,
        height: voc.size.height,
        objects,
    })
}

/// ディレクトリ内のVOC形式アノテーションをすべて読み込みます。
///
/// 語彙に含まれる物体を1つも持たない画像は除外されます。
///
/// # Args
/// * `ann_dir` - XMLファイルのディレクトリ
/// * `img_dir` - 画像ファイルのディレクトリ
/// * `labels` - 語彙
pub fn parse_annotation<P, Q>(ann_dir: P, img_dir: Q, labels: &[String]) -> Result<Annotations>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
{
    let ann_dir = ann_dir.as_ref();
    let img_dir = img_dir.as_ref();

    let mut xml_files: Vec<_> = fs::read_dir(ann_dir)
        .with_context(|| format!("failed to read annotation dir '{}'", ann_dir.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<_, _>>()?;
    xml_files.retain(|p| p.extension().map_or(false, |ext| ext == "xml"));
    xml_files.sort();

    let mut annotations = Annotations::new(labels.to_vec());
    for path in xml_files {
        let xml_content = fs::read_to_string(&path)?;
        let ann = parse_voc(&xml_content, img_dir, labels)
            .with_context(|| format!("failed to parse '{}'", path.display()))?;
        if !ann.objects.is_empty() {
            annotations.add(ann)?;
        }
    }
    info!(
        "{} annotated images loaded from '{}'",
        annotations.len(),
        ann_dir.display()
    );
    Ok(annotations)
}

/// 設定されたラベルがすべて学習データに現れるかを確認します。
///
/// 現れないラベルがある場合は警告を出してfalseを返します。呼び出し側は学習を中止してください。
pub fn check_labels(labels: &[String], seen: &BTreeMap<String, usize>) -> bool {
    let missing: Vec<_> = labels.iter().filter(|l| !seen.contains_key(*l)).collect();

    info!("seen labels: {:?}", seen);
    info!("given labels: {:?}", labels);
    if !missing.is_empty() {
        warn!(
            "some labels have no images: {:?}. please revise the list of labels in the config file",
            missing
        );
        return false;
    }
    true
}
