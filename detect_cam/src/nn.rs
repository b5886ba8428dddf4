//! Object detection models.
//!
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use common::{BoundingBox, Detection};
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::utils::download_file;

type NnModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Pretrained detector producing labeled boxes for a frame.
pub trait Detector: Send + Sync {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Detect objects, boxes are in pixel coordinates of `frame`.
    fn detect(&self, frame: &RgbImage) -> Result<Vec<Detection>>;
}

/// COCO categories indexed by the class id of TensorFlow detection models.
/// Ids without a category in the 2017 release are `N/A`.
pub const COCO_LABELS: [&str; 91] = [
    "background", "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck",
    "boat", "traffic light", "fire hydrant", "N/A", "stop sign", "parking meter", "bench", "bird",
    "cat", "dog", "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "N/A",
    "backpack", "umbrella", "N/A", "N/A", "handbag", "tie", "suitcase", "frisbee", "skis",
    "snowboard", "sports ball", "kite", "baseball bat", "baseball glove", "skateboard",
    "surfboard", "tennis racket", "bottle", "N/A", "wine glass", "cup", "fork", "knife", "spoon",
    "bowl", "banana", "apple", "sandwich", "orange", "broccoli", "carrot", "hot dog", "pizza",
    "donut", "cake", "chair", "couch", "potted plant", "bed", "N/A", "dining table", "N/A", "N/A",
    "toilet", "N/A", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone", "microwave",
    "oven", "toaster", "sink", "refrigerator", "N/A", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

/// SSD-MobileNet trained on COCO.
///
/// The graph takes a `1xHxWx3` `u8` image and outputs `detection_boxes`
/// (`[y_min, x_min, y_max, x_max]`, normalized), `detection_classes`,
/// `detection_scores` and `num_detections`, in that order.
pub struct SsdMobilenetModel {
    model: NnModel,
    width: u32,
    height: u32,
    postproc: SsdPostproc,
}

/// Decoding of the SSD outputs into detections.
#[derive(Clone, Debug)]
pub struct SsdPostproc {
    pub min_score: f32,
    pub max_iou: f32,
    pub max_detections: usize,
}

impl Default for SsdPostproc {
    /// Defaults of COCO-SSD.
    fn default() -> Self {
        Self {
            min_score: 0.5,
            max_iou: 0.5,
            max_detections: 20,
        }
    }
}

impl SsdMobilenetModel {
    /// Load the model for frames of `width` x `height`.
    ///
    /// Without a local `model_path`, the model is fetched from `model_url` into the cache
    /// directory on first use.
    pub async fn load(
        model_path: Option<&Path>,
        model_url: &str,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let model_path = match model_path {
            Some(path) => path.to_owned(),
            None => fetch_cached_model(model_url).await?,
        };

        log::info!("Loading model {}", model_path.display());
        let model = tokio::task::spawn_blocking(move || {
            get_ssd_mobilenet_model(&model_path, width, height)
        })
        .await??;
        log::info!("Model ready for {width}x{height} frames");

        Ok(Self {
            model,
            width,
            height,
            postproc: SsdPostproc::default(),
        })
    }

    fn preproc(&self, frame: &RgbImage) -> Tensor {
        let resized;
        let frame = if frame.dimensions() == (self.width, self.height) {
            frame
        } else {
            resized = image::imageops::resize(
                frame,
                self.width,
                self.height,
                image::imageops::FilterType::Triangle,
            );
            &resized
        };

        tract_ndarray::Array4::from_shape_fn(
            (1, self.height as usize, self.width as usize, 3),
            |(_, y, x, c)| frame[(x as _, y as _)][c],
        )
        .into()
    }
}

impl SsdPostproc {
    /// Detections in pixel coordinates of a `width` x `height` frame, most confident first.
    pub fn apply(&self, outputs: TVec<TValue>, width: u32, height: u32) -> Result<Vec<Detection>> {
        if outputs.len() < 4 {
            bail!("expected 4 model outputs, got {}", outputs.len());
        }
        let boxes = outputs[0]
            .to_array_view::<f32>()
            .context("detection_boxes is not f32")?;
        let classes = outputs[1]
            .to_array_view::<f32>()
            .context("detection_classes is not f32")?;
        let scores = outputs[2]
            .to_array_view::<f32>()
            .context("detection_scores is not f32")?;
        let num_detections = outputs[3]
            .to_array_view::<f32>()
            .context("num_detections is not f32")?
            .iter()
            .next()
            .map(|n| *n as usize)
            .ok_or_else(|| anyhow!("num_detections is empty"))?;

        let boxes: Vec<f32> = boxes.iter().cloned().collect();
        let (width, height) = (width as f32, height as f32);

        let mut candidates: Vec<Detection> = classes
            .iter()
            .zip(scores.iter())
            .zip(boxes.chunks_exact(4))
            .take(num_detections)
            .filter(|((_, score), _)| **score >= self.min_score)
            .map(|((class, score), corners)| {
                let label = COCO_LABELS.get(*class as usize).copied().unwrap_or("N/A");
                // Corners are [y_min, x_min, y_max, x_max] relative to the frame size
                let bbox = BoundingBox::from_corners(
                    corners[1] * width,
                    corners[0] * height,
                    corners[3] * width,
                    corners[2] * height,
                );
                Detection::new(label, *score, bbox)
            })
            .collect();

        candidates.sort_by(|a, b| a.confidence.total_cmp(&b.confidence));

        let mut selected = non_maximum_suppression(candidates, self.max_iou);
        selected.truncate(self.max_detections);

        Ok(selected)
    }
}

impl Detector for SsdMobilenetModel {
    fn name(&self) -> &'static str {
        "ssd-mobilenet"
    }

    fn detect(&self, frame: &RgbImage) -> Result<Vec<Detection>> {
        let (width, height) = frame.dimensions();
        let input = tvec!(self.preproc(frame).into());
        let outputs = self.model.run(input).context("inference failed")?;
        self.postproc.apply(outputs, width, height)
    }
}

fn get_ssd_mobilenet_model(filename: &Path, width: u32, height: u32) -> Result<NnModel> {
    let input_fact = InferenceFact::dt_shape(
        u8::datum_type(),
        tvec!(1, height as usize, width as usize, 3),
    );
    let model = tract_onnx::onnx()
        .model_for_path(filename)
        .with_context(|| format!("failed to load ONNX model from {}", filename.display()))?
        .with_input_fact(0, input_fact)?
        .into_optimized()
        .context("failed to optimize model")?
        .into_runnable()
        .context("failed to build runnable model")?;

    Ok(model)
}

/// Path of the model in the cache directory, downloaded if not present yet.
async fn fetch_cached_model(url: &str) -> Result<PathBuf> {
    let file_name = url
        .rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| anyhow!("no file name in model URL {url}"))?;
    let cache_dir = dirs::cache_dir()
        .ok_or_else(|| anyhow!("no cache directory"))?
        .join("detect_cam");
    let path = cache_dir.join(file_name);

    if !path.exists() {
        tokio::fs::create_dir_all(&cache_dir).await?;
        log::info!("Downloading model from {url}");
        download_file(&reqwest::Client::new(), url, &path).await?;
    }

    Ok(path)
}

/// Run non-maximum-suppression on candidate detections.
///
/// Candidates are expected in ascending order of confidence. Starting with the most confident one,
/// a candidate is selected when it does not overlap any already selected detection with an IoU
/// above `max_iou`. The result is sorted by sinking confidence.
pub fn non_maximum_suppression(
    mut sorted_candidates: Vec<Detection>,
    max_iou: f32,
) -> Vec<Detection> {
    let mut selected: Vec<Detection> = vec![];
    'candidates: while let Some(candidate) = sorted_candidates.pop() {
        for chosen in selected.iter() {
            if candidate.bbox.iou(&chosen.bbox) > max_iou {
                continue 'candidates;
            }
        }

        selected.push(candidate)
    }

    selected
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn labels_match_coco_ids() {
        assert_eq!(COCO_LABELS[1], "person");
        assert_eq!(COCO_LABELS[18], "dog");
        assert_eq!(COCO_LABELS[72], "tv");
        assert_eq!(COCO_LABELS[90], "toothbrush");
    }

    fn outputs(boxes: &[f32], classes: &[f32], scores: &[f32], num: f32) -> TVec<TValue> {
        let n = scores.len();
        tvec!(
            Tensor::from_shape(&[1, n, 4], boxes).unwrap().into(),
            Tensor::from_shape(&[1, n], classes).unwrap().into(),
            Tensor::from_shape(&[1, n], scores).unwrap().into(),
            Tensor::from_shape(&[1], &[num]).unwrap().into(),
        )
    }

    fn assert_bbox(actual: &BoundingBox, expected: BoundingBox) {
        for (a, e) in [
            (actual.x, expected.x),
            (actual.y, expected.y),
            (actual.width, expected.width),
            (actual.height, expected.height),
        ] {
            assert!((a - e).abs() < 1e-3, "{actual:?} != {expected:?}");
        }
    }

    #[test]
    fn postproc_scales_filters_and_labels() {
        #[rustfmt::skip]
        let boxes = [
            0.1, 0.2, 0.5, 0.6,
            0.0, 0.0, 0.2, 0.2,
            0.5, 0.5, 1.0, 1.0,
        ];
        // The third candidate is beyond num_detections
        let outputs = outputs(&boxes, &[1.0, 18.0, 3.0], &[0.9, 0.3, 0.95], 2.0);

        let detections = SsdPostproc::default().apply(outputs, 100, 200).unwrap();

        assert_eq!(detections.len(), 1);
        assert_eq!(detections[0].label, "person");
        assert_eq!(detections[0].confidence, 0.9);
        assert_bbox(&detections[0].bbox, BoundingBox::new(20.0, 20.0, 40.0, 80.0));
    }

    #[test]
    fn postproc_caps_detections_by_confidence() {
        #[rustfmt::skip]
        let boxes = [
            0.0, 0.0, 0.1, 0.1,
            0.5, 0.5, 0.6, 0.6,
            0.8, 0.8, 0.9, 0.9,
        ];
        let outputs = outputs(&boxes, &[44.0, 47.0, 62.0], &[0.6, 0.8, 0.7], 3.0);
        let postproc = SsdPostproc {
            max_detections: 2,
            ..Default::default()
        };

        let detections = postproc.apply(outputs, 10, 10).unwrap();

        let labels: Vec<_> = detections.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, ["cup", "chair"]);
        assert_bbox(&detections[0].bbox, BoundingBox::new(5.0, 5.0, 1.0, 1.0));
    }

    #[test]
    fn postproc_rejects_missing_outputs() {
        let outputs: TVec<TValue> = tvec!(Tensor::from_shape(&[1], &[0.0f32]).unwrap().into());
        assert!(SsdPostproc::default().apply(outputs, 10, 10).is_err());
    }

    #[test]
    fn suppression_keeps_most_confident_overlap() {
        let candidates = vec![
            Detection::new("person", 0.6, BoundingBox::new(1.0, 1.0, 50.0, 80.0)),
            Detection::new("dog", 0.7, BoundingBox::new(200.0, 200.0, 30.0, 30.0)),
            Detection::new("person", 0.9, BoundingBox::new(0.0, 0.0, 50.0, 80.0)),
        ];

        let selected = non_maximum_suppression(candidates, 0.5);

        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].confidence, 0.9);
        assert_eq!(selected[1].label, "dog");
    }
}
