use crate::{
    config::{LabelsConfig, ModelConfig, Validatable},
    detector::{Detection, Detector, DetectorError},
    labels::{load_labels, ColorLabel},
};
use async_trait::async_trait;
use image::{imageops::FilterType, GenericImageView};
use ndarray::{s, Array, Axis, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

const INPUT_SIZE: u32 = 640;
const IOU_THRESHOLD: f32 = 0.7;

#[derive(Debug, Clone, Copy)]
struct Candidate {
    class_id: usize,
    confidence: f32,
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
}

fn intersection(box1: &Candidate, box2: &Candidate) -> f32 {
    let width = (box1.x2.min(box2.x2) - box1.x1.max(box2.x1)).max(0.0);
    let height = (box1.y2.min(box2.y2) - box1.y1.max(box2.y1)).max(0.0);
    width * height
}

fn union(box1: &Candidate, box2: &Candidate) -> f32 {
    ((box1.x2 - box1.x1) * (box1.y2 - box1.y1)) + ((box2.x2 - box2.x1) * (box2.y2 - box2.y1))
        - intersection(box1, box2)
}

fn transform_image(image_data: &[u8]) -> Result<(Array<f32, Ix4>, u32, u32), DetectorError> {
    let original_img = image::load_from_memory(image_data)
        .map_err(|e| DetectorError::Decode(e.to_string()))?;

    let (img_width, img_height) = original_img.dimensions();
    let img = original_img.resize_exact(INPUT_SIZE, INPUT_SIZE, FilterType::CatmullRom);

    let mut input = Array::zeros((1, 3, INPUT_SIZE as usize, INPUT_SIZE as usize));
    for pixel in img.pixels() {
        let x = pixel.0 as usize;
        let y = pixel.1 as usize;
        let [r, g, b, _] = pixel.2 .0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    Ok((input, img_height, img_width))
}

/// Decodes and resizes on the blocking pool so tokio workers keep serving
/// other connections.
async fn prepare_input(image: Vec<u8>) -> Result<(Array<f32, Ix4>, u32, u32), DetectorError> {
    tokio::task::spawn_blocking(move || transform_image(&image))
        .await
        .map_err(|e| DetectorError::Inference(format!("preprocessing task failed: {}", e)))?
}

fn run_inference(
    session: &Mutex<Session>,
    input: &Array<f32, Ix4>,
) -> Result<ndarray::ArrayD<f32>, DetectorError> {
    let mut session = session
        .lock()
        .map_err(|e| DetectorError::Inference(format!("session mutex poisoned: {}", e)))?;

    let tensor_ref = TensorRef::from_array_view(input.view())
        .map_err(|e| DetectorError::Inference(format!("failed to build tensor: {}", e)))?;

    let outputs = session
        .run(ort::inputs![tensor_ref])
        .map_err(|e| DetectorError::Inference(format!("inference failed: {}", e)))?;

    let (shape, data) = outputs["output0"]
        .try_extract_tensor::<f32>()
        .map_err(|e| DetectorError::Inference(format!("failed to extract tensor: {}", e)))?;

    ndarray::ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
        .map_err(|e| DetectorError::Inference(format!("invalid tensor shape: {}", e)))
}

/// YOLOv8 ONNX backend. Requests are spread round-robin over a pool of
/// sessions, each behind its own lock, so concurrent calls are safe.
pub struct OrtDetector {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: AtomicUsize,
    labels: Vec<ColorLabel>,
    min_probability: f32,
}

impl OrtDetector {
    pub fn new(
        model_config: &ModelConfig,
        labels_config: &LabelsConfig,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let labels = load_labels(&labels_config.get_path())?;
        let num_instances = model_config.num_instances.max(1);
        let sessions = (0..num_instances)
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .commit_from_file(model_config.get_path())?;
                Ok(Arc::new(Mutex::new(session)))
            })
            .collect::<Result<Vec<_>, ort::Error>>()?;

        tracing::info!(
            "Created {} ONNX sessions with {} labels",
            num_instances,
            labels.len()
        );

        Ok(Self {
            sessions: Arc::new(sessions),
            counter: AtomicUsize::new(0),
            labels,
            min_probability: model_config.min_probability,
        })
    }

    fn next_session(&self) -> (usize, Arc<Mutex<Session>>) {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        (index, self.sessions[index].clone())
    }

    fn to_detection(&self, candidate: &Candidate) -> Detection {
        let (label, color) = match self.labels.get(candidate.class_id) {
            Some(color_label) => (color_label.label.clone(), Some(color_label.color)),
            None => (format!("Unknown class {}", candidate.class_id), None),
        };

        Detection {
            label,
            confidence: candidate.confidence,
            x: candidate.x1,
            y: candidate.y1,
            width: candidate.x2 - candidate.x1,
            height: candidate.y2 - candidate.y1,
            color,
        }
    }
}

#[async_trait]
impl Detector for OrtDetector {
    async fn detect(&self, image: &[u8]) -> Result<Vec<Detection>, DetectorError> {
        let (input, img_height, img_width) = prepare_input(image.to_vec()).await?;
        let (index, session) = self.next_session();
        tracing::debug!("Handling request with session {}", index);
        let outputs = tokio::task::spawn_blocking(move || run_inference(&session, &input))
            .await
            .map_err(|e| DetectorError::Inference(format!("inference task failed: {}", e)))??;

        let mut boxes = Vec::new();
        let output = outputs.slice(s![.., .., 0]);
        let scale_x = img_width as f32 / INPUT_SIZE as f32;
        let scale_y = img_height as f32 / INPUT_SIZE as f32;

        for row in output.axis_iter(Axis(0)) {
            let row: Vec<_> = row.iter().copied().collect();
            let Some((class_id, prob)) = row
                .iter()
                .skip(4)
                .copied()
                .enumerate()
                .reduce(|accum, row| if row.1 > accum.1 { row } else { accum })
            else {
                continue;
            };

            if prob < self.min_probability {
                continue;
            }

            let xc = row[0] * scale_x;
            let yc = row[1] * scale_y;
            let w = row[2] * scale_x;
            let h = row[3] * scale_y;

            boxes.push(Candidate {
                class_id,
                confidence: prob,
                x1: xc - w / 2.,
                y1: yc - h / 2.,
                x2: xc + w / 2.,
                y2: yc + h / 2.,
            });
        }

        boxes.sort_by(|box1, box2| box2.confidence.total_cmp(&box1.confidence));
        let mut kept = Vec::new();

        while let Some(best) = boxes.first().copied() {
            kept.push(best);
            boxes.retain(|other| intersection(&best, other) / union(&best, other) < IOU_THRESHOLD);
        }

        Ok(kept.iter().map(|c| self.to_detection(c)).collect())
    }
}
