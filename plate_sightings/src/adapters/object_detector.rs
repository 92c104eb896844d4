use std::path::Path;

use opencv::core::{min_max_loc, Point, Range, Rect, Scalar, Size, Vector, CV_32F};
use opencv::dnn::{
    blob_from_image, nms_boxes, read_net_from_darknet, read_net_from_onnx, Net, DNN_BACKEND_CUDA,
    DNN_BACKEND_OPENCV, DNN_TARGET_CPU, DNN_TARGET_CUDA,
};
use opencv::prelude::{Mat, MatTraitConst, NetTrait, NetTraitConst};
use tracing::debug;

use super::PlateDetector;
use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::types::BoundingBox;

/// COCO classes kept by the vehicle detector: car, motorcycle, bus, truck.
const VEHICLE_CLASSES: [i32; 4] = [2, 3, 5, 7];

/// Rows of a YOLOv5 output for a 640x640 input.
const YOLOV5_ROWS: i32 = 25200;

const NMS_SCORE: f32 = 0.5;
const NMS_OVERLAP: f32 = 0.4;

/// Anything that returns boxes for an image.
pub trait BoxDetector {
    fn detect_boxes(&mut self, image: &Mat) -> Result<Vec<BoundingBox>>;
}

trait YoloProcessor {
    fn post_process(&self, img_rows: i32, img_cols: i32, outputs: &Vector<Mat>)
        -> Result<Vec<BoundingBox>>;
}

struct YoloProcessorV3;

impl YoloProcessor for YoloProcessorV3 {
    fn post_process(
        &self,
        img_rows: i32,
        img_cols: i32,
        outputs: &Vector<Mat>,
    ) -> Result<Vec<BoundingBox>> {
        let mut confidences = Vector::<f32>::default();
        let mut boxes = Vector::<Rect>::default();

        for data in outputs {
            for j in 0..data.rows() {
                let row = data.row(j)?;
                let scores = row.col_range(&Range::new(5, data.cols())?)?;

                let mut max_score = 0.0;
                let mut max_loc = Point::default();
                min_max_loc(
                    &scores,
                    None,
                    Some(&mut max_score),
                    None,
                    Some(&mut max_loc),
                    &Mat::default(),
                )?;
                let max_score = max_score as f32;
                if max_score <= NMS_SCORE || !VEHICLE_CLASSES.contains(&max_loc.x) {
                    continue;
                }

                let center_x = (*data.at_2d::<f32>(j, 0)? * img_cols as f32).round() as i32;
                let center_y = (*data.at_2d::<f32>(j, 1)? * img_rows as f32).round() as i32;
                let width = (*data.at_2d::<f32>(j, 2)? * img_cols as f32).round() as i32;
                let height = (*data.at_2d::<f32>(j, 3)? * img_rows as f32).round() as i32;

                confidences.push(max_score);
                boxes.push(Rect::new(
                    center_x - width / 2,
                    center_y - height / 2,
                    width,
                    height,
                ));
            }
        }

        suppress(&boxes, &confidences)
    }
}

struct YoloProcessorV5 {
    input_size: i32,
}

impl YoloProcessor for YoloProcessorV5 {
    fn post_process(
        &self,
        img_rows: i32,
        img_cols: i32,
        outputs: &Vector<Mat>,
    ) -> Result<Vec<BoundingBox>> {
        let mut confidences = Vector::<f32>::default();
        let mut boxes = Vector::<Rect>::default();

        let x_factor = img_cols as f32 / self.input_size as f32;
        let y_factor = img_rows as f32 / self.input_size as f32;

        for data in outputs {
            for j in 0..YOLOV5_ROWS {
                let confidence = *data.at_3d::<f32>(0, j, 4)?;
                if confidence <= 0.4 {
                    continue;
                }
                let class_score = *data.at_3d::<f32>(0, j, 5)?;
                if class_score <= 0.25 {
                    continue;
                }
                let cx = *data.at_3d::<f32>(0, j, 0)?;
                let cy = *data.at_3d::<f32>(0, j, 1)?;
                let w = *data.at_3d::<f32>(0, j, 2)?;
                let h = *data.at_3d::<f32>(0, j, 3)?;

                confidences.push(confidence);
                boxes.push(Rect::new(
                    ((cx - 0.5 * w) * x_factor) as i32,
                    ((cy - 0.5 * h) * y_factor) as i32,
                    (w * x_factor) as i32,
                    (h * y_factor) as i32,
                ));
            }
        }

        suppress(&boxes, &confidences)
    }
}

fn suppress(boxes: &Vector<Rect>, confidences: &Vector<f32>) -> Result<Vec<BoundingBox>> {
    let mut indices = Vector::<i32>::default();
    nms_boxes(boxes, confidences, NMS_SCORE, NMS_OVERLAP, &mut indices, 1.0, 0)?;

    let mut kept = Vec::with_capacity(indices.len());
    for i in indices {
        kept.push(BoundingBox::from(boxes.get(i as usize)?));
    }
    Ok(kept)
}

/// YOLO network loaded through OpenCV DNN.
pub struct ObjectDetector {
    classifier: Net,
    input_size: i32,
    post_processor: Box<dyn YoloProcessor>,
}

impl ObjectDetector {
    /// YOLOv3 (darknet) restricted to vehicle classes.
    pub fn vehicle_detector(models: &ModelConfig) -> Result<Self> {
        ensure_exists(&models.vehicle_cfg)?;
        ensure_exists(&models.vehicle_weights)?;
        let classifier = read_net_from_darknet(
            &models.vehicle_cfg.to_string_lossy(),
            &models.vehicle_weights.to_string_lossy(),
        )?;

        Self::with_backend(classifier, 416, Box::new(YoloProcessorV3), models.use_gpu)
    }

    /// YOLOv5 plate model exported to ONNX.
    pub fn plate_detector(models: &ModelConfig) -> Result<Self> {
        ensure_exists(&models.plate_onnx)?;
        let classifier = read_net_from_onnx(&models.plate_onnx.to_string_lossy())?;

        Self::with_backend(
            classifier,
            640,
            Box::new(YoloProcessorV5 { input_size: 640 }),
            models.use_gpu,
        )
    }

    fn with_backend(
        mut classifier: Net,
        input_size: i32,
        post_processor: Box<dyn YoloProcessor>,
        use_gpu: bool,
    ) -> Result<Self> {
        if use_gpu {
            classifier.set_preferable_backend(DNN_BACKEND_CUDA)?;
            classifier.set_preferable_target(DNN_TARGET_CUDA)?;
        } else {
            classifier.set_preferable_backend(DNN_BACKEND_OPENCV)?;
            classifier.set_preferable_target(DNN_TARGET_CPU)?;
        }

        Ok(ObjectDetector {
            classifier,
            input_size,
            post_processor,
        })
    }
}

impl BoxDetector for ObjectDetector {
    fn detect_boxes(&mut self, image: &Mat) -> Result<Vec<BoundingBox>> {
        let mut blob = blob_from_image(
            image,
            1.0 / 255.0,
            Size::new(self.input_size, self.input_size),
            Scalar::default(),
            true,
            false,
            CV_32F,
        )?;

        self.classifier
            .set_input(&mut blob, "", 1.0, Scalar::default())?;

        let output_names = self.classifier.get_unconnected_out_layers_names()?;
        let mut output_values = Vector::<Mat>::default();
        self.classifier.forward(&mut output_values, &output_names)?;

        let boxes = self
            .post_processor
            .post_process(image.rows(), image.cols(), &output_values)?;
        debug!("{} boxes detected", boxes.len());
        Ok(boxes)
    }
}

impl PlateDetector for ObjectDetector {
    fn detect(&mut self, vehicle_crop: &Mat) -> Result<Vec<BoundingBox>> {
        self.detect_boxes(vehicle_crop)
    }
}

fn ensure_exists(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    Err(Error::Detector(format!(
        "model file {} not found",
        path.display()
    )))
}
