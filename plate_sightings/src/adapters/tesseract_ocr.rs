use std::ffi::CString;

use leptess::tesseract::TessApi;
use opencv::core::Rect;
use opencv::prelude::{Mat, MatTraitConst};
use tesseract_plumbing::TessBaseApi;
use tracing::debug;

use super::CharacterRecognizer;
use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::types::{BoundingBox, TextCandidate};

const PLATE_ALPHABET: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
/// Treat the crop as a single text line.
const SINGLE_LINE: &str = "7";

/// Tesseract restricted to plate characters.
pub struct TesseractOcr {
    ocr: TessApi,
}

impl TesseractOcr {
    pub fn new(models: &ModelConfig) -> Result<Self> {
        let data_path = models.tessdata.to_string_lossy();
        let mut api = TessApi::new(Some(data_path.as_ref()), &models.language).map_err(|e| {
            Error::Ocr(format!(
                "cannot load {:?} from {}: {:?}",
                models.language, data_path, e
            ))
        })?;
        configure(&mut api.raw)?;
        Ok(Self { ocr: api })
    }
}

fn configure(raw: &mut TessBaseApi) -> Result<()> {
    for (name, value) in [
        ("tessedit_char_whitelist", PLATE_ALPHABET),
        ("tessedit_pageseg_mode", SINGLE_LINE),
    ] {
        let key = CString::new(name).map_err(|e| Error::Ocr(e.to_string()))?;
        let value = CString::new(value).map_err(|e| Error::Ocr(e.to_string()))?;
        raw.set_variable(&key, &value)
            .map_err(|e| Error::Ocr(format!("cannot set {name}: {e:?}")))?;
    }
    Ok(())
}

/// Drops the plate frame and screws around the characters.
fn inset(cols: i32, rows: i32) -> Rect {
    let x = cols * 10 / 100;
    let y = rows * 12 / 100;
    let width = cols - cols * 12 / 100 - x;
    let height = rows - rows * 24 / 100;
    Rect::new(x, y, width.max(1), height.max(1))
}

impl CharacterRecognizer for TesseractOcr {
    fn recognize(&mut self, plate: &Mat) -> Result<Vec<TextCandidate>> {
        if plate.empty() || plate.cols() < 8 || plate.rows() < 4 {
            return Ok(Vec::new());
        }
        let region = inset(plate.cols(), plate.rows());
        let cropped = Mat::roi(plate, region)?.try_clone()?;

        let cols = cropped.cols();
        let rows = cropped.rows();
        self.ocr
            .raw
            .set_image(cropped.data_bytes()?, cols, rows, 1, cols)
            .map_err(|e| Error::Ocr(format!("{e:?}")))?;
        let text = self
            .ocr
            .get_utf8_text()
            .map_err(|e| Error::Ocr(e.to_string()))?;
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let confidence = self.ocr.mean_text_conf().clamp(0, 100) as u8;
        debug!("ocr {:?} [{}%]", text, confidence);
        Ok(vec![TextCandidate {
            text: text.to_string(),
            confidence,
            region: BoundingBox::from(region),
        }])
    }
}
