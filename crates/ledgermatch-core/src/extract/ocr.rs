//! Classical OCR fallback engines
//!
//! Standard preprocessing (grayscale, orientation fix, contrast enhancement,
//! sharpening) ahead of a pluggable OCR engine. The Tesseract implementation
//! links a native library and therefore sits behind the `ocr-tesseract`
//! feature; tests use the mock engine.

use image::{DynamicImage, GenericImageView, ImageBuffer, Luma};

use crate::error::Result;

use super::mock::MockOcrEngine;

/// Concrete OCR engine enum
///
/// Provides Clone and compile-time dispatch, mirroring the vision client.
#[derive(Clone)]
pub enum OcrClient {
    #[cfg(feature = "ocr-tesseract")]
    Tesseract(TesseractEngine),
    Mock(MockOcrEngine),
}

impl OcrClient {
    /// Recognize text in raw image bytes
    ///
    /// Each engine owns its preprocessing; the Tesseract pipeline applies
    /// the standard grayscale/rotate/contrast/sharpen pass first.
    pub async fn recognize(&self, image: &[u8]) -> Result<String> {
        match self {
            #[cfg(feature = "ocr-tesseract")]
            Self::Tesseract(engine) => engine.recognize(image).await,
            Self::Mock(engine) => {
                let _ = image;
                engine.recognize_text().map(|t| cleanup_text(&t))
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            #[cfg(feature = "ocr-tesseract")]
            Self::Tesseract(_) => "tesseract",
            Self::Mock(_) => "mock",
        }
    }
}

/// Tesseract-backed engine
#[cfg(feature = "ocr-tesseract")]
#[derive(Clone)]
pub struct TesseractEngine {
    languages: String,
}

#[cfg(feature = "ocr-tesseract")]
impl TesseractEngine {
    pub fn new(languages: &str) -> Self {
        Self {
            languages: languages.to_string(),
        }
    }

    /// Recognize text; the blocking Tesseract call runs off the async runtime
    pub async fn recognize(&self, image: &[u8]) -> Result<String> {
        use crate::error::Error;

        let processed = preprocess(image)?;
        let mut png = Vec::new();
        processed
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .map_err(|e| Error::Ocr(format!("failed to encode image for OCR: {}", e)))?;

        let languages = self.languages.clone();
        let text = tokio::task::spawn_blocking(move || -> Result<String> {
            let tess = tesseract::Tesseract::new(None, Some(&languages))
                .map_err(|e| Error::Ocr(format!("tesseract init failed: {}", e)))?;
            let mut tess = tess
                .set_image_from_mem(&png)
                .map_err(|e| Error::Ocr(format!("tesseract image load failed: {}", e)))?;
            tess.get_text()
                .map_err(|e| Error::Ocr(format!("tesseract recognition failed: {}", e)))
        })
        .await
        .map_err(|e| Error::Ocr(format!("OCR task failed: {}", e)))??;

        Ok(cleanup_text(&text))
    }
}

impl Default for OcrClient {
    /// Tesseract when compiled in, otherwise an engine that reports itself
    /// unavailable
    fn default() -> Self {
        #[cfg(feature = "ocr-tesseract")]
        {
            Self::Tesseract(TesseractEngine::new("eng"))
        }
        #[cfg(not(feature = "ocr-tesseract"))]
        {
            Self::Mock(MockOcrEngine::failing("no OCR engine compiled in"))
        }
    }
}

/// Standard preprocessing pipeline ahead of classical OCR
///
/// Grayscale, orientation fix, contrast enhancement, then a light sharpen.
pub fn preprocess(bytes: &[u8]) -> Result<DynamicImage> {
    let img = image::load_from_memory(bytes)?;
    let img = auto_rotate(img);
    let gray = img.to_luma8();
    let enhanced = enhance_contrast(gray);
    let sharpened = DynamicImage::ImageLuma8(enhanced).unsharpen(1.0, 2);
    Ok(sharpened)
}

/// Receipts are portrait; a landscape frame is almost always a sideways photo
fn auto_rotate(img: DynamicImage) -> DynamicImage {
    let (width, height) = img.dimensions();
    if width > height {
        img.rotate90()
    } else {
        img
    }
}

/// Stretch contrast around the midpoint to make thermal print legible
fn enhance_contrast(img: ImageBuffer<Luma<u8>, Vec<u8>>) -> ImageBuffer<Luma<u8>, Vec<u8>> {
    let mut enhanced = img;
    for pixel in enhanced.pixels_mut() {
        let value = pixel[0] as f32;
        let stretched = ((value - 128.0) * 1.5 + 128.0).clamp(0.0, 255.0) as u8;
        pixel[0] = stretched;
    }
    enhanced
}

/// Crop to the bottom third, where handwritten tips live
pub fn bottom_third(img: &DynamicImage) -> DynamicImage {
    let (width, height) = img.dimensions();
    let top = height - height / 3;
    img.crop_imm(0, top, width, height / 3)
}

/// Collapse OCR output to trimmed, non-empty lines
pub fn cleanup_text(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_image(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageLuma8(ImageBuffer::from_pixel(width, height, Luma([200u8])))
    }

    #[test]
    fn test_auto_rotate_landscape() {
        let rotated = auto_rotate(test_image(100, 40));
        assert_eq!(rotated.dimensions(), (40, 100));
    }

    #[test]
    fn test_auto_rotate_portrait_untouched() {
        let kept = auto_rotate(test_image(40, 100));
        assert_eq!(kept.dimensions(), (40, 100));
    }

    #[test]
    fn test_bottom_third_dimensions() {
        let crop = bottom_third(&test_image(60, 90));
        assert_eq!(crop.dimensions(), (60, 30));
    }

    #[test]
    fn test_contrast_pushes_extremes() {
        let img = ImageBuffer::from_pixel(2, 2, Luma([200u8]));
        let enhanced = enhance_contrast(img);
        assert!(enhanced.get_pixel(0, 0)[0] > 200);

        let dark = ImageBuffer::from_pixel(2, 2, Luma([60u8]));
        let enhanced = enhance_contrast(dark);
        assert!(enhanced.get_pixel(0, 0)[0] < 60);
    }

    #[test]
    fn test_cleanup_text() {
        assert_eq!(cleanup_text("  A  \n\n B \n"), "A\nB");
    }

    #[test]
    fn test_preprocess_round_trip() {
        let mut png = Vec::new();
        test_image(40, 100)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();
        let processed = preprocess(&png).unwrap();
        assert_eq!(processed.dimensions(), (40, 100));
    }

    #[tokio::test]
    async fn test_mock_client_recognize() {
        let client = OcrClient::Mock(MockOcrEngine::with_text(" TOTAL 8.42 \n"));
        let text = client.recognize(b"any bytes").await.unwrap();
        assert_eq!(text, "TOTAL 8.42");
    }
}
