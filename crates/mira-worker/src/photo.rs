use std::io::{Cursor, Write};

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{ExtendedColorType, GenericImageView, ImageEncoder};
use tempfile::NamedTempFile;

use crate::error::{Result, WorkerError};

const JPEG_QUALITY: u8 = 90;

/// Center-crops to a square, scales to `size`×`size` (nearest neighbour)
/// and re-encodes as JPEG.
pub fn prepare_group_photo(bytes: &[u8], size: u32) -> Result<Vec<u8>> {
    let image = image::load_from_memory(bytes).map_err(|e| WorkerError::Image(e.to_string()))?;
    let (width, height) = image.dimensions();
    let side = width.min(height);
    if side == 0 {
        return Err(WorkerError::Image("empty image".to_string()));
    }

    let square = image.crop_imm((width - side) / 2, (height - side) / 2, side, side);
    let scaled = square.resize_exact(size, size, FilterType::Nearest);
    let rgb = scaled.to_rgb8();

    let mut out = Cursor::new(Vec::new());
    JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
        .write_image(rgb.as_raw(), size, size, ExtendedColorType::Rgb8)
        .map_err(|e| WorkerError::Image(e.to_string()))?;
    Ok(out.into_inner())
}

/// Prepared photo parked in a temp file for the duration of a job. The file
/// is removed when this value drops, on every exit path.
pub struct StagedPhoto {
    file: NamedTempFile,
}

impl StagedPhoto {
    pub async fn prepare(bytes: Vec<u8>, size: u32) -> Result<Self> {
        let jpeg = tokio::task::spawn_blocking(move || prepare_group_photo(&bytes, size))
            .await
            .map_err(|e| WorkerError::Image(e.to_string()))??;

        let mut file = tempfile::Builder::new()
            .prefix("mira-photo-")
            .suffix(".jpg")
            .tempfile()?;
        file.write_all(&jpeg)?;
        file.flush()?;
        Ok(Self { file })
    }

    pub async fn bytes(&self) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.file.path()).await?)
    }

    pub fn path(&self) -> &std::path::Path {
        self.file.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, RgbImage};

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_fn(width, height, |x, _| {
            if x < width / 2 {
                image::Rgb([255, 0, 0])
            } else {
                image::Rgb([0, 0, 255])
            }
        });
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn test_output_is_square_jpeg() {
        let jpeg = prepare_group_photo(&png(1200, 800), 640).unwrap();
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.dimensions(), (640, 640));
        assert_eq!(image::guess_format(&jpeg).unwrap(), ImageFormat::Jpeg);
    }

    #[test]
    fn test_garbage_is_rejected() {
        let err = prepare_group_photo(b"not an image", 640).unwrap_err();
        assert!(matches!(err, WorkerError::Image(_)));
    }

    #[tokio::test]
    async fn test_staged_file_removed_on_drop() {
        let staged = StagedPhoto::prepare(png(10, 20), 64).await.unwrap();
        let path = staged.path().to_path_buf();
        assert!(path.exists());
        assert!(!staged.bytes().await.unwrap().is_empty());
        drop(staged);
        assert!(!path.exists());
    }
}
