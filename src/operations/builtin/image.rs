//! Builtin operation: decode an image, optionally resize it, and save it
//! in the format implied by the destination's extension.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{OperationError, Result};
use crate::operations::{optional_u32, required_str, Artifact, Operation, OperationKind};
use crate::sandbox::{write_atomic, Sandbox};

/// Largest resize target accepted (64 megapixels, 256 MiB as RGBA8).
const MAX_TARGET_PIXELS: u64 = 64 * 1024 * 1024;

/// Reads the target size from either `width` + `height` or `resize: [w, h]`.
fn parse_resize(params: &Map<String, Value>) -> Result<Option<(u32, u32)>> {
    let size = match params.get("resize") {
        Some(Value::Array(dims)) => match dims.as_slice() {
            [w, h] => match (as_dimension(w), as_dimension(h)) {
                (Some(w), Some(h)) => Some((w, h)),
                _ => None,
            },
            _ => None,
        }
        .map(Some)
        .ok_or_else(|| {
            OperationError::InvalidParameters(
                "resize must be a [width, height] pair of integers in u32 range".to_string(),
            )
        })?,
        Some(Value::Null) | None => {
            match (optional_u32(params, "width")?, optional_u32(params, "height")?) {
                (Some(w), Some(h)) => Some((w, h)),
                (None, None) => None,
                _ => {
                    return Err(OperationError::InvalidParameters(
                        "width and height must be given together".to_string(),
                    ))
                }
            }
        }
        Some(other) => {
            return Err(OperationError::InvalidParameters(format!(
                "resize must be a [width, height] pair, got {other}"
            )))
        }
    };

    if let Some((w, h)) = size {
        if w == 0 || h == 0 {
            return Err(OperationError::InvalidParameters(format!(
                "resize dimensions must be positive, got {w}x{h}"
            )));
        }
        if u64::from(w) * u64::from(h) > MAX_TARGET_PIXELS {
            return Err(OperationError::InvalidParameters(format!(
                "resize target {w}x{h} exceeds {MAX_TARGET_PIXELS} pixels"
            )));
        }
    }
    Ok(size)
}

fn as_dimension(value: &Value) -> Option<u32> {
    value.as_u64().and_then(|n| u32::try_from(n).ok())
}

/// Decodes, resizes and re-encodes. Runs on the blocking pool.
fn transform(source: &Path, format: ImageFormat, size: Option<(u32, u32)>) -> Result<Vec<u8>> {
    let img = image::ImageReader::open(source)
        .map_err(|e| OperationError::Decode(format!("{}: {e}", source.display())))?
        .with_guessed_format()
        .map_err(|e| OperationError::Decode(format!("{}: {e}", source.display())))?
        .decode()
        .map_err(|e| OperationError::Decode(format!("{}: {e}", source.display())))?;

    let img = match size {
        Some((w, h)) => img.resize_exact(w, h, FilterType::Lanczos3),
        None => img,
    };

    // JPEG has no alpha channel.
    let img = match format {
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(img.to_rgb8()),
        _ => img,
    };

    let mut encoded = Cursor::new(Vec::new());
    img.write_to(&mut encoded, format)
        .map_err(|e| OperationError::Decode(format!("encoding as {format:?} failed: {e}")))?;
    Ok(encoded.into_inner())
}

/// `ImageTransform`: `imagePath` → (optional resize) → `outputPath`.
pub struct ImageTransformOperation {
    sandbox: Arc<Sandbox>,
}

impl ImageTransformOperation {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self { sandbox }
    }
}

#[async_trait]
impl Operation for ImageTransformOperation {
    fn kind(&self) -> OperationKind {
        OperationKind::ImageTransform
    }

    async fn execute(&self, params: &Map<String, Value>) -> Result<Artifact> {
        let image_path = required_str(params, "imagePath")?;
        let output = required_str(params, "outputPath")?;
        let size = parse_resize(params)?;

        let source = self.sandbox.admit_source(image_path)?;
        let dest = self.sandbox.admit(output)?;
        let format = ImageFormat::from_path(dest.as_path()).map_err(|e| {
            OperationError::Decode(format!(
                "cannot infer image format from {}: {e}",
                dest.as_path().display()
            ))
        })?;

        debug!("Transforming {} to {format:?} (resize: {size:?})", source.display());
        let encoded = tokio::task::spawn_blocking(move || transform(&source, format, size))
            .await
            .map_err(|e| OperationError::Decode(e.to_string()))??;

        write_atomic(&dest, encoded).await?;
        Ok(Artifact::file(dest.into_path_buf()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::testing::{params, TestRoot};
    use image::{GenericImageView, Rgb, RgbImage, Rgba, RgbaImage};
    use serde_json::json;

    fn red_square(root: &TestRoot, name: &str) -> String {
        let img = RgbImage::from_pixel(100, 100, Rgb([255, 0, 0]));
        img.save(root.join(name)).unwrap();
        root.path_str(name)
    }

    async fn run(root: &TestRoot, p: Value) -> Result<Artifact> {
        ImageTransformOperation::new(root.sandbox()).execute(&params(p)).await
    }

    #[tokio::test]
    async fn test_resize_to_exact_dimensions() {
        let root = TestRoot::new();
        let src = red_square(&root, "test_image.jpg");
        let artifact = run(&root, json!({
            "imagePath": src,
            "outputPath": root.path_str("test_image_resized.jpg"),
            "width": 50,
            "height": 50,
        }))
        .await
        .unwrap();

        let resized = image::open(&artifact.output_path).unwrap();
        assert_eq!(resized.dimensions(), (50, 50));
    }

    #[tokio::test]
    async fn test_resize_pair_parameter_and_non_square_target() {
        let root = TestRoot::new();
        let src = red_square(&root, "in.png");
        let artifact = run(&root, json!({
            "imagePath": src,
            "outputPath": root.path_str("out.png"),
            "resize": [80, 20],
        }))
        .await
        .unwrap();
        assert_eq!(image::open(&artifact.output_path).unwrap().dimensions(), (80, 20));
    }

    #[tokio::test]
    async fn test_format_conversion_without_resize() {
        let root = TestRoot::new();
        let src = red_square(&root, "in.png");
        let artifact = run(&root, json!({
            "imagePath": src,
            "outputPath": root.path_str("out.bmp"),
        }))
        .await
        .unwrap();
        let bytes = std::fs::read(&artifact.output_path).unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), ImageFormat::Bmp);
        assert_eq!(image::load_from_memory(&bytes).unwrap().dimensions(), (100, 100));
    }

    #[tokio::test]
    async fn test_rgba_source_to_jpeg() {
        let root = TestRoot::new();
        RgbaImage::from_pixel(10, 10, Rgba([0, 0, 255, 128]))
            .save(root.join("alpha.png"))
            .unwrap();
        let artifact = run(&root, json!({
            "imagePath": root.path_str("alpha.png"),
            "outputPath": root.path_str("alpha.jpg"),
        }))
        .await
        .unwrap();
        assert_eq!(image::open(&artifact.output_path).unwrap().dimensions(), (10, 10));
    }

    #[tokio::test]
    async fn test_undecodable_source_is_decode_error() {
        let root = TestRoot::new();
        std::fs::write(root.join("fake.jpg"), b"definitely not an image").unwrap();
        let err = run(&root, json!({
            "imagePath": root.path_str("fake.jpg"),
            "outputPath": root.path_str("out.jpg"),
        }))
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecodeError);
        assert!(!root.join("out.jpg").exists());
    }

    #[tokio::test]
    async fn test_unknown_destination_extension_is_decode_error() {
        let root = TestRoot::new();
        let src = red_square(&root, "in.png");
        let err = run(&root, json!({
            "imagePath": src,
            "outputPath": root.path_str("out.unknownext"),
        }))
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DecodeError);
    }

    #[tokio::test]
    async fn test_out_of_bounds_destination() {
        let root = TestRoot::new();
        let src = red_square(&root, "in.png");
        let outside = tempfile::tempdir().unwrap();
        let dest = outside.path().join("out.png");
        let err = run(&root, json!({"imagePath": src, "outputPath": dest.to_string_lossy()}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfBoundsPath);
        assert!(!dest.exists());
    }

    #[test]
    fn test_parse_resize() {
        assert_eq!(parse_resize(&params(json!({}))).unwrap(), None);
        assert_eq!(
            parse_resize(&params(json!({"width": 50, "height": 40}))).unwrap(),
            Some((50, 40))
        );
        assert_eq!(
            parse_resize(&params(json!({"resize": [50, 40]}))).unwrap(),
            Some((50, 40))
        );
        assert!(parse_resize(&params(json!({"width": 50}))).is_err());
        assert!(parse_resize(&params(json!({"resize": [50]}))).is_err());
        assert!(parse_resize(&params(json!({"resize": "50x50"}))).is_err());
        assert!(parse_resize(&params(json!({"width": 0, "height": 10}))).is_err());
    }

    #[test]
    fn test_parse_resize_rejects_out_of_range_pair() {
        let too_big = u64::from(u32::MAX) + 1;
        for p in [
            json!({"resize": [too_big, 10]}),
            json!({"resize": [10, too_big]}),
            json!({"resize": [-5, 10]}),
            json!({"width": too_big, "height": 10}),
        ] {
            let err = parse_resize(&params(p)).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidParameters);
        }
    }

    #[test]
    fn test_parse_resize_caps_pixel_count() {
        for p in [
            json!({"resize": [100_000, 100_000]}),
            json!({"width": 100_000, "height": 100_000}),
        ] {
            let err = parse_resize(&params(p)).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidParameters);
            assert!(err.to_string().contains("exceeds"));
        }
        assert_eq!(
            parse_resize(&params(json!({"resize": [8192, 8192]}))).unwrap(),
            Some((8192, 8192))
        );
    }

    #[tokio::test]
    async fn test_oversized_target_fails_before_decode() {
        let root = TestRoot::new();
        let src = red_square(&root, "in.png");
        let err = run(&root, json!({
            "imagePath": src,
            "outputPath": root.path_str("huge.png"),
            "resize": [100_000, 100_000],
        }))
        .await
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameters);
        assert!(!root.join("huge.png").exists());
    }
}
