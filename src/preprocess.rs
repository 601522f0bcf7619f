use std::path::{Path, PathBuf};

use burn::prelude::*;
use image::{imageops::FilterType, ImageReader, RgbImage};
use ndarray::Array3;

use crate::error::{ErrorKind, Tagged};

pub const IMAGE_SIZE: usize = 128;
pub const CHANNEL_COUNT: usize = 3;

const PREVIEW_SIZE: u32 = 180;

/// Extensions accepted when scanning class directories.
pub const IMAGE_EXTENSIONS: [&str; 7] = ["png", "jpg", "jpeg", "bmp", "ppm", "tif", "tiff"];

/// Extensions offered by the test image picker.
pub const TEST_IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("image file {0} does not exist")]
    Missing(PathBuf),
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },
}

impl Tagged for PreprocessError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::NotFound
    }
}

pub fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

/// Decode `path` and resize it to the network input resolution.
pub fn load_image(path: &Path) -> Result<RgbImage, PreprocessError> {
    if !path.is_file() {
        return Err(PreprocessError::Missing(path.to_path_buf()));
    }

    let reader = ImageReader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(|source| PreprocessError::Open {
            path: path.to_path_buf(),
            source,
        })?;
    let image = reader.decode().map_err(|source| PreprocessError::Decode {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(image
        .resize_exact(IMAGE_SIZE as u32, IMAGE_SIZE as u32, FilterType::Nearest)
        .to_rgb8())
}

/// Channels-first array rescaled to [0, 1].
pub fn to_array(image: &RgbImage) -> Array3<f32> {
    let (width, height) = image.dimensions();
    Array3::from_shape_fn(
        (CHANNEL_COUNT, height as usize, width as usize),
        |(c, y, x)| image.get_pixel(x as u32, y as u32)[c] as f32 / 255.,
    )
}

pub fn to_tensor<B: Backend>(array: &Array3<f32>, device: &B::Device) -> Tensor<B, 3> {
    let shape = array.shape().to_vec();
    let data = TensorData::new(array.iter().copied().collect::<Vec<f32>>(), shape)
        .convert::<B::FloatElem>();

    Tensor::<B, 3>::from_data(data, device)
}

/// A single image prepared for classification.
#[derive(Debug, Clone)]
pub struct TestSample {
    pub path: PathBuf,
    pub tensor: Array3<f32>,
    /// Upscaled rendering of what the network actually sees.
    pub preview: RgbImage,
}

impl TestSample {
    pub fn load(path: &Path) -> Result<Self, PreprocessError> {
        let image = load_image(path)?;
        let preview =
            image::imageops::resize(&image, PREVIEW_SIZE, PREVIEW_SIZE, FilterType::Lanczos3);

        Ok(Self {
            path: path.to_path_buf(),
            tensor: to_array(&image),
            preview,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use tempfile::tempdir;

    #[test]
    fn loads_and_rescales_to_network_shape() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sample.png");
        RgbImage::from_pixel(300, 200, Rgb([255, 0, 51])).save(&path).unwrap();

        let sample = TestSample::load(&path).unwrap();
        assert_eq!(sample.tensor.shape(), &[3, 128, 128]);
        assert!(sample.tensor.iter().all(|value| (0.0..=1.0).contains(value)));
        assert_eq!(sample.tensor[[0, 5, 5]], 1.0);
        assert_eq!(sample.tensor[[1, 5, 5]], 0.0);
        assert!((sample.tensor[[2, 5, 5]] - 0.2).abs() < 1e-6);
        assert_eq!(sample.preview.dimensions(), (180, 180));
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempdir().unwrap();
        let err = TestSample::load(&dir.path().join("nope.jpg")).unwrap_err();
        assert!(matches!(err, PreprocessError::Missing(_)));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn garbage_file_fails_to_decode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"definitely not a png").unwrap();
        assert!(load_image(&path).is_err());
    }

    #[test]
    fn extension_check_ignores_case() {
        assert!(has_image_extension(Path::new("a/b/Cat.JPG")));
        assert!(has_image_extension(Path::new("dog.tiff")));
        assert!(!has_image_extension(Path::new("notes.txt")));
        assert!(!has_image_extension(Path::new("no_extension")));
    }
}
