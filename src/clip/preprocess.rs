//! CLIP image preprocessing.
//!
//! Must stay bit-faithful to the encoder's training transform: center-crop
//! to a square on the shorter side, bilinear resize to 224×224, per-channel
//! normalization, NCHW layout with channel order R, G, B.

use image::imageops::FilterType;
use image::DynamicImage;
use ndarray::Array4;

pub const IMAGE_SIZE: u32 = 224;

const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// Converts a decoded image into a `[1, 3, 224, 224]` pixel tensor.
pub fn image_to_tensor(img: &DynamicImage) -> Array4<f32> {
    let square = center_crop_square(img);
    let resized = square.resize_exact(IMAGE_SIZE, IMAGE_SIZE, FilterType::Triangle);
    let rgb = resized.to_rgb8();

    let size = IMAGE_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] =
                (pixel[c] as f32 / 255.0 - CLIP_MEAN[c]) / CLIP_STD[c];
        }
    }
    tensor
}

/// Center-crops to a square using the shorter side.
fn center_crop_square(img: &DynamicImage) -> DynamicImage {
    let (w, h) = (img.width(), img.height());
    if w == h {
        return img.clone();
    }
    let size = w.min(h);
    let x = (w - size) / 2;
    let y = (h - size) / 2;
    img.crop_imm(x, y, size, size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    #[test]
    fn test_tensor_shape_and_uniform_normalization() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 64, Rgb([255, 0, 128])));
        let tensor = image_to_tensor(&img);
        assert_eq!(tensor.shape(), &[1, 3, 224, 224]);

        // A uniform image stays uniform per plane; spot-check the formula.
        let r = (1.0 - CLIP_MEAN[0]) / CLIP_STD[0];
        let g = (0.0 - CLIP_MEAN[1]) / CLIP_STD[1];
        let b = (128.0 / 255.0 - CLIP_MEAN[2]) / CLIP_STD[2];
        assert!((tensor[[0, 0, 100, 100]] - r).abs() < 1e-5);
        assert!((tensor[[0, 1, 0, 0]] - g).abs() < 1e-5);
        assert!((tensor[[0, 2, 223, 223]] - b).abs() < 1e-5);
    }

    #[test]
    fn test_center_crop_takes_the_middle() {
        // 300x100: left third red, middle third green, right third blue.
        let mut img = RgbImage::new(300, 100);
        for (x, _y, p) in img.enumerate_pixels_mut() {
            *p = if x < 100 {
                Rgb([255, 0, 0])
            } else if x < 200 {
                Rgb([0, 255, 0])
            } else {
                Rgb([0, 0, 255])
            };
        }
        let cropped = center_crop_square(&DynamicImage::ImageRgb8(img));
        assert_eq!((cropped.width(), cropped.height()), (100, 100));
        let rgb = cropped.to_rgb8();
        // Every pixel of the crop comes from the green middle band.
        assert_eq!(rgb.get_pixel(0, 0)[1], 255);
        assert_eq!(rgb.get_pixel(99, 99)[1], 255);
    }

    #[test]
    fn test_square_input_is_not_cropped() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(50, 50, Rgb([10, 20, 30])));
        let cropped = center_crop_square(&img);
        assert_eq!((cropped.width(), cropped.height()), (50, 50));
    }
}
