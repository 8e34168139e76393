//! Image and label transforms applied lazily by [`TransformedView`].
//!
//! A transform is a capability object: `apply` consumes an input and returns the
//! processed output. Stochastic transforms own their random source, so two
//! calls on the same input generally give different results.
//!
//! [`TransformedView`]: crate::view::TransformedView

use std::sync::{Arc, Mutex};

use image::{imageops::FilterType, DynamicImage, Rgb, RgbImage};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::{ClassifierError, Result};

/// ImageNet channel statistics the pretrained backbones were trained with.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

pub trait Transform<I>: Send + Sync {
    type Output;

    fn apply(&self, input: I) -> Result<Self::Output>;
}

pub trait TransformExt<I>: Transform<I> + Sized {
    /// Runs `next` on the output of `self`.
    fn then<T>(self, next: T) -> Then<Self, T>
    where
        T: Transform<Self::Output>,
    {
        Then {
            first: self,
            second: next,
        }
    }
}

impl<I, T: Transform<I>> TransformExt<I> for T {}

pub struct Then<A, B> {
    first: A,
    second: B,
}

impl<I, A, B> Transform<I> for Then<A, B>
where
    A: Transform<I>,
    B: Transform<A::Output>,
{
    type Output = B::Output;

    fn apply(&self, input: I) -> Result<Self::Output> {
        self.second.apply(self.first.apply(input)?)
    }
}

/// Lets several views share one pipeline.
impl<I, T> Transform<I> for Arc<T>
where
    T: Transform<I> + ?Sized,
{
    type Output = T::Output;

    fn apply(&self, input: I) -> Result<Self::Output> {
        (**self).apply(input)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl<I: Send> Transform<I> for Identity {
    type Output = I;

    fn apply(&self, input: I) -> Result<I> {
        Ok(input)
    }
}

/// Label transform built from a plain function.
pub struct LabelMap<F>(pub F);

impl<F> Transform<usize> for LabelMap<F>
where
    F: Fn(usize) -> usize + Send + Sync,
{
    type Output = usize;

    fn apply(&self, label: usize) -> Result<usize> {
        Ok((self.0)(label))
    }
}

/// Channel-major float image, `data.len() == c * h * w`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    pub data: Vec<f32>,
    pub shape: [usize; 3],
}

impl ImageTensor {
    pub fn channels(&self) -> usize {
        self.shape[0]
    }

    pub fn height(&self) -> usize {
        self.shape[1]
    }

    pub fn width(&self) -> usize {
        self.shape[2]
    }
}

/// Random source owned by a stochastic transform.
struct RandomSource(Mutex<ChaCha8Rng>);

impl RandomSource {
    fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self(Mutex::new(rng))
    }

    fn with<R>(&self, f: impl FnOnce(&mut ChaCha8Rng) -> R) -> R {
        // The generator state stays valid even if another thread panicked.
        let mut rng = self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut rng)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Resize {
    pub width: u32,
    pub height: u32,
}

impl Resize {
    pub fn square(size: u32) -> Self {
        Self {
            width: size,
            height: size,
        }
    }
}

impl Transform<DynamicImage> for Resize {
    type Output = DynamicImage;

    fn apply(&self, image: DynamicImage) -> Result<DynamicImage> {
        Ok(image.resize_exact(self.width, self.height, FilterType::Triangle))
    }
}

/// Random brightness, contrast, saturation and hue changes, applied in a
/// random order.
pub struct ColorJitter {
    brightness: f32,
    contrast: f32,
    saturation: f32,
    hue: f32,
    rng: RandomSource,
}

impl ColorJitter {
    /// `hue` is a fraction of the colour wheel and must be at most 0.5.
    pub fn new(brightness: f32, contrast: f32, saturation: f32, hue: f32) -> Result<Self> {
        if !(0.0..=0.5).contains(&hue) {
            return Err(ClassifierError::Transform(format!(
                "hue jitter must lie in [0, 0.5], got {hue}"
            )));
        }
        Ok(Self {
            brightness,
            contrast,
            saturation,
            hue,
            rng: RandomSource::new(None),
        })
    }

    pub fn seeded(mut self, seed: u64) -> Self {
        self.rng = RandomSource::new(Some(seed));
        self
    }
}

fn jitter_factor(rng: &mut ChaCha8Rng, amount: f32) -> Option<f32> {
    (amount > 0.0).then(|| rng.gen_range((1.0 - amount).max(0.0)..=1.0 + amount))
}

impl Transform<DynamicImage> for ColorJitter {
    type Output = DynamicImage;

    fn apply(&self, image: DynamicImage) -> Result<DynamicImage> {
        let mut rgb = image.to_rgb8();

        let (order, brightness, contrast, saturation, hue) = self.rng.with(|rng| {
            let mut order = [0usize, 1, 2, 3];
            order.shuffle(rng);
            let hue = (self.hue > 0.0).then(|| rng.gen_range(-self.hue..=self.hue));
            (
                order,
                jitter_factor(rng, self.brightness),
                jitter_factor(rng, self.contrast),
                jitter_factor(rng, self.saturation),
                hue,
            )
        });

        for op in order {
            match (op, brightness, contrast, saturation, hue) {
                (0, Some(factor), _, _, _) => adjust_brightness(&mut rgb, factor),
                (1, _, Some(factor), _, _) => adjust_contrast(&mut rgb, factor),
                (2, _, _, Some(factor), _) => adjust_saturation(&mut rgb, factor),
                (3, _, _, _, Some(shift)) => shift_hue(&mut rgb, shift),
                _ => {}
            }
        }

        Ok(DynamicImage::ImageRgb8(rgb))
    }
}

fn luma(pixel: &Rgb<u8>) -> f32 {
    0.299 * pixel[0] as f32 + 0.587 * pixel[1] as f32 + 0.114 * pixel[2] as f32
}

fn blend(value: u8, toward: f32, factor: f32) -> u8 {
    (toward + factor * (value as f32 - toward)).round().clamp(0.0, 255.0) as u8
}

fn adjust_brightness(rgb: &mut RgbImage, factor: f32) {
    for pixel in rgb.pixels_mut() {
        for channel in pixel.0.iter_mut() {
            *channel = blend(*channel, 0.0, factor);
        }
    }
}

fn adjust_contrast(rgb: &mut RgbImage, factor: f32) {
    let count = (rgb.width() * rgb.height()).max(1) as f32;
    let mean = rgb.pixels().map(luma).sum::<f32>() / count;
    for pixel in rgb.pixels_mut() {
        for channel in pixel.0.iter_mut() {
            *channel = blend(*channel, mean, factor);
        }
    }
}

fn adjust_saturation(rgb: &mut RgbImage, factor: f32) {
    for pixel in rgb.pixels_mut() {
        let gray = luma(pixel);
        for channel in pixel.0.iter_mut() {
            *channel = blend(*channel, gray, factor);
        }
    }
}

fn shift_hue(rgb: &mut RgbImage, shift: f32) {
    for pixel in rgb.pixels_mut() {
        let [r, g, b] = pixel.0.map(|c| c as f32 / 255.0);
        let (h, s, v) = rgb_to_hsv(r, g, b);
        let (r, g, b) = hsv_to_rgb((h + shift).rem_euclid(1.0), s, v);
        pixel.0 = [r, g, b].map(|c| (c * 255.0).round().clamp(0.0, 255.0) as u8);
    }
}

fn rgb_to_hsv(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let h = if delta == 0.0 {
        0.0
    } else if max == r {
        ((g - b) / delta).rem_euclid(6.0) / 6.0
    } else if max == g {
        ((b - r) / delta + 2.0) / 6.0
    } else {
        ((r - g) / delta + 4.0) / 6.0
    };
    let s = if max == 0.0 { 0.0 } else { delta / max };
    (h, s, max)
}

fn hsv_to_rgb(h: f32, s: f32, v: f32) -> (f32, f32, f32) {
    let sector = h * 6.0;
    let c = v * s;
    let x = c * (1.0 - (sector.rem_euclid(2.0) - 1.0).abs());
    let m = v - c;
    let (r, g, b) = match sector as u32 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };
    (r + m, g + m, b + m)
}

/// Random rotation about the centre plus translation; uncovered pixels are
/// filled with black.
pub struct RandomAffine {
    degrees: f32,
    translate: (f32, f32),
    rng: RandomSource,
}

impl RandomAffine {
    /// `translate` is the maximum shift as a fraction of width and height.
    pub fn new(degrees: f32, translate: (f32, f32)) -> Self {
        Self {
            degrees,
            translate,
            rng: RandomSource::new(None),
        }
    }

    pub fn seeded(mut self, seed: u64) -> Self {
        self.rng = RandomSource::new(Some(seed));
        self
    }
}

impl Transform<DynamicImage> for RandomAffine {
    type Output = DynamicImage;

    fn apply(&self, image: DynamicImage) -> Result<DynamicImage> {
        let rgb = image.to_rgb8();
        let (width, height) = rgb.dimensions();

        let (angle, tx, ty) = self.rng.with(|rng| {
            let max_dx = self.translate.0 * width as f32;
            let max_dy = self.translate.1 * height as f32;
            (
                rng.gen_range(-self.degrees..=self.degrees).to_radians(),
                rng.gen_range(-max_dx..=max_dx).round(),
                rng.gen_range(-max_dy..=max_dy).round(),
            )
        });

        let (sin, cos) = angle.sin_cos();
        let cx = (width as f32 - 1.0) * 0.5;
        let cy = (height as f32 - 1.0) * 0.5;

        // Inverse mapping with nearest-neighbour sampling.
        let output = RgbImage::from_fn(width, height, |x, y| {
            let dx = x as f32 - cx - tx;
            let dy = y as f32 - cy - ty;
            let sx = (cos * dx + sin * dy + cx).round();
            let sy = (-sin * dx + cos * dy + cy).round();
            if sx >= 0.0 && sy >= 0.0 && sx < width as f32 && sy < height as f32 {
                *rgb.get_pixel(sx as u32, sy as u32)
            } else {
                Rgb([0, 0, 0])
            }
        });

        Ok(DynamicImage::ImageRgb8(output))
    }
}

pub struct RandomHorizontalFlip {
    p: f32,
    rng: RandomSource,
}

impl RandomHorizontalFlip {
    pub fn new(p: f32) -> Self {
        Self {
            p,
            rng: RandomSource::new(None),
        }
    }

    pub fn seeded(mut self, seed: u64) -> Self {
        self.rng = RandomSource::new(Some(seed));
        self
    }
}

impl Transform<DynamicImage> for RandomHorizontalFlip {
    type Output = DynamicImage;

    fn apply(&self, image: DynamicImage) -> Result<DynamicImage> {
        if self.rng.with(|rng| rng.gen::<f32>() < self.p) {
            Ok(image.fliph())
        } else {
            Ok(image)
        }
    }
}

/// Converts an image to a `[3, H, W]` tensor with values in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToTensor;

impl Transform<DynamicImage> for ToTensor {
    type Output = ImageTensor;

    fn apply(&self, image: DynamicImage) -> Result<ImageTensor> {
        let rgb = image.to_rgb8();
        let (width, height) = (rgb.width() as usize, rgb.height() as usize);
        let plane = width * height;

        let mut data = vec![0.0f32; 3 * plane];
        for (x, y, pixel) in rgb.enumerate_pixels() {
            let offset = y as usize * width + x as usize;
            for c in 0..3 {
                data[c * plane + offset] = pixel[c] as f32 / 255.0;
            }
        }

        Ok(ImageTensor {
            data,
            shape: [3, height, width],
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Normalize {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Normalize {
    pub fn imagenet() -> Self {
        Self {
            mean: IMAGENET_MEAN,
            std: IMAGENET_STD,
        }
    }
}

impl Transform<ImageTensor> for Normalize {
    type Output = ImageTensor;

    fn apply(&self, mut tensor: ImageTensor) -> Result<ImageTensor> {
        if tensor.channels() != 3 {
            return Err(ClassifierError::Transform(format!(
                "normalize expects 3 channels, got {}",
                tensor.channels()
            )));
        }
        let plane = tensor.height() * tensor.width();
        for (c, values) in tensor.data.chunks_mut(plane.max(1)).enumerate() {
            for value in values {
                *value = (*value - self.mean[c]) / self.std[c];
            }
        }
        Ok(tensor)
    }
}

/// Erases a random rectangle of a tensor image and fills it with standard
/// normal noise.
pub struct RandomErasing {
    p: f32,
    scale: (f32, f32),
    ratio: (f32, f32),
    rng: RandomSource,
}

impl Default for RandomErasing {
    fn default() -> Self {
        Self::new(0.5, (0.02, 0.33), (0.3, 3.3))
    }
}

impl RandomErasing {
    pub fn new(p: f32, scale: (f32, f32), ratio: (f32, f32)) -> Self {
        Self {
            p,
            scale,
            ratio,
            rng: RandomSource::new(None),
        }
    }

    pub fn seeded(mut self, seed: u64) -> Self {
        self.rng = RandomSource::new(Some(seed));
        self
    }
}

impl Transform<ImageTensor> for RandomErasing {
    type Output = ImageTensor;

    fn apply(&self, mut tensor: ImageTensor) -> Result<ImageTensor> {
        let [channels, height, width] = tensor.shape;
        let area = (height * width) as f32;

        self.rng.with(|rng| {
            if rng.gen::<f32>() >= self.p {
                return;
            }
            let log_ratio = (self.ratio.0.ln(), self.ratio.1.ln());

            for _ in 0..10 {
                let erase_area = area * rng.gen_range(self.scale.0..=self.scale.1);
                let aspect = rng.gen_range(log_ratio.0..=log_ratio.1).exp();
                let h = (erase_area * aspect).sqrt().round() as usize;
                let w = (erase_area / aspect).sqrt().round() as usize;
                if h == 0 || w == 0 || h >= height || w >= width {
                    continue;
                }

                let top = rng.gen_range(0..=height - h);
                let left = rng.gen_range(0..=width - w);
                for c in 0..channels {
                    for y in top..top + h {
                        let row = c * height * width + y * width;
                        for x in left..left + w {
                            tensor.data[row + x] = standard_normal(rng);
                        }
                    }
                }
                return;
            }
        });

        Ok(tensor)
    }
}

/// Box-Muller sample from N(0, 1).
fn standard_normal(rng: &mut ChaCha8Rng) -> f32 {
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}

/// Augmenting pipeline for the training partition.
pub fn train_pipeline(
    size: u32,
    seed: Option<u64>,
) -> Result<impl Transform<DynamicImage, Output = ImageTensor>> {
    let mut jitter = ColorJitter::new(0.5, 0.5, 0.5, 0.5)?;
    let mut affine = RandomAffine::new(10.0, (0.2, 0.2));
    let mut flip = RandomHorizontalFlip::new(0.5);
    let mut erasing = RandomErasing::default();
    if let Some(seed) = seed {
        jitter = jitter.seeded(seed);
        affine = affine.seeded(seed.wrapping_add(1));
        flip = flip.seeded(seed.wrapping_add(2));
        erasing = erasing.seeded(seed.wrapping_add(3));
    }

    Ok(Resize::square(size)
        .then(jitter)
        .then(affine)
        .then(flip)
        .then(ToTensor)
        .then(Normalize::imagenet())
        .then(erasing))
}

/// Deterministic pipeline for validation, test and inference.
pub fn eval_pipeline(size: u32) -> impl Transform<DynamicImage, Output = ImageTensor> {
    Resize::square(size).then(ToTensor).then(Normalize::imagenet())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 5 % 256) as u8, 128])
        }))
    }

    #[test]
    fn resize_is_exact() {
        let out = Resize::square(16).apply(gradient(40, 24)).unwrap();
        assert_eq!((out.width(), out.height()), (16, 16));
    }

    #[test]
    fn to_tensor_is_channel_major_in_unit_range() {
        let image = DynamicImage::ImageRgb8(RgbImage::from_fn(2, 1, |x, _| {
            if x == 0 {
                Rgb([255, 0, 51])
            } else {
                Rgb([0, 255, 102])
            }
        }));
        let tensor = ToTensor.apply(image).unwrap();

        assert_eq!(tensor.shape, [3, 1, 2]);
        assert_eq!(tensor.data, vec![1.0, 0.0, 0.0, 1.0, 0.2, 0.4]);
    }

    #[test]
    fn normalize_uses_per_channel_statistics() {
        let tensor = ImageTensor {
            data: vec![0.5, 0.5, 0.5],
            shape: [3, 1, 1],
        };
        let normalize = Normalize {
            mean: [0.5, 0.0, 1.0],
            std: [1.0, 0.5, 0.5],
        };
        let out = normalize.apply(tensor).unwrap();
        assert_eq!(out.data, vec![0.0, 1.0, -1.0]);
    }

    #[test]
    fn normalize_rejects_grayscale_tensors() {
        let tensor = ImageTensor {
            data: vec![0.5; 4],
            shape: [1, 2, 2],
        };
        assert!(Normalize::imagenet().apply(tensor).is_err());
    }

    #[test]
    fn flip_probability_bounds() {
        let image = gradient(8, 4);
        let flipped = RandomHorizontalFlip::new(1.0).apply(image.clone()).unwrap();
        let kept = RandomHorizontalFlip::new(0.0).apply(image.clone()).unwrap();

        assert_eq!(flipped.to_rgb8(), image.fliph().to_rgb8());
        assert_eq!(kept.to_rgb8(), image.to_rgb8());
    }

    #[test]
    fn zero_jitter_leaves_image_untouched() {
        let image = gradient(12, 12);
        let out = ColorJitter::new(0.0, 0.0, 0.0, 0.0)
            .unwrap()
            .apply(image.clone())
            .unwrap();
        assert_eq!(out.to_rgb8(), image.to_rgb8());
    }

    #[test]
    fn hue_jitter_is_bounded() {
        assert!(ColorJitter::new(0.5, 0.5, 0.5, 0.6).is_err());
    }

    #[test]
    fn hsv_round_trip() {
        for (r, g, b) in [(1.0, 0.0, 0.0), (0.2, 0.6, 0.4), (0.5, 0.5, 0.5), (0.1, 0.2, 0.9)] {
            let (h, s, v) = rgb_to_hsv(r, g, b);
            let (r2, g2, b2) = hsv_to_rgb(h, s, v);
            assert!((r - r2).abs() < 1e-5 && (g - g2).abs() < 1e-5 && (b - b2).abs() < 1e-5);
        }
    }

    #[test]
    fn seeded_affine_is_reproducible() {
        let image = gradient(20, 20);
        let a = RandomAffine::new(10.0, (0.2, 0.2)).seeded(9);
        let b = RandomAffine::new(10.0, (0.2, 0.2)).seeded(9);

        let out_a = a.apply(image.clone()).unwrap();
        let out_b = b.apply(image).unwrap();
        assert_eq!(out_a.to_rgb8(), out_b.to_rgb8());
        assert_eq!(out_a.width(), 20);
    }

    #[test]
    fn erasing_keeps_shape_and_respects_probability() {
        let tensor = ImageTensor {
            data: vec![0.25; 3 * 32 * 32],
            shape: [3, 32, 32],
        };

        let untouched = RandomErasing::new(0.0, (0.02, 0.33), (0.3, 3.3))
            .apply(tensor.clone())
            .unwrap();
        assert_eq!(untouched, tensor);

        let erased = RandomErasing::new(1.0, (0.1, 0.2), (0.5, 2.0))
            .seeded(4)
            .apply(tensor.clone())
            .unwrap();
        assert_eq!(erased.shape, tensor.shape);
        assert!(erased.data.iter().any(|&v| v != 0.25));
    }

    #[test]
    fn eval_pipeline_is_deterministic() {
        let pipeline = eval_pipeline(24);
        let image = gradient(50, 30);

        let first = pipeline.apply(image.clone()).unwrap();
        let second = pipeline.apply(image).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.shape, [3, 24, 24]);
    }

    #[test]
    fn train_pipeline_draws_fresh_augmentation_per_call() {
        let pipeline = train_pipeline(24, Some(3)).unwrap();
        let image = gradient(50, 30);

        let first = pipeline.apply(image.clone()).unwrap();
        let second = pipeline.apply(image).unwrap();
        assert_eq!(first.shape, [3, 24, 24]);
        assert_ne!(first, second);
    }

    #[test]
    fn label_map_applies_function() {
        let shift = LabelMap(|label: usize| label + 10);
        assert_eq!(shift.apply(2).unwrap(), 12);
        assert_eq!(Identity.apply(5usize).unwrap(), 5);
    }
}
