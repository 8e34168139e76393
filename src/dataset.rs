use std::fs;
use std::path::{Path, PathBuf};

use image::{DynamicImage, ImageReader};
use tracing::{debug, warn};

use crate::error::{ClassifierError, Result};

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "bmp", "webp"];

/// A read-only, position-indexed collection of labeled samples.
pub trait LabeledDataset: Send + Sync {
    type Item;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Labels in item order; `labels()[i]` is the label of `get(i)`.
    fn labels(&self) -> &[usize];

    /// Class names, indexed by label.
    fn classes(&self) -> &[String];

    fn get(&self, index: usize) -> Result<(Self::Item, usize)>;
}

/// Images stored as `root/<class_name>/<file>`.
///
/// Class folders are sorted by name and numbered from zero; files inside a
/// class are sorted by path. Images are decoded on access only.
#[derive(Debug, Clone)]
pub struct ImageFolder {
    paths: Vec<PathBuf>,
    labels: Vec<usize>,
    classes: Vec<String>,
}

impl ImageFolder {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        let mut class_dirs: Vec<PathBuf> = fs::read_dir(&root)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        class_dirs.sort();

        let mut paths = Vec::new();
        let mut labels = Vec::new();
        let mut classes = Vec::new();

        for dir in class_dirs {
            let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.is_file() && is_image(path))
                .collect();

            let name = dir
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();

            if files.is_empty() {
                warn!(class = %name, "skipping class folder without images");
                continue;
            }
            files.sort();

            let label = classes.len();
            debug!(class = %name, label, images = files.len(), "found class");
            labels.extend(std::iter::repeat(label).take(files.len()));
            paths.extend(files);
            classes.push(name);
        }

        if paths.is_empty() {
            return Err(ClassifierError::EmptyDataset(root));
        }

        Ok(Self {
            paths,
            labels,
            classes,
        })
    }

    pub fn path(&self, index: usize) -> Option<&Path> {
        self.paths.get(index).map(PathBuf::as_path)
    }

    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.classes.len()];
        for &label in &self.labels {
            counts[label] += 1;
        }
        counts
    }
}

impl LabeledDataset for ImageFolder {
    type Item = DynamicImage;

    fn len(&self) -> usize {
        self.paths.len()
    }

    fn labels(&self) -> &[usize] {
        &self.labels
    }

    fn classes(&self) -> &[String] {
        &self.classes
    }

    fn get(&self, index: usize) -> Result<(DynamicImage, usize)> {
        let path = self
            .paths
            .get(index)
            .ok_or(ClassifierError::IndexOutOfRange {
                index,
                len: self.paths.len(),
            })?;

        Ok((load_image(path)?, self.labels[index]))
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            IMAGE_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

/// Decodes an image, sniffing the format from its content.
pub fn load_image(path: &Path) -> Result<DynamicImage> {
    let decode = || -> image::ImageResult<DynamicImage> {
        ImageReader::open(path)?.with_guessed_format()?.decode()
    };

    decode().map_err(|source| ClassifierError::ImageLoad {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{Rgb, RgbImage};

    /// Writes `counts[c]` small PNGs into `root/<names[c]>/`.
    pub(crate) fn write_folder(root: &Path, names: &[&str], counts: &[usize]) {
        for (class, (&name, &count)) in names.iter().zip(counts).enumerate() {
            let dir = root.join(name);
            fs::create_dir_all(&dir).unwrap();
            for i in 0..count {
                let shade = (class * 60 + i) as u8;
                RgbImage::from_pixel(6, 4, Rgb([shade, 255 - shade, 10]))
                    .save(dir.join(format!("img_{i:03}.png")))
                    .unwrap();
            }
        }
    }

    #[test]
    fn classes_are_sorted_and_labels_follow_folders() {
        let dir = tempfile::tempdir().unwrap();
        write_folder(dir.path(), &["kitchen", "bathroom", "exterior"], &[2, 3, 1]);

        let folder = ImageFolder::new(dir.path()).unwrap();
        assert_eq!(folder.classes(), ["bathroom", "exterior", "kitchen"]);
        assert_eq!(folder.labels(), [0, 0, 0, 1, 2, 2]);
        assert_eq!(folder.class_counts(), vec![3, 1, 2]);
        assert_eq!(folder.len(), 6);
    }

    #[test]
    fn get_decodes_image_with_label() {
        let dir = tempfile::tempdir().unwrap();
        write_folder(dir.path(), &["a", "b"], &[1, 2]);

        let folder = ImageFolder::new(dir.path()).unwrap();
        let (image, label) = folder.get(2).unwrap();
        assert_eq!(label, 1);
        assert_eq!((image.width(), image.height()), (6, 4));
        assert!(matches!(
            folder.get(3),
            Err(ClassifierError::IndexOutOfRange { index: 3, len: 3 })
        ));
    }

    #[test]
    fn non_image_files_and_empty_classes_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        write_folder(dir.path(), &["a"], &[2]);
        fs::write(dir.path().join("a").join("notes.txt"), "x").unwrap();
        fs::create_dir_all(dir.path().join("empty")).unwrap();

        let folder = ImageFolder::new(dir.path()).unwrap();
        assert_eq!(folder.classes(), ["a"]);
        assert_eq!(folder.len(), 2);
    }

    #[test]
    fn empty_root_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ImageFolder::new(dir.path()),
            Err(ClassifierError::EmptyDataset(_))
        ));
    }

    #[test]
    fn corrupt_image_surfaces_load_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a")).unwrap();
        fs::write(dir.path().join("a").join("broken.jpg"), b"not an image").unwrap();

        let folder = ImageFolder::new(dir.path()).unwrap();
        assert!(matches!(folder.get(0), Err(ClassifierError::ImageLoad { .. })));
    }
}
