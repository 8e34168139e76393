use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{command, value_parser, Arg};
use folder_classifier::{
    dataset::{load_image, ImageFolder, LabeledDataset},
    logging,
};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Serialize, Deserialize)]
struct NormalizationStats {
    mean: Vec<f64>,
    std: Vec<f64>,
    images: usize,
    classes: Vec<ClassCount>,
}

#[derive(Serialize, Deserialize)]
struct ClassCount {
    name: String,
    images: usize,
}

/// Per-channel sums over one image, values scaled to [0, 1].
#[derive(Default, Clone, Copy)]
struct ChannelSums {
    sum: [f64; 3],
    sum_sq: [f64; 3],
    pixels: u64,
}

impl ChannelSums {
    fn merge(mut self, other: Self) -> Self {
        for c in 0..3 {
            self.sum[c] += other.sum[c];
            self.sum_sq[c] += other.sum_sq[c];
        }
        self.pixels += other.pixels;
        self
    }
}

fn main() -> Result<()> {
    let matches = command!()
        .about("Per-channel mean/std and class distribution of an image folder")
        .args([
            Arg::new("dir")
                .value_parser(value_parser!(PathBuf))
                .default_value("data/train")
                .help("Directory holding <class>/ image folders"),
            Arg::new("output")
                .long("output")
                .value_parser(value_parser!(PathBuf))
                .default_value("normalization_stats.json"),
            Arg::new("log-level").long("log-level").default_value("info"),
        ])
        .get_matches();

    let level = matches
        .get_one::<String>("log-level")
        .map(String::as_str)
        .unwrap_or("info");
    logging::init(level);

    let dir = matches.get_one::<PathBuf>("dir").cloned().unwrap_or_default();
    let output = matches
        .get_one::<PathBuf>("output")
        .cloned()
        .unwrap_or_default();

    let folder = ImageFolder::new(&dir)
        .with_context(|| format!("cannot scan {}", dir.display()))?;
    info!(images = folder.len(), "loading images from {}", dir.display());

    // Process images in parallel to get per-image sums
    let totals = (0..folder.len())
        .into_par_iter()
        .map(|index| -> Result<ChannelSums> {
            let path = folder.path(index).context("image index out of range")?;
            let rgb = load_image(path)?.to_rgb8();

            let mut sums = ChannelSums::default();
            for pixel in rgb.pixels() {
                for c in 0..3 {
                    let value = pixel[c] as f64 / 255.0;
                    sums.sum[c] += value;
                    sums.sum_sq[c] += value * value;
                }
            }
            sums.pixels = rgb.width() as u64 * rgb.height() as u64;
            Ok(sums)
        })
        .try_reduce(ChannelSums::default, |a, b| Ok(a.merge(b)))?;

    let pixels = totals.pixels.max(1) as f64;
    let mean: Vec<f64> = totals.sum.iter().map(|sum| sum / pixels).collect();
    let std: Vec<f64> = totals
        .sum_sq
        .iter()
        .zip(&mean)
        .map(|(sum_sq, mean)| (sum_sq / pixels - mean * mean).max(0.0).sqrt())
        .collect();

    let classes = folder
        .classes()
        .iter()
        .zip(folder.class_counts())
        .map(|(name, images)| ClassCount {
            name: name.clone(),
            images,
        })
        .collect();

    let stats = NormalizationStats {
        mean,
        std,
        images: folder.len(),
        classes,
    };

    // Save statistics to JSON file
    let json = serde_json::to_string_pretty(&stats)?;
    fs::write(&output, json).with_context(|| format!("cannot write {}", output.display()))?;

    info!("statistics saved to {}", output.display());
    println!("Mean: {:?}", stats.mean);
    println!("Std: {:?}", stats.std);
    for class in &stats.classes {
        println!("{:<40} {}", class.name, class.images);
    }
    Ok(())
}
