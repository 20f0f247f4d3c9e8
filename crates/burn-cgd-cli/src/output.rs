//! Output directory layout and snapshot files

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use burn::prelude::*;
use burn_cgd::core::tensor_to_rgb;
use burn_cgd::RunConfig;
use image::{ImageBuffer, Rgb};

/// Longest directory name derived from the prompts
const MAX_DIR_LEN: usize = 100;

fn sanitize(txt: &str) -> String {
    txt.trim()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

/// Directory under `base` named after the prompt and anti-prompt
///
/// Non-alphanumeric characters become `_`; the anti-prompt is appended as
/// `_MIN_<anti>`.
pub fn txt_to_dir(base: &Path, prompt: &str, prompt_min: Option<&str>) -> PathBuf {
    let mut name = sanitize(prompt);
    if let Some(min) = prompt_min.filter(|m| !m.trim().is_empty()) {
        name.push_str("_MIN_");
        name.push_str(&sanitize(min));
    }
    let name: String = name.chars().take(MAX_DIR_LEN).collect();
    base.join(name)
}

/// Create the output directory and record the run settings in it
pub fn prepare_output_dir(dir: &Path, config: &RunConfig) -> Result<()> {
    if dir.exists() && !dir.is_dir() {
        anyhow::bail!("{} is a file, not a directory", dir.display());
    }
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    let settings = serde_json::to_string_pretty(config).context("Failed to serialize settings")?;
    fs::write(dir.join("settings.json"), settings).context("Failed to write settings.json")?;
    Ok(())
}

/// Whether snapshot `step` should be written to disk
pub fn should_save(step: usize, save_frequency: usize, is_final: bool) -> bool {
    is_final || step % save_frequency == 0
}

/// Write every image of a `[batch, 3, s, s]` estimate as `{step:04}_{j}.png`
/// and refresh `current_{j}.png`
pub fn save_snapshot<B: Backend>(dir: &Path, step: usize, images: Tensor<B, 4>) -> Result<Vec<PathBuf>> {
    let [batch, _, h, w] = images.dims();
    let mut written = Vec::with_capacity(batch);

    for j in 0..batch {
        let rgb = tensor_to_rgb(images.clone(), j)?;
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> =
            ImageBuffer::from_raw(w as u32, h as u32, rgb).context("Failed to create image buffer")?;

        let path = dir.join(format!("{step:04}_{j}.png"));
        img.save(&path)
            .with_context(|| format!("Failed to save {}", path.display()))?;
        fs::copy(&path, dir.join(format!("current_{j}.png")))
            .with_context(|| format!("Failed to update current_{j}.png"))?;
        written.push(path);
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_txt_to_dir() {
        let base = Path::new("outputs");
        assert_eq!(
            txt_to_dir(base, "a cat, sitting!", None),
            base.join("a_cat__sitting_")
        );
        assert_eq!(
            txt_to_dir(base, "sunset", Some("blurry photo")),
            base.join("sunset_MIN_blurry_photo")
        );
        assert_eq!(txt_to_dir(base, "sunset", Some("  ")), base.join("sunset"));

        let long = "x".repeat(300);
        let dir = txt_to_dir(base, &long, None);
        assert_eq!(dir.file_name().unwrap().len(), MAX_DIR_LEN);
    }

    #[test]
    fn test_should_save() {
        let saved: Vec<usize> = (0..25).filter(|&s| should_save(s, 10, s == 24)).collect();
        assert_eq!(saved, vec![0, 10, 20, 24]);
    }

    #[test]
    fn test_save_snapshot_writes_batch() {
        let dir = std::env::temp_dir().join(format!("burn-cgd-snapshot-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let device = Default::default();
        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 4, 4], &device);
        let written = save_snapshot(&dir, 7, images).unwrap();

        assert_eq!(written, vec![dir.join("0007_0.png"), dir.join("0007_1.png")]);
        assert!(dir.join("current_1.png").is_file());
        let decoded = image::open(&written[0]).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (4, 4));
        assert_eq!(decoded.get_pixel(0, 0).0, [128, 128, 128]);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_prepare_output_dir_writes_settings() {
        let dir = std::env::temp_dir().join(format!("burn-cgd-settings-{}", std::process::id()));
        let config = RunConfig::new("a lighthouse");
        prepare_output_dir(&dir, &config).unwrap();

        let written = fs::read_to_string(dir.join("settings.json")).unwrap();
        let back: RunConfig = serde_json::from_str(&written).unwrap();
        assert_eq!(back, config);

        fs::remove_dir_all(&dir).unwrap();
    }
}
