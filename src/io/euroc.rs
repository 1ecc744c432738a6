use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use csv::{ReaderBuilder, WriterBuilder};
use image::DynamicImage;

use crate::system::StampedPose;

#[derive(Debug, Clone)]
pub struct ImageEntry {
    pub timestamp_ns: u64,
    pub filename: String,
}

impl ImageEntry {
    pub fn timestamp_s(&self) -> f64 {
        self.timestamp_ns as f64 * 1e-9
    }
}

/// Monocular EuRoC sequence: `cam0/data.csv` plus the images in `cam0/data`.
#[derive(Debug)]
pub struct EurocSequence {
    image_dir: PathBuf,
    pub entries: Vec<ImageEntry>,
}

impl EurocSequence {
    /// `root` is either the `mav0` directory or its parent.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref();
        let mav0 = if root.join("cam0").is_dir() {
            root.to_path_buf()
        } else {
            root.join("mav0")
        };
        let entries = load_image_list(mav0.join("cam0/data.csv"))?;
        if entries.is_empty() {
            bail!("No images listed in {}", mav0.join("cam0/data.csv").display());
        }
        Ok(Self {
            image_dir: mav0.join("cam0/data"),
            entries,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn image(&self, idx: usize) -> Result<(DynamicImage, f64)> {
        let entry = self
            .entries
            .get(idx)
            .with_context(|| format!("No frame at index {}", idx))?;
        let path = self.image_dir.join(&entry.filename);
        let image = image::open(&path).with_context(|| format!("Failed to read image {}", path.display()))?;
        Ok((image, entry.timestamp_s()))
    }
}

fn load_image_list(csv_path: PathBuf) -> Result<Vec<ImageEntry>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .from_path(&csv_path)
        .with_context(|| format!("Failed to open {}", csv_path.display()))?;

    let mut entries = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        if rec.len() < 2 {
            continue;
        }
        let ts: u64 = rec[0]
            .trim()
            .parse()
            .with_context(|| format!("Bad timestamp {:?} in {}", &rec[0], csv_path.display()))?;
        let filename = rec[1].trim().to_string();
        entries.push(ImageEntry {
            timestamp_ns: ts,
            filename,
        });
    }
    Ok(entries)
}

/// Write camera centers and orientations as a TUM trajectory:
/// `timestamp tx ty tz qx qy qz qw`, camera-to-world.
pub fn write_tum_trajectory<'a, P: AsRef<Path>>(
    path: P,
    poses: impl IntoIterator<Item = &'a StampedPose>,
) -> Result<usize> {
    let path = path.as_ref();
    let mut writer = WriterBuilder::new()
        .delimiter(b' ')
        .has_headers(false)
        .from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    let mut written = 0;
    for pose in poses {
        let twc = pose.camera_to_world();
        let t = twc.translation;
        let q = twc.rotation;
        writer.write_record(&[
            format!("{:.6}", pose.timestamp),
            format!("{:.7}", t.x),
            format!("{:.7}", t.y),
            format!("{:.7}", t.z),
            format!("{:.7}", q.i),
            format!("{:.7}", q.j),
            format!("{:.7}", q.k),
            format!("{:.7}", q.w),
        ])?;
        written += 1;
    }
    writer.flush()?;
    Ok(written)
}
