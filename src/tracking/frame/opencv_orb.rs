//! OpenCV ORB backend, enabled with the `opencv` cargo feature.

use anyhow::{bail, Result};
use image::GrayImage;
use nalgebra::Vector2;
use opencv::core::{KeyPoint as CvKeyPoint, Mat, Ptr, Vector};
use opencv::features2d;
use opencv::prelude::*;

use super::features::{Descriptor, FeatureExtractor, FeatureSet, KeyPoint};
use crate::config::OrbParams;

pub struct OpenCvOrbExtractor {
    orb: Ptr<features2d::ORB>,
}

// The ORB handle is only touched from the thread that owns the extractor.
unsafe impl Send for OpenCvOrbExtractor {}

impl OpenCvOrbExtractor {
    pub fn new(params: &OrbParams) -> Result<Self> {
        let orb = features2d::ORB::create(
            params.num_features as i32,
            params.scale_factor as f32,
            params.num_levels as i32,
            31,
            0,
            2,
            features2d::ORB_ScoreType::HARRIS_SCORE,
            31,
            params.ini_th_fast as i32,
        )?;
        Ok(Self { orb })
    }
}

impl FeatureExtractor for OpenCvOrbExtractor {
    fn extract(&mut self, image: &GrayImage) -> Result<FeatureSet> {
        let flat = Mat::from_slice(image.as_raw())?;
        let img = flat.reshape(1, image.height() as i32)?.try_clone()?;

        let mut keypoints = Vector::<CvKeyPoint>::new();
        let mut descriptors = Mat::default();
        let mask = Mat::default();
        self.orb
            .detect_and_compute(&img, &mask, &mut keypoints, &mut descriptors, false)?;

        let mut features = FeatureSet::default();
        for (i, kp) in keypoints.iter().enumerate() {
            let row = descriptors.at_row::<u8>(i as i32)?;
            if row.len() != 32 {
                bail!("unexpected ORB descriptor length {}", row.len());
            }
            let mut desc: Descriptor = [0u8; 32];
            desc.copy_from_slice(row);
            features.descriptors.push(desc);
            features.keypoints.push(KeyPoint {
                pt: Vector2::new(kp.pt().x as f64, kp.pt().y as f64),
                octave: kp.octave().max(0) as usize,
                angle: kp.angle() as f64,
                response: kp.response() as f64,
            });
        }
        Ok(features)
    }
}
