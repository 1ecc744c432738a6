use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mono_vslam::io::{write_tum_trajectory, EurocSequence};
use mono_vslam::{Engine, SlamError, TrackingState};

const USAGE: &str = "usage: mono-vslam <vocabulary.txt> <settings.yaml> <euroc sequence (mav0)> [trajectory.txt]";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 3 {
        bail!(USAGE);
    }
    let (vocabulary_path, settings_path, sequence_path) = (&args[0], &args[1], &args[2]);
    let trajectory_path = args
        .get(3)
        .cloned()
        .unwrap_or_else(|| "trajectory.txt".to_string());

    let sequence = EurocSequence::new(sequence_path)
        .with_context(|| format!("Loading EuRoC sequence from {}", sequence_path))?;
    info!("Loaded {} frames from {}", sequence.len(), sequence_path);

    let mut engine = Engine::new(vocabulary_path, settings_path, false, false)
        .context("Failed to start the SLAM engine")?;

    let mut tracked = 0usize;
    let mut lost = 0usize;
    for i in 0..sequence.len() {
        let (image, timestamp) = match sequence.image(i) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Skipping frame {}: {:#}", i, e);
                continue;
            }
        };

        match engine.track(&image, timestamp) {
            Ok(TrackingState::Ok) => tracked += 1,
            Ok(TrackingState::Lost) => lost += 1,
            Ok(_) => {}
            Err(e @ SlamError::NonMonotonicTimestamp { .. }) => {
                warn!("Skipping frame {}: {}", i, e);
                continue;
            }
            Err(e) => return Err(e.into()),
        }

        if i % 100 == 0 {
            let timing = engine.last_result().map(|r| r.timing.total_ms).unwrap_or(0.0);
            info!(
                "Frame {}/{}: state={}, {} keyframes, {} map points, {} matched, {:.1} ms",
                i,
                sequence.len(),
                engine.state(),
                engine.keyframe_count(),
                engine.map_point_count(),
                engine.matched_feature_point_count(),
                timing
            );
        }
    }

    // Shutdown cleanly (joins the maintainer thread)
    engine.shutdown();
    info!(
        "Done: {} frames, {} tracked, {} lost, {} keyframes",
        sequence.len(),
        tracked,
        lost,
        engine.keyframe_count()
    );

    let written = write_tum_trajectory(&trajectory_path, engine.poses())?;
    info!("Wrote {} poses to {}", written, trajectory_path);
    Ok(())
}
