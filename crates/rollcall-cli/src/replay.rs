//! `rollcall replay-blink`: feed a recorded EAR sequence through the blink
//! detector on a synthetic clock.

use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use rollcall_core::{BlinkConfig, BlinkDetector, BlinkObservation, BlinkStrategy};
use rollcall_engine::Config;
use serde::Serialize;

#[derive(Serialize)]
struct Sample {
    index: usize,
    ear: f32,
    eye_closed: bool,
    blink_confirmed: bool,
    total_blinks: u32,
    is_live: bool,
    confidence: f32,
}

fn blink_config(config: &Config, strategy: Option<&str>) -> Result<BlinkConfig> {
    let strategy = match strategy.map(str::to_ascii_lowercase).as_deref() {
        None => config.blink.strategy,
        Some("fixed") => match config.blink.strategy {
            s @ BlinkStrategy::FixedThreshold { .. } => s,
            BlinkStrategy::AdaptiveBaseline {
                consecutive_frames,
                fallback_threshold,
                ..
            } => BlinkStrategy::FixedThreshold {
                threshold: fallback_threshold,
                consecutive_frames,
            },
        },
        Some("adaptive") => match config.blink.strategy {
            s @ BlinkStrategy::AdaptiveBaseline { .. } => s,
            BlinkStrategy::FixedThreshold { threshold, .. } => {
                let mut adaptive = BlinkStrategy::adaptive();
                if let BlinkStrategy::AdaptiveBaseline {
                    fallback_threshold, ..
                } = &mut adaptive
                {
                    *fallback_threshold = threshold;
                }
                adaptive
            }
        },
        Some(other) => bail!("unknown blink strategy '{other}' (expected fixed|adaptive)"),
    };
    Ok(BlinkConfig {
        strategy,
        ..config.blink
    })
}

fn replay(config: BlinkConfig, ears: &[f32], interval: Duration) -> Result<Vec<Sample>> {
    let mut detector = BlinkDetector::new(config);
    let start = Instant::now();

    let mut samples = Vec::with_capacity(ears.len());
    for (index, &ear) in ears.iter().enumerate() {
        let now = u32::try_from(index)
            .ok()
            .and_then(|i| interval.checked_mul(i))
            .and_then(|offset| start.checked_add(offset));
        let Some(now) = now else {
            bail!("sample {index} at {interval:?} intervals overflows the replay clock");
        };
        if let BlinkObservation::Observed {
            ear,
            eye_closed,
            blink_confirmed,
            total_blinks,
            signal,
        } = detector.observe_ear_at(ear, now)
        {
            samples.push(Sample {
                index,
                ear,
                eye_closed,
                blink_confirmed,
                total_blinks,
                is_live: signal.is_live,
                confidence: signal.confidence,
            });
        }
    }
    Ok(samples)
}

pub fn run(
    config: &Config,
    ears: &[f32],
    interval_ms: u64,
    strategy: Option<&str>,
    json: bool,
) -> Result<()> {
    let blink = blink_config(config, strategy)?;
    let samples = replay(blink, ears, Duration::from_millis(interval_ms))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&samples)?);
        return Ok(());
    }

    println!("strategy: {:?}", blink.strategy);
    println!("{:>5} {:>7} {:>6} {:>6} {:>6} {:>5} {:>5}", "#", "EAR", "CLOSED", "BLINK", "TOTAL", "LIVE", "CONF");
    for s in &samples {
        println!(
            "{:>5} {:>7.3} {:>6} {:>6} {:>6} {:>5} {:>5.2}",
            s.index,
            s.ear,
            s.eye_closed,
            if s.blink_confirmed { "*" } else { "" },
            s.total_blinks,
            s.is_live,
            s.confidence
        );
    }
    let total = samples.last().map(|s| s.total_blinks).unwrap_or(0);
    println!("blinks: {total}");
    Ok(())
}
