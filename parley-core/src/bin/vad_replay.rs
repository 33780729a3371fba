//! Offline detector replay: feed a WAV file through the noise tracker and the
//! voice activity detector at display-rate hops and print one JSON line per
//! detector event, followed by a summary line.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::Parser;
use parley_core::audio::downmix_into;
use parley_core::audio::envelope::{AnalysisWindow, EnvelopeSampler, DEFAULT_WINDOW};
use parley_core::vad::{
    AdaptiveNoiseTracker, NoiseConfig, VadConfig, VadEvent, VoiceActivityDetector,
};
use serde::Serialize;

#[derive(Debug, Parser)]
#[command(name = "vad_replay", about = "Replay a WAV file through the voice activity detector")]
struct Args {
    /// WAV file to replay (any channel count; downmixed to mono).
    input: PathBuf,

    /// Frame hop in milliseconds.
    #[arg(long, default_value_t = 16, value_parser = clap::value_parser!(u64).range(1..=200))]
    hop_ms: u64,

    /// Analysis window in samples.
    #[arg(long, default_value_t = DEFAULT_WINDOW as u64, value_parser = clap::value_parser!(u64).range(64..=8192))]
    window: u64,

    /// Treat the whole file as played over assistant audio (barge-in threshold).
    #[arg(long)]
    assistant_audible: bool,

    #[arg(long)]
    start_delta: Option<f32>,

    #[arg(long)]
    stop_delta: Option<f32>,
}

#[derive(Debug, Serialize)]
struct EventLine {
    at_ms: u64,
    rms: f32,
    floor: f32,
    #[serde(flatten)]
    event: VadEvent,
}

#[derive(Debug, Default, Serialize)]
struct Summary {
    file: String,
    sample_rate: u32,
    duration_ms: u64,
    frames: usize,
    episodes: usize,
    rejected: usize,
    speech_ms: u64,
    final_floor: f32,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("vad_replay failed: {e}");
        std::process::exit(1);
    }
}

fn read_wav_mono(path: &Path) -> Result<(Vec<f32>, u32), String> {
    let mut reader = hound::WavReader::open(path).map_err(|e| e.to_string())?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| e.to_string())?,
        hound::SampleFormat::Int => {
            let max = ((1_i64 << (spec.bits_per_sample.clamp(2, 32) - 1)) - 1) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / max))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| e.to_string())?
        }
    };

    let mut mono = Vec::with_capacity(interleaved.len() / channels);
    downmix_into(&interleaved, channels, |s: f32| s, &mut mono);
    Ok((mono, spec.sample_rate))
}

fn run() -> Result<(), String> {
    let args = Args::parse();
    let (samples, sample_rate) = read_wav_mono(&args.input)?;
    if sample_rate == 0 {
        return Err("WAV reports a zero sample rate".into());
    }

    let mut vad_config = VadConfig::default();
    if let Some(v) = args.start_delta {
        vad_config.start_delta = v;
    }
    if let Some(v) = args.stop_delta {
        vad_config.stop_delta = v;
    }
    let mut detector = VoiceActivityDetector::new(vad_config.normalized());
    let mut noise = AdaptiveNoiseTracker::new(NoiseConfig::default());
    let window_len = args.window as usize;
    let mut window = AnalysisWindow::new(window_len);
    let mut sampler = EnvelopeSampler::new(window_len);

    let hop = ((sample_rate as u64 * args.hop_ms) / 1000).max(1) as usize;
    let origin = Instant::now();
    let mut summary = Summary {
        file: args.input.display().to_string(),
        sample_rate,
        duration_ms: (samples.len() as u64 * 1000) / sample_rate as u64,
        ..Summary::default()
    };

    for (i, block) in samples.chunks(hop).enumerate() {
        let offset = Duration::from_millis(i as u64 * args.hop_ms);
        window.push(block);
        let sample = sampler.sample(&window, origin + offset);
        let guarded = args.assistant_audible || detector.is_speaking();
        let floor = noise.update(&sample, guarded);
        let event = detector.evaluate(&sample, floor, args.assistant_audible);
        summary.frames += 1;

        match event {
            VadEvent::SpeechStop { speech_ms } => {
                summary.episodes += 1;
                summary.speech_ms += speech_ms;
            }
            VadEvent::SpeechRejectedTooShort { .. } => summary.rejected += 1,
            _ => {}
        }
        if event.is_none() {
            continue;
        }

        let line = EventLine {
            at_ms: offset.as_millis() as u64,
            rms: sample.rms,
            floor,
            event,
        };
        println!("{}", serde_json::to_string(&line).map_err(|e| e.to_string())?);
    }

    summary.final_floor = noise.floor();
    println!(
        "{}",
        serde_json::to_string(&summary).map_err(|e| e.to_string())?
    );
    Ok(())
}
