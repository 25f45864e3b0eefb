use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chipwave::apu::CPU_CLOCK_HZ;
use chipwave::audio::{self, AudioOutput};
use chipwave::config::{PlayerConfig, RuntimeFlags};
use chipwave::dac::{DacRelay, DacWriter};
use chipwave::engine::ApuEngine;
use chipwave::mixer::audio_graph;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Debug, Clone)]
struct Args {
    config: Option<PathBuf>,
    write_config: Option<PathBuf>,
    seconds: f32,
    mono: bool,
    filters: bool,
    dac: bool,
    verbose: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: None,
            write_config: None,
            seconds: 4.0,
            mono: false,
            filters: false,
            dac: false,
            verbose: false,
        }
    }
}

fn parse_args() -> Result<Args> {
    let mut args = Args::default();
    let mut argv = std::env::args().skip(1);

    while let Some(arg) = argv.next() {
        match arg.as_str() {
            "--config" => {
                let value = argv
                    .next()
                    .context("--config requires a path, e.g. --config chipwave.json")?;
                args.config = Some(PathBuf::from(value));
            }
            "--write-config" => {
                let value = argv
                    .next()
                    .context("--write-config requires a path, e.g. --write-config chipwave.json")?;
                args.write_config = Some(PathBuf::from(value));
            }
            "--seconds" => {
                let value = argv
                    .next()
                    .context("--seconds requires a number, e.g. --seconds 4")?;
                args.seconds = value
                    .parse::<f32>()
                    .with_context(|| format!("invalid --seconds value: {value}"))?;
            }
            "--mono" => args.mono = true,
            "--filters" => args.filters = true,
            "--dac" => args.dac = true,
            "--verbose" | "-v" => args.verbose = true,
            "--help" | "-h" => {
                println!(
                    "chipwave\n\n\
Usage:\n\
  cargo run --release -- [options]\n\n\
Options:\n\
  --config <path>        Load player settings from a JSON file\n\
  --write-config <path>  Write the effective settings to a JSON file and exit\n\
  --seconds <n>          Demo length in seconds (default 4)\n\
  --mono                 Mix to mono instead of stereo\n\
  --filters              Emulate the console's analog output filters\n\
  --dac                  Also stream an 8-bit DAC voice\n\
  -v, --verbose          Debug logging\n\
  -h, --help             Show this help\n"
                );
                std::process::exit(0);
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }

    Ok(args)
}

fn setup_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .compact()
        .finish()
        .init();
}

const STEP: Duration = Duration::from_millis(150);
const POLL: Duration = Duration::from_millis(5);

/// C major arpeggio, two octaves.
const MELODY_HZ: [f32; 8] = [
    261.63, 329.63, 392.00, 523.25, 659.25, 523.25, 392.00, 329.63,
];
const BASS_HZ: [f32; 2] = [65.41, 98.00];

/// Half-period square wave for the DMC, one bit at a time.
fn demo_dpcm() -> Vec<u8> {
    (0..64)
        .map(|i| if i % 8 < 4 { 0xFF } else { 0x00 })
        .collect()
}

fn timer_period(freq: f32, steps: f32) -> u16 {
    ((CPU_CLOCK_HZ / (steps * freq)).round() as u16)
        .saturating_sub(1)
        .min(0x7FF)
}

fn write_timer(engine: &mut ApuEngine, low_register: u8, period: u16) {
    engine.write_register(low_register, (period & 0xFF) as u8);
    // Length index 1 with the halt flag set on every voice.
    engine.write_register(low_register + 1, ((period >> 8) as u8 & 0x07) | 0x08);
}

fn start_voices(engine: &mut ApuEngine) {
    engine.write_register(0x17, 0x40);
    engine.write_register(0x15, 0x1F);
    engine.write_register(0x00, 0xB6);
    engine.write_register(0x01, 0x00);
    engine.write_register(0x04, 0x74);
    engine.write_register(0x05, 0x00);
    engine.write_register(0x08, 0xFF);
    engine.write_register(0x10, 0x4F);
    engine.write_register(0x11, 0x40);
    engine.write_register(0x12, 0x00);
    engine.write_register(0x13, 0x03);
}

fn play_step(engine: &mut ApuEngine, step: usize) {
    let note = MELODY_HZ[step % MELODY_HZ.len()];
    write_timer(engine, 0x02, timer_period(note, 16.0));
    write_timer(engine, 0x06, timer_period(note * 1.5, 16.0));
    let bass = BASS_HZ[(step / MELODY_HZ.len()) % BASS_HZ.len()];
    write_timer(engine, 0x0A, timer_period(bass, 32.0));

    if step % 4 == 0 {
        // Short decaying noise hit.
        engine.write_register(0x0C, 0x02);
        engine.write_register(0x0E, 0x04);
        engine.write_register(0x0F, 0x10);
    }
}

/// Unsigned 8-bit triangle wave at `freq` Hz.
fn dac_sample(index: u64, freq: f32, sample_rate: u32) -> u8 {
    let phase = (index as f32 * freq / sample_rate as f32).fract();
    let level = if phase < 0.5 { phase * 2.0 } else { 2.0 - phase * 2.0 };
    (64.0 + level * 127.0) as u8
}

fn play_demo(
    engine: &mut ApuEngine,
    mut dac: Option<&mut DacWriter>,
    seconds: f32,
    sample_rate: u32,
) {
    start_voices(engine);
    let start = Instant::now();
    let length = Duration::from_secs_f32(seconds.max(0.0));
    let mut step = 0usize;
    let mut next_step = start;
    let mut dac_written = 0u64;

    while start.elapsed() < length {
        let now = Instant::now();
        if now >= next_step {
            play_step(engine, step);
            step += 1;
            next_step += STEP;
        }

        if let Some(writer) = dac.as_deref_mut() {
            let due = (start.elapsed().as_secs_f64() * sample_rate as f64) as u64;
            while dac_written < due {
                writer.write_sample(dac_sample(dac_written, 220.0, sample_rate));
                dac_written += 1;
            }
        }

        thread::sleep(POLL);
    }
}

fn main() -> Result<()> {
    let args = parse_args()?;
    setup_logging(args.verbose);

    let mut config = match &args.config {
        Some(path) => PlayerConfig::from_file(path)?,
        None => PlayerConfig::default(),
    };
    if args.mono {
        config.stereo = false;
    }
    if args.filters {
        config.filters = true;
    }
    if let Some(path) = &args.write_config {
        config.save(path)?;
        println!("wrote {}", path.display());
        return Ok(());
    }

    config.sample_rate = audio::probe_sample_rate().context("failed to open audio output")?;
    config.validate()?;

    let flags = Arc::new(RuntimeFlags::from_config(&config));
    let (mut manager, mixer) = audio_graph(config.audio_memory_blocks);
    let (mut engine, mut stream) = ApuEngine::new(&config, Arc::clone(&flags));
    stream.load_dpcm(&demo_dpcm());
    manager.connect(Box::new(stream))?;

    let mut dac = if args.dac {
        let (writer, dac_stream) =
            DacRelay::new(config.dac_buffer_capacity, config.dac_prefill_samples);
        manager.connect(Box::new(dac_stream))?;
        writer.set_enabled(true);
        Some(writer)
    } else {
        None
    };

    let output = AudioOutput::new(mixer)?;
    let start = Instant::now();
    engine.start_frame_timer()?;
    play_demo(&mut engine, dac.as_mut(), args.seconds, output.sample_rate());

    let diagnostics = engine.diagnostics();
    let dac_diagnostics = dac.as_ref().map(DacWriter::diagnostics);
    engine.shutdown();
    let released = manager.mute_and_disconnect()?;
    let mixer_stats = manager.stats();
    drop(released);
    drop(output);

    println!();
    println!("Playback Summary");
    println!("- sample rate: {} Hz", config.sample_rate);
    println!("- stereo: {}, filters: {}", flags.stereo(), flags.filters());
    println!("- register writes: {}", diagnostics.register_writes);
    println!("- non-silent samples: {}", diagnostics.non_silent_samples);
    println!("- blocks rendered: {}", diagnostics.blocks_rendered);
    println!("- blocks skipped: {}", diagnostics.blocks_skipped);
    println!(
        "- frame ticks: {} issued, {} applied, {} dropped",
        diagnostics.frame_ticks_issued,
        diagnostics.frame_ticks_applied,
        diagnostics.frame_ticks_dropped
    );
    println!("- commands dropped: {}", diagnostics.commands_dropped);
    println!("- mixer cycles: {}", mixer_stats.cycles);
    if let Some(dac) = dac_diagnostics {
        println!(
            "- dac: level {} ({:.1}%), underruns {}, overruns {}",
            dac.level, dac.fill_percent, dac.underruns, dac.overruns
        );
    }
    println!("- elapsed: {:.2}s", start.elapsed().as_secs_f32());
    Ok(())
}
