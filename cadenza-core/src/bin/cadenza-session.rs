use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use cadenza_core::{
    AudioOutput, CpalOutput, Credentials, GenerationConfig, GenerationMode, NullOutput, Scale,
    SessionConfig, SessionController, ToneConnector, WeightedPrompt,
};
use tracing::{info, warn};

#[derive(Debug)]
struct Args {
    seconds: u64,
    prompts: Vec<WeightedPrompt>,
    generation: GenerationConfig,
    reconfigure_after: Option<u64>,
    reconfigure_bpm: Option<u32>,
    output: Option<PathBuf>,
    config_path: Option<PathBuf>,
    headless: bool,
    test_tone: bool,
    list_devices: bool,
}

const USAGE: &str = "Usage: cadenza-session [options]
  --seconds <n>              play for n seconds (default 10)
  --prompt <text[:weight]>   add a weighted prompt (repeatable)
  --bpm <60-200>             --density <0-1>   --brightness <0-1>
  --scale <SCALE_NAME>       --mode <quality|diversity|vocalization>
  --reconfigure-after <n>    apply --reconfigure-bpm with a context reset after n seconds
  --reconfigure-bpm <bpm>
  --out <file.wav>           recording path (default cadenza_session_<timestamp>.wav)
  --config <file.json>       session config file
  --headless                 do not open an output device
  --test-tone                play a short 440 Hz tone before starting
  --list-devices             print output devices and exit";

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cadenza=info".into()),
        )
        .init();

    if let Err(e) = run() {
        eprintln!("cadenza-session failed: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args = parse_args()?;

    if args.list_devices {
        for device in cadenza_core::list_output_devices() {
            let marker = if device.is_default { " (default)" } else { "" };
            println!("{}{marker}", device.name);
        }
        return Ok(());
    }

    let mut config = match &args.config_path {
        Some(path) => SessionConfig::from_json_file(path)
            .with_context(|| format!("reading config {}", path.display()))?,
        None => SessionConfig::default(),
    };
    config.apply_env_overrides();

    // The tone connector needs no key; pass one through if present anyway.
    let credentials = Credentials::from_env().unwrap_or_default();
    let connector = Arc::new(ToneConnector::new(config.format));
    let output: Arc<dyn AudioOutput> = if args.headless {
        Arc::new(NullOutput)
    } else {
        Arc::new(CpalOutput::new(config.preferred_output_device.clone()))
    };

    let session = SessionController::new(config, connector, output, credentials);
    session.connect().context("connecting session")?;
    if !session.audio_enabled() {
        warn!("no output device — recording only");
    }

    if args.test_tone && session.audio_enabled() {
        session.play_test_tone(Duration::from_millis(500))?;
        std::thread::sleep(Duration::from_millis(600));
    }

    if !args.prompts.is_empty() {
        session.set_prompts(args.prompts.clone())?;
    }
    if args.generation != GenerationConfig::default() {
        session.set_config(args.generation.clone())?;
    }
    session.play()?;
    info!(seconds = args.seconds, "playing");

    let total = Duration::from_secs(args.seconds);
    let reconfigure_at = args.reconfigure_after.map(Duration::from_secs);
    let started = std::time::Instant::now();
    let mut reconfigured = false;

    while started.elapsed() < total {
        std::thread::sleep(Duration::from_millis(250));
        if !session.is_connected() {
            warn!("connection lost — stopping early");
            break;
        }
        if let (Some(at), false) = (reconfigure_at, reconfigured) {
            if started.elapsed() >= at {
                let mut next = session.generation_config().unwrap_or_default();
                if let Some(bpm) = args.reconfigure_bpm {
                    next.bpm = Some(bpm);
                }
                info!(?next, "reconfiguring with context reset");
                session.update_config_with_reset(next)?;
                reconfigured = true;
            }
        }
    }

    if session.is_connected() {
        session.stop()?;
    }
    let diagnostics = session.diagnostics_snapshot();
    info!(
        chunks = diagnostics.chunks_in,
        underruns = diagnostics.underruns,
        recorded_secs = session.recording_duration_secs(),
        "session finished"
    );

    let path = args.output.unwrap_or_else(|| {
        PathBuf::from(format!(
            "cadenza_session_{}.wav",
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        ))
    });
    session
        .save_recording(&path)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("{}", path.display());

    session.close()?;
    Ok(())
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        seconds: 10,
        prompts: Vec::new(),
        generation: GenerationConfig::default(),
        reconfigure_after: None,
        reconfigure_bpm: None,
        output: None,
        config_path: None,
        headless: false,
        test_tone: false,
        list_devices: false,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = |flag: &str| {
            it.next()
                .with_context(|| format!("missing value for {flag}"))
        };
        match arg.as_str() {
            "--seconds" => {
                args.seconds = value("--seconds")?
                    .parse::<u64>()
                    .context("invalid value for --seconds")?
                    .clamp(1, 3600);
            }
            "--prompt" => args.prompts.push(parse_prompt(&value("--prompt")?)?),
            "--bpm" => {
                args.generation.bpm =
                    Some(value("--bpm")?.parse().context("invalid value for --bpm")?);
            }
            "--density" => {
                args.generation.density =
                    Some(value("--density")?.parse().context("invalid value for --density")?);
            }
            "--brightness" => {
                args.generation.brightness = Some(
                    value("--brightness")?
                        .parse()
                        .context("invalid value for --brightness")?,
                );
            }
            "--scale" => args.generation.scale = Some(Scale::from_name(&value("--scale")?)?),
            "--mode" => {
                args.generation.music_generation_mode =
                    Some(GenerationMode::from_name(&value("--mode")?)?);
            }
            "--reconfigure-after" => {
                args.reconfigure_after = Some(
                    value("--reconfigure-after")?
                        .parse()
                        .context("invalid value for --reconfigure-after")?,
                );
            }
            "--reconfigure-bpm" => {
                args.reconfigure_bpm = Some(
                    value("--reconfigure-bpm")?
                        .parse()
                        .context("invalid value for --reconfigure-bpm")?,
                );
            }
            "--out" => args.output = Some(PathBuf::from(value("--out")?)),
            "--config" => args.config_path = Some(PathBuf::from(value("--config")?)),
            "--headless" => args.headless = true,
            "--test-tone" => args.test_tone = true,
            "--list-devices" => args.list_devices = true,
            "--help" | "-h" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            other => bail!("unknown argument: {other}"),
        }
    }

    args.generation.validate()?;
    if let Some(bpm) = args.reconfigure_bpm {
        GenerationConfig {
            bpm: Some(bpm),
            ..Default::default()
        }
        .validate()?;
    }
    Ok(args)
}

/// `text` or `text:weight`; the weight defaults to 1.0.
fn parse_prompt(raw: &str) -> anyhow::Result<WeightedPrompt> {
    if let Some((text, weight)) = raw.rsplit_once(':') {
        if let Ok(weight) = weight.trim().parse::<f32>() {
            if text.trim().is_empty() {
                bail!("empty prompt text in {raw:?}");
            }
            return Ok(WeightedPrompt::new(text.trim(), weight));
        }
    }
    if raw.trim().is_empty() {
        bail!("empty prompt");
    }
    Ok(WeightedPrompt::new(raw.trim(), 1.0))
}
