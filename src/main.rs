//! Daqstream - streaming I/O demos on a simulated DAQ device
//!
//! Each subcommand sets up one acquisition or generation scenario, runs it
//! until Ctrl+C or `--seconds` elapses, and prints what moved.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daqstream::config::AppConfig;
use daqstream_core::stream::callback::ConsumerError;
use daqstream_core::stream::frame::{channel_mean, channel_peak};
use daqstream_core::{
    ChannelConsumer, ChannelSet, DigitalPattern, Direction, PulseSpec, SampleFrame, ShutdownSignal,
    SimClock, SimSignal, SimulatedDriver, SineWaveform, SoftwarePoller, StreamClockConfig,
    StreamContext, StreamTask, SyncCoordinator, TaskState, WaveformSource,
};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Step of the simulated clock thread
const CLOCK_PERIOD: Duration = Duration::from_millis(5);

/// Counter timebase for pulse generation
const PULSE_TIMEBASE_HZ: f64 = 100_000.0;

#[derive(Parser)]
#[command(name = "daqstream", version, about = "Buffered DAQ streaming demos")]
struct Cli {
    /// Config file (default: <config_dir>/daqstream/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Device name
    #[arg(short, long, global = true)]
    device: Option<String>,

    /// Sample rate in Hz
    #[arg(short, long, global = true)]
    rate: Option<f64>,

    /// Stop after this many seconds (0 = until Ctrl+C)
    #[arg(long, global = true, default_value_t = 5.0)]
    seconds: f64,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Continuous analog input with a per-N-samples callback
    AiContinuous {
        /// Frames per callback (default: config threshold or half the buffer)
        #[arg(long)]
        per_callback: Option<usize>,
    },
    /// Finite analog input of a fixed sample count
    AiFinite {
        #[arg(long, default_value_t = 15000)]
        samples: u64,
    },
    /// Software-timed polling with a rolling window
    AiSoftware {
        #[arg(long, default_value_t = 50)]
        interval_ms: u64,
        #[arg(long, default_value_t = 100)]
        window: usize,
    },
    /// Two-channel sine/cosine output replayed by the device
    AoRegen,
    /// Sine output topped up from a notification callback
    AoCallback,
    /// Binary counter on digital output lines, regenerated or refilled per config
    DoPattern {
        #[arg(long, default_value_t = 8)]
        lines: usize,
    },
    /// Single timed pulse on a counter output
    CoPulse {
        /// Counter number (`ctr<N>`)
        #[arg(long, default_value_t = 1)]
        counter: u32,
        /// Seconds the output stays high
        #[arg(long, default_value_t = 0.0025)]
        high_time: f64,
        /// Seconds the output stays low after each high phase
        #[arg(long, default_value_t = 0.0025)]
        low_time: f64,
        /// Seconds before the first rising edge
        #[arg(long, default_value_t = 2.0)]
        initial_delay: f64,
        #[arg(long, default_value_t = 1)]
        pulses: u64,
    },
    /// Output and input sharing the output's clock, started together
    ///
    /// The output regenerates or is refilled per the config's `regeneration`.
    Mixed,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let directive = if cli.verbose {
        "daqstream=debug"
    } else {
        "daqstream=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.parse()?),
        )
        .init();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };
    if let Some(device) = cli.device {
        config.device = device;
    }
    if let Some(rate) = cli.rate {
        config.sample_rate = rate;
    }
    config.validate().context("Invalid settings")?;

    println!("daqstream v{} on {}", daqstream::VERSION, config.device);
    println!();

    let shutdown = ShutdownSignal::new();
    let handler = shutdown.clone();
    ctrlc::set_handler(move || handler.trigger()).ok();

    let run = Run {
        sim: Arc::new(SimulatedDriver::new(&config.device)),
        config,
        shutdown,
        seconds: cli.seconds,
    };

    match cli.command {
        Command::AiContinuous { per_callback } => run.ai_continuous(per_callback),
        Command::AiFinite { samples } => run.ai_finite(samples),
        Command::AiSoftware {
            interval_ms,
            window,
        } => run.ai_software(Duration::from_millis(interval_ms), window),
        Command::AoRegen => run.ao_regen(),
        Command::AoCallback => run.ao_callback(),
        Command::DoPattern { lines } => run.do_pattern(lines),
        Command::CoPulse {
            counter,
            high_time,
            low_time,
            initial_delay,
            pulses,
        } => run.co_pulse(
            counter,
            PulseSpec {
                high_time,
                low_time,
                initial_delay,
                pulses,
            },
        ),
        Command::Mixed => run.mixed(),
    }
}

/// One demo run on a fresh simulated device
struct Run {
    sim: Arc<SimulatedDriver>,
    config: AppConfig,
    shutdown: ShutdownSignal,
    seconds: f64,
}

impl Run {
    fn context(&self) -> StreamContext {
        StreamContext::new(self.sim.clone())
    }

    fn clock(&self) -> SimClock {
        SimClock::start(self.sim.clone(), self.config.sample_rate, CLOCK_PERIOD)
    }

    /// Block until Ctrl+C or the run time elapses
    fn wait(&self) {
        if self.seconds > 0.0 {
            self.shutdown
                .wait_timeout(Duration::from_secs_f64(self.seconds));
        } else {
            self.shutdown.wait();
        }
    }

    fn deadline(&self) -> Option<Instant> {
        (self.seconds > 0.0).then(|| Instant::now() + Duration::from_secs_f64(self.seconds))
    }

    fn should_stop(&self, deadline: Option<Instant>) -> bool {
        self.shutdown.is_triggered() || deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn ai_continuous(&self, per_callback: Option<usize>) -> Result<()> {
        let ctx = self.context();
        let mut task = ctx.create_task("ai-continuous", Direction::Input);
        let buffer = self.config.buffer_frames;
        if let Some(n) = per_callback.or(self.config.callback_threshold) {
            task.set_callback_threshold(n)?;
        }
        task.configure(
            self.config.input_set(),
            StreamClockConfig::continuous(self.config.sample_rate),
            buffer,
            false,
        )?;
        let (consumer, batches) = ChannelConsumer::bounded(256);
        task.set_consumer(consumer)?;

        let mut clock = self.clock();
        task.start()?;
        println!(
            "Acquiring {} channel(s), {} frames per callback. Press Ctrl+C to stop.",
            self.config.input_channels.len(),
            task.callback_threshold().unwrap_or(buffer / 2)
        );

        let deadline = self.deadline();
        while !self.should_stop(deadline) && task.state() == TaskState::Running {
            if let Ok(batch) = batches.recv_timeout(Duration::from_millis(100)) {
                println!(
                    "[{}] batch {:>5} | frames {:>5} | mean {:>8.4} V",
                    batch.received_at.format("%H:%M:%S%.3f"),
                    batch.sequence,
                    batch.frames.len(),
                    channel_mean(&batch.frames, 0).unwrap_or(0.0)
                );
            }
        }

        task.stop()?;
        clock.stop();
        report(&task)
    }

    fn ai_finite(&self, samples: u64) -> Result<()> {
        let ctx = self.context();
        let mut task = ctx.create_task("ai-finite", Direction::Input);
        let buffer = self.config.buffer_frames.min(samples as usize).max(1);
        task.configure(
            self.config.input_set(),
            StreamClockConfig::finite(self.config.sample_rate, samples),
            buffer,
            false,
        )?;

        let acquired = Arc::new(Mutex::new(Vec::with_capacity(samples as usize)));
        let sink = Arc::clone(&acquired);
        task.set_consumer(move |frames: &[SampleFrame]| -> Result<(), ConsumerError> {
            sink.lock()
                .map_err(|_| ConsumerError("sample store poisoned".into()))?
                .extend_from_slice(frames);
            Ok(())
        })?;

        let mut clock = self.clock();
        task.start()?;
        let expected = Duration::from_secs_f64(samples as f64 / self.config.sample_rate);
        println!("Acquiring {} samples (~{:.1}s)...", samples, expected.as_secs_f64());

        let done = task.wait_until_done(expected + Duration::from_secs(5));
        clock.stop();
        if !done {
            warn!("Finite acquisition did not complete in time");
            task.stop()?;
        }

        let frames = acquired
            .lock()
            .map_err(|_| anyhow::anyhow!("sample store poisoned"))?;
        println!(
            "Acquired {} frames | mean {:.4} V | peak {:.4} V",
            frames.len(),
            channel_mean(&frames, 0).unwrap_or(0.0),
            channel_peak(&frames, 0).unwrap_or(0.0)
        );
        drop(frames);
        report(&task)
    }

    fn ai_software(&self, interval: Duration, window: usize) -> Result<()> {
        let poller = SoftwarePoller::open(
            self.sim.clone(),
            "ai-software",
            self.config.input_set(),
            window,
        )?;
        let worker = poller
            .spawn(interval, self.shutdown.clone(), |frames: &[SampleFrame]| {
                if let Some(value) = frames.first().and_then(|f| f.value(0)) {
                    println!("{:>8.4} V", value);
                }
                Ok::<(), ConsumerError>(())
            })
            .context("Failed to start polling thread")?;

        self.wait();
        self.shutdown.trigger();
        let poller = worker
            .join()
            .map_err(|_| anyhow::anyhow!("polling thread panicked"))??;

        let recent = poller.window();
        println!(
            "Polled {} frames | window {} | window mean {:.4} V",
            poller.polls(),
            recent.len(),
            channel_mean(&recent, 0).unwrap_or(0.0)
        );
        Ok(())
    }

    fn ao_regen(&self) -> Result<()> {
        let ctx = self.context();
        let mut task = ctx.create_task("ao-regen", Direction::Output);
        let names = self.two_output_channels();
        let table = SineWaveform::new(self.config.wave_length, self.config.wave_amplitude)
            .with_quadrature()
            .frames();

        self.configure_output(&mut task, ChannelSet::analog(&names), table, true)?;

        let mut clock = self.clock();
        task.start()?;
        println!(
            "Generating sine/cosine on {} and {}. Press Ctrl+C to stop.",
            names[0], names[1]
        );
        self.wait();

        task.stop()?;
        clock.stop();
        self.report_output(&task)?;
        report(&task)
    }

    fn ao_callback(&self) -> Result<()> {
        let ctx = self.context();
        let mut task = ctx.create_task("ao-callback", Direction::Output);
        let wave = SineWaveform::new(self.config.wave_length, self.config.wave_amplitude);
        self.configure_output(&mut task, self.config.output_set(), wave.frames(), false)?;

        let mut clock = self.clock();
        task.start()?;
        println!("Generating with callback refills. Press Ctrl+C to stop.");

        let deadline = self.deadline();
        while !self.should_stop(deadline) && task.state() == TaskState::Running {
            self.shutdown.wait_timeout(Duration::from_millis(500));
            let stats = task.stats();
            info!(
                written = stats.frames_written,
                transferred = stats.frames_transferred,
                fill = stats.fill_level,
                "Output progress"
            );
        }

        task.stop()?;
        clock.stop();
        self.report_output(&task)?;
        report(&task)
    }

    fn do_pattern(&self, lines: usize) -> Result<()> {
        let ctx = self.context();
        let mut task = ctx.create_task("do-pattern", Direction::Output);
        let pattern = DigitalPattern::counter(lines.clamp(1, 32));
        let table = pattern.frames(256);
        let names: Vec<String> = (0..lines.clamp(1, 32))
            .map(|i| self.config.channel(&format!("port0/line{}", i)))
            .collect();

        self.configure_output(
            &mut task,
            ChannelSet::digital(&names),
            table,
            self.config.regeneration,
        )?;

        let mut clock = self.clock();
        task.start()?;
        println!("Counting on {} lines. Press Ctrl+C to stop.", names.len());
        self.wait();

        task.stop()?;
        clock.stop();
        self.report_output(&task)?;
        report(&task)
    }

    fn co_pulse(&self, counter: u32, spec: PulseSpec) -> Result<()> {
        let ctx = self.context();
        let channel = self.config.channel(&format!("ctr{}", counter));
        let mut pulse = ctx.create_pulse_task("co-pulse");
        pulse.configure(&channel, spec, PULSE_TIMEBASE_HZ)?;

        let mut clock = SimClock::start(self.sim.clone(), PULSE_TIMEBASE_HZ, CLOCK_PERIOD);
        pulse.start()?;
        println!(
            "Pulse on {}: {}s high, {}s low after {}s ({} pulse(s))",
            channel, spec.high_time, spec.low_time, spec.initial_delay, spec.pulses
        );

        let done = pulse.wait_until_done(Duration::from_secs_f64(spec.duration() + 1.0));
        clock.stop();
        if !done {
            warn!("Pulse did not complete in time");
            pulse.stop()?;
        }

        let handle = pulse.handle().context("pulse task has no device handle")?;
        let recent = self.sim.emitted(handle);
        let high = recent.iter().filter(|f| f.value(0) == Some(1.0)).count();
        println!(
            "Counter ran {} ticks at {} Hz, last {} ticks held {} high",
            self.sim.emitted_count(handle),
            PULSE_TIMEBASE_HZ,
            recent.len(),
            high
        );
        if let Some(err) = pulse.last_error() {
            println!("co-pulse stopped on error: {}", err);
        }
        Ok(())
    }

    fn mixed(&self) -> Result<()> {
        let ctx = self.context();
        let out_names = self.config.output_set();
        let in_names = self.config.input_set();
        let ao0 = out_names
            .names()
            .first()
            .cloned()
            .context("no output channels configured")?;
        let ai0 = in_names
            .names()
            .first()
            .cloned()
            .context("no input channels configured")?;
        self.sim.set_channel_signal(&ai0, SimSignal::Loopback(ao0.clone()));

        let mut ao = ctx.create_task("ao", Direction::Output);
        let table = SineWaveform::new(self.config.wave_length, self.config.wave_amplitude).frames();
        self.configure_output(&mut ao, out_names, table, self.config.regeneration)?;

        let mut ai = ctx.create_task("ai", Direction::Input);
        ai.configure(
            in_names,
            StreamClockConfig::continuous(self.config.sample_rate),
            self.config.buffer_frames,
            false,
        )?;
        let (consumer, batches) = ChannelConsumer::bounded(256);
        ai.set_consumer(consumer)?;

        let mut clock = self.clock();
        {
            let mut sync = SyncCoordinator::bind_io(&mut ao, &mut ai)?;
            sync.start_synchronized()?;
            println!(
                "{} drives {} (loopback), started on tick {:?}/{:?}. Press Ctrl+C to stop.",
                ao0,
                ai0,
                sync.leader().stats().start_tick,
                sync.follower().stats().start_tick
            );

            let deadline = self.deadline();
            while !self.should_stop(deadline) && sync.follower().state() == TaskState::Running {
                if let Ok(batch) = batches.recv_timeout(Duration::from_millis(100)) {
                    println!(
                        "batch {:>5} | mean {:>8.4} V | peak {:>8.4} V",
                        batch.sequence,
                        channel_mean(&batch.frames, 0).unwrap_or(0.0),
                        channel_peak(&batch.frames, 0).unwrap_or(0.0)
                    );
                }
            }
            sync.stop_all()?;
        }
        clock.stop();

        report(&ao)?;
        report(&ai)
    }

    /// Configure a continuous output replaying `table`
    fn configure_output(
        &self,
        task: &mut StreamTask,
        channels: ChannelSet,
        table: Vec<SampleFrame>,
        regeneration: bool,
    ) -> Result<()> {
        let plan = self.config.output_plan(table.len(), regeneration);
        if let Some(n) = plan.threshold {
            task.set_callback_threshold(n)?;
        }
        task.configure(
            channels,
            StreamClockConfig::continuous(self.config.sample_rate),
            plan.buffer_frames,
            plan.regeneration,
        )?;
        task.set_source(WaveformSource::new(table))?;
        info!(
            task = %task.name(),
            buffer = plan.buffer_frames,
            regeneration = plan.regeneration,
            "Output buffering"
        );
        Ok(())
    }

    fn two_output_channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.config.output_channels.iter().take(2).cloned().collect();
        for fallback in ["ao0", "ao1"] {
            if names.len() < 2 && !names.iter().any(|n| n == fallback) {
                names.push(fallback.to_string());
            }
        }
        names.iter().map(|n| self.config.channel(n)).collect()
    }

    fn report_output(&self, task: &StreamTask) -> Result<()> {
        let handle = task.handle().context("output task has no device handle")?;
        let emitted = self.sim.emitted_count(handle);
        let last = self.sim.emitted(handle).pop();
        println!(
            "Device emitted {} frames, last frame {:?}",
            emitted,
            last.map(|f| (0..f.width()).filter_map(|c| f.value(c)).collect::<Vec<_>>())
        );
        Ok(())
    }
}

/// Print a task's final counters and any recorded runtime error
fn report(task: &StreamTask) -> Result<()> {
    println!("{}: {}", task.name(), serde_json::to_string_pretty(&task.stats())?);
    if let Some(err) = task.last_error() {
        warn!(task = %task.name(), "Stopped on error: {}", err);
        println!("{} stopped on error: {}", task.name(), err);
    }
    Ok(())
}
