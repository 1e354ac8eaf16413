//! Simulated MCPHA instrument for testing without hardware.
//!
//! `MockInstrument` is a TCP server that speaks the real binary protocol: it
//! decodes every 8-byte command word, records it, and answers read commands
//! with correctly sized blocks. Tests script the timer values it returns and
//! inspect the recorded command log; the `simulate` CLI subcommand runs it in
//! clock mode so a bridge can be driven end to end.

use crate::protocol::{
    decode_command, encode_histogram, encode_oscilloscope, encode_status, encode_timer, Command,
    CommandCode, HistogramBuffer, OscilloscopeBuffer, OSCILLOSCOPE_SAMPLES, TIMER_FREQ,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// How the simulated timer answers `read-timer`.
#[derive(Debug, Clone)]
pub enum TimerScript {
    /// Return these tick values in order, then keep repeating the last one.
    Sequence(Vec<u64>),
    /// Count wall-clock time at 125 MHz while the timer mode is running,
    /// stopping at the programmed timer value.
    Clock,
}

/// Builder for a simulated instrument.
#[derive(Debug, Clone)]
pub struct MockInstrument {
    timer: TimerScript,
    histogram: HistogramBuffer,
    oscilloscope_status: u32,
    generate_pulses: bool,
}

impl Default for MockInstrument {
    fn default() -> Self {
        Self::new()
    }
}

impl MockInstrument {
    /// A quiet instrument: timer stuck at 0, empty histogram.
    pub fn new() -> Self {
        Self {
            timer: TimerScript::Sequence(vec![0]),
            histogram: HistogramBuffer::zeroed(),
            oscilloscope_status: 0,
            generate_pulses: false,
        }
    }

    /// A free-running instrument with a real-time timer that accumulates
    /// random pulses into its histogram while running.
    pub fn simulating() -> Self {
        Self {
            timer: TimerScript::Clock,
            generate_pulses: true,
            ..Self::new()
        }
    }

    /// Script the timer.
    pub fn with_timer_script(mut self, script: TimerScript) -> Self {
        self.timer = script;
        self
    }

    /// Initial histogram contents.
    pub fn with_histogram(mut self, histogram: HistogramBuffer) -> Self {
        self.histogram = histogram;
        self
    }

    /// Value returned by `read-oscilloscope-status`.
    pub fn with_oscilloscope_status(mut self, status: u32) -> Self {
        self.oscilloscope_status = status;
        self
    }

    /// Listen on an ephemeral localhost port.
    pub async fn spawn(self) -> std::io::Result<MockInstrumentHandle> {
        self.bind("127.0.0.1:0").await
    }

    /// Listen on `addr`.
    pub async fn bind(self, addr: &str) -> std::io::Result<MockInstrumentHandle> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        tracing::info!("Mock MCPHA instrument listening on {}", addr);

        let state = Arc::new(Mutex::new(MockState::new(self)));
        let commands = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let state = Arc::clone(&state);
            let commands = Arc::clone(&commands);
            tokio::spawn(async move {
                // One device, one conversation at a time
                loop {
                    match listener.accept().await {
                        Ok((socket, peer)) => {
                            tracing::debug!("Mock instrument accepted {}", peer);
                            if let Err(e) = serve(socket, &state, &commands).await {
                                tracing::debug!("Mock instrument connection ended: {}", e);
                            }
                        }
                        Err(e) => tracing::error!("Mock instrument accept error: {}", e),
                    }
                }
            })
        };

        Ok(MockInstrumentHandle {
            addr,
            commands,
            task,
        })
    }
}

/// A running simulated instrument. Stops when dropped.
pub struct MockInstrumentHandle {
    addr: SocketAddr,
    commands: Arc<Mutex<Vec<Command>>>,
    task: JoinHandle<()>,
}

impl MockInstrumentHandle {
    /// Listening address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Listening port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Every command received so far, in order.
    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().clone()
    }

    /// Number of received commands with `code`.
    pub fn count(&self, code: CommandCode) -> usize {
        self.commands.lock().iter().filter(|c| c.code == code).count()
    }

    /// Payloads of every `set-timer-mode` command received, in order.
    pub fn timer_mode_writes(&self) -> Vec<u64> {
        self.commands
            .lock()
            .iter()
            .filter(|c| c.code == CommandCode::SetTimerMode)
            .map(|c| c.payload)
            .collect()
    }

    /// Wait until the task finishes (it only does when aborted).
    pub async fn run_until_stopped(mut self) {
        let _ = (&mut self.task).await;
    }
}

impl Drop for MockInstrumentHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct MockState {
    timer: TimerScript,
    timer_reads: usize,
    histogram: HistogramBuffer,
    oscilloscope_status: u32,
    generate_pulses: bool,
    run_started: Option<Instant>,
    accumulated_ticks: u64,
    limit_ticks: u64,
    rng: StdRng,
}

impl MockState {
    fn new(config: MockInstrument) -> Self {
        Self {
            timer: config.timer,
            timer_reads: 0,
            histogram: config.histogram,
            oscilloscope_status: config.oscilloscope_status,
            generate_pulses: config.generate_pulses,
            run_started: None,
            accumulated_ticks: 0,
            limit_ticks: 0,
            rng: StdRng::from_entropy(),
        }
    }

    fn clock_ticks(&self) -> u64 {
        let running = self
            .run_started
            .map(|t| (t.elapsed().as_secs_f64() * TIMER_FREQ as f64) as u64)
            .unwrap_or(0);
        let total = self.accumulated_ticks.saturating_add(running);
        if self.limit_ticks > 0 {
            total.min(self.limit_ticks)
        } else {
            total
        }
    }

    fn is_running(&self) -> bool {
        self.run_started.is_some() && (self.limit_ticks == 0 || self.clock_ticks() < self.limit_ticks)
    }

    fn next_timer(&mut self) -> u64 {
        match &self.timer {
            TimerScript::Sequence(values) => {
                let value = values
                    .get(self.timer_reads)
                    .or_else(|| values.last())
                    .copied()
                    .unwrap_or(0);
                self.timer_reads += 1;
                value
            }
            TimerScript::Clock => self.clock_ticks(),
        }
    }

    fn accumulate_pulses(&mut self) {
        if !(self.generate_pulses && self.is_running()) {
            return;
        }
        let mut bins = self.histogram.bins().to_vec();
        if bins.is_empty() {
            return;
        }
        let last = bins.len().saturating_sub(1) as i64;
        for _ in 0..500 {
            // Two photopeaks on a flat background
            let centre: i64 = match self.rng.gen_range(0..10) {
                0..=4 => 3_000,
                5..=7 => 8_000,
                _ => self.rng.gen_range(0..=last),
            };
            let spread = self.rng.gen_range(-150..=150) + self.rng.gen_range(-150..=150);
            let bin = (centre + spread).clamp(0, last) as usize;
            bins[bin] = bins[bin].saturating_add(1);
        }
        self.histogram = HistogramBuffer::new(bins);
    }

    fn oscilloscope_trace(&mut self) -> OscilloscopeBuffer {
        let mut samples = Vec::with_capacity(OSCILLOSCOPE_SAMPLES);
        for i in 0..OSCILLOSCOPE_SAMPLES / 2 {
            let phase = i as f64 / 256.0 * std::f64::consts::TAU;
            let noise: i16 = self.rng.gen_range(-20..=20);
            samples.push((phase.sin() * 2_000.0) as i16 + noise);
            samples.push((phase.cos() * 1_000.0) as i16 + noise);
        }
        OscilloscopeBuffer::new(samples)
    }

    /// Apply `command` and return the response block, if the command has one.
    fn apply(&mut self, command: &Command) -> Option<Vec<u8>> {
        match command.code {
            CommandCode::ResetTimer => {
                self.accumulated_ticks = 0;
                if self.run_started.is_some() {
                    self.run_started = Some(Instant::now());
                }
                None
            }
            CommandCode::ResetHistogram => {
                self.histogram = HistogramBuffer::zeroed();
                None
            }
            CommandCode::SetTimerValue => {
                self.limit_ticks = command.payload;
                None
            }
            CommandCode::SetTimerMode => {
                if command.payload == 1 {
                    if self.run_started.is_none() {
                        self.run_started = Some(Instant::now());
                    }
                } else {
                    self.accumulated_ticks = self.clock_ticks();
                    self.run_started = None;
                }
                None
            }
            CommandCode::ReadTimer => Some(encode_timer(self.next_timer()).to_vec()),
            CommandCode::ReadHistogram => {
                self.accumulate_pulses();
                Some(encode_histogram(&self.histogram))
            }
            CommandCode::ReadOscilloscopeStatus => {
                Some(encode_status(self.oscilloscope_status).to_vec())
            }
            CommandCode::ReadOscilloscopeData => {
                let trace = self.oscilloscope_trace();
                Some(encode_oscilloscope(&trace))
            }
            _ => None,
        }
    }
}

async fn serve(
    mut socket: TcpStream,
    state: &Mutex<MockState>,
    commands: &Mutex<Vec<Command>>,
) -> crate::error::BridgeResult<()> {
    let mut word = [0u8; 8];
    loop {
        match socket.read_exact(&mut word).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let command = decode_command(word)?;
        tracing::trace!(?command, "Mock instrument received");
        commands.lock().push(command);

        let response = state.lock().apply(&command);
        if let Some(block) = response {
            socket.write_all(&block).await?;
        }
    }
}
