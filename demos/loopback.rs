//! Two players and an optional spectator running a toy core in one process.
//!
//! ```text
//! cargo run --example loopback -- --frames 600 --lag 3 --flip-at 120 --spectate
//! cargo run --example loopback -- --transport tcp
//! ```
//!
//! The client lags `--lag` ticks behind the host, so the host speculates and rolls back
//! whenever the client's input changes. At the end the confirmed states of every session
//! are compared.

use std::collections::BTreeMap;
use std::net::TcpListener;

use clap::{Parser, ValueEnum};
use deltaplay::hash::fnv1a_bytes;
use deltaplay::{
    AdvanceOutcome, CoreState, FrameInputs, InputWords, MemoryStream, NonBlockingStream, Role,
    Session, SessionBuilder, TcpNonBlockingStream,
};
use web_time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Transport {
    Memory,
    Tcp,
}

#[derive(Parser, Debug)]
struct Opt {
    /// Host frames to run.
    #[arg(short, long, default_value_t = 600)]
    frames: u32,
    /// Speculation window of both players.
    #[arg(short, long, default_value_t = 8)]
    sync_frames: usize,
    /// Ticks the client starts behind the host.
    #[arg(short, long, default_value_t = 2)]
    lag: u32,
    /// Host frame at which the host requests a player flip.
    #[arg(long)]
    flip_at: Option<u32>,
    /// Attach a spectator to the host.
    #[arg(long)]
    spectate: bool,
    #[arg(long, value_enum, default_value_t = Transport::Memory)]
    transport: Transport,
    /// Log verbosity.
    #[arg(long, default_value_t = tracing::Level::INFO)]
    log_level: tracing::Level,
}

/// A toy core: a position per player, moved by the first input word of its port.
#[derive(Default)]
struct ToyCore {
    frame: u32,
    positions: [i32; 2],
    checksums: BTreeMap<u32, u64>,
}

impl ToyCore {
    const STATE_SIZE: usize = 12;
}

impl CoreState for ToyCore {
    fn state_size(&self) -> usize {
        Self::STATE_SIZE
    }

    fn save_state(&self, buf: &mut [u8]) -> bool {
        if buf.len() != Self::STATE_SIZE {
            return false;
        }
        buf[..4].copy_from_slice(&self.frame.to_le_bytes());
        buf[4..8].copy_from_slice(&self.positions[0].to_le_bytes());
        buf[8..].copy_from_slice(&self.positions[1].to_le_bytes());
        true
    }

    fn load_state(&mut self, buf: &[u8]) -> bool {
        let (Some(frame), Some(p0), Some(p1)) = (
            buf.get(..4).and_then(|b| b.try_into().ok()),
            buf.get(4..8).and_then(|b| b.try_into().ok()),
            buf.get(8..12).and_then(|b| b.try_into().ok()),
        ) else {
            return false;
        };
        self.frame = u32::from_le_bytes(frame);
        self.positions = [i32::from_le_bytes(p0), i32::from_le_bytes(p1)];
        true
    }

    fn run_frame(&mut self, inputs: &FrameInputs) {
        for (port, position) in self.positions.iter_mut().enumerate() {
            let step = match inputs.port(port).word(0) % 3 {
                0 => -1,
                1 => 0,
                _ => 1,
            };
            *position = position.wrapping_add(step);
        }
        let mut state = [0u8; Self::STATE_SIZE];
        self.frame += 1;
        if self.save_state(&mut state) {
            self.checksums.insert(inputs.frame.as_u32(), fnv1a_bytes(&state));
        }
    }
}

/// Pseudo-random but reproducible input for one player and frame.
fn input_for(player: u32, frame: u32) -> InputWords {
    // hold each input for a few frames, like a thumb on a stick
    let held = frame / 7;
    InputWords::new([held.wrapping_mul(2_654_435_761).rotate_left(player + 3), 0, 0])
}

struct Player {
    name: &'static str,
    session: Session,
    core: ToyCore,
    seed: u32,
}

impl Player {
    fn start(
        name: &'static str,
        role: Role,
        seed: u32,
        sync_frames: usize,
        link: impl NonBlockingStream + 'static,
    ) -> Result<Player, Box<dyn std::error::Error>> {
        let core = ToyCore::default();
        let session = SessionBuilder::new()
            .with_role(role)
            .with_nickname(name)
            .with_core("toy", "1.0")
            .with_sync_frames(sync_frames)?
            .start_session(link, &core)?;
        Ok(Player {
            name,
            session,
            core,
            seed,
        })
    }

    fn tick(&mut self) -> Result<AdvanceOutcome, Box<dyn std::error::Error>> {
        let frame = self.session.current_frame().as_u32();
        let outcome = self
            .session
            .advance_frame(&mut self.core, input_for(self.seed, frame))?;
        for event in self.session.events() {
            tracing::info!(player = self.name, ?event, "session event");
        }
        Ok(outcome)
    }
}

fn links(
    transport: Transport,
) -> Result<(Box<dyn NonBlockingStream>, Box<dyn NonBlockingStream>), Box<dyn std::error::Error>> {
    match transport {
        Transport::Memory => {
            let (host, client) = MemoryStream::pair();
            Ok((Box::new(host), Box::new(client)))
        },
        Transport::Tcp => {
            let listener = TcpListener::bind("127.0.0.1:0")?;
            let client =
                TcpNonBlockingStream::connect_timeout(listener.local_addr()?, Duration::from_secs(5))?;
            let host = TcpNonBlockingStream::accept(&listener)?;
            Ok((Box::new(host), Box::new(client)))
        },
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let opt = Opt::parse();

    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(opt.log_level)
            .finish(),
    )?;

    let (host_link, client_link) = links(opt.transport)?;
    let mut host = Player::start("host", Role::Server, 1, opt.sync_frames, host_link)?;
    let mut client = Player::start("client", Role::Client, 2, opt.sync_frames, client_link)?;

    let mut spectator = None;
    if opt.spectate {
        let (feed, view) = MemoryStream::pair();
        host.session.add_spectator(feed)?;
        spectator = Some(Player::start("viewer", Role::Spectator, 0, opt.sync_frames, view)?);
    }

    let mut flip_at = opt.flip_at;
    let mut tick: u32 = 0;
    while host.session.current_frame().as_u32() < opt.frames {
        tick += 1;
        if flip_at == Some(host.session.current_frame().as_u32()) && host.session.is_ready() {
            flip_at = None;
            let frame = host.session.request_flip()?;
            tracing::info!(%frame, "flip requested");
        }
        host.tick()?;
        if tick > opt.lag {
            client.tick()?;
        }
        if let Some(viewer) = spectator.as_mut() {
            viewer.tick()?;
        }
        if opt.transport == Transport::Tcp {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    // let the client catch up so every frame gets confirmed
    while client
        .session
        .current_frame()
        .is_before(host.session.current_frame())
    {
        client.tick()?;
        host.session.poll_remote()?;
    }

    let confirmed = host
        .session
        .confirmed_frame()
        .as_u32()
        .min(client.session.confirmed_frame().as_u32());
    let mut sessions = vec![&client];
    sessions.extend(spectator.as_ref());
    for other in sessions {
        let mismatches = other
            .core
            .checksums
            .iter()
            .filter(|(frame, _)| **frame < confirmed)
            .filter(|(frame, checksum)| host.core.checksums.get(*frame) != Some(*checksum))
            .count();
        tracing::info!(
            session = other.name,
            frames = other.core.checksums.len(),
            mismatches,
            "compared confirmed states with host"
        );
    }
    tracing::info!(
        confirmed,
        host_rollbacks = host.session.rollbacks(),
        client_rollbacks = client.session.rollbacks(),
        positions = ?host.core.positions,
        "done"
    );

    host.session.disconnect()?;
    Ok(())
}
