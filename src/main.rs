//! Demo binary: a small layout with a ring, a switch spur and one
//! locomotive, driven either by stepping the control logic directly or by
//! the real threaded control loops.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use rand::Rng;

use rail_control::hardware::{ControlUnit, MockControlUnit};
use rail_control::model::{
    Direction, ModelConfig, Position, Railway, ScopeId, SegmentId,
};
use rail_control::store::MemoryStore;

#[derive(Parser)]
#[command(author, version, about = "Model railway control demo")]
struct Cli {
    /// Number of control steps to run
    #[arg(long, default_value_t = 300)]
    ticks: u32,

    /// Control step length in milliseconds
    #[arg(long, default_value_t = 100)]
    tick_millis: u64,

    /// Drive the trains with real threaded control loops instead of
    /// deterministic stepping
    #[arg(long, default_value_t = false)]
    threaded: bool,
}

struct Demo {
    railway: Railway,
    control: Arc<MockControlUnit>,
    scope: ScopeId,
    switch: SegmentId,
    address: u16,
}

/// A ring of five tracks with a switch spur ending at a bumper, one
/// balise on the ring and one locomotive.
fn build_demo() -> Result<Demo> {
    let control = Arc::new(MockControlUnit::new());
    let railway = Railway::new(
        ModelConfig::default(),
        control.clone(),
        Arc::new(MemoryStore::new()),
    );
    let net = railway.network().clone();

    let ring: Vec<_> = (0..5).map(|_| net.add_node()).collect();
    let mut tracks = Vec::new();
    for i in 0..4 {
        tracks.push(net.add_track(ring[i], ring[i + 1], 1.0, 50.0)?);
    }
    // Closing the ring through a switch whose other branch runs onto a
    // short bumper spur.
    let spur_node = net.add_node();
    let switch = net.add_switch(ring[4], ring[0], spur_node, 1.0, 0.4, 50.0, 20.0)?;
    net.add_bumper(spur_node, 0.2, 10.0)?;

    let start_edge = net.segment(tracks[0])?.current_edge();
    let start = Position::new(&net, start_edge, 0.5)?;
    let address = 185;
    let scope = railway.spawn_locomotive("br185", 0.1, 160.0, start, Direction::Positive, address)?;

    let balise_edge = net.segment(tracks[2])?.current_edge();
    railway.add_balise(7, Position::new(&net, balise_edge, 0.5)?);

    Ok(Demo {
        railway,
        control,
        scope,
        switch,
        address,
    })
}

fn run_stepped(demo: &Demo, ticks: u32, tick_millis: u64) -> Result<()> {
    let net = demo.railway.network().clone();
    let scope = demo.railway.scope(demo.scope)?;
    let dt = tick_millis as f64 / 1000.0;
    let mut rng = rand::rng();
    for tick in 0..ticks {
        let speed = scope
            .tick(&net, demo.control.as_ref(), dt)
            .context("control step failed")?;

        // Pretend the decoder confirms the commanded level and a trackside
        // sensor measures the resulting speed with some noise.
        let level = demo.control.speed(demo.address)?;
        demo.railway.apply_speed_feedback(demo.address, level)?;
        if level > 0 {
            let measured = speed * rng.random_range(0.95..1.05);
            demo.railway
                .record_speed_measurement(demo.address, level, measured)?;
        }

        if tick % 10 == 0 {
            let front = scope.front();
            info!(
                "tick {:3}: speed {:.4} m/s, front at {:?}+{:.4}",
                tick, speed, front.position.edge, front.position.offset
            );
        }
    }
    Ok(())
}

fn run_threaded(demo: &Demo, ticks: u32, tick_millis: u64) -> Result<()> {
    demo.railway.start_all()?;
    let total = Duration::from_millis(tick_millis * ticks as u64);
    let report = Duration::from_secs(1);
    let mut elapsed = Duration::ZERO;
    while elapsed < total {
        thread::sleep(report.min(total - elapsed));
        elapsed += report;
        demo.railway.print_summary();
    }
    demo.railway.stop_all();
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let demo = build_demo().context("failed to build demo layout")?;
    info!(
        "layout ready, switch {:?} set to {:?}",
        demo.switch,
        demo.railway.network().switch_state(demo.switch)?
    );

    if cli.threaded {
        run_threaded(&demo, cli.ticks, cli.tick_millis)?;
    } else {
        run_stepped(&demo, cli.ticks, cli.tick_millis)?;
    }

    let scope = demo.railway.scope(demo.scope)?;
    info!(
        "done: final speed {:.4} m/s, scope consistent: {}",
        scope.current_speed(),
        scope.check_valid(demo.railway.network())
    );
    Ok(())
}
