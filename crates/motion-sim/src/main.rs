mod app;
mod cli;
mod clock;

use std::rc::Rc;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use i2c_async::sim::SimTransport;
use i2c_async::{Bus, Duration, Event};
use mpu_9250::sim::{attach, simulated_mpu9250};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::app::Session;
use crate::cli::Cli;
use crate::clock::{to_std, StdClock};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let sim = simulated_mpu9250();
    let mut transport = SimTransport::new();
    attach(&mut transport, &sim);
    transport.fail_next(cli.probe_failures, Event::NO_SLAVE);

    let mut session = Session::new(
        sim,
        cli.samples,
        Duration::from_millis(cli.period_ms),
        Duration::from_millis(cli.retry_ms),
    );
    if let Some(bias) = &cli.mag_bias {
        let bias: [f32; 3] = bias
            .as_slice()
            .try_into()
            .context("--mag-bias takes north, east and down")?;
        session = session.with_mag_bias(bias);
    }
    if cli.calibrate {
        session = session.with_calibration();
    }
    let session = Rc::new(session);

    let mut bus = Bus::new(transport, StdClock::new());
    app::start(&mut bus, session.clone());
    run(&mut bus, &session);

    if let Some(err) = session.failure() {
        return Err(anyhow!("MPU-9250 session failed: {err}"));
    }
    info!(samples = session.taken(), elapsed_ms = bus.now().as_millis(), "done");
    Ok(())
}

/// Dispatch until the session ends, sleeping up to the next wakeup whenever a
/// cycle runs no callbacks.
fn run(bus: &mut Bus<SimTransport, StdClock>, session: &Session) {
    while !session.is_finished() {
        if bus.poll() > 0 {
            continue;
        }
        let Some(wakeup) = bus.next_wakeup() else {
            break;
        };
        let now = bus.now();
        if wakeup > now {
            std::thread::sleep(to_std(wakeup - now));
        }
    }
}
