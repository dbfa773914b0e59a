use std::cell::Cell;
use std::rc::Rc;

use i2c_async::sim::SimTransport;
use i2c_async::{Bus, Clock, Duration};
use mpu_9250::sim::SimMpu9250;
use mpu_9250::{Error, Mpu9250, ACCEL_GYRO_CAL_SAMPLES};
use tracing::{debug, error, info, warn};

/// Shared state of one sampling run.
pub struct Session {
    samples: usize,
    period: Duration,
    retry: Duration,
    mag_bias: Option<[f32; 3]>,
    calibrate: bool,
    sim: SimMpu9250,
    taken: Cell<usize>,
    probes: Cell<usize>,
    failure: Cell<Option<Error>>,
    last_mag: Cell<[f32; 3]>,
    finished: Cell<bool>,
}

impl Session {
    pub fn new(sim: SimMpu9250, samples: usize, period: Duration, retry: Duration) -> Self {
        Self {
            samples,
            period,
            retry,
            mag_bias: None,
            calibrate: false,
            sim,
            taken: Cell::new(0),
            probes: Cell::new(0),
            failure: Cell::new(None),
            last_mag: Cell::new([0.0; 3]),
            finished: Cell::new(false),
        }
    }

    pub fn with_mag_bias(mut self, bias: [f32; 3]) -> Self {
        self.mag_bias = Some(bias);
        self
    }

    pub fn with_calibration(mut self) -> Self {
        self.calibrate = true;
        self
    }

    pub fn taken(&self) -> usize {
        self.taken.get()
    }

    pub fn probes(&self) -> usize {
        self.probes.get()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.get()
    }

    pub fn failure(&self) -> Option<Error> {
        self.failure.get()
    }

    /// Magnetometer reading of the latest sample, in mG.
    pub fn last_mag(&self) -> [f32; 3] {
        self.last_mag.get()
    }

    fn finish(&self, failure: Option<Error>) {
        self.failure.set(failure);
        self.finished.set(true);
    }
}

type SimBus<C> = Bus<SimTransport, C>;

/// Queue the first probe. Everything after that runs from bus callbacks.
pub fn start<C: Clock + 'static>(bus: &mut SimBus<C>, session: Rc<Session>) {
    bus.post(move |bus| probe(bus, Mpu9250::default(), session));
}

fn probe<C: Clock + 'static>(bus: &mut SimBus<C>, imu: Mpu9250, session: Rc<Session>) {
    session.probes.set(session.probes.get() + 1);
    imu.probe(bus, move |bus, mut imu, result| match result {
        Ok(()) => {
            info!(attempts = session.probes(), "MPU-9250 detected");
            if let Some([north, east, down]) = session.mag_bias {
                imu.set_mag_bias(north, east, down);
            }
            init(bus, imu, session);
        }
        Err(err) => {
            warn!(%err, retry_ms = session.retry.as_millis(), "probe failed");
            let retry = session.retry;
            bus.post_after(retry, move |bus| probe(bus, imu, session));
        }
    });
}

fn init<C: Clock + 'static>(bus: &mut SimBus<C>, imu: Mpu9250, session: Rc<Session>) {
    imu.init_all(bus, move |bus, imu, result| match result {
        Ok(()) => {
            let adj = imu.mag_adjustment();
            info!(?adj, "initialized");
            if session.calibrate {
                calibrate(bus, imu, session);
            } else {
                bus.post(move |bus| sample(bus, imu, session));
            }
        }
        Err(err) => {
            error!(%err, "initialization failed");
            session.finish(Some(err));
        }
    });
}

fn calibrate<C: Clock + 'static>(bus: &mut SimBus<C>, imu: Mpu9250, session: Rc<Session>) {
    imu.calibrate_accel_gyro(bus, ACCEL_GYRO_CAL_SAMPLES, move |bus, imu, result| {
        match result {
            Ok(bias) => info!(accel = ?bias.accel, gyro = ?bias.gyro, "calibrated"),
            // Sampling still works on the uncorrected readings.
            Err(err) => warn!(%err, "calibration failed"),
        }
        sample(bus, imu, session);
    });
}

fn sample<C: Clock + 'static>(bus: &mut SimBus<C>, imu: Mpu9250, session: Rc<Session>) {
    if session.taken() >= session.samples {
        session.finish(None);
        return;
    }
    animate(&session.sim, session.taken());

    imu.read_accel_gyro(bus, move |bus, imu, result| {
        if let Err(err) = result {
            warn!(%err, "accel/gyro read failed");
            return reschedule(bus, imu, session);
        }
        imu.read_mag(bus, move |bus, mut imu, result| {
            if let Err(err) = result {
                warn!(%err, "magnetometer read failed");
                return reschedule(bus, imu, session);
            }
            let q = imu.update_orientation(bus.now());
            let (a, g, m) = (imu.accel(), imu.gyro(), imu.mag());
            let n = session.taken.get() + 1;
            session.taken.set(n);
            session.last_mag.set([m.x, m.y, m.z]);
            info!(
                n,
                accel = ?[a.x, a.y, a.z],
                gyro = ?[g.x, g.y, g.z],
                mag = ?[m.x, m.y, m.z],
                q = ?[q.w(), q.x(), q.y(), q.z()],
                "sample"
            );
            reschedule(bus, imu, session);
        });
    });
}

fn reschedule<C: Clock + 'static>(bus: &mut SimBus<C>, imu: Mpu9250, session: Rc<Session>) {
    let period = session.period;
    debug!(period_ms = period.as_millis(), "next sample");
    bus.post_after(period, move |bus| sample(bus, imu, session));
}

/// Rock the simulated board about its x axis.
fn animate(sim: &SimMpu9250, step: usize) {
    let phase = step as f32 * 0.3;
    let tilt = (phase.sin() * 2000.0) as i16;
    let rate = (phase.cos() * 300.0) as i16;
    sim.set_motion([0, tilt, 16384], 0, [rate, 0, 0]);
    sim.set_mag([200, (phase.sin() * 40.0) as i16, 300], false);
}

#[cfg(test)]
mod tests {
    use i2c_async::sim::{settle, ManualClock};
    use i2c_async::{Event, Instant, StatusCode};
    use mpu_9250::ll::AK8963_ADDRESS;
    use mpu_9250::sim::{attach, simulated_mpu9250};
    use mpu_9250::MagScale;

    use super::*;

    fn make_bus(probe_failures: usize) -> (SimBus<ManualClock>, SimMpu9250) {
        let sim = simulated_mpu9250();
        let mut transport = SimTransport::new();
        attach(&mut transport, &sim);
        transport.fail_next(probe_failures, Event::NO_SLAVE);
        (Bus::new(transport, ManualClock::new()), sim)
    }

    #[test]
    fn takes_requested_samples_then_finishes() {
        let (mut bus, sim) = make_bus(0);
        let session = Rc::new(Session::new(
            sim,
            5,
            Duration::from_millis(200),
            Duration::from_millis(100),
        ));

        start(&mut bus, session.clone());
        settle(&mut bus);

        assert!(session.is_finished());
        assert_eq!(session.failure(), None);
        assert_eq!(session.taken(), 5);
        assert_eq!(session.probes(), 1);
        assert!(bus.is_idle());
    }

    #[test]
    fn failed_probes_are_retried_after_back_off() {
        let (mut bus, sim) = make_bus(3);
        let session = Rc::new(Session::new(
            sim,
            1,
            Duration::from_millis(200),
            Duration::from_millis(100),
        ));

        start(&mut bus, session.clone());
        settle(&mut bus);

        assert_eq!(session.probes(), 4);
        assert_eq!(session.taken(), 1);
        // Three back-offs plus the 340 ms init settle.
        assert!(bus.now() >= Instant::from_millis(640));
    }

    #[test]
    fn init_failure_ends_the_run() {
        let (mut bus, sim) = make_bus(0);
        let session = Rc::new(Session::new(
            sim,
            3,
            Duration::from_millis(200),
            Duration::from_millis(100),
        ));

        // The MPU answers the probe but the magnetometer never does.
        bus.transport_mut().detach(AK8963_ADDRESS);
        start(&mut bus, session.clone());
        settle(&mut bus);

        assert!(session.is_finished());
        assert_eq!(session.failure(), Some(Error::Transfer(StatusCode::NoSlave)));
        assert_eq!(session.probes(), 1);
        assert_eq!(session.taken(), 0);
    }

    #[test]
    fn calibration_runs_before_sampling() {
        let (mut bus, sim) = make_bus(0);
        let session = Rc::new(
            Session::new(sim.clone(), 1, Duration::from_millis(10), Duration::from_millis(10))
                .with_calibration(),
        );
        // Gyro offset for the calibration to find.
        sim.set_motion([0, 0, 16384], 0, [262, 0, 0]);

        start(&mut bus, session.clone());
        settle(&mut bus);

        assert_eq!(session.taken(), 1);
        assert_eq!(session.failure(), None);
        let motion_reads = bus
            .transport()
            .issued()
            .iter()
            .filter(|transfer| transfer.address == mpu_9250::ll::MPU9250_ADDRESS)
            .count();
        assert!(motion_reads > ACCEL_GYRO_CAL_SAMPLES);
    }

    #[test]
    fn configured_bias_reaches_the_driver() {
        let (mut bus, sim) = make_bus(0);
        let session = Rc::new(
            Session::new(sim, 1, Duration::from_millis(10), Duration::from_millis(10))
                .with_mag_bias([1000.0, 0.0, 0.0]),
        );

        start(&mut bus, session.clone());
        settle(&mut bus);

        // First sample sees raw x = 200 with unit sensitivity adjustment.
        let expected = 200.0 * MagScale::Bits16.resolution() - 1000.0;
        assert_eq!(session.taken(), 1);
        assert!((session.last_mag()[0] - expected).abs() < 1e-2);
    }
}
