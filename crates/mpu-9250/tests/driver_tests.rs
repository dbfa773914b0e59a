use std::cell::RefCell;
use std::rc::Rc;

use i2c_async::sim::{settle, ManualClock, SimTransport};
use i2c_async::{Bus, Duration, Event, Instant, StatusCode};
use mpu_9250::ll::{ak, mpu, MPU9250_ADDRESS};
use mpu_9250::sim::{attach, attach_mag_sweep, simulated_mpu9250, SimMpu9250};
use mpu_9250::{
    Error, MagMode, MagScale, Mpu9250, Mpu9250Config, ACCEL_GYRO_CAL_SAMPLES, STANDARD_GRAVITY,
};

type SimBus = Bus<SimTransport, ManualClock>;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

type Slot<R> = Rc<RefCell<Option<(Mpu9250, Result<R, Error>)>>>;

fn slot<R>() -> Slot<R> {
    Rc::new(RefCell::new(None))
}

fn store<R: 'static>(slot: &Slot<R>) -> impl FnOnce(&mut SimBus, Mpu9250, Result<R, Error>) {
    let slot = slot.clone();
    move |_, imu, result| *slot.borrow_mut() = Some((imu, result))
}

fn take<R>(slot: &Slot<R>) -> (Mpu9250, Result<R, Error>) {
    slot.borrow_mut().take().expect("callback did not run")
}

fn make_bus() -> (SimBus, SimMpu9250) {
    let sim = simulated_mpu9250();
    let mut transport = SimTransport::new();
    attach(&mut transport, &sim);
    (Bus::new(transport, ManualClock::new()), sim)
}

fn initialized(bus: &mut SimBus, imu: Mpu9250) -> Mpu9250 {
    let done = slot();
    imu.init_all(bus, store(&done));
    settle(bus);
    let (imu, result) = take(&done);
    result.unwrap();
    imu
}

// ---------------------------------------------------------------------------
// Probe
// ---------------------------------------------------------------------------

#[test]
fn probe_accepts_mpu9250() {
    let (mut bus, _sim) = make_bus();
    let done = slot();

    Mpu9250::default().probe(&mut bus, store(&done));
    settle(&mut bus);

    let (_, result) = take(&done);
    assert_eq!(result, Ok(()));
}

#[test]
fn probe_rejects_wrong_identity() {
    let (mut bus, sim) = make_bus();
    sim.mpu.borrow_mut().set(mpu::WHO_AM_I, 0x70);
    let done = slot();

    Mpu9250::default().probe(&mut bus, store(&done));
    settle(&mut bus);

    let (_, result) = take(&done);
    assert_eq!(result, Err(Error::InvalidWhoAmI(0x70)));
}

#[test]
fn probe_reports_missing_device() {
    let mut bus = Bus::new(SimTransport::new(), ManualClock::new());
    let done = slot();

    Mpu9250::default().probe(&mut bus, store(&done));
    settle(&mut bus);

    let (imu, result) = take(&done);
    assert_eq!(result, Err(Error::Transfer(StatusCode::NoSlave)));
    assert!(!imu.is_initialized());
}

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

#[test]
fn init_writes_mpu_then_magnetometer() {
    let (mut bus, sim) = make_bus();
    let finished_at = Rc::new(RefCell::new(None));

    let f = finished_at.clone();
    Mpu9250::default().init_all(&mut bus, move |bus, imu, result| {
        assert_eq!(result, Ok(()));
        assert!(imu.is_initialized());
        *f.borrow_mut() = Some(bus.now());
    });
    settle(&mut bus);

    assert_eq!(
        sim.mpu.borrow().writes(),
        &[
            (mpu::PWR_MGMT_1, 0x80),
            (mpu::PWR_MGMT_1, 0x00),
            (mpu::PWR_MGMT_1, 0x01),
            (mpu::CONFIG, 0x03),
            (mpu::SMPLRT_DIV, 0x04),
            (mpu::GYRO_CONFIG, 0x00),
            (mpu::ACCEL_CONFIG, 0x00),
            (mpu::ACCEL_CONFIG2, 0x03),
            (mpu::INT_PIN_CFG, 0x22),
            (mpu::INT_ENABLE, 0x01),
        ]
    );
    assert_eq!(
        sim.mag.borrow().writes(),
        &[(ak::CNTL, 0x00), (ak::CNTL, 0x0F), (ak::CNTL, 0x00), (ak::CNTL, 0x16)]
    );
    // Three 100 ms settles on the MPU, four 10 ms on the magnetometer.
    let expected =
        Instant::from_ticks(0) + Duration::from_millis(100) * 3 + Duration::from_millis(10) * 4;
    assert_eq!(*finished_at.borrow(), Some(expected));
}

#[test]
fn init_reads_sensitivity_adjustment() {
    let (mut bus, sim) = make_bus();
    sim.set_mag_adjustment([0x90, 0x80, 0x70]);

    let imu = initialized(&mut bus, Mpu9250::default());
    assert_eq!(imu.mag_adjustment(), [1.0625, 1.0, 0.9375]);
}

#[test]
fn init_is_idempotent() {
    let (mut bus, _sim) = make_bus();
    let imu = initialized(&mut bus, Mpu9250::default());
    let issued = bus.transport().issued().len();

    let imu = initialized(&mut bus, imu);
    assert!(imu.is_initialized());
    assert_eq!(bus.transport().issued().len(), issued);
}

#[test]
fn init_failure_is_reported_and_leaves_device_uninitialized() {
    let (mut bus, _sim) = make_bus();
    bus.transport_mut().fail_next(1, Event::NO_SLAVE);
    let done = slot();

    Mpu9250::default().init_all(&mut bus, store(&done));
    settle(&mut bus);

    let (imu, result) = take(&done);
    assert_eq!(result, Err(Error::Transfer(StatusCode::NoSlave)));
    assert!(!imu.is_initialized());
    assert_eq!(bus.transport().issued().len(), 1);
}

#[test]
fn uses_configured_full_scale() {
    let (mut bus, sim) = make_bus();
    let config = Mpu9250Config {
        accel_scale: mpu_9250::AccelScale::G8,
        gyro_scale: mpu_9250::GyroScale::Dps2000,
        mag_scale: MagScale::Bits14,
        mag_mode: MagMode::Continuous8Hz,
        ..Default::default()
    };

    initialized(&mut bus, Mpu9250::new(config));
    let mpu_regs = sim.mpu.borrow();
    assert_eq!(mpu_regs.get(mpu::GYRO_CONFIG), 0x18);
    assert_eq!(mpu_regs.get(mpu::ACCEL_CONFIG), 0x10);
    assert_eq!(sim.mag.borrow().get(ak::CNTL), 0x02);
}

// ---------------------------------------------------------------------------
// Sampling
// ---------------------------------------------------------------------------

#[test]
fn reads_require_initialization() {
    let (mut bus, _sim) = make_bus();
    let done = slot();

    Mpu9250::default().read_accel_gyro(&mut bus, store(&done));
    settle(&mut bus);

    let (_, result) = take(&done);
    assert_eq!(result.err(), Some(Error::NotInitialized));
    assert!(bus.transport().issued().is_empty());
}

#[test]
fn accel_gyro_are_scaled_to_si_units() {
    let (mut bus, sim) = make_bus();
    let imu = initialized(&mut bus, Mpu9250::default());
    sim.set_motion([0, -8192, 16384], 0, [131, 0, -262]);
    let done = slot();

    imu.read_accel_gyro(&mut bus, store(&done));
    settle(&mut bus);

    let (imu, result) = take(&done);
    let sample = result.unwrap();
    assert!((sample.accel.y + STANDARD_GRAVITY / 2.0).abs() < 1e-3);
    assert!((sample.accel.z - STANDARD_GRAVITY).abs() < 1e-3);
    assert!((sample.gyro.x - 1f32.to_radians()).abs() < 1e-4);
    assert!((sample.gyro.z + 2f32.to_radians()).abs() < 1e-4);
    assert_eq!(imu.gyro(), sample.gyro);

    let last = bus.transport().issued().last().unwrap();
    assert_eq!(last.address, MPU9250_ADDRESS);
}

#[test]
fn magnetometer_is_scaled_to_milligauss() {
    let (mut bus, sim) = make_bus();
    let mut imu = initialized(&mut bus, Mpu9250::default());
    imu.set_mag_bias(10.0, 0.0, 0.0);
    sim.set_mag([1000, -1000, 0], false);
    let done = slot();

    imu.read_mag(&mut bus, store(&done));
    settle(&mut bus);

    let (_, result) = take(&done);
    let mag = result.unwrap();
    let res = MagScale::Bits16.resolution();
    assert!((mag.x - (1000.0 * res - 10.0)).abs() < 1e-3);
    assert!((mag.y + 1000.0 * res).abs() < 1e-3);
    assert_eq!(mag.z, 0.0);
}

#[test]
fn magnetometer_overflow_is_an_error() {
    let (mut bus, sim) = make_bus();
    let imu = initialized(&mut bus, Mpu9250::default());
    sim.set_mag([1, 2, 3], true);
    let done = slot();

    imu.read_mag(&mut bus, store(&done));
    settle(&mut bus);

    let (_, result) = take(&done);
    assert_eq!(result, Err(Error::MagnetometerOverflow));
}

#[test]
fn single_mode_polls_data_ready_first() {
    let (mut bus, sim) = make_bus();
    let config = Mpu9250Config { mag_mode: MagMode::Single, ..Default::default() };
    let imu = initialized(&mut bus, Mpu9250::new(config));
    sim.mag.borrow_mut().set(ak::ST1, 0x00);
    let before = bus.transport().issued().len();
    let done = slot();

    imu.read_mag(&mut bus, store(&done));
    settle(&mut bus);

    // Not ready: only ST1 was read and the previous value comes back.
    let (imu, result) = take(&done);
    assert_eq!(result, Ok(imu.mag()));
    assert_eq!(bus.transport().issued().len(), before + 1);

    sim.set_mag([100, 0, 0], false);
    let done = slot();
    imu.read_mag(&mut bus, store(&done));
    settle(&mut bus);

    let (_, result) = take(&done);
    assert!(result.unwrap().x > 0.0);
    assert_eq!(bus.transport().issued().len(), before + 3);
}

#[test]
fn temperature_reads_two_bytes() {
    let (mut bus, sim) = make_bus();
    let imu = initialized(&mut bus, Mpu9250::default());
    sim.set_motion([0, 0, 0], 3339, [0, 0, 0]);
    let done = slot();

    imu.read_temperature(&mut bus, store(&done));
    settle(&mut bus);

    let (_, result) = take(&done);
    assert!((result.unwrap() - 31.0).abs() < 0.01);
}

#[test]
fn failed_sample_keeps_the_driver() {
    let (mut bus, _sim) = make_bus();
    let imu = initialized(&mut bus, Mpu9250::default());
    bus.transport_mut().fail_next(1, Event::ERROR);
    let done = slot();

    imu.read_accel_gyro(&mut bus, store(&done));
    settle(&mut bus);

    let (imu, result) = take(&done);
    assert_eq!(result.err(), Some(Error::Transfer(StatusCode::Error)));
    assert!(imu.is_initialized());
}

#[test]
fn orientation_stays_level_for_a_still_device() {
    let (mut bus, _sim) = make_bus();
    let mut imu = initialized(&mut bus, Mpu9250::default());

    for step in 0..20u64 {
        let done = slot();
        imu.read_accel_gyro(&mut bus, store(&done));
        settle(&mut bus);
        let (next, _) = take(&done);

        let done = slot();
        next.read_mag(&mut bus, store(&done));
        settle(&mut bus);
        let (next, _) = take(&done);

        imu = next;
        imu.update_orientation(Instant::from_millis(step * 10));
    }

    let q = imu.quaternion();
    let norm = (q.w() * q.w() + q.x() * q.x() + q.y() * q.y() + q.z() * q.z()).sqrt();
    assert!((norm - 1.0).abs() < 1e-3);
}

// ---------------------------------------------------------------------------
// Calibration
// ---------------------------------------------------------------------------

#[test]
fn mag_calibration_takes_centre_and_spread_of_the_sweep() {
    let sim = simulated_mpu9250();
    let mut transport = SimTransport::new();
    let sweep = [[-100, -100, 0], [300, 100, 400], [100, 0, 200], [0, 0, 0]];
    attach_mag_sweep(&mut transport, &sim, sweep);
    let mut bus = Bus::new(transport, ManualClock::new());
    let imu = initialized(&mut bus, Mpu9250::default());
    let started = bus.now();
    let done = slot();

    imu.calibrate_mag(&mut bus, sweep.len(), store(&done));
    settle(&mut bus);

    let (imu, result) = take(&done);
    let cal = result.unwrap();
    let res = MagScale::Bits16.resolution();
    assert!((cal.bias[0] - 100.0 * res).abs() < 1e-3);
    assert_eq!(cal.bias[1], 0.0);
    assert!((cal.bias[2] - 200.0 * res).abs() < 1e-3);
    // Half-ranges 200, 100, 200 stretched to their mean.
    let mean = 500.0 / 3.0;
    assert!((cal.scale[0] - mean / 200.0).abs() < 1e-5);
    assert!((cal.scale[1] - mean / 100.0).abs() < 1e-5);
    assert!((cal.scale[2] - mean / 200.0).abs() < 1e-5);

    assert_eq!(imu.config().mag_bias, cal.bias);
    assert_eq!(imu.config().mag_scale_factors, cal.scale);
    // Continuous 100 Hz: one fresh sample every 12 ms, no mode writes.
    assert_eq!(bus.now(), started + Duration::from_millis(12) * 3);
    assert_eq!(sim.mag.borrow().writes().len(), 4);
}

#[test]
fn mag_calibration_is_applied_to_later_samples() {
    let sim = simulated_mpu9250();
    let mut transport = SimTransport::new();
    attach_mag_sweep(&mut transport, &sim, [[-200, -200, -200], [200, 200, 200], [200, 200, 200]]);
    let mut bus = Bus::new(transport, ManualClock::new());
    let imu = initialized(&mut bus, Mpu9250::default());
    let done = slot();

    imu.calibrate_mag(&mut bus, 2, store(&done));
    settle(&mut bus);
    let (imu, result) = take(&done);
    assert_eq!(result.unwrap().scale, [1.0; 3]);

    // The sweep was centred on zero, so the held 200 counts read unchanged.
    let done = slot();
    imu.read_mag(&mut bus, store(&done));
    settle(&mut bus);
    let (_, result) = take(&done);
    let mag = result.unwrap();
    assert!((mag.x - 200.0 * MagScale::Bits16.resolution()).abs() < 1e-3);
}

#[test]
fn single_mode_mag_calibration_triggers_each_measurement() {
    let (mut bus, sim) = make_bus();
    let config = Mpu9250Config { mag_mode: MagMode::Single, ..Default::default() };
    let imu = initialized(&mut bus, Mpu9250::new(config));
    let writes = sim.mag.borrow().writes().len();
    let done = slot();

    imu.calibrate_mag(&mut bus, 3, store(&done));
    settle(&mut bus);

    let (_, result) = take(&done);
    assert!(result.is_ok());
    let mag_regs = sim.mag.borrow();
    assert_eq!(mag_regs.writes().len(), writes + 3);
    assert_eq!(mag_regs.writes().last(), Some(&(ak::CNTL, 0x11)));
}

#[test]
fn overflowed_sweep_gives_no_calibration() {
    let (mut bus, sim) = make_bus();
    let imu = initialized(&mut bus, Mpu9250::default());
    sim.set_mag([5000, 0, 0], true);
    let done = slot();

    imu.calibrate_mag(&mut bus, 3, store(&done));
    settle(&mut bus);

    let (imu, result) = take(&done);
    assert_eq!(result, Err(Error::NoCalibrationData));
    assert_eq!(imu.config().mag_scale_factors, [1.0; 3]);
}

#[test]
fn failed_calibration_read_leaves_config_alone() {
    let (mut bus, _sim) = make_bus();
    let imu = initialized(&mut bus, Mpu9250::default());
    bus.transport_mut().fail_next(1, Event::ERROR);
    let done = slot();

    imu.calibrate_mag(&mut bus, 4, store(&done));
    settle(&mut bus);

    let (imu, result) = take(&done);
    assert_eq!(result, Err(Error::Transfer(StatusCode::Error)));
    assert_eq!(imu.config().mag_bias, [0.0; 3]);
    assert_eq!(imu.config().mag_scale_factors, [1.0; 3]);
    assert!(imu.is_initialized());
}

#[test]
fn calibration_requires_initialization() {
    let (mut bus, _sim) = make_bus();
    let done = slot();

    Mpu9250::default().calibrate_mag(&mut bus, 4, store(&done));
    settle(&mut bus);

    let (_, result) = take(&done);
    assert_eq!(result, Err(Error::NotInitialized));
    assert!(bus.transport().issued().is_empty());
}

#[test]
fn accel_gyro_calibration_zeroes_a_still_device() {
    let (mut bus, sim) = make_bus();
    let imu = initialized(&mut bus, Mpu9250::default());
    sim.set_motion([100, -50, 16384 + 200], 0, [131, -262, 0]);
    let issued = bus.transport().issued().len();
    let done = slot();

    imu.calibrate_accel_gyro(&mut bus, ACCEL_GYRO_CAL_SAMPLES, store(&done));
    settle(&mut bus);

    let (imu, result) = take(&done);
    let bias = result.unwrap();
    assert!((bias.accel[2] - 200.0 / 16384.0).abs() < 1e-6);
    assert!((bias.gyro[0] - 1.0).abs() < 1e-2);
    assert_eq!(imu.config().accel_bias, bias.accel);
    assert_eq!(imu.config().gyro_bias, bias.gyro);
    assert_eq!(bus.transport().issued().len(), issued + ACCEL_GYRO_CAL_SAMPLES);

    let done = slot();
    imu.read_accel_gyro(&mut bus, store(&done));
    settle(&mut bus);
    let (_, result) = take(&done);
    let sample = result.unwrap();
    assert!(sample.accel.x.abs() < 1e-3);
    assert!(sample.accel.y.abs() < 1e-3);
    assert!((sample.accel.z - STANDARD_GRAVITY).abs() < 1e-3);
    assert!(sample.gyro.x.abs() < 1e-6);
    assert!(sample.gyro.y.abs() < 1e-6);
}
