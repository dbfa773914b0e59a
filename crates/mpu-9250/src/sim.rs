//! Register-level MPU-9250 model for the simulated bus.

use alloc::collections::VecDeque;
use alloc::rc::Rc;
use core::cell::RefCell;

use i2c_async::sim::{RegisterFile, SimDevice, SimTransport};

use crate::ll::{ak, mpu, Status1, Status2, AK8963_ADDRESS, AK8963_ID, MPU9250_ADDRESS, MPU9250_ID};

/// Shared handles to the two register files on the bus.
#[derive(Clone)]
pub struct SimMpu9250 {
    pub mpu: Rc<RefCell<RegisterFile>>,
    pub mag: Rc<RefCell<RegisterFile>>,
}

impl SimMpu9250 {
    /// Load raw accelerometer, temperature and gyroscope registers.
    pub fn set_motion(&self, accel: [i16; 3], temp: i16, gyro: [i16; 3]) {
        let mut bytes = [0u8; mpu::ACCEL_GYRO_LEN];
        let words = accel.into_iter().chain([temp]).chain(gyro);
        for (chunk, word) in bytes.chunks_exact_mut(2).zip(words) {
            chunk.copy_from_slice(&word.to_be_bytes());
        }
        self.mpu.borrow_mut().load(mpu::ACCEL_XOUT_H, &bytes);
    }

    /// Load raw magnetometer registers and mark the sample ready.
    pub fn set_mag(&self, field: [i16; 3], overflow: bool) {
        load_mag(&mut self.mag.borrow_mut(), field, overflow);
    }

    /// Set the AK8963 fuse ROM sensitivity adjustment bytes.
    pub fn set_mag_adjustment(&self, asa: [u8; 3]) {
        self.mag.borrow_mut().load(ak::ASAX, &asa);
    }
}

fn load_mag(regs: &mut RegisterFile, field: [i16; 3], overflow: bool) {
    let mut bytes = [0u8; ak::MAG_LEN];
    for (chunk, word) in bytes.chunks_exact_mut(2).zip(field) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    let mut st2 = Status2::BITM;
    st2.set(Status2::HOFL, overflow);
    bytes[6] = st2.bits();

    regs.set(ak::ST1, Status1::DRDY.bits());
    regs.load(ak::XOUT_L, &bytes);
}

/// AK8963 whose field moves to the next queued value on every data read,
/// as if the board were being turned. Holds the last value once the queue
/// runs dry.
pub struct MagSweep {
    regs: Rc<RefCell<RegisterFile>>,
    fields: VecDeque<[i16; 3]>,
    selected: u8,
}

impl MagSweep {
    pub fn new(
        regs: Rc<RefCell<RegisterFile>>,
        fields: impl IntoIterator<Item = [i16; 3]>,
    ) -> Self {
        Self { regs, fields: fields.into_iter().collect(), selected: 0 }
    }
}

impl SimDevice for MagSweep {
    fn write(&mut self, bytes: &[u8]) {
        if let Some(&register) = bytes.first() {
            self.selected = register;
        }
        self.regs.write(bytes);
    }

    fn read(&mut self, buf: &mut [u8]) {
        if self.selected == ak::XOUT_L {
            if let Some(field) = self.fields.pop_front() {
                load_mag(&mut self.regs.borrow_mut(), field, false);
            }
        }
        self.regs.read(buf);
    }
}

/// A level, still MPU-9250 with the magnetometer pointing north and down.
pub fn simulated_mpu9250() -> SimMpu9250 {
    let sim = SimMpu9250 {
        mpu: Rc::new(RefCell::new(RegisterFile::new().preload(mpu::WHO_AM_I, &[MPU9250_ID]))),
        mag: Rc::new(RefCell::new(RegisterFile::new().preload(ak::WIA, &[AK8963_ID]))),
    };
    // 1 g on z at the default 2 g range.
    sim.set_motion([0, 0, 16384], 0, [0, 0, 0]);
    sim.set_mag([200, 0, 300], false);
    sim.set_mag_adjustment([128; 3]);
    sim
}

/// Attach `sim` to `transport` at the usual addresses.
pub fn attach(transport: &mut SimTransport, sim: &SimMpu9250) {
    transport.attach(MPU9250_ADDRESS, sim.mpu.clone());
    transport.attach(AK8963_ADDRESS, sim.mag.clone());
}

/// Like [`attach`], but the magnetometer steps through `fields`.
pub fn attach_mag_sweep(
    transport: &mut SimTransport,
    sim: &SimMpu9250,
    fields: impl IntoIterator<Item = [i16; 3]>,
) {
    transport.attach(MPU9250_ADDRESS, sim.mpu.clone());
    transport.attach(AK8963_ADDRESS, MagSweep::new(sim.mag.clone(), fields));
}
