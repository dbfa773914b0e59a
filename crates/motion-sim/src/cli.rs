use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run the MPU-9250 sampling loop against a simulated I2C bus")]
pub struct Cli {
    /// Number of samples to take before exiting
    #[arg(short, long, default_value_t = 10)]
    pub samples: usize,

    /// Time between samples, in milliseconds
    #[arg(long, default_value_t = 200)]
    pub period_ms: u64,

    /// Fail this many transfers before the device answers
    #[arg(long, default_value_t = 0)]
    pub probe_failures: usize,

    /// Back-off before a failed probe is retried, in milliseconds
    #[arg(long, default_value_t = 100)]
    pub retry_ms: u64,

    /// Magnetometer hard-iron bias in mG: north east down
    #[arg(long, num_args = 3, allow_negative_numbers = true)]
    pub mag_bias: Option<Vec<f32>>,

    /// Measure accelerometer and gyroscope offsets before sampling
    #[arg(long)]
    pub calibrate: bool,
}
