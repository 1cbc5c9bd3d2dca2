pub use configuration::{
    Configuration, ConfigurationError, FlowConfiguration, NodeConfiguration, PulseConfiguration,
    WorkloadConfiguration,
};

pub mod configuration;

//flow settings
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 3000;

//pulse settings
pub const DEFAULT_PULSE_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_PULSE_STEP: u32 = 10;

//workload settings
pub const DEFAULT_REQUESTS_PER_PULSE: usize = 0;

pub const CONFIG_FILE_NAME: &str = "pulseflow.toml";
pub const ROOT_DIR_NAME: &str = ".pulseflow";
