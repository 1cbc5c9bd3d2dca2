use clap::Parser;

use crate::config::{
    Configuration, FlowConfiguration, NodeConfiguration, PulseConfiguration,
    WorkloadConfiguration, DEFAULT_PULSE_INTERVAL_MS, DEFAULT_PULSE_STEP,
    DEFAULT_REPLY_TIMEOUT_MS, DEFAULT_REQUESTS_PER_PULSE,
};
use crate::epoch::Epoch;

#[derive(Debug, Clone, Parser)]
pub struct InitCmd {
    #[arg(long, default_value = "default")]
    pub node_name: String,
    #[clap(long, default_value_t = Epoch::FIRST.value())]
    pub first_epoch: u32,
    #[clap(long, default_value_t = DEFAULT_REPLY_TIMEOUT_MS)]
    pub reply_timeout_ms: u64,
    #[clap(long, default_value_t = DEFAULT_PULSE_INTERVAL_MS)]
    pub pulse_interval_ms: u64,
    #[clap(long, default_value_t = DEFAULT_PULSE_STEP)]
    pub pulse_step: u32,
    #[clap(long, default_value_t = DEFAULT_REQUESTS_PER_PULSE)]
    pub requests_per_pulse: usize,
}

impl InitCmd {
    pub fn execute(self) -> anyhow::Result<()> {
        if Configuration::try_load_from_home_dir(&self.node_name).is_ok() {
            anyhow::bail!("Configuration file already exists: {}", self.node_name);
        }
        if !Epoch::new(self.first_epoch).is_set() {
            anyhow::bail!("First epoch must be greater than {}", Epoch::NONE);
        }

        let configuration = self.configuration();
        let path = configuration.try_write_home_dir(&self.node_name)?;
        println!("Created node configuration in: {path:?}");
        println!("Configuration: {configuration:?}");
        Ok(())
    }

    fn configuration(&self) -> Configuration {
        Configuration {
            node: NodeConfiguration {
                name: self.node_name.clone(),
                first_epoch: Epoch::new(self.first_epoch),
            },
            flow: FlowConfiguration {
                reply_timeout_ms: self.reply_timeout_ms,
            },
            pulse: PulseConfiguration {
                interval_ms: self.pulse_interval_ms,
                step: self.pulse_step,
            },
            workload: WorkloadConfiguration {
                requests_per_pulse: self.requests_per_pulse,
            },
        }
    }
}
