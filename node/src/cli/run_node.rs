use std::path::PathBuf;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};

use crate::config::Configuration;
use crate::logging::pretty_json;
use crate::node::Node;

#[derive(Debug, Clone, Parser)]
pub struct RunNodeCmd {
    #[clap(short, long)]
    pub config_file: String,
}

impl RunNodeCmd {
    pub async fn execute(&self) -> anyhow::Result<()> {
        let conf = match Configuration::try_load(PathBuf::from(self.config_file.as_str())) {
            Ok(conf) => conf,
            Err(err) => anyhow::bail!("Error loading configuration file: {err:?}"),
        };
        log::info!("Configuration: {}", pretty_json(&conf));

        let node = Node::new(conf)?;
        let node_shutdown = node.handle().shutdown;
        let node_task = tokio::spawn(node.run());

        let mut stream_int = signal(SignalKind::interrupt())?;
        let mut stream_term = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = stream_int.recv() => {
                log::info!("Received SIGINT");
            }
            _ = stream_term.recv() => {
                log::info!("Received SIGTERM");
            }
        }

        //Wait node to stop
        node_shutdown.shutdown();
        node_task.await?;
        Ok(())
    }
}
