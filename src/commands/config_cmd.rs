use clap::{Args, Subcommand};

use super::OutputFormat;
use sitesync::Config;

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl ConfigCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(config)?);
                    }
                    OutputFormat::Text => {
                        println!("Configuration");
                        println!("=============\n");

                        if let Some(path) = &config.config_file {
                            println!("Config file: {}", path.display());
                        } else {
                            println!(
                                "Config file: {} (not found)",
                                Config::default_config_path().display()
                            );
                        }
                        println!();

                        println!(
                            "database_path: {}",
                            config.database_path.value.display()
                        );
                        println!("  source: {}", config.database_path.source);
                        println!();

                        println!("server_url: {}", config.server_url.value);
                        println!("  source: {}", config.server_url.source);
                        println!();

                        println!("app_name: {}", config.app_name.value);
                        println!("  source: {}", config.app_name.source);
                        println!();

                        println!("client_id: {}", config.client_id.value);
                        println!("  source: {}", config.client_id.source);
                        println!();

                        let sync = &config.sync;
                        println!("sync:");
                        println!(
                            "  api_key: {}",
                            if sync.api_key.is_some() { "(set)" } else { "(none)" }
                        );
                        println!("  auto_sync: {}", sync.auto_sync);
                        println!("  refresh_interval_secs: {}", sync.refresh_interval_secs);
                        println!("  request_timeout_secs: {}", sync.request_timeout_secs);
                        println!("  max_attempts: {}", sync.max_attempts);
                    }
                }
                Ok(())
            }
        }
    }
}
