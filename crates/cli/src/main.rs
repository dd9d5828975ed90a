use clap::Parser;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(
    name = "margin",
    about = "LMS launch and grading bridge for web annotation",
    version
)]
struct Cli {
    /// Path to configuration file
    #[arg(long, default_value = "margin.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Create the data directory, configuration, master key and signing key
    Init {
        /// Data directory path
        #[arg(long, default_value = "/var/lib/margin")]
        data_dir: String,
        /// Externally reachable base URL of this service
        #[arg(long)]
        public_url: Option<String>,
    },
    /// Show tenants and stored records
    Status,
    /// Serve LTI launches and the frontend API
    Serve {
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        /// Port to listen on
        #[arg(long, default_value = "8000")]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init {
            data_dir,
            public_url,
        } => {
            commands::init::run(&data_dir, public_url.as_deref()).await?;
        }
        Commands::Status => {
            commands::status::run(&cli.config).await?;
        }
        Commands::Serve { bind, port } => {
            commands::serve::run(&cli.config, &bind, port).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn cli_parse_init_defaults() {
        let cli = Cli::parse_from(["margin", "init"]);
        assert_eq!(cli.config, "margin.toml");
        match cli.command {
            Commands::Init {
                data_dir,
                public_url,
            } => {
                assert_eq!(data_dir, "/var/lib/margin");
                assert!(public_url.is_none());
            }
            _ => panic!("expected Init command"),
        }
    }

    #[test]
    fn cli_parse_init_custom() {
        let cli = Cli::parse_from([
            "margin",
            "--config",
            "/etc/margin.toml",
            "init",
            "--data-dir",
            "/opt/margin",
            "--public-url",
            "https://margin.example.edu",
        ]);
        assert_eq!(cli.config, "/etc/margin.toml");
        match cli.command {
            Commands::Init {
                data_dir,
                public_url,
            } => {
                assert_eq!(data_dir, "/opt/margin");
                assert_eq!(public_url.as_deref(), Some("https://margin.example.edu"));
            }
            _ => panic!("expected Init command"),
        }
    }

    #[test]
    fn cli_parse_status() {
        let cli = Cli::parse_from(["margin", "status"]);
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    fn cli_parse_serve_defaults() {
        let cli = Cli::parse_from(["margin", "serve"]);
        match cli.command {
            Commands::Serve { bind, port } => {
                assert_eq!(bind, "0.0.0.0");
                assert_eq!(port, 8000);
            }
            _ => panic!("expected Serve command"),
        }
    }

    #[test]
    fn cli_parse_serve_custom() {
        let cli = Cli::parse_from(["margin", "serve", "--bind", "127.0.0.1", "--port", "3000"]);
        match cli.command {
            Commands::Serve { bind, port } => {
                assert_eq!(bind, "127.0.0.1");
                assert_eq!(port, 3000);
            }
            _ => panic!("expected Serve command"),
        }
    }
}
