pub mod daemon;
pub mod jobs;

use clap::{Parser, Subcommand};
use serde_json::Value;

use crate::models::OptionSet;

/// Download Job Runner - batch downloads run by an external downloader
#[derive(Parser, Debug)]
#[command(
    name = "djr",
    version,
    about = "Download Job Runner - batch downloads run by an external downloader"
)]
pub struct Cli {
    /// Server host
    #[arg(long, default_value = "127.0.0.1", global = true)]
    pub host: String,

    /// Server port
    #[arg(long, default_value_t = 8390, global = true)]
    pub port: u16,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the server in the foreground
    Serve {
        /// Path to configuration file
        #[arg(short = 'c', long = "config")]
        config: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(short = 'p', long = "listen-port")]
        listen_port: Option<u16>,

        /// Data directory path
        #[arg(long = "data-dir")]
        data_dir: Option<String>,

        /// Keep jobs in memory only
        #[arg(long)]
        ephemeral: bool,
    },

    /// Show server status
    Status,

    /// Submit a batch of URLs
    Submit {
        /// URLs to download
        #[arg(required = true)]
        urls: Vec<String>,

        /// Downloader option (ID=VALUE, or ID alone for a flag)
        #[arg(short = 'o', long = "opt", value_name = "ID=VALUE")]
        opt: Vec<String>,

        /// Follow the output of the started jobs
        #[arg(long)]
        follow: bool,
    },

    /// List jobs
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a job and its captured output
    Show {
        /// Job ID
        job: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete a job, cancelling it first if it is running
    Delete {
        /// Job ID
        job: String,
    },

    /// Cancel a running job
    Cancel {
        /// Job ID
        job: String,
    },

    /// Stream a job's output until it finishes
    Watch {
        /// Job ID
        job: String,
    },
}

/// Build the base URL for the server HTTP API.
pub fn base_url(host: &str, port: u16) -> String {
    format!("http://{}:{}", host, port)
}

/// Parse `--opt` arguments into an ordered option set.
///
/// `ID=VALUE` takes the value as JSON when it parses (`retries=3`,
/// `quiet=false`) and as a plain string otherwise. A bare `ID` sets a flag.
pub fn parse_option_args(opt_args: &[String]) -> Result<OptionSet, String> {
    let mut options = OptionSet::new();
    for arg in opt_args {
        let (id, value) = match arg.split_once('=') {
            Some((id, raw)) => {
                let value = serde_json::from_str::<Value>(raw)
                    .unwrap_or_else(|_| Value::String(raw.to_string()));
                (id, value)
            }
            None => (arg.as_str(), Value::Bool(true)),
        };
        if id.trim().is_empty() {
            return Err(format!("Invalid option: '{}'. Expected ID=VALUE", arg));
        }
        options.set(id.trim(), value);
    }
    Ok(options)
}

/// Format a connection error message for when the server is not reachable.
pub fn connection_error_message(host: &str, port: u16) -> String {
    format!(
        "Could not connect to server at {}:{}. Is it running? (try: djr serve)",
        host, port
    )
}

/// Dispatch the CLI command to the appropriate handler.
pub async fn dispatch(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Some(Commands::Serve {
            config,
            listen_port,
            data_dir,
            ephemeral,
        }) => {
            daemon::cmd_serve(
                &cli.host,
                config.as_deref(),
                *listen_port,
                data_dir.as_deref(),
                *ephemeral,
                cli.verbose,
            )
            .await
        }
        Some(Commands::Status) => daemon::cmd_status(&cli.host, cli.port, cli.verbose).await,
        Some(Commands::Submit { urls, opt, follow }) => {
            let options = parse_option_args(opt).map_err(|e| anyhow::anyhow!(e))?;
            jobs::cmd_submit(&cli.host, cli.port, urls, &options, *follow).await
        }
        Some(Commands::List { json }) => jobs::cmd_list(&cli.host, cli.port, *json).await,
        Some(Commands::Show { job, json }) => {
            jobs::cmd_show(&cli.host, cli.port, job, *json).await
        }
        Some(Commands::Delete { job }) => jobs::cmd_delete(&cli.host, cli.port, job).await,
        Some(Commands::Cancel { job }) => jobs::cmd_cancel(&cli.host, cli.port, job).await,
        Some(Commands::Watch { job }) => jobs::cmd_watch(&cli.host, cli.port, job).await,
        None => {
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use serde_json::json;

    #[test]
    fn test_cli_version_flag() {
        let err = Cli::try_parse_from(["djr", "--version"]).expect_err("version exits");
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayVersion);
        assert!(err.to_string().contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_cli_submit_parses_urls_and_options() {
        let cli = Cli::try_parse_from([
            "djr",
            "submit",
            "https://example.com/a",
            "https://example.com/b",
            "-o",
            "retries=3",
            "--opt",
            "quiet",
            "--follow",
        ])
        .expect("Should parse submit");

        match &cli.command {
            Some(Commands::Submit { urls, opt, follow }) => {
                assert_eq!(urls.len(), 2);
                assert_eq!(opt, &["retries=3", "quiet"]);
                assert!(follow);
            }
            other => panic!("Expected Submit command, got: {:?}", other),
        }
    }

    #[test]
    fn test_cli_submit_requires_urls() {
        assert!(Cli::try_parse_from(["djr", "submit"]).is_err());
    }

    #[test]
    fn test_cli_serve_flags() {
        let cli = Cli::try_parse_from([
            "djr",
            "serve",
            "--data-dir",
            "/tmp/djr",
            "-p",
            "9000",
            "--ephemeral",
        ])
        .expect("Should parse serve");

        match &cli.command {
            Some(Commands::Serve {
                data_dir,
                listen_port,
                ephemeral,
                config,
            }) => {
                assert_eq!(data_dir.as_deref(), Some("/tmp/djr"));
                assert_eq!(*listen_port, Some(9000));
                assert!(ephemeral);
                assert!(config.is_none());
            }
            other => panic!("Expected Serve command, got: {:?}", other),
        }
    }

    #[test]
    fn test_global_host_and_port() {
        let cli = Cli::try_parse_from(["djr", "list", "--port", "9100", "--host", "10.0.0.2"])
            .expect("Should parse globals after subcommand");
        assert_eq!(cli.port, 9100);
        assert_eq!(cli.host, "10.0.0.2");
        assert_eq!(base_url(&cli.host, cli.port), "http://10.0.0.2:9100");
    }

    #[test]
    fn test_parse_option_args() {
        let options = parse_option_args(&[
            "retries=3".to_string(),
            "quiet".to_string(),
            "filter=width > 100".to_string(),
            "simulate=false".to_string(),
        ])
        .expect("parse");

        let pairs: Vec<_> = options.iter().collect();
        assert_eq!(pairs[0], ("retries", &json!(3)));
        assert_eq!(pairs[1], ("quiet", &json!(true)));
        assert_eq!(pairs[2], ("filter", &json!("width > 100")));
        assert_eq!(pairs[3], ("simulate", &json!(false)));
    }

    #[test]
    fn test_parse_option_args_rejects_empty_id() {
        let err = parse_option_args(&["=3".to_string()]).expect_err("empty id");
        assert!(err.contains("Expected ID=VALUE"));
    }

    #[test]
    fn test_connection_error_message() {
        let msg = connection_error_message("127.0.0.1", 8390);
        assert!(msg.contains("127.0.0.1:8390"));
        assert!(msg.contains("djr serve"));
    }
}
