use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.voterid.Verifier1",
    default_service = "org.voterid.Verifier1",
    default_path = "/org/voterid/Verifier1"
)]
trait Verifier {
    async fn verify(&self, document: &[u8], live: &[u8]) -> zbus::Result<String>;
    async fn load_model(&self, name: &str) -> zbus::Result<String>;
    async fn unload_model(&self, name: &str) -> zbus::Result<bool>;
    async fn reload_model(&self, name: &str) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "voterid", about = "voterid identity-verification CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify a live capture against an identity document photo
    Verify {
        /// Image of the identity document
        #[arg(short, long)]
        document: PathBuf,
        /// Live capture of the voter
        #[arg(short, long)]
        live: PathBuf,
    },
    /// Load a model by name
    Load { name: String },
    /// Unload a resident model
    Unload { name: String },
    /// Reload a model from disk
    Reload { name: String },
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("failed to connect to D-Bus")?;
    let proxy = VerifierProxy::new(&conn)
        .await
        .context("voteridd is not reachable")?;

    match cli.command {
        Commands::Verify { document, live } => {
            let document = read_image(&document)?;
            let live = read_image(&live)?;
            tracing::debug!(
                document_bytes = document.len(),
                live_bytes = live.len(),
                "sending verify"
            );
            let reply = proxy.verify(&document, &live).await?;
            print_json(&reply)?;
        }
        Commands::Load { name } => println!("{}", proxy.load_model(&name).await?),
        Commands::Unload { name } => {
            if proxy.unload_model(&name).await? {
                println!("model '{name}' unloaded");
            } else {
                println!("model '{name}' was not loaded");
            }
        }
        Commands::Reload { name } => println!("{}", proxy.reload_model(&name).await?),
        Commands::Status => print_json(&proxy.status().await?)?,
    }

    Ok(())
}

fn read_image(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn print_json(reply: &str) -> Result<()> {
    let value: serde_json::Value =
        serde_json::from_str(reply).context("daemon returned malformed JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_verify() {
        let cli = Cli::try_parse_from([
            "voterid", "--session", "verify", "--document", "id.png", "--live", "me.jpg",
        ])
        .unwrap();
        assert!(cli.session);
        match cli.command {
            Commands::Verify { document, live } => {
                assert_eq!(document, PathBuf::from("id.png"));
                assert_eq!(live, PathBuf::from("me.jpg"));
            }
            _ => panic!("expected verify"),
        }
    }

    #[test]
    fn test_verify_requires_both_images() {
        assert!(Cli::try_parse_from(["voterid", "verify", "--document", "id.png"]).is_err());
    }

    #[test]
    fn test_print_json_rejects_garbage() {
        assert!(print_json("{\"matched\": true}").is_ok());
        assert!(print_json("not json").is_err());
    }
}
