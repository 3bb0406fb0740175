use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use secure_mesh::{
    Host, Keystore, MeshError, MeshSecurityConfig, SecureTransportClient, SecureTransportServer,
    SecurityPreset, Signer, TransportMessage,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(about = "Secure mesh transport node", author, version)]
struct Cli {
    /// Directory holding the identity and revocation list
    #[arg(long = "keystore", value_name = "DIR", default_value = ".mesh", global = true)]
    keystore: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print this node's fingerprint, creating an identity if needed
    Identity,

    /// Revoke a peer fingerprint
    Revoke {
        fingerprint: String,

        /// Free-form reason stored with the entry
        #[arg(long = "reason")]
        reason: Option<String>,

        /// Remove the fingerprint from the list instead
        #[arg(long = "undo", default_value_t = false)]
        undo: bool,
    },

    /// List revoked fingerprints
    Revocations,

    /// Accept connections and log inbound messages
    Serve {
        #[arg(long = "port", default_value_t = 9876)]
        port: u16,

        #[command(flatten)]
        security: SecurityArgs,
    },

    /// Connect to a peer and send one message
    Send {
        #[arg(long = "address", default_value = "127.0.0.1")]
        address: String,

        #[arg(long = "port", default_value_t = 9876)]
        port: u16,

        /// Message type
        #[arg(long = "type", default_value = "ping")]
        kind: String,

        /// JSON payload
        #[arg(long = "payload", default_value = "null")]
        payload: String,

        #[command(flatten)]
        security: SecurityArgs,
    },
}

#[derive(clap::Args, Debug)]
struct SecurityArgs {
    /// Named security preset
    #[arg(long = "preset", value_enum, default_value = "secure")]
    preset: PresetArg,

    /// JSON config file; overrides --preset
    #[arg(long = "config", value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PresetArg {
    Development,
    Signed,
    Secure,
    Strict,
}

impl From<PresetArg> for SecurityPreset {
    fn from(value: PresetArg) -> Self {
        match value {
            PresetArg::Development => SecurityPreset::Development,
            PresetArg::Signed => SecurityPreset::Signed,
            PresetArg::Secure => SecurityPreset::Secure,
            PresetArg::Strict => SecurityPreset::Strict,
        }
    }
}

impl SecurityArgs {
    fn load(&self) -> Result<Arc<MeshSecurityConfig>, MeshError> {
        let config = match &self.config {
            Some(path) => MeshSecurityConfig::from_json_file(path)?,
            None => MeshSecurityConfig::preset(self.preset.into()),
        };
        Ok(Arc::new(config))
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("mesh-node failed: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), MeshError> {
    let keystore = Arc::new(Keystore::open(&cli.keystore)?);

    match cli.command {
        Command::Identity => {
            let identity = keystore.load_or_create_identity()?;
            println!("{}", identity.fingerprint());
        }
        Command::Revoke {
            fingerprint,
            reason,
            undo,
        } => {
            let changed = if undo {
                keystore.unrevoke(&fingerprint)?
            } else {
                keystore.revoke(&fingerprint, reason)?
            };
            if !changed {
                println!("{fingerprint}: unchanged");
            }
        }
        Command::Revocations => {
            for entry in keystore.revocations() {
                println!(
                    "{}\t{}\t{}",
                    entry.fingerprint,
                    entry.revoked_at,
                    entry.reason.as_deref().unwrap_or("")
                );
            }
        }
        Command::Serve { port, security } => {
            let config = security.load()?;
            let identity = Arc::new(keystore.load_or_create_identity()?);
            let server = SecureTransportServer::new(port, config, Some(identity))?
                .with_keystore(Arc::clone(&keystore));
            let mut inbound = server.on_message();
            server.start().await?;

            loop {
                tokio::select! {
                    message = inbound.recv() => {
                        let Some(message) = message else { break };
                        info!(
                            connection = %message.connection,
                            sender = message.sender_fingerprint.as_deref().unwrap_or("-"),
                            kind = %message.message.kind,
                            payload = %message.message.payload,
                            "Message received"
                        );
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("Shutting down");
                        break;
                    }
                }
            }
            server.stop().await;
        }
        Command::Send {
            address,
            port,
            kind,
            payload,
            security,
        } => {
            let config = security.load()?;
            let identity = Arc::new(keystore.load_or_create_identity()?);
            let payload: serde_json::Value = serde_json::from_str(&payload)
                .map_err(|e| secure_mesh::ConfigError::InvalidOption(format!("--payload: {e}")))?;

            let host = Host::new(format!("{address}:{port}"), address, port);
            let client = SecureTransportClient::new(host, config, Some(identity))?
                .with_keystore(Arc::clone(&keystore))?;
            client.connect().await?;
            let id = client.send(TransportMessage::new(kind, payload)).await?;
            println!("{id}");
            client.disconnect().await;
        }
    }
    Ok(())
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .try_init();
    });
}
