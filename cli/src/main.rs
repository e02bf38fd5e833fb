// dmail — command-line front end
//
// Manages local email identities and the engine configuration, inspects the
// packets an email turns into, and runs a loopback self-test of the whole
// send / check / confirm cycle.

mod config;
mod identity;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::*;
use dmail_core::email::{create_email_packets, parse_address, SignatureStatus};
use dmail_core::{
    Email, EmailIdentity, EngineConfig, LocalNetwork, MailEngine, MemoryDht, NodeKeys, SchemeId,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "dmail")]
#[command(about = "dmail — anonymous store-and-forward email over a DHT", long_about = None)]
#[command(version)]
struct Cli {
    /// Log at info level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage email identities
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },
    /// Show or change the configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Fragment and encrypt a file as an email and list the resulting packets
    Packets {
        file: PathBuf,
        /// Recipient destination, optionally as "Name <destination>"
        #[arg(long)]
        to: String,
        /// Override packets.max_fragment_size
        #[arg(long)]
        fragment_size: Option<usize>,
    },
    /// Send an email between two in-process engines and confirm delivery
    Selftest {
        /// Relay hops between sender and DHT
        #[arg(long, default_value = "0")]
        hops: u8,
    },
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Generate a new identity
    New {
        name: String,
        #[arg(short, long, value_enum, default_value = "p256")]
        scheme: Scheme,
        #[arg(short, long, default_value = "")]
        description: String,
        /// Make it the default identity
        #[arg(long)]
        default: bool,
    },
    List,
    Show { identity: String },
    /// Print the private key export string
    Export { identity: String },
    /// Import an identity from its export string
    Import { key: String, name: String },
    /// Make an identity the default
    Default { identity: String },
    Remove { identity: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    Show,
    Path,
    /// Set a value by dotted key, e.g. `mail_check.interval_mins 15`
    Set { key: String, value: String },
    /// Number of relay hops used when sending
    SetHops { hops: u8 },
}

#[derive(Clone, Copy, ValueEnum)]
enum Scheme {
    P256,
    P384,
    Lattice,
}

impl From<Scheme> for SchemeId {
    fn from(scheme: Scheme) -> Self {
        match scheme {
            Scheme::P256 => SchemeId::EcP256,
            Scheme::P384 => SchemeId::EcP384,
            Scheme::Lattice => SchemeId::Lattice,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dmail_core::init_logging(if cli.verbose { "info" } else { "warn" });

    match cli.command {
        Commands::Identity { action } => cmd_identity(action),
        Commands::Config { action } => cmd_config(action),
        Commands::Packets {
            file,
            to,
            fragment_size,
        } => cmd_packets(file, &to, fragment_size),
        Commands::Selftest { hops } => cmd_selftest(hops).await,
    }
}

// ============================================================================
// IDENTITIES
// ============================================================================

fn print_identity(identity: &EmailIdentity) {
    let marker = if identity.is_default { " (default)".bright_green().to_string() } else { String::new() };
    println!("{}{}", identity.display_name.bold(), marker);
    println!("  Hash:        {}", identity.hash().to_hex().bright_cyan());
    println!("  Scheme:      {}", identity.scheme());
    if !identity.description.is_empty() {
        println!("  Description: {}", identity.description);
    }
    let created = chrono::DateTime::from_timestamp(identity.created_at as i64, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M UTC").to_string())
        .unwrap_or_else(|| identity.created_at.to_string());
    println!("  Created:     {}", created);
    println!("  Destination: {}", identity.destination().to_base64().bright_yellow());
}

fn cmd_identity(action: IdentityAction) -> Result<()> {
    let config = config::load()?;
    let store = identity::open_store(&config)?;

    match action {
        IdentityAction::New {
            name,
            scheme,
            description,
            default,
        } => {
            let mut new_identity = EmailIdentity::generate(scheme.into(), &name);
            new_identity.description = description;
            new_identity.is_default = default;
            let hash = store.add(new_identity).context("Failed to store identity")?;
            let stored = identity::find(&store, &hash.to_hex())?;
            println!("{} Identity created", "✓".green());
            println!();
            print_identity(&stored);
        }
        IdentityAction::List => {
            let all = store.get_all()?;
            if all.is_empty() {
                println!("{}", "No identities yet.".dimmed());
                println!("  Create one: {}", "dmail identity new <name>".bright_green());
                return Ok(());
            }
            println!("{} ({} total)", "Identities".bold(), all.len());
            for entry in &all {
                let marker = if entry.is_default { "*".bright_green() } else { " ".normal() };
                println!(
                    " {} {:<20} {} {}",
                    marker,
                    entry.display_name,
                    entry.hash().short().bright_cyan(),
                    entry.scheme()
                );
            }
        }
        IdentityAction::Show { identity: selector } => {
            print_identity(&identity::find(&store, &selector)?);
        }
        IdentityAction::Export { identity: selector } => {
            let found = identity::find(&store, &selector)?;
            println!("{}", "⚠️  WARNING: this string contains your private keys!".bright_red().bold());
            println!();
            println!("{}", found.export_base64());
        }
        IdentityAction::Import { key, name } => {
            let imported = EmailIdentity::import_base64(&key, &name).context("Invalid export string")?;
            let hash = store.add(imported).context("Failed to store identity")?;
            println!("{} Imported {} ({})", "✓".green(), name.bold(), hash.short());
        }
        IdentityAction::Default { identity: selector } => {
            let found = identity::find(&store, &selector)?;
            store.set_default(&found.hash())?;
            println!("{} {} is now the default identity", "✓".green(), found.display_name.bold());
        }
        IdentityAction::Remove { identity: selector } => {
            let found = identity::find(&store, &selector)?;
            store.remove(&found.hash())?;
            println!("{} Removed {}", "✓".green(), found.display_name.bold());
            if let Some(default) = store.get_default()? {
                println!("  Default identity: {}", default.display_name);
            }
        }
    }
    Ok(())
}

// ============================================================================
// CONFIGURATION
// ============================================================================

fn cmd_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = config::load()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigAction::Path => {
            println!("Config: {}", config::config_file()?.display());
            println!("Data:   {}", config::data_dir()?.display());
        }
        ConfigAction::Set { key, value } => {
            let mut config = config::load()?;
            config.set(&key, &value)?;
            config::save(&config)?;
            println!("{} {} = {}", "✓".green(), key.bold(), value);
        }
        ConfigAction::SetHops { hops } => {
            let mut config = config::load()?;
            config.set("relay.hops", &hops.to_string())?;
            config::save(&config)?;
            if hops == 0 {
                println!("{} Packets are stored directly, without relays", "✓".green());
            } else {
                println!("{} Packets go through {} relay hop(s)", "✓".green(), hops);
            }
        }
    }
    Ok(())
}

// ============================================================================
// PACKET INSPECTION
// ============================================================================

fn cmd_packets(file: PathBuf, to: &str, fragment_size: Option<usize>) -> Result<()> {
    let config = config::load()?;
    let body = std::fs::read_to_string(&file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let recipient = parse_address(to).context("Invalid recipient")?;
    let subject = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let email = Email::new()
        .with_header("To", &recipient.to_header_value())
        .with_header("Subject", &subject)
        .with_body(&body);

    let max_fragment_size = fragment_size.unwrap_or(config.packets.max_fragment_size);
    let packets = create_email_packets(
        &email,
        None,
        &recipient.destination,
        std::slice::from_ref(&recipient.destination),
        max_fragment_size,
    )?;

    println!("{}", "Email packets".bold());
    println!("  Message:   {}", packets.message_id.to_string().bright_cyan());
    println!("  Recipient: {}", packets.recipient.to_hex());
    println!("  Scheme:    {}", recipient.destination.scheme());
    println!("  Fragments: {} (max {} bytes)", packets.fragments.len(), max_fragment_size);
    println!();
    for (fragment, encrypted) in packets.fragments.iter().zip(&packets.encrypted) {
        println!(
            "  [{}/{}] {} {:>6} bytes  delete-hash {}",
            fragment.fragment_index + 1,
            fragment.fragment_count,
            encrypted.dht_key.to_hex().bright_yellow(),
            encrypted.ciphertext.len(),
            encrypted.deletion_hash.short()
        );
    }
    println!();
    println!(
        "  Index packet for {} lists {} entries",
        packets.index.recipient.short(),
        packets.index.len()
    );
    Ok(())
}

// ============================================================================
// SELF-TEST
// ============================================================================

fn start_engine(
    network: &Arc<LocalNetwork>,
    dht: &Arc<MemoryDht>,
    config: EngineConfig,
) -> Result<MailEngine> {
    let keys = NodeKeys::generate();
    let transport = Arc::new(network.join(&keys));
    let engine = MailEngine::new(config, keys, transport, dht.clone())?;
    engine.start()?;
    Ok(engine)
}

async fn wait_for(what: &str, timeout: Duration, mut check: impl FnMut() -> bool) -> Result<()> {
    tokio::time::timeout(timeout, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .with_context(|| format!("Timed out waiting for {}", what))
}

async fn cmd_selftest(hops: u8) -> Result<()> {
    println!("{}", "Running dmail self-test...".bold());
    println!();

    let network = LocalNetwork::new();
    let dht = Arc::new(MemoryDht::new());
    let mut base = EngineConfig::default();
    base.mail_check.auto_check = false;
    base.relay.max_delay_secs = 0;
    base.relay.pow_bits_per_hop = 8;
    base.relay.min_pow_bits = 8;
    base.peers.response_timeout_secs = 10;

    let mut relays = Vec::with_capacity(hops as usize);
    for _ in 0..hops {
        relays.push(start_engine(&network, &dht, base.clone())?);
    }
    let mut sender_config = base.clone();
    sender_config.relay.hops = hops;
    sender_config.peers.bootstrap_peers = relays
        .iter()
        .map(|relay| relay.local_destination().to_base64())
        .collect();
    let alice = start_engine(&network, &dht, sender_config)?;
    let bob = start_engine(&network, &dht, base)?;
    println!("  {} {} engines on the loopback network", "✓".green(), hops as usize + 2);

    let alice_hash = alice
        .identities()
        .add(EmailIdentity::generate(SchemeId::EcP256, "alice"))?;
    let bob_identity = EmailIdentity::generate(SchemeId::EcP384, "bob");
    let bob_address = bob_identity.destination().to_base64();
    bob.identities().add(bob_identity)?;
    println!("  {} Identities created", "✓".green());

    let body = "This message went through the DHT and back.";
    let email = Email::new()
        .with_header("To", &bob_address)
        .with_header("Subject", "dmail self-test")
        .with_body(body);
    let id = alice.send_email(email, Some(alice_hash))?;
    wait_for("the outbox to drain", Duration::from_secs(60), || {
        alice.outbox().is_empty().unwrap_or(false)
    })
    .await?;

    // relayed packets are stored after the first hop accepted them
    let fragments: usize = alice
        .metadata()
        .get(&id)?
        .map(|m| m.recipients.values().map(Vec::len).sum())
        .unwrap_or(0);
    wait_for("packets to reach the DHT", Duration::from_secs(60), || {
        let stats = dht.stats();
        stats.email_stores >= fragments && stats.index_stores >= 1
    })
    .await?;
    println!("  {} Email sent in {} fragment(s)", "✓".green(), fragments);

    if !bob.check_mail().await.new_mail() {
        bail!("The recipient found no new mail");
    }
    let inbox = bob.inbox().list()?;
    let received = inbox.first().context("Inbox is empty")?;
    if received.email.body() != body {
        bail!("Received body does not match");
    }
    if received.email.signature != SignatureStatus::Valid {
        bail!("Signature check failed: {:?}", received.email.signature);
    }
    println!("  {} Email received, signature valid", "✓".green());

    let confirmed = alice.check_delivery().await;
    let delivered = alice
        .metadata()
        .get(&id)?
        .map(|m| m.is_delivered())
        .unwrap_or(false);
    if !delivered {
        bail!("Delivery was not confirmed");
    }
    println!("  {} Delivery confirmed ({} fragment(s))", "✓".green(), confirmed);

    for engine in relays.iter().chain([&alice, &bob]) {
        engine.shutdown().await?;
    }
    println!();
    println!("{}", "All checks passed.".bright_green().bold());
    Ok(())
}
