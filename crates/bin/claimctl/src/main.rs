//! claimctl: claim managed keys against a threshold key network
//!
//! composition point for the keyclaim library. the `KEYCLAIM_SECRET`
//! environment fallback for the wallet secret lives here and only here.

use anyhow::Context;
use clap::{Parser, Subcommand};
use keyclaim::{
    delegate, Address, ClaimConfig, ClaimFlow, DelegationParams, Identity, NetworkClient,
    NetworkConfig, Registry, RpcRegistry,
};
use tracing::info;

#[derive(Parser)]
#[command(name = "claimctl")]
#[command(about = "claim managed keys against a threshold key network")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// network preset: localhost or rotko-testnet
    #[arg(long, default_value = "localhost")]
    network: String,

    /// registry endpoint
    #[arg(long, default_value = "http://localhost:7200")]
    registry: String,

    /// hex wallet secret; falls back to the KEYCLAIM_SECRET env var
    #[arg(long)]
    secret: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// claim a key for a user identifier
    Claim {
        /// user identifier the key is derived for
        #[arg(long)]
        user_id: String,
    },

    /// delegate capacity from a pre-purchased allowance
    Delegate {
        /// capacity token reference
        #[arg(long)]
        capacity_token: String,

        /// delegatee address, repeatable
        #[arg(long, required = true)]
        delegatee: Vec<String>,

        #[arg(long, default_value_t = 1)]
        max_uses: u32,

        /// days until the delegation deadline
        #[arg(long, default_value_t = 1)]
        days: i64,
    },

    /// mint a capacity allowance on the registry
    MintCapacity {
        /// requests per kilosecond
        #[arg(long, default_value_t = 10)]
        rate: u32,

        /// days until expiration
        #[arg(long, default_value_t = 1)]
        days: u32,
    },

    /// issue short-lived session credentials scoped to a managed key,
    /// minting the key and a capacity allowance when absent
    KeySession {
        /// existing key record token id (with --key-public-key and
        /// --key-address); minted when absent
        #[arg(long)]
        key_token: Option<String>,

        #[arg(long)]
        key_public_key: Option<String>,

        #[arg(long)]
        key_address: Option<String>,

        /// existing capacity token; minted when absent
        #[arg(long)]
        capacity_token: Option<String>,

        /// session lifetime in minutes
        #[arg(long, default_value_t = 10)]
        minutes: i64,
    },
}

fn network_config(name: &str) -> anyhow::Result<NetworkConfig> {
    match name {
        "localhost" => Ok(NetworkConfig::localhost()),
        "rotko-testnet" => Ok(NetworkConfig::rotko_testnet()),
        other => anyhow::bail!("unknown network preset: {other}"),
    }
}

fn identity_from(cli_secret: Option<String>) -> anyhow::Result<Identity> {
    let secret = cli_secret.or_else(|| std::env::var("KEYCLAIM_SECRET").ok());
    Identity::from_optional_hex(secret.as_deref())
        .context("provide --secret or set KEYCLAIM_SECRET")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let identity = identity_from(cli.secret)?;
    info!("wallet address: {}", identity.address());

    match cli.command {
        Commands::Claim { user_id } => {
            let network = NetworkClient::new(network_config(&cli.network)?)?;
            let registry = RpcRegistry::new(cli.registry);
            let mut flow = ClaimFlow::new(network, registry, identity, ClaimConfig::default());

            let receipt = flow.run(&user_id).await?;
            println!("derived key id: {}", receipt.derived_key_id);
            println!("key record:     {}", receipt.key_record.token_id);
            println!("key address:    {}", receipt.key_record.address);
            println!("transaction:    {}", receipt.tx.0);
        }

        Commands::Delegate { capacity_token, delegatee, max_uses, days } => {
            let delegatees = delegatee
                .iter()
                .map(|addr| Address::from_hex(addr))
                .collect::<keyclaim::Result<Vec<_>>>()
                .context("bad delegatee address")?;
            let params = DelegationParams {
                capacity_token_ref: capacity_token,
                delegatees,
                max_uses,
                deadline: chrono::Utc::now() + chrono::Duration::days(days),
            };

            let network = NetworkClient::new(network_config(&cli.network)?)?;
            network.connect().await?;
            let result = delegate(&network, &identity, params).await;
            network.disconnect().await;

            let delegation = result?;
            println!("{}", serde_json::to_string_pretty(&delegation)?);
        }

        Commands::MintCapacity { rate, days } => {
            let registry = RpcRegistry::new(cli.registry);
            let token_ref = registry.mint_capacity_allowance(rate, days).await?;
            println!("capacity token: {token_ref}");
        }

        Commands::KeySession { key_token, key_public_key, key_address, capacity_token, minutes } => {
            let registry = RpcRegistry::new(cli.registry);

            let record = match key_token {
                Some(token_id) => {
                    let (public_key, address) = key_public_key
                        .zip(key_address)
                        .context("--key-token needs --key-public-key and --key-address")?;
                    keyclaim::ManagedKeyRecord { token_id, public_key, address }
                }
                None => registry.mint_managed_key().await?,
            };
            info!("managed key {} at {}", record.token_id, record.address);

            let capacity_token = match capacity_token {
                Some(token) => token,
                None => registry.mint_capacity_allowance(10, 1).await?,
            };

            let network = NetworkClient::new(network_config(&cli.network)?)?;
            network.connect().await?;
            let result = key_session(&network, &identity, &record, capacity_token, minutes).await;
            network.disconnect().await;

            let credentials = result?;
            println!(
                "key session for {} valid until {} on {} nodes",
                record.token_id,
                credentials.expiration().to_rfc3339(),
                credentials.len()
            );
        }
    }

    Ok(())
}

/// delegate capacity to the key's own address, then negotiate key-scoped
/// session credentials
async fn key_session(
    network: &NetworkClient,
    identity: &Identity,
    record: &keyclaim::ManagedKeyRecord,
    capacity_token: String,
    minutes: i64,
) -> keyclaim::Result<keyclaim::SessionCredentialSet> {
    let delegation = delegate(
        network,
        identity,
        DelegationParams {
            capacity_token_ref: capacity_token,
            delegatees: vec![Address::from_hex(&record.address)?],
            max_uses: 1,
            deadline: chrono::Utc::now() + chrono::Duration::days(1),
        },
    )
    .await?;

    let signer = keyclaim::AuthSigBuilder::new(identity);
    let issuer = keyclaim::SessionIssuer::new(
        network,
        network.config().name.clone(),
        "keyclaim:session",
    );
    issuer
        .issue_for_key(
            &signer,
            record,
            vec![delegation],
            &[keyclaim::ResourceAbilityRequest::any(keyclaim::Ability::PkpSigning)],
            chrono::Utc::now() + chrono::Duration::minutes(minutes),
        )
        .await
}
