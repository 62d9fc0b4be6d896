use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use ethers::types::{Address, U256};
use market_client::crypto::{HostKeyResolver, HttpChallengeClient};
use market_client::discovery::{HostDiscovery, HostRequirements};
use market_client::escrow::{EscrowLedger, EthersMarketplace, PaymentToken};
use market_client::session::{PromptOptions, SessionProtocol, StartSessionRequest, WebSocketConnector};
use market_client::MarketConfig;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "market-cli", version, about = "Rent metered LLM inference from marketplace hosts")]
struct Cli {
    /// YAML configuration file
    #[arg(long, env = "MARKET_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List eligible hosts for a model, cheapest first
    Hosts {
        /// Model spec, e.g. org/repo:model-q4.gguf
        model: String,
        /// Price in the stable token instead of the native token
        #[arg(long)]
        stable: bool,
        #[arg(long)]
        max_price: Option<u64>,
        #[arg(long)]
        min_vram: Option<u32>,
    },
    /// Show escrow balance
    Balance {
        #[arg(long)]
        stable: bool,
    },
    /// Deposit into escrow (smallest token unit)
    Deposit {
        amount: String,
        #[arg(long)]
        stable: bool,
    },
    /// Withdraw unlocked escrow (smallest token unit)
    Withdraw {
        amount: String,
        #[arg(long)]
        stable: bool,
    },
    /// Open a session and chat over stdin until EOF or /quit
    Chat {
        model: String,
        /// Host address; the cheapest eligible host when omitted
        #[arg(long)]
        host: Option<String>,
        /// Escrow locked for the session (smallest token unit)
        #[arg(long)]
        deposit: String,
        /// Price per token (PRICE_PRECISION = 1000); the host's price when omitted
        #[arg(long)]
        price: Option<u64>,
        #[arg(long)]
        stable: bool,
        /// Pay from the pre-funded deposit instead of the wallet
        #[arg(long)]
        use_deposit: bool,
        /// Disable end-to-end encryption
        #[arg(long)]
        plaintext: bool,
    },
}

fn parse_amount(raw: &str) -> Result<U256> {
    U256::from_dec_str(raw).map_err(|e| anyhow!("Invalid amount '{}': {}", raw, e))
}

fn payment_token(config: &MarketConfig, stable: bool) -> Result<PaymentToken> {
    if !stable {
        return Ok(PaymentToken::Native);
    }
    let token = config.chain.contracts.stable_token;
    if token.is_zero() {
        return Err(anyhow!("Stable token address is not configured"));
    }
    Ok(PaymentToken::Erc20(token))
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => MarketConfig::from_file(path)?,
        None => MarketConfig::default(),
    };
    config.apply_env_overrides()?;

    let marketplace = Arc::new(
        EthersMarketplace::connect(&config)
            .await
            .context("Failed to connect to the marketplace")?,
    );
    let ledger = Arc::new(EscrowLedger::new(marketplace.clone(), config.clone()));
    let discovery = Arc::new(HostDiscovery::new(
        marketplace.clone(),
        Duration::from_secs(config.discovery.cache_ttl_secs),
    ));

    match cli.command {
        Commands::Hosts {
            model,
            stable,
            max_price,
            min_vram,
        } => {
            let requirements = HostRequirements {
                min_vram_gb: min_vram,
                max_cost_per_token: max_price.map(U256::from),
                payment_token: payment_token(&config, stable)?,
                ..HostRequirements::default()
            };
            let hosts = discovery.find_hosts(&model, &requirements).await?;
            if hosts.is_empty() {
                println!("No hosts serve {}", model);
            }
            for candidate in hosts {
                println!(
                    "{:?}  price={}  stake={}  gpu={}  url={}",
                    candidate.record.address,
                    candidate.price_per_token,
                    candidate.record.stake,
                    candidate.record.metadata.hardware.gpu,
                    candidate.record.api_url
                );
            }
        }
        Commands::Balance { stable } => {
            let balance = ledger.balance(payment_token(&config, stable)?).await?;
            println!(
                "total={}  locked={}  available={}",
                balance.total,
                balance.locked,
                balance.available()
            );
        }
        Commands::Deposit { amount, stable } => {
            let amount = parse_amount(&amount)?;
            let tx = if stable {
                ledger.deposit_token(amount).await?
            } else {
                ledger.deposit_native(amount).await?
            };
            println!("✅ Deposited {} in tx {:?}", amount, tx);
        }
        Commands::Withdraw { amount, stable } => {
            let amount = parse_amount(&amount)?;
            let tx = if stable {
                ledger.withdraw_token(amount).await?
            } else {
                ledger.withdraw_native(amount).await?
            };
            println!("✅ Withdrew {} in tx {:?}", amount, tx);
        }
        Commands::Chat {
            model,
            host,
            deposit,
            price,
            stable,
            use_deposit,
            plaintext,
        } => {
            let token = payment_token(&config, stable)?;
            let (record, host_price) = match host {
                Some(raw) => {
                    let address: Address = raw
                        .parse()
                        .map_err(|e| anyhow!("Invalid host address '{}': {}", raw, e))?;
                    let record = discovery.host(address).await?;
                    let price = discovery.get_model_pricing(address, &model, token).await?;
                    (record, price)
                }
                None => {
                    let requirements = HostRequirements {
                        payment_token: token,
                        ..HostRequirements::default()
                    };
                    let best = discovery.select_best_host(&model, &requirements).await?;
                    (best.record, best.price_per_token)
                }
            };

            let keys = Arc::new(HostKeyResolver::new(Arc::new(HttpChallengeClient::new(
                Duration::from_secs(10),
            )?)));
            let protocol = SessionProtocol::new(
                ledger.clone(),
                keys,
                Arc::new(WebSocketConnector),
                config.clone(),
            )
            .with_discovery(discovery.clone());

            let mut request = StartSessionRequest::new(
                record,
                model.clone(),
                config.chain.chain_id,
                parse_amount(&deposit)?,
            );
            request.price_per_token = Some(price.map(U256::from).unwrap_or(host_price));
            request.payment_token = token;
            request.use_deposit = use_deposit;
            request.encryption = Some(!plaintext);

            let session_id = protocol.start_session(request).await?;
            println!("Session {} open with {}. Type /quit to finish.", session_id, model);

            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                let line = line.trim();
                if line == "/quit" {
                    break;
                }
                if line.is_empty() {
                    continue;
                }
                let options = PromptOptions::streaming(|chunk| {
                    print!("{}", chunk);
                    let _ = std::io::stdout().flush();
                })
                .with_usage(|usage| {
                    println!(
                        "\n[{} tokens: llm={} vlm={}]",
                        usage.total_tokens, usage.llm_tokens, usage.vlm_tokens
                    );
                });
                if let Err(e) = protocol.send_prompt(session_id, line, options).await {
                    eprintln!("\n❌ {} ({})", e, e.code());
                    break;
                }
            }

            let tx = protocol.end_session(session_id).await?;
            println!("🏁 Session {} settled in tx {:?}", session_id, tx);
        }
    }

    Ok(())
}
