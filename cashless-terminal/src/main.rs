//! cashless-terminal
//!
//! Point-of-sale terminal for festival bracelets. The bracelet is a tag image
//! file (see [`image`]) presented to a simulated radio; balances and
//! transactions go through the same orchestrator a hardware terminal uses.
//!
//! ```text
//!   cashless-terminal provision --uid 04A22B91 --account acc-1 --balance 5000
//!   cashless-terminal pay 450 --vendor bar-3
//!   cashless-terminal sync
//! ```
//!
//! Configuration comes from `--config` (TOML) layered under `CASHLESS_*`
//! environment variables; a `.env` file is honoured.

mod image;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use cashless_codec::{CashlessAccount, LogicalTagRecord, MinorUnits};
use cashless_core::{
    CashlessConfig, Collaborators, ConfigOverrides, ConnectivityMonitor, HttpLedger, Ledger,
    RefundRequest, SledStore, TopupRequest, TransactionOrchestrator, TransactionResult,
};
use cashless_nfc::{SessionManager, SimulatedRadio, TracingFeedback};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use crate::image::TagImage;

const DEFAULT_TAG_PATH: &str = "bracelet.json";
const DEFAULT_STORE_PATH: &str = ".cashless/store";
const DEFAULT_LOG_FILTER: &str = "cashless_terminal=info,cashless_core=info,cashless_nfc=info";

#[derive(Parser)]
#[command(
    name = "cashless-terminal",
    about = "Festival cashless point-of-sale terminal"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Bracelet image presented to the terminal.
    #[arg(long, global = true, default_value = DEFAULT_TAG_PATH)]
    tag: PathBuf,
    /// Directory of the local store (cache, daily totals, offline queue).
    #[arg(long, global = true, default_value = DEFAULT_STORE_PATH)]
    store: PathBuf,
    /// Override the ledger base URL.
    #[arg(long, global = true)]
    api_url: Option<String>,
    /// Override the festival id.
    #[arg(long, global = true)]
    festival: Option<String>,
    /// Treat the ledger as unreachable without probing it.
    #[arg(long, global = true)]
    offline: bool,
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a fresh cashless record onto the bracelet image.
    Provision(ProvisionArgs),
    /// Decode and print the bracelet's record.
    Inspect,
    /// Charge the presented bracelet.
    Pay(PayArgs),
    /// Credit the presented bracelet (online only).
    Topup(AmountArgs),
    /// Refund onto the presented bracelet (online only).
    Refund(RefundArgs),
    /// Push queued offline transactions to the ledger.
    Sync,
    /// List recent transactions of a bracelet.
    History(HistoryArgs),
}

#[derive(Args)]
struct ProvisionArgs {
    /// Tag UID in hex. Defaults to the UID of the existing image.
    #[arg(long)]
    uid: Option<String>,
    #[arg(long)]
    account: String,
    /// Starting balance in minor units.
    #[arg(long, default_value_t = 0)]
    balance: MinorUnits,
    /// Tag capacity in bytes.
    #[arg(long)]
    max_size: Option<usize>,
    /// Replace an existing record.
    #[arg(long)]
    force: bool,
}

#[derive(Args)]
struct AmountArgs {
    /// Amount in minor units.
    amount: MinorUnits,
}

#[derive(Args)]
struct PayArgs {
    /// Amount in minor units.
    amount: MinorUnits,
    /// Vendor charging the bracelet. Defaults to the configured vendor.
    #[arg(long)]
    vendor: Option<String>,
}

#[derive(Args)]
struct RefundArgs {
    /// Amount in minor units.
    amount: MinorUnits,
    /// Transaction being refunded.
    #[arg(long)]
    original: Option<String>,
}

#[derive(Args)]
struct HistoryArgs {
    /// Bracelet id. Defaults to the UID of the bracelet image.
    #[arg(long)]
    bracelet: Option<String>,
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_logging(cli.global.log_json);

    let config = CashlessConfig::load(cli.global.config.as_deref())?.with_overrides(ConfigOverrides {
        api_base_url: cli.global.api_url.clone(),
        festival_id: cli.global.festival.clone(),
        ..Default::default()
    })?;

    let terminal = Terminal::open(config, &cli.global, &cli.command).await?;
    let outcome = terminal.run(cli.command).await;
    terminal.persist_tag().await?;
    outcome
}

// ═══════════════════════════════════════════════════════════════════════════════
// TERMINAL
// ═══════════════════════════════════════════════════════════════════════════════

struct Terminal {
    orchestrator: Arc<TransactionOrchestrator>,
    radio: Arc<SimulatedRadio>,
    tag_path: PathBuf,
    image: Option<TagImage>,
}

impl Terminal {
    async fn open(config: CashlessConfig, global: &GlobalArgs, command: &Commands) -> Result<Self> {
        let image = load_image(&global.tag, command).await?;
        let radio = Arc::new(match &image {
            Some(image) => SimulatedRadio::with_tag(image.to_tag()?),
            None => SimulatedRadio::new(),
        });
        let session = SessionManager::with_feedback(radio.clone(), Arc::new(TracingFeedback));
        session.initialize().await;

        let ledger: Arc<dyn Ledger> = Arc::new(HttpLedger::from_config(&config)?);
        let online = !global.offline && ledger.ping().await.is_ok();
        if !online {
            warn!(api_base_url = %config.api_base_url, "ledger unreachable, running offline");
        }
        let store = SledStore::open(&global.store)
            .with_context(|| format!("failed to open store {}", global.store.display()))?;

        let orchestrator = TransactionOrchestrator::new(
            config,
            Collaborators {
                ledger,
                store: Arc::new(store),
                network: ConnectivityMonitor::new(online),
                session,
            },
        )?;

        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            radio,
            tag_path: global.tag.clone(),
            image,
        })
    }

    async fn run(&self, command: Commands) -> Result<ExitCode> {
        match command {
            Commands::Provision(args) => self.provision(args).await,
            Commands::Inspect => self.inspect().await,
            Commands::Pay(args) => {
                let result = self
                    .orchestrator
                    .charge_bracelet(args.amount, args.vendor)
                    .await;
                report_transaction(&result)
            }
            Commands::Topup(args) => {
                let (bracelet_id, account) = self.read_bracelet().await?;
                let result = self
                    .orchestrator
                    .process_topup(TopupRequest {
                        bracelet_id,
                        amount: args.amount,
                        tag_account: Some(account),
                    })
                    .await;
                report_transaction(&result)
            }
            Commands::Refund(args) => {
                let (bracelet_id, account) = self.read_bracelet().await?;
                let result = self
                    .orchestrator
                    .process_refund(RefundRequest {
                        bracelet_id,
                        amount: args.amount,
                        original_transaction_id: args.original,
                        tag_account: Some(account),
                    })
                    .await;
                report_transaction(&result)
            }
            Commands::Sync => {
                let report = self.orchestrator.sync_offline_transactions().await;
                print_json(&report)?;
                Ok(if report.error.is_none() && report.failed == 0 {
                    ExitCode::SUCCESS
                } else {
                    ExitCode::FAILURE
                })
            }
            Commands::History(args) => {
                let bracelet_id = args
                    .bracelet
                    .or_else(|| self.image.as_ref().map(|i| i.uid.clone()))
                    .context("no bracelet given and no bracelet image found")?;
                let history = self
                    .orchestrator
                    .get_transaction_history(&bracelet_id, args.limit)
                    .await;
                print_json(&history)?;
                Ok(exit_code(history.success))
            }
        }
    }

    async fn provision(&self, args: ProvisionArgs) -> Result<ExitCode> {
        let config = self.orchestrator.config();
        let record = LogicalTagRecord::cashless(
            config.festival_id.clone(),
            CashlessAccount::new(args.account, args.balance),
            chrono::Utc::now().timestamp_millis().max(0) as u64,
        );
        let writer = self.orchestrator.writer();
        let result = writer
            .write_tag(&record, writer.policy().write_options(args.force))
            .await;

        match result.error {
            None => {
                info!(
                    bracelet_id = %result.tag.as_ref().map(|t| t.uid_hex()).unwrap_or_default(),
                    bytes = result.bytes_written,
                    "bracelet provisioned"
                );
                print_json(&record)?;
                Ok(ExitCode::SUCCESS)
            }
            Some(error) => {
                eprintln!("provisioning failed [{}]: {error}", error.code());
                Ok(ExitCode::FAILURE)
            }
        }
    }

    async fn inspect(&self) -> Result<ExitCode> {
        let reader = self.orchestrator.reader();
        let read = reader
            .read_tag(self.orchestrator.writer().policy().read_options())
            .await;
        match (read.data, read.error) {
            (Some(record), _) => {
                print_json(&record)?;
                Ok(ExitCode::SUCCESS)
            }
            (None, None) => {
                println!("bracelet is blank");
                Ok(ExitCode::SUCCESS)
            }
            (None, Some(error)) => {
                eprintln!("read failed [{}]: {error}", error.code());
                Ok(ExitCode::FAILURE)
            }
        }
    }

    async fn read_bracelet(&self) -> Result<(String, CashlessAccount)> {
        let read = self
            .orchestrator
            .reader()
            .read_cashless_bracelet(self.orchestrator.writer().policy().read_options())
            .await;
        match (read.bracelet_id, read.cashless_data) {
            (Some(id), Some(account)) => Ok((id, account)),
            _ => Err(match read.error {
                Some(error) => anyhow!("bracelet read failed [{}]: {error}", error.code()),
                None => anyhow!("bracelet read failed"),
            }),
        }
    }

    /// Write whatever is now on the simulated tag back to the image file.
    async fn persist_tag(&self) -> Result<()> {
        if let Some(tag) = self.radio.current().await {
            let updated = TagImage::from_tag(&tag);
            if self.image.as_ref() != Some(&updated) {
                updated.save(&self.tag_path).await?;
            }
        }
        Ok(())
    }
}

async fn load_image(path: &Path, command: &Commands) -> Result<Option<TagImage>> {
    let exists = tokio::fs::try_exists(path).await.unwrap_or(false);
    match command {
        Commands::Provision(args) => match (&args.uid, exists) {
            (Some(uid), _) => {
                let uid = hex::decode(uid).with_context(|| format!("bad uid {uid:?}"))?;
                if exists {
                    let existing = TagImage::load(path).await?;
                    if existing.uid.eq_ignore_ascii_case(&hex::encode_upper(&uid)) {
                        return Ok(Some(existing));
                    }
                }
                Ok(Some(TagImage::blank(&uid, args.max_size)))
            }
            (None, true) => TagImage::load(path).await.map(Some),
            (None, false) => Err(anyhow!(
                "no bracelet image at {}; pass --uid to create one",
                path.display()
            )),
        },
        Commands::Sync | Commands::History(_) if !exists => Ok(None),
        _ if !exists => Err(anyhow!("no bracelet image at {}", path.display())),
        _ => TagImage::load(path).await.map(Some),
    }
}

fn report_transaction(result: &TransactionResult) -> Result<ExitCode> {
    print_json(result)?;
    if let Some(tx) = &result.transaction {
        info!(
            transaction_id = %tx.id,
            bracelet_id = %tx.bracelet_id,
            new_balance = tx.new_balance(),
            offline = result.is_offline(),
            "transaction finished"
        );
    }
    Ok(exit_code(result.success))
}

fn exit_code(success: bool) -> ExitCode {
    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
