use clap::{Parser, Subcommand};
use minibank::config::AppConfig;
use minibank::domain::account::{AccountNumber, Balance, CompanyId};
use minibank::domain::ports::{LedgerStoreBox, Registry, RegistryBox};
use minibank::domain::transaction::TransferRequest;
use minibank::infrastructure::in_memory::InMemoryLedger;
#[cfg(feature = "storage-postgres")]
use minibank::infrastructure::postgres::PgLedger;
use minibank::interfaces::csv::account_reader::{AccountReader, seed_ledger};
use minibank::interfaces::csv::transfer_reader::TransferReader;
use minibank::interfaces::csv::writer::{AccountWriter, CompanyWriter, EntryWriter};
use minibank::logging::init_logging;
use minibank::{LedgerError, TransferEngine};
use miette::Result;
use rust_decimal::Decimal;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// YAML configuration file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// PostgreSQL URL (requires the 'storage-postgres' feature). Without one the
    /// ledger lives in memory for the duration of the command.
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Seed the ledger from a `company,account,balance` CSV file before running
    /// the command.
    #[arg(long, global = true)]
    accounts: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Move funds between two accounts
    Transfer {
        source: i64,
        target: i64,
        amount: Decimal,
    },
    /// Apply a headerless `source,target,amount` CSV file as one all-or-nothing batch
    Batch { file: PathBuf },
    /// Apply the database schema
    Migrate,
    /// Manage companies
    Company {
        #[command(subcommand)]
        command: CompanyCommand,
    },
    /// Manage accounts
    Account {
        #[command(subcommand)]
        command: AccountCommand,
    },
    /// Print the transaction log
    Log,
}

#[derive(Subcommand)]
enum CompanyCommand {
    Create { name: String },
    List,
}

#[derive(Subcommand)]
enum AccountCommand {
    Open {
        company: i64,
        #[arg(long, default_value = "0")]
        balance: Decimal,
    },
    List { company: i64 },
}

struct Ledger {
    store: LedgerStoreBox,
    registry: RegistryBox,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Logging is not up yet, so config errors go straight to stderr
    let mut config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => return Ok(report(e)),
    };
    if let Some(url) = cli.database_url.clone() {
        config.database.url = Some(url);
    }
    init_logging(&config.log);

    let migrate = matches!(cli.command, Command::Migrate);
    let ledger = match open_ledger(&config, cli.accounts.as_deref(), migrate).await {
        Ok(ledger) => ledger,
        Err(e) => return Ok(report(e)),
    };

    match run(cli.command, ledger, config).await {
        Ok(code) => Ok(code),
        Err(e) => Ok(report(e)),
    }
}

fn report(error: LedgerError) -> ExitCode {
    let code = error.kind().exit_code();
    eprintln!("{:?}", miette::Report::new(error));
    ExitCode::from(code)
}

async fn open_ledger(
    config: &AppConfig,
    accounts: Option<&Path>,
    migrate: bool,
) -> std::result::Result<Ledger, LedgerError> {
    if let Some(url) = config.database.url.as_deref() {
        #[cfg(feature = "storage-postgres")]
        {
            let ledger = PgLedger::connect(url, &config.database).await?;
            if migrate {
                ledger.migrate().await?;
            }
            if let Some(path) = accounts {
                seed_ledger(&ledger, AccountReader::new(File::open(path)?).seeds()).await?;
            }
            return Ok(Ledger {
                store: Box::new(ledger.clone()),
                registry: Box::new(ledger),
            });
        }
        #[cfg(not(feature = "storage-postgres"))]
        {
            let _ = url;
            tracing::warn!(
                "database URL given, but the 'storage-postgres' feature is not enabled; falling back to in-memory storage"
            );
        }
    }

    if migrate {
        tracing::info!("in-memory ledger has no schema to migrate");
    }

    let ledger = InMemoryLedger::with_lock_timeout(config.database.lock_timeout());
    if let Some(path) = accounts {
        let file = File::open(path)?;
        seed_ledger(&ledger, AccountReader::new(file).seeds()).await?;
    }
    Ok(Ledger {
        store: Box::new(ledger.clone()),
        registry: Box::new(ledger),
    })
}

async fn run(
    command: Command,
    ledger: Ledger,
    config: AppConfig,
) -> std::result::Result<ExitCode, LedgerError> {
    let Ledger { store, registry } = ledger;
    let engine = TransferEngine::with_config(store, config.engine);

    match command {
        Command::Transfer {
            source,
            target,
            amount,
        } => {
            let request = TransferRequest::new(AccountNumber(source), AccountNumber(target), amount)?;
            engine.transfer(request).await?;
            print_accounts(&registry, &[request.source(), request.target()]).await?;
        }
        Command::Batch { file } => {
            let requests = TransferReader::new(File::open(&file)?).read_all()?;
            tracing::info!(rows = requests.len(), file = %file.display(), "batch parsed");

            if let Err(failure) = engine.batch_transfer(&requests).await {
                let report = serde_json::to_string_pretty(&failure.report())
                    .map_err(|e| LedgerError::StoreError(e.to_string()))?;
                println!("{}", report);
                eprintln!("{}", failure);
                return Ok(ExitCode::from(failure.kind().exit_code()));
            }

            let mut touched = Vec::new();
            for request in &requests {
                for number in [request.source(), request.target()] {
                    if !touched.contains(&number) {
                        touched.push(number);
                    }
                }
            }
            print_accounts(&registry, &touched).await?;
        }
        Command::Migrate => {}
        Command::Company { command } => match command {
            CompanyCommand::Create { name } => {
                let company = registry.create_company(&name).await?;
                CompanyWriter::new(io::stdout().lock()).write_companies(&[company])?;
            }
            CompanyCommand::List => {
                let companies = registry.list_companies().await?;
                CompanyWriter::new(io::stdout().lock()).write_companies(&companies)?;
            }
        },
        Command::Account { command } => match command {
            AccountCommand::Open { company, balance } => {
                let opening = Balance::opening(balance)?;
                let account = registry.open_account(CompanyId(company), opening).await?;
                AccountWriter::new(io::stdout().lock()).write_accounts([account])?;
            }
            AccountCommand::List { company } => {
                let company = CompanyId(company);
                if registry.get_company(company).await?.is_none() {
                    return Err(LedgerError::CompanyNotFound(company));
                }
                let accounts = registry.list_accounts(company).await?;
                AccountWriter::new(io::stdout().lock()).write_accounts(accounts)?;
            }
        },
        Command::Log => {
            let entries = registry.ledger_entries().await?;
            EntryWriter::new(io::stdout().lock()).write_entries(&entries)?;
        }
    }

    Ok(ExitCode::SUCCESS)
}

async fn print_accounts(
    registry: &RegistryBox,
    numbers: &[AccountNumber],
) -> std::result::Result<(), LedgerError> {
    let mut accounts = Vec::with_capacity(numbers.len());
    for number in numbers {
        let account = registry
            .find_account(*number)
            .await?
            .ok_or(LedgerError::AccountNotFound(*number))?;
        accounts.push(account);
    }
    AccountWriter::new(io::stdout().lock()).write_accounts(accounts)?;
    Ok(())
}
