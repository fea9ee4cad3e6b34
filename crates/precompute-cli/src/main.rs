use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use precompute_api::config::DB_PATH_ENV;
use precompute_api::keys::CODEC_KEY_ENV;
use precompute_api::{
    load_config, ArtifactStore, EnvKeyProvider, FactLog, IdentityService, NullCache,
    StoreExecutor, API_CONTRACT_VERSION,
};
use precompute_core::codec::MIN_KEY_LEN;
use precompute_core::{
    CacheConfig, CanonicalId, CodecConfig, Fingerprint, IdentifierCodec, InvalidationScope,
    PersistentFact, PrecomputeConfig, RawIdentifier, SourceSystem, StoreConfig, TimeRange,
    Watermark,
};
use precompute_store_sqlite::SqliteStore;
use rand::RngCore;
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroize;

const LOG_ENV: &str = "PRECOMPUTE_LOG";
const DEFAULT_DB: &str = "./precompute.sqlite3";

#[derive(Debug, Parser)]
#[command(name = "precompute")]
#[command(about = "Precompute kernel admin CLI")]
struct Cli {
    /// SQLite file. Wins over `store.path` from the config file.
    #[arg(long)]
    db: Option<PathBuf>,

    /// YAML config file. Required by identity commands.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    /// Drop durable artifacts matching one scope.
    Invalidate(InvalidateArgs),
    Identity {
        #[command(subcommand)]
        command: IdentityCommand,
    },
    Codec {
        #[command(subcommand)]
        command: CodecCommand,
    },
    Facts {
        #[command(subcommand)]
        command: FactsCommand,
    },
    Claims {
        #[command(subcommand)]
        command: ClaimsCommand,
    },
    Artifacts {
        #[command(subcommand)]
        command: ArtifactsCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    Status,
    Migrate(DbMigrateArgs),
    Integrity,
    Backup(DbBackupArgs),
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct InvalidateArgs {
    #[arg(long)]
    fingerprint: Option<String>,
    #[arg(long)]
    kind: Option<String>,
    /// Artifacts computed from a watermark strictly below this one.
    #[arg(long)]
    before: Option<String>,
    #[arg(long)]
    all: bool,
}

#[derive(Debug, Subcommand)]
enum IdentityCommand {
    Resolve(RawArgs),
    Merge(MergeArgs),
    Override(OverrideArgs),
    Show(ShowArgs),
    Reviews,
}

#[derive(Debug, Args)]
struct RawArgs {
    #[arg(long)]
    source: SourceArg,
    #[arg(long)]
    value: String,
}

#[derive(Debug, Args)]
struct MergeArgs {
    #[arg(long)]
    left: String,
    #[arg(long)]
    right: String,
    #[arg(long)]
    writer: String,
    #[arg(long)]
    reason: String,
}

#[derive(Debug, Args)]
struct OverrideArgs {
    #[command(flatten)]
    raw: RawArgs,
    #[arg(long)]
    canonical_id: String,
    #[arg(long)]
    writer: String,
}

#[derive(Debug, Args)]
struct ShowArgs {
    #[arg(long)]
    canonical_id: String,
}

#[derive(Debug, Subcommand)]
enum CodecCommand {
    Encode(CodecArgs),
    Decode(CodecArgs),
    /// Print fresh hex key material for `PRECOMPUTE_CODEC_KEY`.
    Keygen(KeygenArgs),
}

#[derive(Debug, Args)]
struct CodecArgs {
    #[arg(long)]
    value: String,
    /// Defaults to `codec.key_id` from the config file.
    #[arg(long)]
    key_id: Option<String>,
}

#[derive(Debug, Args)]
struct KeygenArgs {
    #[arg(long, default_value_t = 32)]
    bytes: usize,
}

#[derive(Debug, Subcommand)]
enum FactsCommand {
    Append(FactAppendArgs),
    Query(FactQueryArgs),
}

#[derive(Debug, Args)]
struct FactAppendArgs {
    #[arg(long)]
    subject: String,
    #[arg(long)]
    kind: String,
    /// RFC 3339 timestamp.
    #[arg(long)]
    timestamp: String,
    /// JSON payload.
    #[arg(long)]
    payload: String,
}

#[derive(Debug, Args)]
struct FactQueryArgs {
    #[arg(long)]
    subject: String,
    #[arg(long)]
    from: String,
    #[arg(long)]
    to: String,
    #[arg(long)]
    kind: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ClaimsCommand {
    List,
    /// Delete claims whose lease has expired.
    Reap,
}

#[derive(Debug, Subcommand)]
enum ArtifactsCommand {
    /// Delete expired artifacts and stale failure memos.
    Purge,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SourceArg {
    Git,
    Github,
    Gitlab,
    Bitbucket,
    Jira,
}

impl From<SourceArg> for SourceSystem {
    fn from(value: SourceArg) -> Self {
        match value {
            SourceArg::Git => Self::Git,
            SourceArg::Github => Self::Github,
            SourceArg::Gitlab => Self::Gitlab,
            SourceArg::Bitbucket => Self::Bitbucket,
            SourceArg::Jira => Self::Jira,
        }
    }
}

/// Config file (when given) plus the resolved database path.
struct Settings {
    config: Option<PrecomputeConfig>,
    db: PathBuf,
}

impl Settings {
    fn load(cli: &Cli) -> Result<Self> {
        let config = cli.config.as_deref().map(load_config).transpose()?;
        let db = cli
            .db
            .clone()
            .or_else(|| config.as_ref().map(|config| config.store.path.clone()))
            .or_else(|| std::env::var_os(DB_PATH_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DB));
        Ok(Self { config, db })
    }

    fn require_config(&self, what: &str) -> Result<&PrecomputeConfig> {
        self.config
            .as_ref()
            .ok_or_else(|| anyhow!("{what} requires --config with a resolver section"))
    }

    fn cache_config(&self) -> CacheConfig {
        self.config.as_ref().map(|config| config.cache.clone()).unwrap_or_default()
    }

    fn key_id(&self, explicit: Option<&str>) -> String {
        explicit.map(str::to_string).unwrap_or_else(|| {
            self.config
                .as_ref()
                .map_or_else(|| CodecConfig::default().key_id, |config| config.codec.key_id.clone())
        })
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open(&self.db)
    }

    fn start_executor(&self) -> Result<Arc<StoreExecutor>> {
        let config = StoreConfig { path: self.db.clone(), workers: 1 };
        Ok(Arc::new(StoreExecutor::start(&config)?))
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(API_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": API_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let settings = Settings::load(&cli)?;
    match cli.command {
        Command::Db { command } => run_db(command, &settings),
        Command::Invalidate(args) => run_invalidate(&args, &settings).await,
        Command::Identity { command } => run_identity(command, &settings).await,
        Command::Codec { command } => run_codec(command, &settings),
        Command::Facts { command } => run_facts(command, &settings).await,
        Command::Claims { command } => run_claims(&command, &settings),
        Command::Artifacts { command } => run_artifacts(&command, &settings),
    }
}

fn run_db(command: DbCommand, settings: &Settings) -> Result<()> {
    let mut store = settings.open_store()?;
    match command {
        DbCommand::Status => {
            let status = store.schema_status()?;
            emit_json(serde_json::json!({
                "db_path": settings.db,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty()
            }))
        }
        DbCommand::Migrate(args) => run_db_migrate(&args, &mut store),
        DbCommand::Integrity => {
            let report = store.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
        DbCommand::Backup(args) => {
            store.migrate()?;
            store.backup_database(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
    }
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        return emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
        }));
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn parse_scope(args: &InvalidateArgs) -> Result<InvalidationScope> {
    if let Some(fingerprint) = &args.fingerprint {
        return Ok(InvalidationScope::Fingerprint(fingerprint.parse::<Fingerprint>()?));
    }
    if let Some(kind) = &args.kind {
        return Ok(InvalidationScope::QueryKind(kind.clone()));
    }
    if let Some(before) = &args.before {
        return Ok(InvalidationScope::WatermarkBefore(before.parse::<Watermark>()?));
    }
    if args.all {
        return Ok(InvalidationScope::All);
    }
    bail!("one of --fingerprint, --kind, --before or --all is required")
}

async fn run_invalidate(args: &InvalidateArgs, settings: &Settings) -> Result<()> {
    let scope = parse_scope(args)?;
    let artifacts =
        ArtifactStore::new(settings.start_executor()?, Arc::new(NullCache), settings.cache_config());
    let report = artifacts.invalidate(scope).await?;
    // Tier-1 lives inside each service process; entries there age out by TTL.
    emit_json(serde_json::json!({
        "scope": report.scope,
        "removed": report.removed,
        "removed_count": report.removed.len(),
        "tier1": "skipped"
    }))
}

fn raw_identifier(args: &RawArgs) -> Result<RawIdentifier> {
    Ok(RawIdentifier::new(args.source.into(), args.value.clone())?)
}

fn canonical_id(value: &str) -> Result<CanonicalId> {
    value.parse::<CanonicalId>().with_context(|| format!("invalid canonical id {value:?}"))
}

async fn run_identity(command: IdentityCommand, settings: &Settings) -> Result<()> {
    let config = settings.require_config("identity commands")?;
    let identities = IdentityService::new(settings.start_executor()?, &config.resolver)?;
    identities.sync().await?;

    match command {
        IdentityCommand::Resolve(args) => {
            let resolution = identities.resolve(&raw_identifier(&args)?).await?;
            emit_json(serde_json::to_value(&resolution)?)
        }
        IdentityCommand::Merge(args) => {
            let merged = identities
                .merge(
                    canonical_id(&args.left)?,
                    canonical_id(&args.right)?,
                    &args.writer,
                    &args.reason,
                )
                .await?;
            emit_json(serde_json::to_value(&merged)?)
        }
        IdentityCommand::Override(args) => {
            let raw = raw_identifier(&args.raw)?;
            let target = identities
                .set_override(&raw, canonical_id(&args.canonical_id)?, &args.writer)
                .await?;
            emit_json(serde_json::json!({
                "raw": raw,
                "alias_key": raw.alias_key(),
                "canonical_id": target
            }))
        }
        IdentityCommand::Show(args) => {
            let view = identities.show(canonical_id(&args.canonical_id)?).await?;
            emit_json(serde_json::to_value(&view)?)
        }
        IdentityCommand::Reviews => {
            let reviews = identities.pending_reviews().await?;
            emit_json(serde_json::json!({
                "count": reviews.len(),
                "reviews": reviews
            }))
        }
    }
}

fn run_codec(command: CodecCommand, settings: &Settings) -> Result<()> {
    match command {
        CodecCommand::Encode(args) => {
            let key_id = settings.key_id(args.key_id.as_deref());
            let codec = IdentifierCodec::new(Arc::new(EnvKeyProvider::default()), key_id.clone());
            let token = codec.encode(&args.value)?;
            emit_json(serde_json::json!({ "key_id": key_id, "token": token }))
        }
        CodecCommand::Decode(args) => {
            let key_id = settings.key_id(args.key_id.as_deref());
            let codec = IdentifierCodec::new(Arc::new(EnvKeyProvider::default()), key_id.clone());
            let identifier = codec.decode(&args.value)?;
            emit_json(serde_json::json!({ "key_id": key_id, "identifier": identifier }))
        }
        CodecCommand::Keygen(args) => {
            if args.bytes < MIN_KEY_LEN {
                bail!("codec keys need at least {MIN_KEY_LEN} bytes, got {}", args.bytes);
            }
            let mut key = vec![0_u8; args.bytes];
            rand::rngs::OsRng.fill_bytes(&mut key);
            let encoded = hex::encode(&key);
            key.zeroize();
            emit_json(serde_json::json!({
                "bytes": args.bytes,
                "env": CODEC_KEY_ENV,
                "key_hex": encoded
            }))
        }
    }
}

fn parse_timestamp(flag: &str, value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &Rfc3339)
        .with_context(|| format!("--{flag} must be an RFC 3339 timestamp, got {value:?}"))
}

async fn run_facts(command: FactsCommand, settings: &Settings) -> Result<()> {
    let facts = FactLog::new(settings.start_executor()?);
    match command {
        FactsCommand::Append(args) => {
            let payload: Value = serde_json::from_str(&args.payload)
                .context("--payload must be valid JSON")?;
            let fact = PersistentFact::new(
                args.subject,
                args.kind,
                parse_timestamp("timestamp", &args.timestamp)?,
                payload,
            );
            let outcome = facts.append(fact.clone()).await?;
            emit_json(serde_json::json!({ "status": outcome, "fact": fact }))
        }
        FactsCommand::Query(args) => {
            let range = TimeRange::new(
                parse_timestamp("from", &args.from)?,
                parse_timestamp("to", &args.to)?,
            )?;
            let found = facts.query(&args.subject, range, args.kind.as_deref()).await?;
            emit_json(serde_json::json!({
                "subject_id": args.subject,
                "range": range,
                "count": found.len(),
                "facts": found
            }))
        }
    }
}

fn run_claims(command: &ClaimsCommand, settings: &Settings) -> Result<()> {
    let mut store = settings.open_store()?;
    store.migrate()?;
    match command {
        ClaimsCommand::List => {
            let now = OffsetDateTime::now_utc();
            let claims = store.list_claims()?;
            let expired = claims.iter().filter(|claim| !claim.is_live(now)).count();
            emit_json(serde_json::json!({
                "count": claims.len(),
                "expired": expired,
                "claims": claims
            }))
        }
        ClaimsCommand::Reap => {
            let reaped = store.reap_expired_claims(OffsetDateTime::now_utc())?;
            emit_json(serde_json::json!({ "reaped": reaped }))
        }
    }
}

fn run_artifacts(command: &ArtifactsCommand, settings: &Settings) -> Result<()> {
    let mut store = settings.open_store()?;
    store.migrate()?;
    match command {
        ArtifactsCommand::Purge => {
            let now = OffsetDateTime::now_utc();
            let purged = store.purge_expired_artifacts(now)?;
            let failures = store.purge_expired_failures(now)?;
            emit_json(serde_json::json!({
                "purged_artifacts": purged,
                "purged_count": purged.len(),
                "purged_failures": failures
            }))
        }
    }
}
