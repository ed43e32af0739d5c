use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context};
use colored::Colorize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::info;

use cdn_crypto::Secret;
use cdn_meta::{FileMetadataStore, InMemoryMetadataStore, MetadataStore};
use cdn_store::{BufferPolicy, DriverRegistry, StorageUnit, UnitContext};
use cdn_sync::{ingest, read_item, SyncEngine};
use cdn_types::{Clock, ItemId, MonitoringStatusLine, StatusLevel, SystemClock, UnitId, UnitRole};

use crate::cli::*;
use crate::config::{CdnConfig, MetadataConfig};

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let format = cli.format;
    let command = match cli.command {
        Command::Keygen => return cmd_keygen(format),
        command => command,
    };

    let config = CdnConfig::load(&cli.config)?;
    let service = Service::open(&config).await?;
    match command {
        Command::Check => cmd_check(&config, &service, format),
        Command::Status => cmd_status(&service, format).await,
        Command::Put(args) => cmd_put(&service, args, format).await,
        Command::Get(args) => cmd_get(&service, args).await,
        Command::Sync(args) => cmd_sync(&service, args, format).await,
        Command::Evict => cmd_evict(&service, format).await,
        Command::Retry(args) => cmd_retry(&service, args, format).await,
        Command::Keygen => cmd_keygen(format),
    }
}

/// Everything a command needs, built from one configuration.
pub struct Service {
    pub metadata: Arc<dyn MetadataStore>,
    pub clock: Arc<dyn Clock>,
    pub engine: Arc<SyncEngine>,
}

impl Service {
    pub async fn open(config: &CdnConfig) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let metadata: Arc<dyn MetadataStore> = match &config.metadata {
            MetadataConfig::File { path } => Arc::new(
                FileMetadataStore::open(path, clock.clone())
                    .with_context(|| format!("opening metadata {}", path.display()))?,
            ),
            MetadataConfig::Memory => Arc::new(InMemoryMetadataStore::with_clock(clock.clone())),
        };

        let registry = DriverRegistry::with_builtin();
        let ctx = UnitContext::new(metadata.clone());
        let mut buffer = None;
        let mut targets = Vec::new();
        let mut policy = BufferPolicy::default();
        for unit_config in &config.units {
            let unit = registry
                .init_unit(ctx.clone(), unit_config)
                .await
                .with_context(|| format!("starting unit {}", unit_config.name))?;
            match unit_config.role {
                UnitRole::Buffer => {
                    policy = unit_config.buffer_policy();
                    buffer = Some(unit);
                }
                UnitRole::Durable => targets.push(unit),
            }
        }
        let buffer = buffer.context("no buffer unit configured")?;

        let engine = SyncEngine::new(
            buffer,
            targets,
            metadata.clone(),
            clock.clone(),
            config.sync.clone(),
            policy,
        )?;
        Ok(Self {
            metadata,
            clock,
            engine: Arc::new(engine),
        })
    }

    /// Buffer first, then durable units in configuration order.
    pub fn units(&self) -> impl Iterator<Item = &Arc<dyn StorageUnit>> {
        std::iter::once(self.engine.buffer()).chain(self.engine.targets())
    }

    pub fn unit(&self, id: &UnitId) -> anyhow::Result<&Arc<dyn StorageUnit>> {
        self.units()
            .find(|u| u.id() == id)
            .with_context(|| format!("no unit named {id}"))
    }

    /// The first unit holding a copy of `item`.
    pub async fn locate(&self, item: ItemId) -> anyhow::Result<&Arc<dyn StorageUnit>> {
        for unit in self.units() {
            if self.metadata.lookup_binding(item, unit.id()).await?.is_some() {
                return Ok(unit);
            }
        }
        bail!("item {item} has no copy on any unit")
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Cancelled on Ctrl-C.
fn interrupt_token() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping");
            trigger.cancel();
        }
    });
    cancel
}

fn cmd_check(config: &CdnConfig, service: &Service, format: OutputFormat) -> anyhow::Result<()> {
    #[derive(Serialize)]
    struct UnitSummary<'a> {
        name: &'a UnitId,
        role: UnitRole,
        driver: &'static str,
        encrypted: bool,
    }

    let units: Vec<UnitSummary<'_>> = config
        .units
        .iter()
        .map(|u| UnitSummary {
            name: &u.name,
            role: u.role,
            driver: u.driver.driver_name(),
            encrypted: u.encryption.is_some(),
        })
        .collect();

    if format == OutputFormat::Json {
        return print_json(&units);
    }
    for unit in &units {
        let lock = if unit.encrypted { " encrypted" } else { "" };
        println!(
            "{} {} ({} {}{})",
            "✓".green().bold(),
            unit.name.as_str().bold(),
            unit.role,
            unit.driver,
            lock
        );
    }
    println!(
        "{} eviction after {} of {} durable copies",
        "✓".green().bold(),
        service.engine.required_replicas(),
        service.engine.targets().count()
    );
    Ok(())
}

async fn cmd_status(service: &Service, format: OutputFormat) -> anyhow::Result<()> {
    let lines = service.engine.status().await;
    if format == OutputFormat::Json {
        return print_json(&lines);
    }
    for line in &lines {
        print_status_line(line);
    }
    Ok(())
}

fn print_status_line(line: &MonitoringStatusLine) {
    let level = match line.status {
        StatusLevel::Ok => format!("{:<5}", "OK").green().bold(),
        StatusLevel::Warn => format!("{:<5}", "WARN").yellow().bold(),
        StatusLevel::Alert => format!("{:<5}", "ALERT").red().bold(),
    };
    println!("{level} {:<32} {}", line.component, line.value);
}

async fn cmd_put(service: &Service, args: PutArgs, format: OutputFormat) -> anyhow::Result<()> {
    let content = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("reading {}", args.file.display()))?;
    let item = ingest(
        service.engine.buffer().as_ref(),
        service.metadata.as_ref(),
        service.clock.as_ref(),
        args.item_type,
        &content,
    )
    .await?;

    if format == OutputFormat::Json {
        return print_json(&item);
    }
    let locator = item.locator().map(|l| l.as_str()).unwrap_or_default();
    println!("{} Stored {}", "✓".green().bold(), item.id().to_string().bold());
    println!("  type:    {}", item.item_type());
    println!("  size:    {} bytes", content.len());
    println!("  locator: {locator}");
    Ok(())
}

async fn cmd_get(service: &Service, args: GetArgs) -> anyhow::Result<()> {
    let unit = match &args.unit {
        Some(id) => service.unit(id)?,
        None => service.locate(args.item).await?,
    };
    let content = read_item(unit.as_ref(), service.metadata.as_ref(), args.item).await?;
    match &args.out {
        Some(path) => write_out(path, &content).await?,
        None => std::io::stdout().lock().write_all(&content)?,
    }
    info!(item = %args.item, unit = %unit.id(), bytes = content.len(), "item read");
    Ok(())
}

async fn write_out(path: &Path, content: &[u8]) -> anyhow::Result<()> {
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

async fn cmd_sync(service: &Service, args: SyncArgs, format: OutputFormat) -> anyhow::Result<()> {
    let cancel = interrupt_token();
    if args.watch {
        info!(
            interval_secs = service.engine.config().interval_secs,
            "watching for new items"
        );
        service.engine.clone().run(cancel).await;
        return Ok(());
    }

    let cycle = service.engine.run_cycle(&cancel).await?;
    let eviction = service.engine.evict_cycle(&cancel).await?;
    if format == OutputFormat::Json {
        return print_json(&serde_json::json!({ "sync": cycle, "eviction": eviction }));
    }

    let mark = if cycle.failed == 0 && cycle.needs_attention == 0 {
        "✓".green().bold()
    } else {
        "!".yellow().bold()
    };
    println!(
        "{mark} Replication: {} bound, {} already bound, {} failed",
        cycle.bound, cycle.already_bound, cycle.failed
    );
    if cycle.lease_held + cycle.deferred + cycle.needs_attention + cycle.not_ready > 0 {
        println!(
            "  skipped: {} leased elsewhere, {} backing off, {} need attention, {} not ready",
            cycle.lease_held, cycle.deferred, cycle.needs_attention, cycle.not_ready
        );
    }
    println!(
        "{} Eviction: {} evicted, {} retained, {} errors",
        "✓".green().bold(),
        eviction.evicted,
        eviction.retained,
        eviction.errors
    );
    Ok(())
}

async fn cmd_evict(service: &Service, format: OutputFormat) -> anyhow::Result<()> {
    let report = service.engine.evict_cycle(&interrupt_token()).await?;
    if format == OutputFormat::Json {
        return print_json(&report);
    }
    println!(
        "{} {} evicted, {} retained, {} errors",
        "✓".green().bold(),
        report.evicted,
        report.retained,
        report.errors
    );
    Ok(())
}

async fn cmd_retry(service: &Service, args: RetryArgs, format: OutputFormat) -> anyhow::Result<()> {
    service.unit(&args.unit)?;
    let cleared = service.engine.retry(args.item, &args.unit).await?;
    if format == OutputFormat::Json {
        return print_json(&serde_json::json!({ "cleared": cleared }));
    }
    if cleared {
        println!(
            "{} {} will be retried on {}",
            "✓".green().bold(),
            args.item,
            args.unit
        );
    } else {
        println!("{} no failure recorded for {} on {}", "·".dimmed(), args.item, args.unit);
    }
    Ok(())
}

fn cmd_keygen(format: OutputFormat) -> anyhow::Result<()> {
    let secret = Secret::generate().to_hex();
    if format == OutputFormat::Json {
        return print_json(&serde_json::json!({ "secret": secret }));
    }
    println!("{secret}");
    Ok(())
}
