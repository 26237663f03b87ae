use anyhow::Result;
use clap::Parser;
use daemon::ad_placement::AdPlacement;
use daemon::cancellation_reissue::CancellationReissue;
use daemon::chat_automation::ChatAutomation;
use daemon::config::Config;
use daemon::context::AppContext;
use daemon::email_client::HttpEmailClient;
use daemon::gate_balance_setter::GateBalanceSetter;
use daemon::order_discovery::OrderDiscovery;
use daemon::payout_intake::{AutoApprove, PayoutIntake};
use daemon::pdf_parser::RealPdfTextExtractor;
use daemon::receipt_processor::ReceiptProcessor;
use daemon::release_engine::ReleaseEngine;
use daemon::scheduler::{Scheduler, TaskDef};
use daemon::store::{SqliteStore, Store};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
struct Opts {
    /// Path to the TOML configuration file.
    #[clap(long, default_value = "config.toml")]
    config: PathBuf,

    /// SQLite connection string. Overrides `DATABASE_URL`.
    #[clap(long, env = "DATABASE_URL", default_value = "sqlite://trader-agent.sqlite")]
    database_url: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let opts = Opts::parse();
    let config = Config::load(Some(&opts.config))?;

    let store: Arc<dyn Store> = Arc::new(SqliteStore::connect(&opts.database_url).await?);
    let ctx = AppContext::new(store, config);

    let email: Arc<dyn daemon::email_client::EmailClient> = Arc::new(HttpEmailClient::new(
        ctx.config.email.base_url.clone(),
        ctx.config.email.api_key.clone(),
    ));
    let pdf = Arc::new(RealPdfTextExtractor);

    let payout_intake = Arc::new(PayoutIntake::new(
        ctx.store.clone(),
        ctx.registry.clone(),
        Arc::new(AutoApprove),
    ));
    let ad_placement = Arc::new(AdPlacement::new(
        ctx.store.clone(),
        ctx.registry.clone(),
        ctx.config.clone(),
    ));
    let chat_automation = Arc::new(ChatAutomation::new(
        ctx.store.clone(),
        ctx.registry.clone(),
        ctx.events.clone(),
    ));
    let order_discovery = Arc::new(OrderDiscovery::new(
        ctx.store.clone(),
        ctx.registry.clone(),
        chat_automation.clone(),
        ctx.events.clone(),
    ));
    let receipt_processor = Arc::new(ReceiptProcessor::new(
        ctx.store.clone(),
        email,
        pdf,
        ctx.events.clone(),
        ctx.config.clone(),
    ));
    let release_engine = Arc::new(ReleaseEngine::new(
        ctx.store.clone(),
        ctx.registry.clone(),
        ctx.events.clone(),
    ));
    let cancellation_reissue = Arc::new(CancellationReissue::new(
        ctx.store.clone(),
        ctx.registry.clone(),
        ctx.events.clone(),
    ));
    let gate_balance_setter = Arc::new(GateBalanceSetter::new(
        ctx.store.clone(),
        ctx.registry.clone(),
        ctx.config.clone(),
    ));

    let mut scheduler = Scheduler::new();
    let intervals = &ctx.config.orchestrator.intervals;

    scheduler.register(
        TaskDef {
            id: "work_acceptor".into(),
            interval: Duration::from_secs(intervals.work_acceptor),
            run_on_start: false,
        },
        {
            let payout_intake = payout_intake.clone();
            Arc::new(move || {
                let payout_intake = payout_intake.clone();
                Box::pin(async move { payout_intake.run().await })
            })
        },
    );
    scheduler.register(
        TaskDef {
            id: "payouts_sync".into(),
            interval: Duration::from_secs(intervals.work_acceptor),
            run_on_start: false,
        },
        {
            let payout_intake = payout_intake.clone();
            Arc::new(move || {
                let payout_intake = payout_intake.clone();
                Box::pin(async move { payout_intake.sync().await })
            })
        },
    );
    scheduler.register(
        TaskDef {
            id: "ad_creator".into(),
            interval: Duration::from_secs(intervals.ad_creator),
            run_on_start: false,
        },
        {
            let ad_placement = ad_placement.clone();
            Arc::new(move || {
                let ad_placement = ad_placement.clone();
                Box::pin(async move { ad_placement.run().await })
            })
        },
    );
    scheduler.register(
        TaskDef {
            id: "order_checker".into(),
            interval: Duration::from_secs(intervals.order_checker),
            run_on_start: false,
        },
        {
            let order_discovery = order_discovery.clone();
            Arc::new(move || {
                let order_discovery = order_discovery.clone();
                Box::pin(async move { order_discovery.run().await })
            })
        },
    );
    scheduler.register(
        TaskDef {
            id: "chat_processor".into(),
            interval: Duration::from_secs(intervals.chat_processor),
            run_on_start: false,
        },
        {
            let chat_automation = chat_automation.clone();
            Arc::new(move || {
                let chat_automation = chat_automation.clone();
                Box::pin(async move { chat_automation.run().await })
            })
        },
    );
    scheduler.register(
        TaskDef {
            id: "receipt_processor".into(),
            interval: Duration::from_secs(intervals.receipt_processor),
            run_on_start: false,
        },
        {
            let receipt_processor = receipt_processor.clone();
            Arc::new(move || {
                let receipt_processor = receipt_processor.clone();
                Box::pin(async move { receipt_processor.run().await })
            })
        },
    );
    scheduler.register(
        TaskDef {
            id: "successer".into(),
            interval: Duration::from_secs(intervals.successer),
            run_on_start: false,
        },
        {
            let release_engine = release_engine.clone();
            Arc::new(move || {
                let release_engine = release_engine.clone();
                Box::pin(async move { release_engine.run().await })
            })
        },
    );
    scheduler.register(
        TaskDef {
            id: "cancellation_reissue".into(),
            interval: Duration::from_secs(intervals.order_checker),
            run_on_start: false,
        },
        {
            let cancellation_reissue = cancellation_reissue.clone();
            Arc::new(move || {
                let cancellation_reissue = cancellation_reissue.clone();
                Box::pin(async move { cancellation_reissue.run().await })
            })
        },
    );
    scheduler.register(
        TaskDef {
            id: "gate_balance_setter".into(),
            interval: Duration::from_secs(intervals.gate_balance_setter),
            run_on_start: false,
        },
        {
            let gate_balance_setter = gate_balance_setter.clone();
            Arc::new(move || {
                let gate_balance_setter = gate_balance_setter.clone();
                Box::pin(async move { gate_balance_setter.run().await })
            })
        },
    );

    // Wire up accounts, then explicitly run payouts_sync, work_acceptor,
    // and ad_creator once, in that order, before the periodic ticker starts
    // -- otherwise the first tick could race account client setup.
    ctx.registry.boot().await?;
    scheduler.trigger_and_wait("payouts_sync").await;
    scheduler.trigger_and_wait("work_acceptor").await;
    scheduler.trigger_and_wait("ad_creator").await;

    if !ctx.config.orchestrator.start_paused {
        scheduler.start().await;
    }

    info!("trader-agent running");
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    scheduler.stop(None).await;

    Ok(())
}
