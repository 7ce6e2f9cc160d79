use std::{env, time::Duration};

use anyhow::{bail, Context};
use ferris_contract_stream::{
    config::Config as StreamConfig, rest::ContractsClient, AuthToken, ConsumerEvent,
    PriceConsumer, PriceRequest, PriceSession,
};
use tokio::{signal, time::Instant};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

mod cli;


use cli::print_usage;

pub(crate) use cli::{parse_args, Config, Mode, ParseResult};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let parse_result = match parse_args(&args) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("error: {err}\n");
            print_usage();
            std::process::exit(2);
        }
    };

    match parse_result {
        ParseResult::Help => {
            print_usage();
            Ok(())
        }
        ParseResult::Run(config) => {
            init_tracing();
            run(config).await
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();
}

async fn run(config: Config) -> anyhow::Result<()> {
    let mut settings = StreamConfig::from_env().context("failed to load configuration")?;
    if let Some(stream_url) = config.stream_url.clone() {
        settings.stream_url = stream_url;
    }
    if let Some(rest_url) = config.rest_url.as_deref() {
        settings.rest_base_url = rest_url.trim_end_matches('/').to_string();
    }

    let token = config
        .token
        .clone()
        .map(AuthToken::from)
        .or_else(|| settings.auth_token.clone())
        .context("an auth token is required (pass --token or set AUTH_TOKEN)")?;

    println!("mode={}", config.mode.as_str());

    match config.mode {
        Mode::Watch => watch_prices(&config, &settings, token).await,
        Mode::Details => {
            let client = contracts_client(&settings)?;
            let contract_id = required_contract_id(&config)?;
            let details = client
                .fetch_contract_details(&token, contract_id)
                .await
                .with_context(|| format!("failed to fetch contract `{contract_id}`"))?;
            println!("{}", serde_json::to_string_pretty(&details)?);
            Ok(())
        }
        Mode::Sell => {
            let client = contracts_client(&settings)?;
            let contract_id = required_contract_id(&config)?;
            let receipt = client
                .sell_contract(&token, contract_id)
                .await
                .with_context(|| format!("failed to sell contract `{contract_id}`"))?;
            println!("{}", serde_json::to_string_pretty(&receipt)?);
            Ok(())
        }
    }
}

async fn watch_prices(
    config: &Config,
    settings: &StreamConfig,
    token: AuthToken,
) -> anyhow::Result<()> {
    let request = PriceRequest::new(
        config.instrument.clone(),
        config.trade_type,
        config.duration,
        config.currency.clone(),
        config.payout,
        config.strike,
    );

    let session = PriceSession::from_config(settings);
    let mut consumer = PriceConsumer::activate(&session, token, request)
        .await
        .context("failed to subscribe to contract price")?;

    info!(key = %consumer.key(), stream_url = %settings.stream_url, "watching contract price");
    if let Some(duration_secs) = config.duration_secs {
        println!("will stop after {duration_secs}s");
    }
    if let Some(iterations) = config.iterations {
        println!("will stop after {iterations} updates");
    }
    println!("press Ctrl+C to stop\n");

    let deadline = config
        .duration_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    let mut updates = 0u64;

    loop {
        let event = tokio::select! {
            event = consumer.next_event() => event,
            _ = wait_for_deadline(deadline) => break,
            _ = signal::ctrl_c() => {
                info!("interrupt received");
                break;
            }
        };

        let Some(event) = event else {
            bail!("price session stopped unexpectedly");
        };

        match event {
            ConsumerEvent::Price(price) => {
                updates += 1;
                println!(
                    "{} price={} key={}",
                    price.datetime.as_deref().unwrap_or("-"),
                    price.price,
                    price.key
                );
                if config.iterations.is_some_and(|limit| updates >= limit) {
                    break;
                }
            }
            ConsumerEvent::Connected => println!("connected"),
            ConsumerEvent::Disconnected => println!("disconnected; last price is now stale"),
            ConsumerEvent::Error(err) => eprintln!("stream error: {err}"),
        }
    }

    consumer
        .deactivate()
        .await
        .context("failed to release contract price")?;
    session.close().await.context("failed to close price session")?;
    Ok(())
}

async fn wait_for_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

fn contracts_client(settings: &StreamConfig) -> anyhow::Result<ContractsClient> {
    ContractsClient::new(settings.rest_base_url.clone(), settings.request_timeout_ms)
        .context("failed to build contracts client")
}

fn required_contract_id(config: &Config) -> anyhow::Result<&str> {
    config
        .contract_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .context("`--contract-id` is required")
}
