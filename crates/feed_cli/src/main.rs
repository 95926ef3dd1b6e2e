use std::{sync::Arc, time::Duration};

use chrono::{Days, Utc};
use chrono_tz::Tz;
use feed_client::{Credentials, HttpFeed, MemoryFeed};
use feed_engine::{Classification, FeedEngine, InvalidationBus, Money, NewTransaction, RemoteFeed};

use crate::{
    config::AppConfig,
    error::{AppError, Result},
};

mod config;
mod error;
mod quick_add;
mod repl;

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load()?;

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(format!(
            "feed_engine={level},feed_client={level},feed_cli={level}",
            level = config.level
        ))
        .init();

    let timezone: Tz = config
        .timezone
        .parse()
        .map_err(|_| AppError::Timezone(config.timezone.clone()))?;

    let (remote, memory) = backend(&config, timezone)?;
    let engine = FeedEngine::builder()
        .remote(remote)
        .config(config.feed.clone())
        .build()?;
    let bus = InvalidationBus::new();
    let listener = engine.listen(&bus);

    let mut repl = repl::Repl::new(engine.clone(), bus, memory, timezone);
    let result = repl.run().await;

    engine.shutdown();
    if let Err(err) = listener.await {
        tracing::error!("invalidation listener failed: {err}");
    }
    result
}

fn backend(
    config: &AppConfig,
    timezone: Tz,
) -> Result<(Arc<dyn RemoteFeed>, Option<Arc<MemoryFeed>>)> {
    if config.offline {
        tracing::info!("running against the in-process feed");
        let memory = Arc::new(
            MemoryFeed::new()
                .with_latency(Duration::from_millis(300))
                .with_indexing_lag(Duration::from_secs(1)),
        );
        memory.seed(demo_rows(timezone));
        let remote: Arc<dyn RemoteFeed> = memory.clone();
        return Ok((remote, Some(memory)));
    }

    let credentials = match (&config.access_token, &config.refresh_token) {
        (Some(access_token), Some(refresh_token)) => Credentials::Session {
            access_token: access_token.clone(),
            refresh_token: refresh_token.clone(),
        },
        _ => Credentials::Basic {
            username: config.username.clone(),
            password: config.password.clone().unwrap_or_default(),
        },
    };
    tracing::info!("connecting to {}", config.base_url);
    let remote: Arc<dyn RemoteFeed> = Arc::new(HttpFeed::new(&config.base_url, credentials)?);
    Ok((remote, None))
}

fn demo_rows(timezone: Tz) -> Vec<NewTransaction> {
    let today = Utc::now().with_timezone(&timezone).date_naive();
    let rows = [
        (Classification::Income, 180_000, 24, "salary", "Monthly salary"),
        (Classification::Expense, 75_000, 20, "rent", "Rent"),
        (Classification::Expense, 6_420, 9, "groceries", "Weekly shop"),
        (Classification::Expense, 1_250, 6, "transport", "Train ticket"),
        (Classification::Expense, 380, 2, "bar", "Coffee"),
        (Classification::Income, 4_000, 1, "refund", "Returned shoes"),
        (Classification::Expense, 2_990, 0, "dining", "Pizza night"),
    ];
    rows.into_iter()
        .map(|(classification, cents, days_ago, category, description)| {
            let occurred_on = today.checked_sub_days(Days::new(days_ago)).unwrap_or(today);
            NewTransaction {
                category: Some(category.to_string()),
                description: Some(description.to_string()),
                ..NewTransaction::new(classification, Money::new(cents), occurred_on)
            }
        })
        .collect()
}
