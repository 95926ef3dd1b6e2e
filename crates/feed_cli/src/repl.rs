use std::sync::Arc;

use chrono::Utc;
use chrono_tz::Tz;
use feed_client::MemoryFeed;
use feed_engine::{
    Classification, FeedEngine, FeedError, FeedFilter, FeedView, Fingerprint, InvalidationBus,
    Money, MutationOutcome, TransactionPatch, TxId,
};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::{error::Result, quick_add};

const HELP: &str = "\
commands:
  list [expense|income] [search..]   show a feed
  more                               load the next page
  add <amount> [#tag] [note]         +amount for income
  rm <id>                            delete a row
  edit <id> <amount>                 change the amount
  show <id>                          authoritative detail
  online | offline                   toggle connectivity
  logout                             drop the cache
  quit";

enum Command {
    List(FeedFilter),
    More,
    Add(String),
    Remove(TxId),
    Edit(TxId, Money),
    Show(TxId),
    Online(bool),
    Logout,
    Help,
    Quit,
}

fn parse_command(line: &str) -> std::result::Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Ok(Command::Help);
    };
    let id = |word: Option<&str>| -> std::result::Result<TxId, String> {
        word.ok_or_else(|| "missing id".to_string())?
            .parse::<TxId>()
            .map_err(|err| err.to_string())
    };

    match head {
        "list" | "ls" => {
            let mut filter = FeedFilter::all();
            let rest: Vec<&str> = words.collect();
            let search = match rest.split_first() {
                Some((&first, tail)) => match Classification::try_from(first) {
                    Ok(classification) => {
                        filter = filter.classification(classification);
                        tail.join(" ")
                    }
                    Err(_) => rest.join(" "),
                },
                None => String::new(),
            };
            Ok(Command::List(filter.search(&search)))
        }
        "more" => Ok(Command::More),
        "add" => Ok(Command::Add(words.collect::<Vec<_>>().join(" "))),
        "rm" => Ok(Command::Remove(id(words.next())?)),
        "edit" => {
            let target = id(words.next())?;
            let amount = words
                .next()
                .ok_or_else(|| "missing amount".to_string())?
                .parse::<Money>()
                .map_err(|err| err.to_string())?;
            Ok(Command::Edit(target, amount))
        }
        "show" => Ok(Command::Show(id(words.next())?)),
        "online" => Ok(Command::Online(true)),
        "offline" => Ok(Command::Online(false)),
        "logout" => Ok(Command::Logout),
        "help" | "?" => Ok(Command::Help),
        "quit" | "exit" | "q" => Ok(Command::Quit),
        other => Err(format!("unknown command: {other}")),
    }
}

/// Line-oriented driver over a [`FeedEngine`].
pub struct Repl {
    engine: FeedEngine,
    bus: InvalidationBus,
    memory: Option<Arc<MemoryFeed>>,
    timezone: Tz,
    current: Fingerprint,
}

impl Repl {
    pub fn new(
        engine: FeedEngine,
        bus: InvalidationBus,
        memory: Option<Arc<MemoryFeed>>,
        timezone: Tz,
    ) -> Self {
        Self {
            engine,
            bus,
            memory,
            timezone,
            current: Fingerprint::transactions(FeedFilter::all()),
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        println!("{HELP}");
        self.show_feed(self.current.clone()).await;

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Some(line) = lines.next_line().await? {
            let command = match parse_command(&line) {
                Ok(command) => command,
                Err(err) => {
                    println!("! {err}");
                    continue;
                }
            };
            if matches!(command, Command::Quit) {
                break;
            }
            self.execute(command).await;
        }
        Ok(())
    }

    async fn execute(&mut self, command: Command) {
        match command {
            Command::List(filter) => {
                if let Err(err) = filter.validate() {
                    println!("! {err}");
                    return;
                }
                self.show_feed(Fingerprint::transactions(filter)).await;
            }
            Command::More => {
                let result = self.engine.load_more(&self.current).await;
                self.report(result.map(|outcome| tracing::debug!("load more: {outcome:?}")));
                self.print(&self.engine.view(&self.current));
            }
            Command::Add(input) => match quick_add::parse(&input) {
                Ok(parsed) => {
                    let today = Utc::now().with_timezone(&self.timezone).date_naive();
                    let engine = self.engine.clone();
                    let entity = parsed.into_new(today);
                    self.in_background(async move { engine.create(entity).await })
                        .await;
                }
                Err(err) => println!("! {err}"),
            },
            Command::Remove(id) => {
                let engine = self.engine.clone();
                self.in_background(async move { engine.delete(id).await })
                    .await;
            }
            Command::Edit(id, amount) => {
                let patch = TransactionPatch {
                    amount: Some(amount),
                    ..TransactionPatch::default()
                };
                let result = self.engine.update(id, patch).await;
                self.report(result.map(|outcome| print_outcome(&outcome)));
                self.print(&self.engine.view(&self.current));
            }
            Command::Show(id) => match self.engine.detail(&id).await {
                Ok(tx) => println!("{tx:#?}"),
                Err(err) => self.report(Err(err)),
            },
            Command::Online(online) => {
                if let Some(memory) = &self.memory {
                    memory.set_reachable(online);
                }
                self.bus.set_online(online);
                println!("{}", if online { "online" } else { "offline" });
            }
            Command::Logout => {
                self.bus.session_cleared();
                println!("logged out");
            }
            Command::Help => println!("{HELP}"),
            Command::Quit => {}
        }
    }

    async fn show_feed(&mut self, fp: Fingerprint) {
        if fp != self.current {
            self.engine.release(&self.current);
            self.current = fp;
        }
        let view = self.engine.observe(&self.current);
        if view.stale || view.loading {
            let result = self.engine.refresh(&self.current).await;
            self.report(result.map(|_| ()));
        }
        self.print(&self.engine.view(&self.current));
    }

    /// Runs a mutation without waiting for the server and prints the
    /// optimistic view right away.
    async fn in_background<F>(&self, mutation: F)
    where
        F: Future<Output = std::result::Result<MutationOutcome, FeedError>> + Send + 'static,
    {
        let bus = self.bus.clone();
        tokio::spawn(async move {
            match mutation.await {
                Ok(outcome) => print_outcome(&outcome),
                Err(err) => {
                    println!("! {err}");
                    if err.is_session_expired() {
                        bus.session_cleared();
                    }
                }
            }
        });
        tokio::task::yield_now().await;
        self.print(&self.engine.view(&self.current));
    }

    fn report(&self, result: std::result::Result<(), FeedError>) {
        let Err(err) = result else {
            return;
        };
        let retry = if err.is_retryable() { " (retry?)" } else { "" };
        println!("! {err}{retry}");
        if err.is_session_expired() {
            self.bus.session_cleared();
        }
    }

    fn print(&self, view: &FeedView) {
        let mut flags = Vec::new();
        if view.has_more {
            flags.push("more");
        }
        if view.loading {
            flags.push("loading");
        }
        if view.stale {
            flags.push("stale");
        }
        println!(
            "== {} [{}/{}] {}",
            view.fingerprint,
            view.items.len(),
            view.total,
            flags.join(" ")
        );
        for tx in &view.items {
            let sign = match tx.classification {
                Classification::Income => '+',
                Classification::Expense => '-',
            };
            let pending = if tx.is_provisional() { " (pending)" } else { "" };
            println!(
                "  {:<24} {} {sign}{:>10} {:<12} {}{pending}",
                tx.id.to_string(),
                tx.occurred_on,
                tx.amount.to_string(),
                tx.category.as_deref().unwrap_or("-"),
                tx.note
                    .as_deref()
                    .or(tx.description.as_deref())
                    .unwrap_or(""),
            );
        }
        if let Some(err) = &view.error {
            println!("  ! last fetch failed: {err}");
        }
    }
}

fn print_outcome(outcome: &MutationOutcome) {
    match outcome {
        MutationOutcome::Created { temp, entity } => println!("+ {temp} saved as {}", entity.id),
        MutationOutcome::Updated(entity) => println!("~ {} updated", entity.id),
        MutationOutcome::Deleted(id) => println!("- {id} deleted"),
    }
}
