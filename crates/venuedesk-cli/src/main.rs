//! venuedesk - command-line access to venue administration data.
//!
//! Every command runs through the core sync layer, so reads are cached for
//! the session, writes invalidate what they touch and failures are reported
//! as classified error records.

mod render;

use std::io;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use venuedesk_core::api::{ApiClient, EntityService, Resource};
use venuedesk_core::config::Config;
use venuedesk_core::models::{Contract, Entity, Expense, Goal, ListParams, Owner, Permission, Venue};
use venuedesk_core::store::{list_loader, SyncStore};
use venuedesk_core::sync::{CacheEntry, MutationDescriptor, QueryKey, QueryStatus, Subscription};
use venuedesk_core::ErrorRecord;

use render::TableRow;

/// Environment variable holding the bearer token
const TOKEN_ENV: &str = "VENUEDESK_TOKEN";

const USAGE: &str = "\
Usage: venuedesk <command> <entity> [args]

Commands:
  list <entity> [--parent ID] [--search TERM]
  show <entity> <id>
  create <entity> <json> [--parent ID]
  update <entity> <id> <json>
  delete <entity> <id> [--parent ID]
  search <entity> [--parent ID]     read search terms from stdin, one per line

Entities: venues, contracts, goals, expenses, owners, permissions";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

#[derive(Debug, Clone, PartialEq)]
enum Command {
    List { entity: Entity, params: ListParams },
    Show { entity: Entity, id: String },
    Create { entity: Entity, body: Value },
    Update { entity: Entity, id: String, body: Value },
    Delete { entity: Entity, id: String, parent_id: Option<String> },
    Search { entity: Entity, parent_id: Option<String> },
}

impl Command {
    fn entity(&self) -> Entity {
        match self {
            Command::List { entity, .. }
            | Command::Show { entity, .. }
            | Command::Create { entity, .. }
            | Command::Update { entity, .. }
            | Command::Delete { entity, .. }
            | Command::Search { entity, .. } => *entity,
        }
    }

    fn parse(args: &[String]) -> Result<Self> {
        let (command, rest) = args.split_first().context(USAGE)?;
        let (entity_name, rest) = rest
            .split_first()
            .with_context(|| format!("Missing entity for '{}'", command))?;
        let entity = Entity::parse(entity_name)
            .with_context(|| format!("Unknown entity: {}", entity_name))?;

        let mut positional = Vec::new();
        let mut parent_id = None;
        let mut search = String::new();
        let mut iter = rest.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--parent" => {
                    parent_id = Some(iter.next().context("--parent needs a value")?.clone())
                }
                "--search" => search = iter.next().context("--search needs a value")?.clone(),
                _ => positional.push(arg.as_str()),
            }
        }

        let id = |index: usize| {
            positional
                .get(index)
                .map(|s| s.to_string())
                .with_context(|| format!("Missing id for '{}'", command))
        };
        let body = |index: usize| -> Result<Value> {
            let raw = positional.get(index).context("Missing JSON body")?;
            serde_json::from_str(raw).context("Body is not valid JSON")
        };

        match command.as_str() {
            "list" => Ok(Command::List {
                entity,
                params: ListParams { parent_id, search },
            }),
            "show" => Ok(Command::Show { entity, id: id(0)? }),
            "create" => {
                let mut body = body(0)?;
                if let (Some(field), Some(parent), Value::Object(map)) =
                    (entity.parent_field(), parent_id, &mut body)
                {
                    map.insert(field.to_string(), Value::String(parent));
                }
                Ok(Command::Create { entity, body })
            }
            "update" => Ok(Command::Update {
                entity,
                id: id(0)?,
                body: body(1)?,
            }),
            "delete" => Ok(Command::Delete {
                entity,
                id: id(0)?,
                parent_id,
            }),
            "search" => Ok(Command::Search { entity, parent_id }),
            other => bail!("Unknown command: {}\n\n{}", other, USAGE),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() || args[0] == "--help" || args[0] == "-h" {
        println!("{}", USAGE);
        return Ok(());
    }

    init_tracing();
    let command = Command::parse(&args)?;

    let config = Config::load()?;
    let mut api = ApiClient::with_timeout(config.api_base_url(), config.request_timeout())?;
    match std::env::var(TOKEN_ENV) {
        Ok(token) if !token.is_empty() => api.set_token(token),
        _ => debug!("{} not set, sending unauthenticated requests", TOKEN_ENV),
    }
    info!(base_url = %api.base_url(), entity = %command.entity(), "venuedesk starting");

    let store = SyncStore::new(config.sync_config());
    let result = match command.entity() {
        Entity::Venue => run::<Venue>(&store, api, command).await,
        Entity::Contract => run::<Contract>(&store, api, command).await,
        Entity::Goal => run::<Goal>(&store, api, command).await,
        Entity::Expense => run::<Expense>(&store, api, command).await,
        Entity::Owner => run::<Owner>(&store, api, command).await,
        Entity::Permission => run::<Permission>(&store, api, command).await,
    };

    store.end_session();
    result
}

fn report(record: ErrorRecord) -> anyhow::Error {
    anyhow::anyhow!(render::error(&record))
}

async fn run<T: TableRow>(store: &SyncStore, api: ApiClient, command: Command) -> Result<()> {
    let service = Arc::new(Resource::<T>::new(api, command.entity()));

    match command {
        Command::List { params, .. } => {
            let rows: Vec<T> = store.list(&service, &params).await.map_err(report)?;
            println!("{}", render::table(&rows));
        }
        Command::Show { id, .. } => {
            let row: T = store.get(&service, &id).await.map_err(report)?;
            println!("{}", serde_json::to_string_pretty(&row)?);
        }
        Command::Create { body, .. } => {
            let row: T = store
                .create(service.as_ref(), &body)
                .await
                .map_err(report)?;
            println!("{}", render::table(std::slice::from_ref(&row)));
        }
        Command::Update { id, body, .. } => {
            let row: T = store
                .update(service.as_ref(), &id, &body)
                .await
                .map_err(report)?;
            println!("{}", render::table(std::slice::from_ref(&row)));
        }
        Command::Delete {
            entity,
            id,
            parent_id,
        } => {
            let mut descriptor = MutationDescriptor::delete(entity, &id);
            if let (Some(field), Some(parent)) = (entity.parent_field(), parent_id) {
                descriptor = descriptor.with_field(field, parent);
            }
            store
                .mutate(&descriptor, || service.delete(&id))
                .await
                .map_err(report)?;
            println!("Deleted {} {}", entity, id);
        }
        Command::Search { parent_id, .. } => interactive_search(store, service, parent_id).await?,
    }
    Ok(())
}

/// Feed stdin lines into a debounced search and print each committed result.
async fn interactive_search<T: TableRow>(
    store: &SyncStore,
    service: Arc<Resource<T>>,
    parent_id: Option<String>,
) -> Result<()> {
    let entity = service.entity();
    let (tx, rx) = mpsc::unbounded_channel();
    let cache = store.cache().clone();
    let search = store.search(move |term| {
        let params = ListParams {
            parent_id: parent_id.clone(),
            search: term.to_string(),
        };
        let key = QueryKey::list(entity, &params);
        // Attach before the fetch is issued so the result is kept for the printer
        let _ = tx.send(cache.subscribe(&key));
        (key, list_loader::<T, _>(Arc::clone(&service), params))
    });
    let printer = tokio::spawn(print_results::<T>(rx));

    eprintln!("Searching {}. Enter terms one per line, Ctrl-D to finish.", entity.path());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .context("Failed to read search input")?
    {
        search.on_input(line.trim());
    }

    search.flush();
    drop(search);
    printer.await.context("Result printer failed")?;
    Ok(())
}

fn settled(entry: &CacheEntry) -> bool {
    !entry.is_fetching && matches!(entry.status, QueryStatus::Success | QueryStatus::Error)
}

/// Print the result for each committed key, skipping ahead when a newer
/// commit arrives before the current one settles.
async fn print_results<T: TableRow>(mut commits: mpsc::UnboundedReceiver<Subscription>) {
    let mut next = commits.recv().await;
    while let Some(mut subscription) = next {
        let newer = tokio::select! {
            entry = subscription.wait_for(settled) => {
                if let Some(entry) = entry {
                    show_entry::<T>(&entry);
                }
                None
            }
            Some(newer) = commits.recv() => Some(newer),
        };
        debug!(key = %subscription.key(), "Done with committed search");
        drop(subscription);

        next = match newer {
            Some(newer) => Some(newer),
            None => commits.recv().await,
        };
    }
}

fn show_entry<T: TableRow>(entry: &CacheEntry) {
    if entry.status == QueryStatus::Error {
        if let Some(ref error) = entry.error {
            eprintln!("{}", render::error(error));
        }
        return;
    }
    match entry.data_as::<Vec<T>>() {
        Some(Ok(rows)) => println!(
            "{}\n({} results, updated {})\n",
            render::table(&rows),
            rows.len(),
            entry.age_display()
        ),
        Some(Err(e)) => eprintln!("Unexpected response: {}", e),
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(String::from).collect()
    }

    #[test]
    fn test_parse_list_with_flags() {
        let command = Command::parse(&args("list contracts --parent v1 --search lease")).unwrap();
        assert_eq!(
            command,
            Command::List {
                entity: Entity::Contract,
                params: ListParams::scoped("v1").with_search("lease"),
            }
        );
    }

    #[test]
    fn test_parse_create_adds_parent_field() {
        let mut input = args("create goal --parent v9");
        input.push(r#"{"description":"Fill the hall"}"#.to_string());
        let command = Command::parse(&input).unwrap();
        assert_eq!(
            command,
            Command::Create {
                entity: Entity::Goal,
                body: json!({ "description": "Fill the hall", "venueId": "v9" }),
            }
        );
    }

    #[test]
    fn test_parse_update_and_delete() {
        let mut input = args("update owners o1");
        input.push(r#"{"email":"a@b.c"}"#.to_string());
        assert_eq!(
            Command::parse(&input).unwrap(),
            Command::Update {
                entity: Entity::Owner,
                id: "o1".to_string(),
                body: json!({ "email": "a@b.c" }),
            }
        );

        assert_eq!(
            Command::parse(&args("delete expense e1 --parent v2")).unwrap(),
            Command::Delete {
                entity: Entity::Expense,
                id: "e1".to_string(),
                parent_id: Some("v2".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(Command::parse(&[]).is_err());
        assert!(Command::parse(&args("list")).is_err());
        assert!(Command::parse(&args("list tents")).is_err());
        assert!(Command::parse(&args("show venue")).is_err());
        assert!(Command::parse(&args("frobnicate venue")).is_err());
        assert!(Command::parse(&args("list venue --parent")).is_err());

        let mut bad_json = args("create venue");
        bad_json.push("{not json".to_string());
        assert!(Command::parse(&bad_json).is_err());
    }

    #[test]
    fn test_settled() {
        let mut entry = CacheEntry::idle(QueryKey::detail(Entity::Venue, "v1"));
        assert!(!settled(&entry));
        entry.status = QueryStatus::Success;
        entry.is_fetching = true;
        assert!(!settled(&entry));
        entry.is_fetching = false;
        assert!(settled(&entry));
    }
}
