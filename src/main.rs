use clap::{Parser, Subcommand};
use smartstore::sync::SyncState;
use smartstore::{QuerySpec, SmartStore, StoreConfig, StoreRegistry, StoreScope};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "smartstore")]
#[command(about = "SmartStore - inspect encrypted JSON soup stores", long_about = None)]
struct Args {
    /// Root directory of the stores (defaults to SMARTSTORE_ROOT)
    #[arg(long)]
    root: Option<PathBuf>,

    /// User whose stores to open (defaults to SMARTSTORE_USER)
    #[arg(long)]
    user: Option<String>,

    /// Open global stores instead of user stores
    #[arg(long)]
    global: bool,

    /// Encryption key of the stores
    #[arg(long)]
    key: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List stores of the selected scope
    Stores,
    /// List soups of a store
    Soups {
        #[arg(long)]
        store: String,
    },
    /// Show the index specs of a soup
    Indices {
        #[arg(long)]
        store: String,
        #[arg(long)]
        soup: String,
    },
    /// Run a smart SQL query and print one JSON row per line
    Query {
        #[arg(long)]
        store: String,
        #[arg(long)]
        sql: String,
        /// Rows per page (defaults to SMARTSTORE_PAGE_SIZE); 0 returns everything
        #[arg(long)]
        page_size: Option<usize>,
        #[arg(long, default_value_t = 0)]
        page: usize,
    },
    /// Count the rows a smart SQL query returns
    Count {
        #[arg(long)]
        store: String,
        #[arg(long)]
        sql: String,
    },
    /// Finish interrupted soup alterations
    Resume {
        #[arg(long)]
        store: String,
    },
    /// List the syncs recorded in a store
    Syncs {
        #[arg(long)]
        store: String,
    },
}

/// Inspection never creates stores
fn open_existing(
    registry: &StoreRegistry,
    scope: &StoreScope,
    name: &str,
) -> anyhow::Result<Arc<SmartStore>> {
    if !registry
        .database_manager(scope.clone())
        .persistent_store_exists(name)
    {
        anyhow::bail!("store '{}' does not exist ({})", name, scope);
    }
    Ok(registry.store(scope.clone(), name)?)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "smartstore=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = StoreConfig::from_env();
    if let Some(root) = args.root {
        config.root_dir = root;
    }
    if args.user.is_some() {
        config.user = args.user;
    }
    let scope = if args.global {
        StoreScope::Global
    } else {
        match &config.user {
            Some(user) => StoreScope::User(user.clone()),
            None => anyhow::bail!("no user given; pass --user, set SMARTSTORE_USER or use --global"),
        }
    };

    let registry = StoreRegistry::from_config(&config);
    if let Some(key) = args.key {
        registry.set_encryption_key_provider(Arc::new(move || Some(key.clone())))?;
    }
    tracing::debug!("Using stores under {} ({})", config.root_dir.display(), scope);

    match args.command {
        Command::Stores => {
            for name in registry.all_store_names(&scope)? {
                println!("{}", name);
            }
        }
        Command::Soups { store } => {
            let store = open_existing(&registry, &scope, &store)?;
            for name in store.all_soup_names()? {
                println!("{}", name);
            }
        }
        Command::Indices { store, soup } => {
            let store = open_existing(&registry, &scope, &store)?;
            let specs: Vec<_> = store
                .indices_for_soup(&soup)?
                .iter()
                .map(|s| s.to_json())
                .collect();
            println!("{}", serde_json::to_string_pretty(&specs)?);
        }
        Command::Query {
            store,
            sql,
            page_size,
            page,
        } => {
            let store = open_existing(&registry, &scope, &store)?;
            let page_size = page_size.unwrap_or(config.default_page_size);
            for row in store.query(&QuerySpec::smart(&sql, page_size), page)? {
                println!("{}", row);
            }
        }
        Command::Count { store, sql } => {
            let store = open_existing(&registry, &scope, &store)?;
            println!("{}", store.count(&QuerySpec::smart(&sql, 0))?);
        }
        Command::Resume { store } => {
            // Opening resumes pending operations; a second pass reports leftovers
            let store = open_existing(&registry, &scope, &store)?;
            let resumed = store.resume_long_operations()?;
            println!("{} operations resumed", resumed);
        }
        Command::Syncs { store } => {
            let store = open_existing(&registry, &scope, &store)?;
            if !store.soup_exists(smartstore::sync::SYNCS_SOUP)? {
                return Ok(());
            }
            for state in SyncState::all(&store)? {
                println!("{}", serde_json::to_string(&state)?);
            }
        }
    }

    registry.close_all();
    Ok(())
}
