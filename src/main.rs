mod server;
mod views;

use std::net::SocketAddr;

use axum::http::HeaderName;
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use serde_json::json;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use verification_keys::{ApiKeyType, Store, StoreError};

use server::{ForwardAuthConfig, ServeOptions};

const DEFAULT_LOG_FILTER: &str = "verification_keys=info,tower_http=info";

#[derive(Debug, Parser)]
#[command(author, version, about = "API key console for the verification server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP console.
    Serve(ServeArgs),
    /// Create a realm and a member user, reusing any that already exist.
    Bootstrap(BootstrapArgs),
    /// Register an authorized app and print its API key. The key is shown only once.
    AddApp(AddAppArgs),
    /// Disable an authorized app. It stays listed under disabled keys.
    DisableApp(DisableAppArgs),
    /// Add issued verification codes to an app's daily statistics.
    RecordCodes(RecordCodesArgs),
    /// Print the 1/7/30 day code issuance of every app in a realm.
    Summary(SummaryArgs),
}

#[derive(Debug, Parser)]
struct DbArgs {
    /// SQLite database path holding users, realms, apps and statistics.
    #[arg(long, env = "VERIFY_DB_PATH", default_value = "verification.db")]
    db_path: String,
}

#[derive(Debug, Parser)]
struct ServeArgs {
    #[command(flatten)]
    db: DbArgs,

    /// Address to bind the console to.
    #[arg(long, env = "VERIFY_BIND", default_value = "127.0.0.1")]
    bind: String,

    /// Port to bind the console to.
    #[arg(long, env = "VERIFY_PORT", default_value_t = 8080)]
    port: u16,

    /// Trusted header carrying the signed-in user's email, set by the auth proxy.
    #[arg(long, env = "FORWARD_AUTH_HEADER")]
    forward_auth_header: Option<String>,

    /// Treat every request as this user. Development only.
    #[arg(long, env = "DEV_USER_EMAIL")]
    dev_user_email: Option<String>,

    /// Maximum number of app statistics lookups run at once per request.
    #[arg(long, env = "STATS_CONCURRENCY", default_value_t = 4)]
    stats_concurrency: usize,

    /// Mark session cookies as Secure (serve behind HTTPS).
    #[arg(long, env = "COOKIE_SECURE")]
    cookie_secure: bool,
}

#[derive(Debug, Parser)]
struct BootstrapArgs {
    #[command(flatten)]
    db: DbArgs,

    /// Realm name.
    #[arg(long)]
    realm: String,

    /// Email of the user to add to the realm.
    #[arg(long)]
    email: String,

    /// Display name for a newly created user.
    #[arg(long, default_value = "")]
    name: String,
}

#[derive(Debug, Parser)]
struct AddAppArgs {
    #[command(flatten)]
    db: DbArgs,

    /// Realm the app belongs to.
    #[arg(long)]
    realm: String,

    /// App name shown in the console.
    #[arg(long)]
    name: String,

    /// Key type: device or admin.
    #[arg(long = "type", default_value = "device")]
    api_key_type: ApiKeyType,
}

#[derive(Debug, Parser)]
struct DisableAppArgs {
    #[command(flatten)]
    db: DbArgs,

    /// Authorized app id.
    #[arg(long)]
    app_id: i64,
}

#[derive(Debug, Parser)]
struct RecordCodesArgs {
    #[command(flatten)]
    db: DbArgs,

    /// Authorized app id.
    #[arg(long)]
    app_id: i64,

    /// Number of codes issued.
    #[arg(long)]
    count: u64,

    /// Day the codes were issued (YYYY-MM-DD). Defaults to today (UTC).
    #[arg(long)]
    date: Option<NaiveDate>,
}

#[derive(Debug, Parser)]
struct SummaryArgs {
    #[command(flatten)]
    db: DbArgs,

    /// Realm name.
    #[arg(long)]
    realm: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Serve(args) => return run_server(args).await,
        Command::Bootstrap(args) => run_bootstrap(args).await,
        Command::AddApp(args) => run_add_app(args).await,
        Command::DisableApp(args) => run_disable_app(args).await,
        Command::RecordCodes(args) => run_record_codes(args).await,
        Command::Summary(args) => run_summary(args).await,
    };

    if let Err(err) = result {
        report_error(&err);
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_server(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let store = Store::open(&args.db.db_path).await?;
    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;

    let user_header = args
        .forward_auth_header
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(HeaderName::try_from)
        .transpose()?;
    let forward_auth = ForwardAuthConfig::new(user_header, sanitize_optional(args.dev_user_email));
    let options = ServeOptions {
        stats_concurrency: args.stats_concurrency,
        secure_cookies: args.cookie_secure,
    };

    server::serve(addr, store, forward_auth, options).await
}

async fn run_bootstrap(args: BootstrapArgs) -> Result<(), StoreError> {
    let store = Store::open(&args.db.db_path).await?;
    let (realm, user) = store.bootstrap(&args.realm, &args.email, &args.name).await?;
    tracing::info!(realm_id = realm.id, user_id = user.id, "bootstrap complete");
    println!(
        "realm {} (id {}) has member {} (id {})",
        realm.name, realm.id, user.email, user.id
    );
    Ok(())
}

async fn run_add_app(args: AddAppArgs) -> Result<(), StoreError> {
    let store = Store::open(&args.db.db_path).await?;
    let realm = find_realm(&store, &args.realm).await?;
    let created = store
        .create_authorized_app(realm.id, &args.name, args.api_key_type)
        .await?;
    tracing::info!(
        app_id = created.app.id,
        realm_id = realm.id,
        api_key_type = %created.app.api_key_type,
        "authorized app created"
    );
    println!("app id: {}", created.app.id);
    println!("api key (shown once): {}", created.api_key);
    Ok(())
}

async fn run_disable_app(args: DisableAppArgs) -> Result<(), StoreError> {
    let store = Store::open(&args.db.db_path).await?;
    store.disable_authorized_app(args.app_id).await?;
    tracing::info!(app_id = args.app_id, "authorized app disabled");
    Ok(())
}

async fn run_record_codes(args: RecordCodesArgs) -> Result<(), StoreError> {
    let store = Store::open(&args.db.db_path).await?;
    if store.find_authorized_app(args.app_id).await?.is_none() {
        return Err(StoreError::NotFound(format!("authorized app {}", args.app_id)));
    }
    let date = args.date.unwrap_or_else(|| Utc::now().date_naive());
    store
        .record_codes_issued(args.app_id, date, args.count)
        .await?;
    tracing::info!(app_id = args.app_id, %date, count = args.count, "codes recorded");
    Ok(())
}

async fn run_summary(args: SummaryArgs) -> Result<(), StoreError> {
    let store = Store::open(&args.db.db_path).await?;
    let mut realm = find_realm(&store, &args.realm).await?;
    let today = Utc::now().date_naive();

    let apps = realm.load_authorized_apps(&store, true).await?.to_vec();
    let mut rows = Vec::with_capacity(apps.len());
    for app in &apps {
        let summary = store.stats_summary_as_of(app, &realm, today).await?;
        rows.push(json!({
            "id": app.id,
            "name": app.name,
            "type": app.api_key_type,
            "disabled": app.is_disabled(),
            "codes_issued_1d": summary.codes_issued_1d,
            "codes_issued_7d": summary.codes_issued_7d,
            "codes_issued_30d": summary.codes_issued_30d,
        }));
    }

    let report = json!({ "realm": realm.name, "as_of": today.to_string(), "apps": rows });
    match serde_json::to_string_pretty(&report) {
        Ok(pretty) => println!("{pretty}"),
        Err(_) => println!("{report}"),
    }
    Ok(())
}

async fn find_realm(store: &Store, name: &str) -> Result<verification_keys::Realm, StoreError> {
    store
        .find_realm_by_name(name)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("realm '{name}'")))
}

fn sanitize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|item| item.trim().to_owned())
        .filter(|item| !item.is_empty())
}

fn report_error(err: &StoreError) {
    eprintln!("error: {err}");
    match err {
        StoreError::Database(db_err) => {
            eprintln!("  database: {db_err}");
        }
        StoreError::Conflict(what) => {
            eprintln!("  hint: {what} is already registered");
        }
        _ => {}
    }
}
