//! fixdesk - command-line client for the campus repair service.
//!
//! Signs in, keeps the session token between runs and fetches API data
//! through the managed-request executor.

use std::io;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fixdesk_core::api::HttpTransport;
use fixdesk_core::auth::{open_storage, SessionStore};
use fixdesk_core::models::{ProfileUpdate, RegisterRequest};
use fixdesk_core::{Config, ManagedRequestExecutor, RequestCache};

const USAGE: &str = "\
Usage: fixdesk <command> [args]

Commands:
  login [username]                             Sign in (prompts for password)
  register <username> <student-id> [email] [phone]
                                               Create an account and sign in
  logout                                       Sign out and forget the token
  whoami                                       Check the saved session
  forgot-password <email>                      Request a password reset email
  reset-password <token>                       Set a new password (prompts)
  change-password                              Change the password (prompts)
  profile <field>=<value>...                   Update email, phone or student-id
  get <path>                                   Fetch API data as JSON
  config                                       Show the active configuration

Environment:
  RUST_LOG               log filter (default: warn)
  FIXDESK_API_URL        API base URL
  FIXDESK_TOKEN_BACKEND  file | keyring | memory";

/// Initialize the tracing subscriber for logging.
/// Logs go to stderr, and also to a daily file when `log_dir` is configured.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr_layer = fmt::layer().with_writer(io::stderr);

    match config.log_dir.as_ref() {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "fixdesk.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .with(filter)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(stderr_layer)
                .with(filter)
                .init();
            None
        }
    }
}

/// Everything a command needs, wired from the config
struct Client {
    config: Config,
    transport: HttpTransport,
    session: SessionStore,
}

impl Client {
    fn new(config: Config) -> Result<Self> {
        let storage = open_storage(config.token_backend, &config.cache_dir()?);
        let transport = HttpTransport::new(&config, Arc::clone(&storage))
            .context("Failed to build HTTP client")?;
        let session = SessionStore::new(Arc::new(transport.clone()), storage);
        Ok(Self {
            config,
            transport,
            session,
        })
    }
}

fn arg(args: &[String], index: usize, name: &str) -> Result<String> {
    args.get(index)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("Missing <{}>\n\n{}", name, USAGE))
}

fn prompt_password(prompt: &str) -> Result<String> {
    rpassword::prompt_password(prompt).context("Failed to read password")
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    // Tracing first, so warnings about bad environment overrides are seen
    let mut config = Config::load_file()?;
    let _log_guard = init_tracing(&config);
    config.apply_env(|key| std::env::var(key).ok());

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        eprintln!("{}", USAGE);
        return Ok(());
    };

    info!(command, api = %config.api_base_url, "fixdesk starting");
    let mut client = Client::new(config)?;

    match command {
        "login" => login(&mut client, &args).await,
        "register" => register(&client, &args).await,
        "logout" => {
            client.session.logout().await?;
            eprintln!("Signed out");
            Ok(())
        }
        "whoami" => whoami(&client).await,
        "forgot-password" => {
            let email = arg(&args, 1, "email")?;
            client.session.forgot_password(&email).await?;
            eprintln!("Password reset email sent to {}", email);
            Ok(())
        }
        "reset-password" => {
            let token = arg(&args, 1, "token")?;
            let password = prompt_password("New password: ")?;
            client.session.reset_password(&token, &password).await?;
            eprintln!("Password updated, please sign in again");
            Ok(())
        }
        "change-password" => {
            let old_password = prompt_password("Current password: ")?;
            let new_password = prompt_password("New password: ")?;
            client.session.change_password(&old_password, &new_password).await?;
            eprintln!("Password changed");
            Ok(())
        }
        "profile" => profile(&client, &args[1..]).await,
        "get" => get(&client, &arg(&args, 1, "path")?).await,
        "config" => {
            eprintln!("# {}", Config::config_path()?.display());
            println!("{}", serde_json::to_string_pretty(&client.config)?);
            Ok(())
        }
        "help" | "--help" | "-h" => {
            eprintln!("{}", USAGE);
            Ok(())
        }
        other => Err(anyhow::anyhow!("Unknown command: {}\n\n{}", other, USAGE)),
    }
}

async fn login(client: &mut Client, args: &[String]) -> Result<()> {
    let username = match args.get(1).cloned().or_else(|| client.config.last_username.clone()) {
        Some(username) => username,
        None => arg(args, 1, "username")?,
    };
    let password = prompt_password(&format!("Password for {}: ", username))?;

    let user = client.session.login(&username, &password).await?;
    eprintln!("Signed in as {}", user.display_name());

    client.config.last_username = Some(username);
    client.config.save().context("Failed to save config")?;
    Ok(())
}

async fn register(client: &Client, args: &[String]) -> Result<()> {
    let username = arg(args, 1, "username")?;
    let student_id = arg(args, 2, "student-id")?;
    let password = prompt_password("Password: ")?;

    let request = RegisterRequest {
        username,
        password,
        student_id,
        email: args.get(3).cloned(),
        phone: args.get(4).cloned(),
    };
    let user = client.session.register(&request).await?;
    eprintln!("Registered and signed in as {}", user.display_name());
    Ok(())
}

fn parse_profile_update(fields: &[String]) -> Result<ProfileUpdate> {
    let mut update = ProfileUpdate::default();
    for field in fields {
        let (name, value) = field
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Expected <field>=<value>, got {}", field))?;
        let value = Some(value.to_string());
        match name {
            "email" => update.email = value,
            "phone" => update.phone = value,
            "student-id" => update.student_id = value,
            other => return Err(anyhow::anyhow!("Unknown profile field: {}", other)),
        }
    }
    if update.is_empty() {
        return Err(anyhow::anyhow!("Nothing to update\n\n{}", USAGE));
    }
    Ok(update)
}

async fn profile(client: &Client, fields: &[String]) -> Result<()> {
    let update = parse_profile_update(fields)?;
    let user = client.session.update_profile(&update).await?;
    eprintln!("Profile updated for {}", user.display_name());
    Ok(())
}

async fn whoami(client: &Client) -> Result<()> {
    let user = client.session.check_auth().await?;
    println!("{}", user.display_name());
    if !user.roles.is_empty() {
        let roles: Vec<&str> = user.roles.iter().map(String::as_str).collect();
        println!("roles: {}", roles.join(", "));
    }
    Ok(())
}

async fn get(client: &Client, path: &str) -> Result<()> {
    let executor = ManagedRequestExecutor::new(Arc::new(RequestCache::new()), client.config.request);
    let handle = executor.execute(
        path,
        client.transport.get_fn::<serde_json::Value>(path),
        executor.options().immediate(false),
    );

    handle.run().await;
    let state = handle.state();
    if let Some(err) = state.error() {
        return Err(anyhow::anyhow!("Request to {} failed: {}", path, err));
    }
    println!("{}", serde_json::to_string_pretty(&state.data())?);
    Ok(())
}
