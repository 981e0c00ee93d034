use anyhow::Context;
use chrono::Local;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::io::{AsyncBufReadExt, BufReader};
use userbot_rust::auth::AuthProgress;
use userbot_rust::config::Config;
use userbot_rust::http::UreqHttpClient;
use userbot_rust::provider::loopback::{LoopbackAccount, LoopbackProvider};
use userbot_rust::ubcore::{AccountKey, AppCredentials, ChatKey, IncomingMessage, RequesterKey};
use userbot_rust::ControlPlane;

// Interactive control plane over the in-process loopback network.
//
// Usage:
//   cargo run                                    # REPL with the demo account
//   cargo run -- --data-dir /tmp/userbot repl
//   cargo run -- accounts                        # list stored credentials
//   cargo run -- forget 15550000000

const DEMO_PHONE: &str = "+15550000000";
const DEMO_CODE: &str = "12345";
const DEMO_PASSWORD: &str = "p@ss";
const REPL_REQUESTER: RequesterKey = RequesterKey(1);

#[derive(Parser)]
#[command(name = "userbot", about = "Account session manager for a userbot")]
struct Cli {
    /// JSON configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides `data_dir` from the file and the environment.
    #[arg(long)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// List stored account credentials.
    Accounts,
    /// Delete an account's credential and session handle.
    Forget { account: String },
    /// Interactive control plane.
    Repl,
}

fn main() {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build tokio runtime");

    if let Err(e) = rt.block_on(run(cli)) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    config
        .default_app
        .get_or_insert_with(|| AppCredentials::new(1, "loopback"));

    let provider = LoopbackProvider::persistent(config.sessions_dir())
        .await
        .context("opening the sessions directory")?;
    provider.register(
        LoopbackAccount::new(DEMO_PHONE, DEMO_CODE, "Demo Account").with_password(DEMO_PASSWORD),
    );

    let plane = ControlPlane::builder()
        .with_config(config)
        .with_connection_factory(Arc::new(provider.clone()))
        .with_http_client(Arc::new(UreqHttpClient::new()))
        .build()
        .await
        .context("building the control plane")?;

    match cli.command.unwrap_or(Command::Repl) {
        Command::Accounts => {
            let accounts = plane.list_accounts().await?;
            if accounts.is_empty() {
                println!("no stored accounts");
            }
            for account in accounts {
                println!("{}", account.as_str());
            }
        }
        Command::Forget { account } => {
            let key = AccountKey::from_phone(&account);
            if plane.forget_account(&key).await? {
                println!("forgot {key}");
            } else {
                println!("no stored credential for {key}");
            }
        }
        Command::Repl => repl(&plane, &provider).await?,
    }
    Ok(())
}

async fn repl(plane: &ControlPlane, provider: &LoopbackProvider) -> anyhow::Result<()> {
    for (account, result) in plane.restore_all().await? {
        match result {
            Ok(outcome) => info!("Restored {account}: {outcome:?}"),
            Err(e) => warn!("Could not restore {account}: {e}"),
        }
    }

    println!("demo account {DEMO_PHONE}, code {DEMO_CODE}, password {DEMO_PASSWORD}");
    println!("type `help` for commands");

    let message_ids = AtomicI64::new(1);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((&command, args)) = words.split_first() else {
            continue;
        };
        if command == "quit" {
            break;
        }
        if let Err(e) = dispatch(plane, provider, &message_ids, command, args).await {
            println!("error: {e:#}");
        }
    }

    plane.shutdown().await;
    Ok(())
}

async fn dispatch(
    plane: &ControlPlane,
    provider: &LoopbackProvider,
    message_ids: &AtomicI64,
    command: &str,
    args: &[&str],
) -> anyhow::Result<()> {
    match (command, args) {
        ("help", _) => print_help(),
        ("begin", []) => {
            let state = plane.begin_onboarding(REPL_REQUESTER).await?;
            println!("{state}");
        }
        ("begin", [app_id, app_secret]) => {
            let app = AppCredentials::new(app_id.parse().context("app id")?, *app_secret);
            let state = plane.begin_onboarding_with(REPL_REQUESTER, app).await?;
            println!("{state}");
        }
        ("phone", [phone @ ..]) if !phone.is_empty() => {
            report(plane.submit_phone(REPL_REQUESTER, &phone.join(" ")).await?);
        }
        ("code", [code @ ..]) if !code.is_empty() => {
            report(plane.submit_code(REPL_REQUESTER, &code.join(" ")).await?);
        }
        ("password", [password]) => {
            report(plane.submit_password(REPL_REQUESTER, password).await?);
        }
        ("cancel", []) => {
            plane.cancel_onboarding(REPL_REQUESTER).await?;
            println!("cancelled");
        }
        ("start", [account]) => {
            let outcome = plane.start_session(&AccountKey::from_phone(account)).await?;
            println!("{outcome:?}");
        }
        ("stop", [account]) => {
            let outcome = plane.stop_session(&AccountKey::from_phone(account)).await?;
            println!("{outcome:?}");
        }
        ("status", [account]) => {
            println!("{:?}", plane.session_status(&AccountKey::from_phone(account)).await);
        }
        ("arm", [account, chat]) => {
            let changed = plane
                .arm_chat(&AccountKey::from_phone(account), parse_chat(chat)?)
                .await?;
            println!("{}", if changed { "armed" } else { "already armed" });
        }
        ("disarm", [account, chat]) => {
            let changed = plane
                .disarm_chat(&AccountKey::from_phone(account), parse_chat(chat)?)
                .await?;
            println!("{}", if changed { "disarmed" } else { "already disarmed" });
        }
        ("reset", [account, chat]) => {
            plane
                .reset_chat(&AccountKey::from_phone(account), parse_chat(chat)?)
                .await?;
            println!("reset");
        }
        ("say" | "self", [account, chat, text @ ..]) if !text.is_empty() => {
            let message = IncomingMessage {
                chat: parse_chat(chat)?,
                message_id: message_ids.fetch_add(1, Ordering::Relaxed),
                is_self_authored: command == "self",
                is_private: true,
                text: text.join(" "),
            };
            let delivered = provider
                .deliver(&AccountKey::from_phone(account), message)
                .await;
            if delivered == 0 {
                println!("no running session received it");
            }
        }
        ("replies", []) => {
            for reply in provider.sent_replies() {
                println!("[{} / chat {}] {}", reply.account, reply.chat, reply.text);
            }
        }
        ("accounts", []) => {
            for account in plane.list_accounts().await? {
                let running = if plane.session(&account).is_some() {
                    " (running)"
                } else {
                    ""
                };
                println!("{}{running}", account.as_str());
            }
        }
        ("forget", [account]) => {
            let existed = plane.forget_account(&AccountKey::from_phone(account)).await?;
            println!("{}", if existed { "forgotten" } else { "unknown account" });
        }
        _ => println!("unrecognized command, type `help`"),
    }
    Ok(())
}

fn parse_chat(raw: &str) -> anyhow::Result<ChatKey> {
    Ok(ChatKey(raw.parse().context("chat id must be a number")?))
}

fn report(progress: AuthProgress) {
    match progress {
        AuthProgress::CodeSent => println!("code sent"),
        AuthProgress::PasswordRequired => println!("password required"),
        AuthProgress::Authorized(authorized) => println!(
            "authorized as {} ({:?})",
            authorized.profile.display_name, authorized.session
        ),
    }
}

fn print_help() {
    println!(
        "\
onboarding:  begin [app_id app_secret] | phone <number> | code <code> | password <pw> | cancel
sessions:    start <account> | stop <account> | status <account> | accounts | forget <account>
chats:       arm|disarm|reset <account> <chat>
traffic:     say <account> <chat> <text>   (from the peer)
             self <account> <chat> <text>  (from the owner)
             replies
             quit"
    );
}
