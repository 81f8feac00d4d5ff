use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings_from, ChatClient, ClientEvent, ClientSettings, ImagePayload, MessageDraft,
    NoticeLevel,
};
use shared::{
    domain::{AuthUser, Message, UserId},
    protocol::{LoginRequest, SignupRequest, UpdateProfileRequest},
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::{self, error::RecvError},
};
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

const PRESENCE_WAIT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(about = "Terminal client for the chat service")]
struct Args {
    /// Flat TOML settings file.
    #[arg(long, default_value = client_core::config::DEFAULT_SETTINGS_FILE)]
    config: PathBuf,
    #[arg(long)]
    api_url: Option<String>,
    #[arg(long)]
    socket_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct Credentials {
    #[arg(long)]
    email: String,
    #[arg(long)]
    password: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create an account.
    Signup {
        #[arg(long)]
        full_name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// List correspondents, marking the ones online.
    Users {
        #[command(flatten)]
        credentials: Credentials,
    },
    /// Open a conversation and chat from stdin.
    Chat {
        #[command(flatten)]
        credentials: Credentials,
        /// Correspondent id.
        #[arg(long = "with")]
        with: String,
    },
    /// Change display name and/or avatar.
    Profile {
        #[command(flatten)]
        credentials: Credentials,
        #[arg(long)]
        full_name: Option<String>,
        #[arg(long)]
        avatar: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let settings = resolve_settings(&args);
    debug!(api_url = %settings.api_url, socket_url = ?settings.socket_url, "settings resolved");
    let client = ChatClient::new(&settings).context("failed to build http client")?;
    let mut console = Console::new(client.subscribe_events());

    match args.command {
        Command::Signup {
            full_name,
            email,
            password,
        } => signup(&client, &mut console, full_name, email, password).await,
        Command::Users { credentials } => users(&client, &mut console, credentials).await,
        Command::Chat { credentials, with } => {
            chat(&client, &mut console, credentials, UserId::new(with)).await
        }
        Command::Profile {
            credentials,
            full_name,
            avatar,
        } => profile(&client, &mut console, credentials, full_name, avatar).await,
    }
}

fn resolve_settings(args: &Args) -> ClientSettings {
    let mut settings = load_settings_from(&args.config);
    if let Some(api_url) = &args.api_url {
        settings.api_url = api_url.clone();
    }
    if let Some(socket_url) = &args.socket_url {
        settings.socket_url = Some(socket_url.clone());
    }
    settings
}

async fn signup(
    client: &ChatClient,
    console: &mut Console,
    full_name: String,
    email: String,
    password: String,
) -> Result<()> {
    let request = SignupRequest {
        full_name,
        email,
        password,
    };
    for field in request.validate() {
        eprintln!("  - {field}");
    }
    let result = client.session().signup(request).await;
    console.flush();
    let user = result?;
    println!("signed up as {} ({})", user.full_name, user.id);
    client.session().logout().await?;
    console.flush();
    Ok(())
}

async fn users(client: &ChatClient, console: &mut Console, credentials: Credentials) -> Result<()> {
    let me = sign_in(client, console, credentials).await?;
    console.wait_for_presence(PRESENCE_WAIT).await;

    let result = client.conversations().get_users().await;
    console.flush();
    for user in result? {
        let marker = if client.presence().is_online(&user.id) {
            "*"
        } else {
            " "
        };
        println!("{marker} {:<24} {}", user.id.as_str(), user.full_name);
    }
    debug!(user_id = %me.id, online = client.presence().len(), "listed correspondents");

    client.session().logout().await?;
    console.flush();
    Ok(())
}

async fn chat(
    client: &ChatClient,
    console: &mut Console,
    credentials: Credentials,
    with: UserId,
) -> Result<()> {
    let me = sign_in(client, console, credentials).await?;

    let users = client.conversations().get_users().await;
    console.flush();
    let correspondent = users?
        .into_iter()
        .find(|user| user.id == with)
        .ok_or_else(|| anyhow!("no correspondent with id {with}"))?;
    println!("chatting with {} (type /quit to leave)", correspondent.full_name);

    let history = client.open_conversation(correspondent).await;
    console.flush();
    for message in history? {
        print_message(&message, &me);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                match Input::parse(&line) {
                    Input::Quit => break,
                    Input::Empty => {}
                    Input::Online => {
                        let online = client.presence().online_users();
                        println!("online ({}): {}", online.len(), join_ids(&online));
                    }
                    Input::Image(path) => match read_file(&path).await {
                        Ok(bytes) => {
                            let draft = MessageDraft::image(ImagePayload::Bytes(bytes));
                            send(client, console, &me, draft).await;
                        }
                        Err(err) => eprintln!("error: {err:#}"),
                    },
                    Input::Text(text) => {
                        send(client, console, &me, MessageDraft::text(text)).await;
                    }
                }
            }
            event = console.events.recv() => match event {
                Ok(ClientEvent::MessageReceived(message)) => print_message(&message, &me),
                Ok(event) => console.show(event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "event bus lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    client.close_conversation();
    client.session().logout().await?;
    console.flush();
    Ok(())
}

async fn profile(
    client: &ChatClient,
    console: &mut Console,
    credentials: Credentials,
    full_name: Option<String>,
    avatar: Option<PathBuf>,
) -> Result<()> {
    let profile_pic = match avatar {
        Some(path) => Some(data_uri(&path, &read_file(&path).await?)),
        None => None,
    };
    let request = UpdateProfileRequest {
        full_name,
        profile_pic,
    };
    if request.is_empty() {
        bail!("nothing to update: pass --full-name and/or --avatar");
    }

    sign_in(client, console, credentials).await?;
    let result = client.session().update_profile(request).await;
    console.flush();
    let user = result?;
    println!("profile of {} updated", user.full_name);
    if !user.profile_pic.is_empty() {
        println!("avatar: {}", user.profile_pic);
    }

    client.session().logout().await?;
    console.flush();
    Ok(())
}

async fn sign_in(
    client: &ChatClient,
    console: &mut Console,
    credentials: Credentials,
) -> Result<AuthUser> {
    let result = client
        .session()
        .login(LoginRequest {
            email: credentials.email,
            password: credentials.password,
        })
        .await;
    console.flush();
    Ok(result?)
}

async fn send(client: &ChatClient, console: &mut Console, me: &AuthUser, draft: MessageDraft) {
    let result = client.conversations().send_message(draft).await;
    console.flush();
    if let Ok(message) = result {
        print_message(&message, me);
    }
}

async fn read_file(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))
}

fn data_uri(path: &Path, bytes: &[u8]) -> String {
    let mime = match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    };
    format!("data:{mime};base64,{}", STANDARD.encode(bytes))
}

fn print_message(message: &Message, me: &AuthUser) {
    let who = if message.sender_id == me.id {
        "you".to_string()
    } else {
        message.sender_id.to_string()
    };
    let time = message.created_at.format("%H:%M");
    if let Some(text) = &message.text {
        println!("[{time}] {who}: {text}");
    }
    if let Some(image) = &message.image {
        println!("[{time}] {who} sent an image: {image}");
    }
}

fn join_ids(ids: &[UserId]) -> String {
    ids.iter()
        .map(UserId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, PartialEq, Eq)]
enum Input {
    Quit,
    Online,
    Image(PathBuf),
    Text(String),
    Empty,
}

impl Input {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        match line.split_once(' ') {
            _ if line.is_empty() => Input::Empty,
            _ if line == "/quit" => Input::Quit,
            _ if line == "/online" => Input::Online,
            Some(("/image", path)) if !path.trim().is_empty() => {
                Input::Image(PathBuf::from(path.trim()))
            }
            _ => Input::Text(line.to_string()),
        }
    }
}

/// Prints notices from the event bus to stderr.
struct Console {
    events: broadcast::Receiver<ClientEvent>,
}

impl Console {
    fn new(events: broadcast::Receiver<ClientEvent>) -> Self {
        Self { events }
    }

    /// Prints whatever is queued without waiting.
    fn flush(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.show(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "event bus lagged");
                }
                Err(_) => break,
            }
        }
    }

    fn show(&self, event: ClientEvent) {
        match event {
            ClientEvent::Notice(notice) => match notice.level {
                NoticeLevel::Success => eprintln!("ok: {}", notice.text),
                NoticeLevel::Error => eprintln!("error: {}", notice.text),
            },
            ClientEvent::ConnectionStateChanged(state) => debug!(?state, "connection state"),
            ClientEvent::OnlineUsersChanged(online) => debug!(count = online.len(), "presence"),
            ClientEvent::SessionChanged(_) | ClientEvent::MessageReceived(_) => {}
        }
    }

    /// Waits for the first presence snapshot after connecting, up to `limit`.
    async fn wait_for_presence(&mut self, limit: Duration) {
        let waited = tokio::time::timeout(limit, async {
            loop {
                match self.events.recv().await {
                    Ok(ClientEvent::OnlineUsersChanged(_)) => return,
                    Ok(event) => self.show(event),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => return,
                }
            }
        })
        .await;
        if waited.is_err() {
            debug!("no presence snapshot received");
        }
    }
}
