//! decentra-cli - zeilenbasierter Client für Chat und Voice
//!
//! Aufruf: `decentra-cli [ws://server/ws]`, ohne Argument gilt
//! `DECENTRA_SERVER_URL` bzw. der Standard-Endpunkt.

use anyhow::{bail, Context, Result};
use decentra_client::chat::ChatState;
use decentra_client::{init_tracing, CallEvent, ChatUpdate, Client, ClientConfig, ClientEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};

const HELP: &str = "\
Commands:
  /login <user> <password>            anmelden
  /signup <user> <password> <invite>  registrieren
  /server <id>                        Server wechseln
  /channel <id|name>                  Kanal wechseln
  /dm <id>                            Direktnachrichten öffnen
  /create <name>                      Server erstellen
  /call <user>                        Direktanruf starten
  /hangup [user]                      Anruf(e) beenden
  /join [server channel]              Voice Channel beitreten
  /leave                              Voice Channel verlassen
  /mute | /unmute                     Mikrofon stumm schalten
  /deafen | /undeafen                 Lautsprecher stumm schalten
  /status                             Verbindung und Anrufe anzeigen
  /quit                               beenden
Alles andere wird als Chat-Nachricht gesendet.";

// ============================================================================
// COMMANDS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Login {
        username: String,
        password: String,
    },
    Signup {
        username: String,
        password: String,
        invite_code: String,
    },
    Server(String),
    Channel(String),
    Dm(String),
    Create(String),
    Call(String),
    HangUp(Option<String>),
    /// `None` tritt dem aktuell gewählten Kanal bei
    Join(Option<(String, String)>),
    Leave,
    Mute(bool),
    Deafen(bool),
    Status,
    Help,
    Quit,
    Say(String),
}

/// Parst eine Eingabezeile, leere Zeilen ergeben `None`
fn parse_command(line: &str) -> Result<Option<Command>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    if !line.starts_with('/') {
        return Ok(Some(Command::Say(line.to_string())));
    }

    let mut parts = line.split_whitespace();
    let name = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();

    let command = match (name, args.as_slice()) {
        ("/login", [username, password]) => Command::Login {
            username: username.to_string(),
            password: password.to_string(),
        },
        ("/signup", [username, password, invite_code]) => Command::Signup {
            username: username.to_string(),
            password: password.to_string(),
            invite_code: invite_code.to_string(),
        },
        ("/server", [id]) => Command::Server(id.to_string()),
        ("/channel", [id]) => Command::Channel(id.to_string()),
        ("/dm", [id]) => Command::Dm(id.to_string()),
        ("/create", name @ [_, ..]) => Command::Create(name.join(" ")),
        ("/call", [user]) => Command::Call(user.to_string()),
        ("/hangup", []) => Command::HangUp(None),
        ("/hangup", [user]) => Command::HangUp(Some(user.to_string())),
        ("/join", []) => Command::Join(None),
        ("/join", [server, channel]) => {
            Command::Join(Some((server.to_string(), channel.to_string())))
        }
        ("/leave", []) => Command::Leave,
        ("/mute", []) => Command::Mute(true),
        ("/unmute", []) => Command::Mute(false),
        ("/deafen", []) => Command::Deafen(true),
        ("/undeafen", []) => Command::Deafen(false),
        ("/status", []) => Command::Status,
        ("/help", []) => Command::Help,
        ("/quit", []) | ("/exit", []) => Command::Quit,
        (
            "/login" | "/signup" | "/server" | "/channel" | "/dm" | "/create" | "/call"
            | "/hangup" | "/join" | "/leave" | "/mute" | "/unmute" | "/deafen" | "/undeafen"
            | "/status" | "/help" | "/quit",
            _,
        ) => bail!("Wrong arguments for {}, see /help", name),
        _ => bail!("Unknown command {}, see /help", name),
    };

    Ok(Some(command))
}

/// Führt ein Kommando aus, `false` beendet die Schleife
async fn execute(client: &Client, command: Command) -> bool {
    match command {
        Command::Login { username, password } => client.login(&username, &password).await,
        Command::Signup {
            username,
            password,
            invite_code,
        } => client.signup(&username, &password, &invite_code).await,
        Command::Server(id) => client.switch_server(&id).await,
        Command::Channel(id_or_name) => {
            let id = client.with_chat(|chat| {
                chat.find_channel(&id_or_name)
                    .map(|c| c.channel_id.clone())
                    .unwrap_or_else(|| id_or_name.clone())
            });
            client.switch_channel(&id).await;
        }
        Command::Dm(id) => client.switch_dm(&id).await,
        Command::Create(name) => client.create_server(&name).await,
        Command::Call(user) => client.call_user(&user).await,
        Command::HangUp(None) => client.hang_up().await,
        Command::HangUp(Some(user)) => client.hang_up_peer(&user).await,
        Command::Join(Some((server, channel))) => client.join_voice(&server, &channel).await,
        Command::Join(None) => {
            if !client.join_current_voice_channel().await {
                println!("Select a voice channel first (/server, /channel)");
            }
        }
        Command::Leave => client.leave_voice().await,
        Command::Mute(muted) => {
            client.set_muted(muted);
            println!("Microphone {}", if muted { "muted" } else { "live" });
        }
        Command::Deafen(deafened) => {
            client.set_deafened(deafened);
            println!("Speaker {}", if deafened { "off" } else { "on" });
        }
        Command::Status => print_status(client),
        Command::Help => println!("{}", HELP),
        Command::Quit => return false,
        Command::Say(text) => client.send_chat(&text).await,
    }
    true
}

// ============================================================================
// OUTPUT
// ============================================================================

fn print_status(client: &Client) {
    let coordinator = client.coordinator();
    let (input, output) = coordinator.audio_levels();

    println!("Server:   {} ({:?})", client.config().server_url, client.connection().state());
    client.with_chat(|chat| println!("Account:  {:?}", chat.auth));
    println!("Voice:    {:?}", coordinator.mode());
    for session in coordinator.sessions() {
        println!(
            "  {} {:?} since {}",
            session.peer_id,
            session.state,
            session.since.format("%H:%M:%S")
        );
    }
    println!(
        "Audio:    muted={} deafened={} level in={:.2} out={:.2}",
        coordinator.is_muted(),
        coordinator.is_deafened(),
        input,
        output
    );
}

fn print_update(chat: &ChatState, update: &ChatUpdate) {
    match update {
        ChatUpdate::MessageAdded(message) => {
            println!("[{}] {}: {}", message.timestamp, message.username, message.content);
        }
        ChatUpdate::HistoryReplaced(_) => {
            for message in &chat.messages {
                println!("[{}] {}: {}", message.timestamp, message.username, message.content);
            }
        }
        ChatUpdate::ServersReplaced(count) => {
            println!("{} server(s):", count);
            for server in &chat.servers {
                println!("  {} {}", server.server_id, server.name);
            }
        }
        ChatUpdate::ChannelsReplaced(count) => {
            println!("{} channel(s):", count);
            for channel in &chat.channels {
                println!("  {} #{} ({})", channel.channel_id, channel.name, channel.channel_type);
            }
        }
        ChatUpdate::FriendsReplaced(count) => {
            println!("{} friend(s):", count);
            for friend in &chat.friends {
                println!("  {} [{}]", friend.username, friend.status);
            }
        }
        ChatUpdate::DirectMessagesReplaced(count) => {
            println!("{} conversation(s):", count);
            for dm in &chat.direct_messages {
                println!("  {} with {} ({} unread)", dm.dm_id, dm.other_user, dm.unread_count);
            }
        }
        ChatUpdate::Auth(status) => println!("Auth: {:?}", status),
    }
}

fn print_call_event(event: &CallEvent) {
    match event {
        CallEvent::StateChanged { peer_id, state } => println!("Call {}: {:?}", peer_id, state),
        CallEvent::ModeChanged(mode) => println!("Voice: {:?}", mode),
    }
}

// ============================================================================
// MAIN
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let mut config = ClientConfig::from_env();
    if let Some(url) = std::env::args().nth(1) {
        config.server_url = url;
    }

    let client = Client::new(config);
    let mut events = client.subscribe();
    let mut call_events = client.call_events();

    client.start().await;
    if !client.is_connected() {
        bail!("Could not connect to {}", client.config().server_url);
    }
    println!("Connected to {}. Type /help for commands.", client.config().server_url);

    // Stdin in eigenem Task lesen
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            line = line_rx.recv() => {
                let Some(line) = line else { break };
                match parse_command(&line) {
                    Ok(Some(command)) => {
                        if !execute(&client, command).await {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("{}", e),
                }
            }
            event = events.recv() => match event {
                Ok(ClientEvent::Chat(update)) => client.with_chat(|chat| print_update(chat, &update)),
                Ok(ClientEvent::Connected) => println!("Connected"),
                Ok(ClientEvent::Disconnected) => {
                    println!("Connection lost");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Missed {} client events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            event = call_events.recv() => match event {
                Ok(event) => print_call_event(&event),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                break;
            }
        }
    }

    if client.coordinator().in_voice_channel() {
        client.leave_voice().await;
    }
    client.hang_up().await;
    client.disconnect().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Command {
        parse_command(line).unwrap().unwrap()
    }

    #[test]
    fn test_plain_text_is_chat() {
        assert_eq!(parse("  hello there "), Command::Say("hello there".to_string()));
        assert!(parse_command("   ").unwrap().is_none());
    }

    #[test]
    fn test_commands() {
        assert_eq!(
            parse("/login alice pw"),
            Command::Login {
                username: "alice".to_string(),
                password: "pw".to_string()
            }
        );
        assert_eq!(
            parse("/signup bob secret INVITE1"),
            Command::Signup {
                username: "bob".to_string(),
                password: "secret".to_string(),
                invite_code: "INVITE1".to_string()
            }
        );
        assert_eq!(parse("/create My Guild"), Command::Create("My Guild".to_string()));
        assert_eq!(parse("/call carol"), Command::Call("carol".to_string()));
        assert_eq!(parse("/hangup"), Command::HangUp(None));
        assert_eq!(parse("/hangup carol"), Command::HangUp(Some("carol".to_string())));
        assert_eq!(parse("/join"), Command::Join(None));
        assert_eq!(
            parse("/join s1 voice"),
            Command::Join(Some(("s1".to_string(), "voice".to_string())))
        );
        assert_eq!(parse("/mute"), Command::Mute(true));
        assert_eq!(parse("/undeafen"), Command::Deafen(false));
        assert_eq!(parse("/exit"), Command::Quit);
    }

    #[test]
    fn test_invalid_commands() {
        let err = parse_command("/login alice").unwrap_err();
        assert!(err.to_string().contains("Wrong arguments"));

        let err = parse_command("/teleport mars").unwrap_err();
        assert!(err.to_string().contains("Unknown command"));

        assert!(parse_command("/create").is_err());
    }
}
