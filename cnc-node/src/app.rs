//! Console front end: one loop over stdin, transport events, relay frames and
//! outgoing transfer updates, all funneled into the single [`PeerCore`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use cnc_core::transfer::{TransferError, TransferReport};
use cnc_core::{
    MemoryPostStore, OutgoingFile, PeerCore, PeerEvent, PostDelivery, PostStore, ReceivedFile,
    SignalingEnvelope, TransferProgress,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::relay::Relay;
use crate::store::JsonPostStore;
use crate::webrtc::WebRtcConnector;

const HELP: &str = "\
commands:
  /code            show your connection code
  <json> | /paste <json>
                   paste the code you received from the peer
  /post <text>     publish a post
  /posts           list posts
  /delete <id>     delete a post here and at the peer
  /send <path>     send a file
  /call /hangup    start or stop the call
  /video           toggle video during a call
  /status          connection state
  /reset           drop the session and start over
  /quit
  anything else is sent as a direct message";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Code,
    Signal(String),
    Post(String),
    Posts,
    Delete(String),
    Message(String),
    Send(PathBuf),
    Call,
    Hangup,
    Video,
    Status,
    Reset,
    Help,
    Quit,
    Empty,
}

fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Command::Empty);
    }
    if line.starts_with('{') {
        return Ok(Command::Signal(line.to_string()));
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Command::Message(line.to_string()));
    };
    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };
    let required = |what: &str| {
        if arg.is_empty() {
            Err(format!("usage: /{name} <{what}>"))
        } else {
            Ok(arg.to_string())
        }
    };
    Ok(match name {
        "code" => Command::Code,
        "paste" => Command::Signal(required("code")?),
        "post" => Command::Post(required("text")?),
        "posts" => Command::Posts,
        "delete" => Command::Delete(required("post id")?),
        "dm" => Command::Message(required("text")?),
        "send" => Command::Send(PathBuf::from(required("path")?)),
        "call" => Command::Call,
        "hangup" => Command::Hangup,
        "video" => Command::Video,
        "status" => Command::Status,
        "reset" => Command::Reset,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command /{other}; try /help")),
    })
}

enum TransferUpdate {
    Progress(TransferProgress),
    Finished {
        file_id: String,
        name: String,
        result: Result<TransferReport, TransferError>,
    },
}

struct App {
    core: PeerCore,
    relay: Option<Relay>,
    download_dir: PathBuf,
    transfers: mpsc::UnboundedSender<TransferUpdate>,
    /// Last percentage printed per transfer id.
    shown: HashMap<String, u8>,
}

/// Run until /quit, end of input, or a shutdown signal.
pub async fn run(cfg: Config) -> anyhow::Result<()> {
    let identity = cnc_core::Identity::generate();
    let posts: Box<dyn PostStore> = match &cfg.posts_file {
        Some(path) => Box::new(JsonPostStore::open(path)?),
        None => Box::new(MemoryPostStore::new()),
    };
    let connector = Arc::new(WebRtcConnector::new(cfg.ice_gather_timeout()));
    let (core, mut transport_rx) = PeerCore::new(identity, connector, cfg.peer_config(), posts);
    info!(event = "node_started", id = %core.local_id(), "CyberNetCall node started");

    let (relay, mut relay_rx) = match &cfg.relay_url {
        Some(url) => {
            let (relay, rx) = Relay::connect(url, core.local_id()).await?;
            (Some(relay), Some(rx))
        }
        None => (None, None),
    };

    let (transfer_tx, mut transfer_rx) = mpsc::unbounded_channel();
    let mut app = App {
        core,
        relay,
        download_dir: cfg.download_dir.clone(),
        transfers: transfer_tx,
        shown: HashMap::new(),
    };
    app.show_code();
    println!("type /help for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else { break };
                match parse_command(&line) {
                    Ok(Command::Quit) => break,
                    Ok(cmd) => app.execute(cmd).await,
                    Err(msg) => println!("{msg}"),
                }
            }
            Some((epoch, event)) = transport_rx.recv() => {
                let events = app.core.handle_transport_event(epoch, event).await;
                app.render(events).await;
            }
            frame = recv_relay(&mut relay_rx) => match frame {
                Some(text) => {
                    let events = app.core.handle_signaling(&text).await;
                    app.render(events).await;
                }
                None => {
                    warn!(event = "relay_lost", "Relay disconnected; paste codes instead");
                    println!("relay disconnected; exchange codes by pasting them");
                    relay_rx = None;
                    app.relay = None;
                }
            },
            Some(update) = transfer_rx.recv() => app.on_transfer_update(update),
            res = &mut shutdown => {
                if let Err(e) = res {
                    warn!(event = "signal_handler_failed", error = %e);
                }
                break;
            }
        }
    }

    let events = app.core.reset("shutting down").await;
    debug!(event = "shutdown", pending = events.len());
    if let Some(relay) = &app.relay {
        relay.close().await;
    }
    Ok(())
}

async fn recv_relay(rx: &mut Option<mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl App {
    async fn execute(&mut self, cmd: Command) {
        match cmd {
            Command::Empty | Command::Quit => {}
            Command::Help => println!("{HELP}"),
            Command::Code => self.show_code(),
            Command::Signal(text) => {
                let events = self.core.handle_signaling(&text).await;
                self.render(events).await;
            }
            Command::Status => self.show_status(),
            Command::Reset => {
                let events = self.core.reset("reset by user").await;
                if events.is_empty() {
                    println!("nothing to reset");
                }
                self.render(events).await;
            }
            Command::Post(text) => match self.core.send_post(&text).await {
                Ok((post, PostDelivery::Delivered)) => println!("posted {}", post.id),
                Ok((post, PostDelivery::LocalOnly)) => {
                    println!("posted {} (not connected; saved locally only)", post.id)
                }
                Err(e) => println!("post failed: {e}"),
            },
            Command::Posts => {
                let posts = self.core.posts();
                if posts.is_empty() {
                    println!("no posts");
                }
                for p in posts {
                    println!(
                        "{} {} [{}] {}",
                        p.timestamp.format("%Y-%m-%d %H:%M"),
                        short(&p.sender),
                        p.id,
                        p.content
                    );
                }
            }
            Command::Delete(id) => match self.core.delete_post(&id).await {
                Ok(true) => println!("deleted {id}"),
                Ok(false) => println!("no post {id}"),
                Err(e) => println!("deleted {id} locally; peer not told: {e}"),
            },
            Command::Message(text) => {
                if let Err(e) = self.core.send_direct_message(&text).await {
                    println!("message not sent: {e}");
                }
            }
            Command::Send(path) => {
                if let Err(e) = self.send_file(&path).await {
                    println!("cannot send {}: {e:#}", path.display());
                }
            }
            Command::Call => match self.core.start_call().await {
                Ok(()) => println!("call started"),
                Err(e) => println!("call failed: {e}"),
            },
            Command::Hangup => match self.core.end_call().await {
                Ok(()) => println!("call ended"),
                Err(e) => println!("{e}"),
            },
            Command::Video => match self.core.toggle_video().await {
                Ok(on) => println!("video {}", if on { "on" } else { "off" }),
                Err(e) => println!("{e}"),
            },
        }
    }

    fn show_code(&self) {
        match self.core.initial_envelope().to_json() {
            Ok(json) => {
                println!("your code (give it to the peer, or paste theirs):");
                println!("{json}");
            }
            Err(e) => warn!(event = "envelope_encode_failed", error = %e),
        }
    }

    fn show_status(&self) {
        let remote = self
            .core
            .remote_id()
            .map(|id| id.short().to_string())
            .unwrap_or_else(|| "-".into());
        let role = self
            .core
            .role()
            .map(|r| format!("{r:?}").to_lowercase())
            .unwrap_or_else(|| "-".into());
        println!(
            "id {} state {} role {} peer {} call {}",
            self.core.local_id().short(),
            self.core.state(),
            role,
            remote,
            if self.core.in_call() { "on" } else { "off" }
        );
    }

    async fn send_file(&mut self, path: &Path) -> anyhow::Result<()> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".into());
        let file = OutgoingFile {
            mime_type: mime_type_for(&name).to_string(),
            name,
            data,
        };
        let transfer = self.core.prepare_file(file)?;
        println!("sending {} ({} bytes)", transfer.name(), transfer.metadata().size);
        let tx = self.transfers.clone();
        tokio::spawn(async move {
            let file_id = transfer.file_id().to_string();
            let name = transfer.name().to_string();
            let progress_tx = tx.clone();
            let result = transfer
                .run(move |p| {
                    let _ = progress_tx.send(TransferUpdate::Progress(p));
                })
                .await;
            let _ = tx.send(TransferUpdate::Finished {
                file_id,
                name,
                result,
            });
        });
        Ok(())
    }

    fn on_transfer_update(&mut self, update: TransferUpdate) {
        match update {
            TransferUpdate::Progress(p) => self.show_progress("sending", &p),
            TransferUpdate::Finished {
                file_id,
                name,
                result,
            } => {
                self.shown.remove(&file_id);
                match result {
                    Ok(report) => {
                        info!(
                            event = "file_sent",
                            name = %name,
                            chunks = report.chunks_sent,
                            bytes = report.bytes_sent,
                            retries = report.backpressure_retries
                        );
                        println!("sent {name}");
                    }
                    Err(e) => println!("sending {name} failed: {e}"),
                }
            }
        }
    }

    /// Print at most once per 10% step.
    fn show_progress(&mut self, verb: &str, p: &TransferProgress) {
        let pct = p.percent();
        let last = self.shown.get(&p.file_id).copied();
        if pct >= 100 {
            self.shown.remove(&p.file_id);
        } else if last.map_or(false, |l| pct / 10 == l / 10) {
            return;
        } else {
            self.shown.insert(p.file_id.clone(), pct);
        }
        println!("{verb} {}: {pct}%", p.name);
    }

    async fn render(&mut self, events: Vec<PeerEvent>) {
        for event in events {
            self.render_one(event).await;
        }
    }

    async fn render_one(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Envelope {
                envelope,
                recipient,
            } => self.deliver_envelope(&envelope, &recipient).await,
            PeerEvent::StateChanged(state) => debug!(event = "state", %state),
            PeerEvent::Connected { remote } => println!("connected to {}", remote.short()),
            PeerEvent::Reset { reason } => {
                // Partial transfers die with the session.
                self.shown.clear();
                println!("session ended: {reason}");
            }
            PeerEvent::Rearmed(_) => {
                println!("ready for a new connection");
                self.show_code();
            }
            PeerEvent::Error(e) => println!("error: {e}"),
            PeerEvent::PostReceived(post) => {
                println!("[post {}] {}: {}", post.id, short(&post.sender), post.content)
            }
            PeerEvent::PostDeleted { post_id } => println!("peer deleted post {post_id}"),
            PeerEvent::DirectMessage(m) => println!("<{}> {}", short(&m.sender), m.content),
            PeerEvent::TransferStarted(p) => {
                println!("receiving {} ({} bytes)", p.name, p.total);
                self.shown.insert(p.file_id.clone(), 0);
            }
            PeerEvent::TransferProgress(p) => self.show_progress("receiving", &p),
            PeerEvent::FileReceived(file) => match save_file(&self.download_dir, &file).await {
                Ok(path) => {
                    info!(
                        event = "file_saved",
                        path = %path.display(),
                        size = file.data.len(),
                        sha256 = %file.sha256_hex()
                    );
                    println!("received {} -> {}", file.name, path.display());
                }
                Err(e) => println!("could not save {}: {e:#}", file.name),
            },
            PeerEvent::TransferFailed { file_id, error } => {
                self.shown.remove(&file_id);
                println!("transfer failed: {error}");
            }
            PeerEvent::RemoteTrack(kind) => println!("peer started sending {kind:?}"),
        }
    }

    async fn deliver_envelope(&self, envelope: &SignalingEnvelope, recipient: &cnc_core::PeerId) {
        if let Some(relay) = &self.relay {
            match relay.send(envelope, recipient).await {
                Ok(()) => {
                    println!("{} sent to {} via relay", envelope.kind(), recipient.short());
                    return;
                }
                Err(e) => warn!(event = "relay_send_failed", error = %format!("{e:#}")),
            }
        }
        match envelope.to_json() {
            Ok(json) => {
                println!("give this {} code to {}:", envelope.kind(), recipient.short());
                println!("{json}");
            }
            Err(e) => println!("error: {e}"),
        }
    }
}

fn short(sender: &str) -> &str {
    match sender.char_indices().nth(6) {
        Some((i, _)) => &sender[..i],
        None => sender,
    }
}

fn mime_type_for(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "txt" | "md" | "log" => "text/plain",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

/// Reduce a peer-supplied name to a single safe path component.
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .trim_start_matches('.')
        .to_string();
    if cleaned.is_empty() {
        "download".into()
    } else {
        cleaned
    }
}

/// `dir/name`, or `dir/stem (n).ext` when that already exists.
fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() => (s, Some(e)),
        _ => (name, None),
    };
    (1u32..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
            None => dir.join(format!("{stem} ({n})")),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

async fn save_file(dir: &Path, file: &ReceivedFile) -> anyhow::Result<PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let path = unique_path(dir, &sanitize_file_name(&file.name));
    tokio::fs::write(&path, &file.data)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("  "), Ok(Command::Empty));
        assert_eq!(parse_command("hello there"), Ok(Command::Message("hello there".into())));
        assert_eq!(parse_command("/dm hi"), Ok(Command::Message("hi".into())));
        assert_eq!(parse_command("/post  first post "), Ok(Command::Post("first post".into())));
        assert_eq!(
            parse_command(r#"{"type":"initial","deviceId":"x"}"#),
            Ok(Command::Signal(r#"{"type":"initial","deviceId":"x"}"#.into()))
        );
        assert_eq!(parse_command("/send ./a b.txt"), Ok(Command::Send("./a b.txt".into())));
        assert_eq!(parse_command("/quit"), Ok(Command::Quit));
        assert!(parse_command("/post").is_err());
        assert!(parse_command("/frobnicate").is_err());
    }

    #[test]
    fn sanitizes_peer_file_names() {
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\x\\photo.jpg"), "photo.jpg");
        assert_eq!(sanitize_file_name(".bashrc"), "bashrc");
        assert_eq!(sanitize_file_name("a\u{0}b\nc"), "abc");
        assert_eq!(sanitize_file_name(".."), "download");
        assert_eq!(sanitize_file_name(""), "download");
    }

    #[test]
    fn unique_path_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(unique_path(dir.path(), "a.txt"), dir.path().join("a.txt"));
        std::fs::write(dir.path().join("a.txt"), b"1").unwrap();
        std::fs::write(dir.path().join("a (1).txt"), b"2").unwrap();
        assert_eq!(unique_path(dir.path(), "a.txt"), dir.path().join("a (2).txt"));
        std::fs::write(dir.path().join("README"), b"3").unwrap();
        assert_eq!(unique_path(dir.path(), "README"), dir.path().join("README (1)"));
    }

    #[tokio::test]
    async fn saves_received_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = ReceivedFile {
            file_id: "f".into(),
            name: "../notes.txt".into(),
            mime_type: "text/plain".into(),
            data: b"hello".to_vec(),
        };
        let path = save_file(&dir.path().join("downloads"), &file).await.unwrap();
        assert_eq!(path, dir.path().join("downloads/notes.txt"));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    fn idle_app() -> (App, mpsc::UnboundedReceiver<TransferUpdate>) {
        let connector = Arc::new(WebRtcConnector::new(std::time::Duration::from_secs(1)));
        let (core, _events) = PeerCore::new(
            cnc_core::Identity::with_id("me"),
            connector,
            cnc_core::PeerConfig::default(),
            Box::new(MemoryPostStore::new()),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let app = App {
            core,
            relay: None,
            download_dir: PathBuf::from("unused"),
            transfers: tx,
            shown: HashMap::new(),
        };
        (app, rx)
    }

    fn progress(file_id: &str, done: u64) -> TransferProgress {
        TransferProgress {
            file_id: file_id.into(),
            name: format!("{file_id}.bin"),
            done,
            total: 100,
        }
    }

    #[tokio::test]
    async fn progress_tracking_is_dropped_with_its_transfer() {
        let (mut app, _rx) = idle_app();
        app.on_transfer_update(TransferUpdate::Progress(progress("out", 30)));
        assert!(app.shown.contains_key("out"));
        app.on_transfer_update(TransferUpdate::Finished {
            file_id: "out".into(),
            name: "out.bin".into(),
            result: Err(TransferError::Send(cnc_core::TransportError::ChannelClosed)),
        });
        assert!(app.shown.is_empty());

        app.render(vec![PeerEvent::TransferStarted(progress("in", 0))]).await;
        app.render(vec![PeerEvent::TransferProgress(progress("in", 40))]).await;
        assert!(app.shown.contains_key("in"));
        app.render(vec![PeerEvent::Reset {
            reason: "data channel closed".into(),
        }])
        .await;
        assert!(app.shown.is_empty());
    }

    #[test]
    fn guesses_mime_types() {
        assert_eq!(mime_type_for("Photo.JPG"), "image/jpeg");
        assert_eq!(mime_type_for("archive.tar.zip"), "application/zip");
        assert_eq!(mime_type_for("noext"), "application/octet-stream");
    }
}
