#![forbid(unsafe_code)]

//! Per-chat dialogue that turns `/start`, a URL and a format choice into a
//! delivered file.
//!
//! The controller knows nothing about Telegram: replies go through
//! [`ChatOutbox`] and downloads through [`Downloader`], so the whole flow can
//! be driven from tests.

use std::{collections::HashMap, path::Path, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::downloader::{DownloadError, DownloadResult, Downloader, FormatSelector};

pub const URL_PROMPT: &str = "👋 Send me a YouTube / Instagram / TikTok / etc. URL";
pub const FORMAT_PROMPT: &str = "🎯 Pick a format:\n1️⃣ Video MP4\n2️⃣ Audio MP3";
pub const INVALID_CHOICE: &str = "❌ Invalid choice. Type 1 or 2.";
pub const DOWNLOADING: &str = "⏳ Downloading...";
pub const SENDING: &str = "📤 Sending file...";
pub const DONE: &str = "✅ Done! Send /start to go again.";
pub const RETRY_HINT: &str = "Try again with another URL.";

/// Where a chat currently is. A chat without an entry has no session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    AwaitingUrl,
    AwaitingFormat { url: String },
}

/// What one incoming message did.
#[derive(Debug)]
pub enum Outcome {
    Started,
    UrlAccepted,
    FormatRejected,
    Completed(DownloadResult),
    Failed(String),
    Ignored,
}

/// Outgoing side of a chat transport.
#[async_trait]
pub trait ChatOutbox: Send + Sync {
    async fn send_text(&self, chat: i64, text: String) -> Result<()>;
    async fn send_file(&self, chat: i64, path: &Path) -> Result<()>;
}

enum Step {
    Start,
    AcceptUrl,
    RejectChoice,
    Download { url: String, format: FormatSelector },
    Ignore,
}

pub struct FlowController {
    downloader: Arc<dyn Downloader>,
    sessions: Mutex<HashMap<i64, SessionState>>,
}

impl FlowController {
    pub fn new(downloader: Arc<dyn Downloader>) -> Self {
        Self {
            downloader,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    #[cfg(test)]
    pub(crate) fn session(&self, chat: i64) -> Option<SessionState> {
        self.sessions.lock().get(&chat).cloned()
    }

    /// Feeds one text message into the chat's session and performs whatever
    /// replies and downloads it triggers. Only transport failures while
    /// replying surface as `Err`.
    pub async fn handle_text(
        &self,
        chat: i64,
        text: &str,
        outbox: &dyn ChatOutbox,
    ) -> Result<Outcome> {
        match self.advance(chat, text) {
            Step::Ignore => {
                debug!(chat, "ignoring message outside a session");
                Ok(Outcome::Ignored)
            }
            Step::Start => {
                outbox.send_text(chat, URL_PROMPT.into()).await?;
                Ok(Outcome::Started)
            }
            Step::AcceptUrl => {
                outbox.send_text(chat, FORMAT_PROMPT.into()).await?;
                Ok(Outcome::UrlAccepted)
            }
            Step::RejectChoice => {
                outbox.send_text(chat, INVALID_CHOICE.into()).await?;
                Ok(Outcome::FormatRejected)
            }
            Step::Download { url, format } => self.deliver(chat, url, format, outbox).await,
        }
    }

    /// State transition only; no I/O happens under the session lock.
    fn advance(&self, chat: i64, text: &str) -> Step {
        let text = text.trim();
        let mut sessions = self.sessions.lock();

        if is_start_command(text) {
            sessions.insert(chat, SessionState::AwaitingUrl);
            return Step::Start;
        }
        if text.starts_with('/') {
            return Step::Ignore;
        }

        match sessions.get(&chat).cloned() {
            None => Step::Ignore,
            Some(SessionState::AwaitingUrl) => {
                sessions.insert(
                    chat,
                    SessionState::AwaitingFormat {
                        url: text.to_string(),
                    },
                );
                Step::AcceptUrl
            }
            Some(SessionState::AwaitingFormat { url }) => match parse_choice(text) {
                Some(format) => {
                    sessions.remove(&chat);
                    Step::Download { url, format }
                }
                None => Step::RejectChoice,
            },
        }
    }

    async fn deliver(
        &self,
        chat: i64,
        url: String,
        format: FormatSelector,
        outbox: &dyn ChatOutbox,
    ) -> Result<Outcome> {
        outbox.send_text(chat, DOWNLOADING.into()).await?;
        info!(chat, url = %url, format = format.label(), "starting download");

        let downloader = Arc::clone(&self.downloader);
        let downloaded = tokio::task::spawn_blocking(move || downloader.download(&url, format))
            .await
            .unwrap_or_else(|err| Err(DownloadError::Aborted(err.to_string())));

        let result = match downloaded {
            Ok(result) => result,
            Err(err) => return self.report_failure(chat, err.to_string(), outbox).await,
        };

        outbox.send_text(chat, summary(&result)).await?;
        outbox.send_text(chat, SENDING.into()).await?;
        if let Err(err) = outbox.send_file(chat, &result.path).await {
            return self.report_failure(chat, format!("{err:#}"), outbox).await;
        }
        outbox.send_text(chat, DONE.into()).await?;
        info!(chat, path = %result.path.display(), "file delivered");
        Ok(Outcome::Completed(result))
    }

    async fn report_failure(
        &self,
        chat: i64,
        message: String,
        outbox: &dyn ChatOutbox,
    ) -> Result<Outcome> {
        error!(chat, error = %message, "download flow failed");
        outbox.send_text(chat, format!("❌ Error: {message}")).await?;
        outbox.send_text(chat, RETRY_HINT.into()).await?;
        Ok(Outcome::Failed(message))
    }
}

/// `/start`, `/start@SomeBot` and `/start payload` all count.
fn is_start_command(text: &str) -> bool {
    let command = text.split_whitespace().next().unwrap_or_default();
    command == "/start" || command.starts_with("/start@")
}

fn parse_choice(text: &str) -> Option<FormatSelector> {
    match text {
        "1" => Some(FormatSelector::Video),
        "2" => Some(FormatSelector::Audio),
        _ => None,
    }
}

fn summary(result: &DownloadResult) -> String {
    let title = result.title.as_deref().unwrap_or("unknown");
    let uploader = result.uploader.as_deref().unwrap_or("unknown");
    let duration = result
        .duration
        .map(|secs| format!("{secs} sec"))
        .unwrap_or_else(|| "unknown".to_string());
    format!("📹 Title: {title}\n📺 Uploader: {uploader}\n⏱️ Duration: {duration}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::path::PathBuf;

    #[derive(Debug, Clone, PartialEq)]
    enum Sent {
        Text(i64, String),
        File(i64, PathBuf),
    }

    #[derive(Default)]
    struct RecordingOutbox {
        sent: Mutex<Vec<Sent>>,
        fail_files: bool,
    }

    impl RecordingOutbox {
        fn texts(&self) -> Vec<String> {
            self.sent
                .lock()
                .iter()
                .filter_map(|sent| match sent {
                    Sent::Text(_, text) => Some(text.clone()),
                    Sent::File(..) => None,
                })
                .collect()
        }

        fn files(&self) -> Vec<PathBuf> {
            self.sent
                .lock()
                .iter()
                .filter_map(|sent| match sent {
                    Sent::File(_, path) => Some(path.clone()),
                    Sent::Text(..) => None,
                })
                .collect()
        }
    }

    #[async_trait]
    impl ChatOutbox for RecordingOutbox {
        async fn send_text(&self, chat: i64, text: String) -> Result<()> {
            self.sent.lock().push(Sent::Text(chat, text));
            Ok(())
        }

        async fn send_file(&self, chat: i64, path: &Path) -> Result<()> {
            if self.fail_files {
                return Err(anyhow!("upload rejected"));
            }
            self.sent.lock().push(Sent::File(chat, path.to_path_buf()));
            Ok(())
        }
    }

    /// Records every call; URLs containing `fail` produce an engine error.
    #[derive(Default)]
    struct FakeDownloader {
        calls: Mutex<Vec<(String, FormatSelector)>>,
    }

    impl Downloader for FakeDownloader {
        fn download(
            &self,
            url: &str,
            format: FormatSelector,
        ) -> Result<DownloadResult, DownloadError> {
            self.calls.lock().push((url.to_string(), format));
            if url.contains("fail") {
                return Err(DownloadError::Engine("ERROR: Unsupported URL".into()));
            }
            Ok(DownloadResult {
                path: PathBuf::from(format!("/media/clip.{}", format.extension())),
                title: Some("Clip".into()),
                uploader: None,
                duration: Some(42),
            })
        }

        fn expected_filename(
            &self,
            _url: &str,
            format: FormatSelector,
        ) -> Result<PathBuf, DownloadError> {
            Ok(PathBuf::from(format!("/media/clip.{}", format.extension())))
        }
    }

    fn controller() -> (FlowController, Arc<FakeDownloader>) {
        let downloader = Arc::new(FakeDownloader::default());
        (FlowController::new(downloader.clone()), downloader)
    }

    #[tokio::test]
    async fn invalid_choice_keeps_waiting_then_audio_downloads() {
        let (flow, downloader) = controller();
        let outbox = RecordingOutbox::default();

        let outcome = flow.handle_text(7, "/start", &outbox).await.unwrap();
        assert!(matches!(outcome, Outcome::Started));
        assert_eq!(flow.session(7), Some(SessionState::AwaitingUrl));

        let outcome = flow.handle_text(7, "not-a-number", &outbox).await.unwrap();
        assert!(matches!(outcome, Outcome::UrlAccepted));
        assert_eq!(
            flow.session(7),
            Some(SessionState::AwaitingFormat {
                url: "not-a-number".into()
            })
        );

        let outcome = flow.handle_text(7, "3", &outbox).await.unwrap();
        assert!(matches!(outcome, Outcome::FormatRejected));
        assert!(matches!(
            flow.session(7),
            Some(SessionState::AwaitingFormat { .. })
        ));
        assert!(downloader.calls.lock().is_empty());

        let outcome = flow.handle_text(7, "2", &outbox).await.unwrap();
        assert!(matches!(outcome, Outcome::Completed(_)));
        assert_eq!(flow.session(7), None);
        assert_eq!(
            *downloader.calls.lock(),
            vec![("not-a-number".to_string(), FormatSelector::Audio)]
        );

        let texts = outbox.texts();
        assert_eq!(texts[0], URL_PROMPT);
        assert_eq!(texts[1], FORMAT_PROMPT);
        assert_eq!(texts[2], INVALID_CHOICE);
        assert_eq!(texts[3], DOWNLOADING);
        assert!(texts[4].contains("Title: Clip"));
        assert!(texts[4].contains("Uploader: unknown"));
        assert!(texts[4].contains("42 sec"));
        assert_eq!(texts[5], SENDING);
        assert_eq!(texts[6], DONE);
        assert_eq!(outbox.files(), vec![PathBuf::from("/media/clip.mp3")]);
    }

    #[tokio::test]
    async fn video_choice_and_trimmed_url() {
        let (flow, downloader) = controller();
        let outbox = RecordingOutbox::default();
        flow.handle_text(1, "/start", &outbox).await.unwrap();
        flow.handle_text(1, "  https://v.test/a  ", &outbox)
            .await
            .unwrap();
        flow.handle_text(1, " 1 ", &outbox).await.unwrap();
        assert_eq!(
            *downloader.calls.lock(),
            vec![("https://v.test/a".to_string(), FormatSelector::Video)]
        );
    }

    #[tokio::test]
    async fn text_without_session_is_ignored() {
        let (flow, downloader) = controller();
        let outbox = RecordingOutbox::default();
        let outcome = flow.handle_text(3, "https://v.test/a", &outbox).await.unwrap();
        assert!(matches!(outcome, Outcome::Ignored));
        let outcome = flow.handle_text(3, "1", &outbox).await.unwrap();
        assert!(matches!(outcome, Outcome::Ignored));
        assert!(outbox.sent.lock().is_empty());
        assert!(downloader.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn other_commands_inside_session_are_ignored() {
        let (flow, _) = controller();
        let outbox = RecordingOutbox::default();
        flow.handle_text(3, "/start", &outbox).await.unwrap();
        let outcome = flow.handle_text(3, "/help", &outbox).await.unwrap();
        assert!(matches!(outcome, Outcome::Ignored));
        assert_eq!(flow.session(3), Some(SessionState::AwaitingUrl));
    }

    #[tokio::test]
    async fn start_restarts_an_active_session() {
        let (flow, _) = controller();
        let outbox = RecordingOutbox::default();
        flow.handle_text(5, "/start", &outbox).await.unwrap();
        flow.handle_text(5, "https://v.test/a", &outbox).await.unwrap();
        let outcome = flow
            .handle_text(5, "/start@MediaDropBot", &outbox)
            .await
            .unwrap();
        assert!(matches!(outcome, Outcome::Started));
        assert_eq!(flow.session(5), Some(SessionState::AwaitingUrl));
    }

    #[tokio::test]
    async fn sessions_are_per_chat() {
        let (flow, _) = controller();
        let outbox = RecordingOutbox::default();
        flow.handle_text(1, "/start", &outbox).await.unwrap();
        flow.handle_text(2, "/start payload", &outbox).await.unwrap();
        flow.handle_text(1, "https://v.test/one", &outbox)
            .await
            .unwrap();
        assert_eq!(flow.session(2), Some(SessionState::AwaitingUrl));
        assert!(matches!(
            flow.session(1),
            Some(SessionState::AwaitingFormat { .. })
        ));
    }

    #[tokio::test]
    async fn engine_failure_is_reported_and_session_ends() {
        let (flow, _) = controller();
        let outbox = RecordingOutbox::default();
        flow.handle_text(9, "/start", &outbox).await.unwrap();
        flow.handle_text(9, "https://v.test/fail", &outbox)
            .await
            .unwrap();
        let outcome = flow.handle_text(9, "1", &outbox).await.unwrap();

        assert!(matches!(outcome, Outcome::Failed(ref message) if message.contains("Unsupported URL")));
        assert_eq!(flow.session(9), None);
        let texts = outbox.texts();
        let tail = &texts[texts.len() - 2..];
        assert!(tail[0].starts_with("❌ Error: "));
        assert_eq!(tail[1], RETRY_HINT);
        assert!(outbox.files().is_empty());
    }

    #[tokio::test]
    async fn delivery_failure_is_reported() {
        let (flow, _) = controller();
        let outbox = RecordingOutbox {
            fail_files: true,
            ..RecordingOutbox::default()
        };
        flow.handle_text(4, "/start", &outbox).await.unwrap();
        flow.handle_text(4, "https://v.test/a", &outbox).await.unwrap();
        let outcome = flow.handle_text(4, "2", &outbox).await.unwrap();

        assert!(matches!(outcome, Outcome::Failed(ref message) if message.contains("upload rejected")));
        let texts = outbox.texts();
        assert!(!texts.contains(&DONE.to_string()));
        assert_eq!(texts.last().map(String::as_str), Some(RETRY_HINT));
    }

    #[test]
    fn start_command_variants() {
        assert!(is_start_command("/start"));
        assert!(is_start_command("/start@MediaDropBot"));
        assert!(is_start_command("/start deep-link"));
        assert!(!is_start_command("/started"));
        assert!(!is_start_command("start"));
    }

    #[test]
    fn summary_falls_back_to_unknown() {
        let text = summary(&DownloadResult {
            path: PathBuf::from("x.mp4"),
            title: None,
            uploader: Some("Chan".into()),
            duration: None,
        });
        assert!(text.contains("Title: unknown"));
        assert!(text.contains("Uploader: Chan"));
        assert!(text.contains("Duration: unknown"));
    }
}
