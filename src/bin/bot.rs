#![forbid(unsafe_code)]

//! Telegram front end for the download flow: `/start`, send a URL, answer `1`
//! (video) or `2` (audio), receive the file.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use mediadrop_tools::{
    config::{RuntimeOverrides, resolve_runtime_settings},
    conversation::{ChatOutbox, FlowController},
    downloader::YtDlp,
    logging,
    security::ensure_not_root,
};
use teloxide::{prelude::*, types::InputFile};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(version, about = "Telegram bot that downloads media on request")]
struct BotArgs {
    /// Where downloaded files are stored (defaults to DOWNLOAD_FOLDER).
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long)]
    env_file: Option<PathBuf>,
}

impl BotArgs {
    fn overrides(&self) -> RuntimeOverrides {
        RuntimeOverrides {
            download_dir: self.output_dir.clone(),
            env_path: self.env_file.clone(),
            ..RuntimeOverrides::default()
        }
    }
}

/// [`ChatOutbox`] backed by the Bot API.
struct TelegramOutbox {
    bot: Bot,
}

#[async_trait]
impl ChatOutbox for TelegramOutbox {
    async fn send_text(&self, chat: i64, text: String) -> Result<()> {
        self.bot
            .send_message(ChatId(chat), text)
            .await
            .context("sending message")?;
        Ok(())
    }

    async fn send_file(&self, chat: i64, path: &Path) -> Result<()> {
        self.bot
            .send_document(ChatId(chat), InputFile::file(path.to_path_buf()))
            .await
            .with_context(|| format!("sending {}", path.display()))?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = BotArgs::parse();
    logging::init("info");
    ensure_not_root("bot")?;

    let settings = resolve_runtime_settings(args.overrides())?;
    let token = settings.require_bot_token()?.to_string();
    fs::create_dir_all(&settings.download_dir)
        .with_context(|| format!("creating {}", settings.download_dir.display()))?;

    let ytdlp = YtDlp::new(settings.ytdlp_program.clone(), settings.download_dir.clone());
    ytdlp.ensure_available()?;
    let flow = Arc::new(FlowController::new(Arc::new(ytdlp)));

    info!(dir = %settings.download_dir.display(), "bot started");

    let handler = Update::filter_message().endpoint(on_message);
    Dispatcher::builder(Bot::new(token), handler)
        .dependencies(dptree::deps![flow])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

/// Updates of one chat arrive here one at a time, so a running download holds
/// back that chat's next message until it is delivered.
async fn on_message(bot: Bot, flow: Arc<FlowController>, msg: Message) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let chat = msg.chat.id.0;
    let outbox = TelegramOutbox { bot };
    if let Err(err) = flow.handle_text(chat, text, &outbox).await {
        let message = format!("{err:#}");
        error!(chat, error = %message, "could not reply");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_output_dir_and_env_file() {
        let args = BotArgs::try_parse_from([
            "bot",
            "--output-dir",
            "/srv/media",
            "--env-file",
            "/etc/mediadrop.env",
        ])
        .unwrap();
        let overrides = args.overrides();
        assert_eq!(overrides.download_dir, Some(PathBuf::from("/srv/media")));
        assert_eq!(overrides.env_path, Some(PathBuf::from("/etc/mediadrop.env")));
        assert!(overrides.server_port.is_none());
    }

    #[test]
    fn no_flags_means_no_overrides() {
        let args = BotArgs::try_parse_from(["bot"]).unwrap();
        let overrides = args.overrides();
        assert!(overrides.download_dir.is_none());
        assert!(overrides.env_path.is_none());
    }

    #[test]
    fn rejects_positional_arguments() {
        assert!(BotArgs::try_parse_from(["bot", "extra"]).is_err());
    }
}
