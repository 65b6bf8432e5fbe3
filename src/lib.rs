#![forbid(unsafe_code)]

//! Shared building blocks for the mediadrop binaries: the yt-dlp invoker, the
//! batch runner, the chat flow controller and the directory catalog served
//! over HTTP.

pub mod batch;
pub mod catalog;
pub mod config;
pub mod conversation;
pub mod downloader;
pub mod logging;
pub mod security;
