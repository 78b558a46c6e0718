#![forbid(unsafe_code)]

//! Download job orchestration around the external `yt-dlp` tool: metadata
//! lookup, background downloads with live progress, and an in-memory job
//! history.

pub mod config;
pub mod download;
pub mod error;
pub mod metadata;
pub mod models;
pub mod notifier;
pub mod progress;
pub mod security;
pub mod store;
pub mod validators;
pub mod ytdlp;

#[cfg(test)]
mod test_support;
