//! In-memory job store holding cached videos and download jobs.
//!
//! One instance is built at startup and shared (behind an `Arc`) by the
//! orchestrator and the HTTP handlers. Every operation takes the lock for a
//! single short critical section; records are replaced whole on update.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;

use crate::models::{Download, DownloadStatus, DownloadUpdate, NewDownload, NewVideo, Video};

#[derive(Default)]
pub struct JobStore {
    inner: RwLock<StoreInner>,
}

struct StoreInner {
    videos: HashMap<String, Video>,
    downloads: HashMap<u64, Download>,
    next_download_id: u64,
    generation: u64,
}

impl Default for StoreInner {
    fn default() -> Self {
        Self {
            videos: HashMap::new(),
            downloads: HashMap::new(),
            next_download_id: 1,
            generation: 0,
        }
    }
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_video(&self, video_id: &str) -> Option<Video> {
        self.inner.read().videos.get(video_id).cloned()
    }

    /// Caches a video record. Callers check [`JobStore::get_video`] first;
    /// the store does not arbitrate between racing writers for one id.
    pub fn create_video(&self, new: NewVideo) -> Video {
        let NewVideo { url, info } = new;
        let video = Video {
            video_id: info.id,
            url,
            title: info.title,
            description: info.description,
            duration: info.duration,
            thumbnail: info.thumbnail,
            channel: info.channel,
            views: info.views,
            upload_date: info.upload_date,
            available_qualities: info.available_qualities,
            created_at: Utc::now(),
        };
        self.inner
            .write()
            .videos
            .insert(video.video_id.clone(), video.clone());
        video
    }

    pub fn get_download(&self, id: u64) -> Option<Download> {
        self.inner.read().downloads.get(&id).cloned()
    }

    pub fn get_downloads_by_status(&self, status: DownloadStatus) -> Vec<Download> {
        let mut matches: Vec<Download> = self
            .inner
            .read()
            .downloads
            .values()
            .filter(|download| download.status == status)
            .cloned()
            .collect();
        matches.sort_by_key(|download| download.id);
        matches
    }

    /// Most recent downloads first. Ties on `created_at` fall back to the id
    /// so repeated calls always return the same order.
    pub fn get_download_history(&self, limit: usize) -> Vec<Download> {
        let mut all: Vec<Download> = self.inner.read().downloads.values().cloned().collect();
        all.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        all.truncate(limit);
        all
    }

    pub fn create_download(&self, new: NewDownload) -> Download {
        self.create_download_in(new).0
    }

    /// Creates a download and returns it with the generation it belongs to,
    /// both read under one lock.
    pub fn create_download_in(&self, new: NewDownload) -> (Download, u64) {
        let mut inner = self.inner.write();
        let id = inner.next_download_id;
        inner.next_download_id += 1;
        let download = Download {
            id,
            video_id: new.video_id,
            url: new.url,
            title: new.title,
            quality: new.quality,
            format: new.format,
            status: DownloadStatus::Pending,
            progress: 0,
            file_path: None,
            file_size: None,
            download_speed: None,
            eta: None,
            error: None,
            thumbnail: new.thumbnail,
            created_at: Utc::now(),
            completed_at: None,
        };
        inner.downloads.insert(id, download.clone());
        (download, inner.generation)
    }

    /// Merges `update` into the stored record. The first transition into
    /// `completed` stamps `completed_at`; later ones leave it untouched. A
    /// transition into `failed` drops `completed_at` and `file_path`.
    pub fn update_download(&self, id: u64, update: DownloadUpdate) -> Option<Download> {
        let mut inner = self.inner.write();
        let existing = inner.downloads.get_mut(&id)?;
        apply_update(existing, update);
        Some(existing.clone())
    }

    /// Like [`JobStore::update_download`] but only while the store is still in
    /// `generation`. A history clear in between turns the update into a no-op,
    /// so a job started before the clear never writes into a reused id.
    pub fn update_download_in(
        &self,
        generation: u64,
        id: u64,
        update: DownloadUpdate,
    ) -> Option<Download> {
        let mut inner = self.inner.write();
        if inner.generation != generation {
            return None;
        }
        let existing = inner.downloads.get_mut(&id)?;
        apply_update(existing, update);
        Some(existing.clone())
    }

    pub fn delete_download(&self, id: u64) -> bool {
        self.inner.write().downloads.remove(&id).is_some()
    }

    /// Drops every download and restarts ids at 1. Cached videos survive.
    pub fn clear_history(&self) {
        let mut inner = self.inner.write();
        inner.downloads.clear();
        inner.next_download_id = 1;
        inner.generation += 1;
    }

    pub fn generation(&self) -> u64 {
        self.inner.read().generation
    }
}

fn apply_update(existing: &mut Download, update: DownloadUpdate) {
    let DownloadUpdate {
        status,
        progress,
        file_path,
        file_size,
        download_speed,
        eta,
        error,
    } = update;

    if let Some(status) = status {
        match status {
            DownloadStatus::Completed if existing.completed_at.is_none() => {
                existing.completed_at = Some(Utc::now());
            }
            DownloadStatus::Failed => {
                existing.completed_at = None;
                existing.file_path = None;
            }
            _ => {}
        }
        existing.status = status;
    }
    if let Some(progress) = progress {
        existing.progress = progress.min(100);
    }
    if file_path.is_some() {
        existing.file_path = file_path;
    }
    if file_size.is_some() {
        existing.file_size = file_size;
    }
    if download_speed.is_some() {
        existing.download_speed = download_speed;
    }
    if eta.is_some() {
        existing.eta = eta;
    }
    if error.is_some() {
        existing.error = error;
    }
}
