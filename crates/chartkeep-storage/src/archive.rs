//! Write-once archive of raw feed bodies, addressed by their SHA-256 digest.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveDate;
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

/// Hex SHA-256 of a feed body; stamped on runs as their input digest.
pub fn feed_digest(raw: &[u8]) -> String {
    hex::encode(Sha256::digest(raw))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedFeed {
    pub digest: String,
    /// Relative to the archive root: `<date>/<source>/<digest>.json`.
    pub path: PathBuf,
    pub byte_size: usize,
    /// Identical bytes were already archived for this date and source.
    pub reused: bool,
}

#[derive(Debug, Clone)]
pub struct FeedArchive {
    root: PathBuf,
}

impl FeedArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(snapshot_date: NaiveDate, source: &str, digest: &str) -> PathBuf {
        let source: String = source
            .trim()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        let source = if source.is_empty() { "feed".to_string() } else { source };
        PathBuf::from(snapshot_date.to_string())
            .join(source)
            .join(format!("{digest}.json"))
    }

    /// Keep the exact feed bytes a run consumed. Entries are never rewritten.
    pub async fn archive(
        &self,
        snapshot_date: NaiveDate,
        source: Option<&str>,
        raw: &[u8],
    ) -> anyhow::Result<ArchivedFeed> {
        let digest = feed_digest(raw);
        let path = Self::entry_path(snapshot_date, source.unwrap_or("feed"), &digest);
        let target = self.root.join(&path);
        let archived = ArchivedFeed {
            digest,
            path,
            byte_size: raw.len(),
            reused: true,
        };

        if fs::try_exists(&target)
            .await
            .with_context(|| format!("checking archived feed {}", target.display()))?
        {
            return Ok(archived);
        }

        let dir = target.parent().unwrap_or(self.root.as_path());
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating feed archive directory {}", dir.display()))?;
        let staging = dir.join(format!(".{}.partial", Uuid::new_v4()));
        fs::write(&staging, raw)
            .await
            .with_context(|| format!("writing {}", staging.display()))?;
        if let Err(err) = fs::rename(&staging, &target).await {
            let _ = fs::remove_file(&staging).await;
            return Err(err).with_context(|| format!("moving feed into {}", target.display()));
        }
        Ok(ArchivedFeed {
            reused: false,
            ..archived
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, day).expect("date")
    }

    #[test]
    fn digest_is_hex_sha256() {
        assert_eq!(
            feed_digest(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn same_feed_twice_reuses_the_archived_entry() {
        let dir = tempdir().expect("tempdir");
        let archive = FeedArchive::new(dir.path());
        let body = br#"{"snapshot_date":"2026-03-01","rows":[]}"#;

        let first = archive.archive(date(1), Some("daily sheet"), body).await.unwrap();
        let second = archive.archive(date(1), Some("daily sheet"), body).await.unwrap();

        assert!(!first.reused);
        assert!(second.reused);
        assert_eq!(first.path, second.path);
        assert_eq!(
            first.path,
            PathBuf::from("2026-03-01/daily_sheet").join(format!("{}.json", first.digest))
        );
        assert_eq!(std::fs::read(dir.path().join(&first.path)).unwrap(), body);
    }

    #[tokio::test]
    async fn unnamed_sources_land_under_feed() {
        let dir = tempdir().expect("tempdir");
        let archive = FeedArchive::new(dir.path());
        let archived = archive.archive(date(2), None, b"{}").await.unwrap();
        assert!(archived.path.starts_with("2026-03-02/feed"));
        assert_eq!(archived.byte_size, 2);
    }
}
