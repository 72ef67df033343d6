//! File-backed message store.
//!
//! Each message is kept as three files sharing the message id as stem:
//! `<id>.meta` (JSON metadata), `<id>.header` (header lines) and `<id>.body`
//! (raw bytes). Write order is header, body, meta and removal order is
//! header, body, meta, so an interruption at any point leaves a state the
//! startup scan can recognize: a meta file is the marker that a message
//! exists, and a meta without its siblings is a fragment to be cleaned up.

use std::path::{Path, PathBuf};

use postrider_common::{BodyBuffer, Header, SourceAddr};
use tracing::{debug, warn};

use crate::{error::Result, message::QueueMetadata};

const META_EXT: &str = "meta";
const HEADER_EXT: &str = "header";
const BODY_EXT: &str = "body";

/// On-disk store for queued messages.
#[derive(Debug, Clone)]
pub struct DiskStore {
    location: PathBuf,
}

impl DiskStore {
    /// Open (creating if needed) the store directory.
    ///
    /// # Errors
    /// Fails if the directory cannot be created.
    pub async fn open(location: impl Into<PathBuf>) -> Result<Self> {
        let location = location.into();
        tokio::fs::create_dir_all(&location).await?;
        Ok(Self { location })
    }

    #[must_use]
    pub fn location(&self) -> &Path {
        &self.location
    }

    fn file_path(&self, id: &str, ext: &str) -> PathBuf {
        self.location.join(format!("{id}.{ext}"))
    }

    /// Persist a new message: header file, then the body streamed from its
    /// source, then metadata. On failure every file created so far is removed
    /// again (best effort, reverse order) and the error is surfaced.
    ///
    /// Returns a file-backed body buffer so later attempts no longer depend
    /// on the upstream body staying valid.
    ///
    /// # Errors
    /// Any I/O or serialization failure of the three writes.
    pub async fn store_new_message(
        &self,
        meta: &QueueMetadata,
        header: &Header,
        body: &BodyBuffer,
    ) -> Result<BodyBuffer> {
        let id = meta.msg_meta.id.as_str();

        let header_path = self.file_path(id, HEADER_EXT);
        if let Err(err) = tokio::fs::write(&header_path, header.to_bytes()).await {
            self.remove_dangling(id, HEADER_EXT).await;
            return Err(err.into());
        }

        let body_path = self.file_path(id, BODY_EXT);
        if let Err(err) = Self::copy_body(body, &body_path).await {
            self.remove_dangling(id, BODY_EXT).await;
            self.remove_dangling(id, HEADER_EXT).await;
            return Err(err);
        }

        if let Err(err) = self.update_metadata(meta).await {
            self.remove_dangling(id, BODY_EXT).await;
            self.remove_dangling(id, HEADER_EXT).await;
            return Err(err);
        }

        Ok(BodyBuffer::File(body_path))
    }

    async fn copy_body(body: &BodyBuffer, dest: &Path) -> Result<()> {
        let mut reader = body.open().await?;
        let mut file = tokio::fs::File::create(dest).await?;
        tokio::io::copy(&mut reader, &mut file).await?;
        Ok(())
    }

    /// Rewrite `<id>.meta` with the current state of `meta`.
    ///
    /// The source network address is erased unless it is a plain TCP address:
    /// nothing else is guaranteed to deserialize again.
    ///
    /// # Errors
    /// I/O or serialization failure.
    pub async fn update_metadata(&self, meta: &QueueMetadata) -> Result<()> {
        let mut copy = meta.clone();
        if !matches!(copy.msg_meta.src_addr, Some(SourceAddr::Tcp(_)) | None) {
            copy.msg_meta.src_addr = None;
        }

        let encoded = serde_json::to_vec(&copy)?;
        tokio::fs::write(self.file_path(&meta.msg_meta.id, META_EXT), encoded).await?;
        Ok(())
    }

    async fn read_metadata(&self, id: &str) -> Result<QueueMetadata> {
        let raw = tokio::fs::read(self.file_path(id, META_EXT)).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Load a message for a delivery attempt.
    ///
    /// Returns `Ok(None)` when the triple is incomplete; the surviving
    /// fragments are removed first so the id will not come back.
    ///
    /// # Errors
    /// Fails if the metadata file itself cannot be read or parsed.
    pub async fn open_message(
        &self,
        id: &str,
    ) -> Result<Option<(QueueMetadata, Header, BodyBuffer)>> {
        let meta = self.read_metadata(id).await?;

        let body_path = self.file_path(id, BODY_EXT);
        if !tokio::fs::try_exists(&body_path).await.unwrap_or(false) {
            self.remove_dangling(id, META_EXT).await;
            return Ok(None);
        }

        let header_path = self.file_path(id, HEADER_EXT);
        let raw_header = match tokio::fs::read(&header_path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.remove_dangling(id, META_EXT).await;
                self.remove_dangling(id, BODY_EXT).await;
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        let header = match Header::parse(&raw_header) {
            Ok(header) => header,
            Err(err) => {
                warn!(msg_id = %id, error = %err, "unparseable header file, skipping message");
                return Ok(None);
            }
        };

        Ok(Some((meta, header, BodyBuffer::File(body_path))))
    }

    /// Remove all three files of a message.
    ///
    /// Removal failures are logged, never fatal: a left-over meta file is
    /// picked up by the next startup scan.
    pub async fn remove(&self, id: &str) {
        for ext in [HEADER_EXT, BODY_EXT, META_EXT] {
            if let Err(err) = tokio::fs::remove_file(self.file_path(id, ext)).await {
                warn!(msg_id = %id, file = ext, error = %err, "failed to remove message file");
            }
        }
        debug!(msg_id = %id, "removed message from disk");
    }

    /// Startup reconciliation scan.
    ///
    /// Walks the store directory looking at `.meta` files only: metadata that
    /// fails to parse is skipped (and left in place, for operators to
    /// inspect); a meta whose header or body file is missing has its
    /// surviving fragments deleted. Orphan `.header`/`.body` files without a
    /// meta are not cleaned here.
    ///
    /// # Errors
    /// Fails only if the directory itself cannot be read.
    pub async fn scan(&self) -> Result<Vec<QueueMetadata>> {
        let mut dir = tokio::fs::read_dir(&self.location).await?;
        let mut loaded = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(id) = name.strip_suffix(".meta") else {
                continue;
            };

            let meta = match self.read_metadata(id).await {
                Ok(meta) => meta,
                Err(err) => {
                    warn!(msg_id = %id, error = %err, "failed to read metadata, skipping");
                    continue;
                }
            };

            let header_exists = tokio::fs::try_exists(self.file_path(id, HEADER_EXT))
                .await
                .unwrap_or(false);
            if !header_exists {
                warn!(msg_id = %id, "header file missing, dropping fragments");
                self.remove_dangling(id, META_EXT).await;
                self.remove_dangling(id, BODY_EXT).await;
                continue;
            }

            let body_exists = tokio::fs::try_exists(self.file_path(id, BODY_EXT))
                .await
                .unwrap_or(false);
            if !body_exists {
                warn!(msg_id = %id, "body file missing, dropping fragments");
                self.remove_dangling(id, META_EXT).await;
                self.remove_dangling(id, HEADER_EXT).await;
                continue;
            }

            loaded.push(meta);
        }

        Ok(loaded)
    }

    async fn remove_dangling(&self, id: &str, ext: &str) {
        let path = self.file_path(id, ext);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(file = %path.display(), "removed dangling file"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(file = %path.display(), error = %err, "failed to remove dangling file"),
        }
    }
}

#[cfg(test)]
mod tests {
    use postrider_common::{BodyBuffer, MsgMetadata, SourceAddr};

    use super::*;

    fn test_meta(id: &str) -> QueueMetadata {
        let mut meta = QueueMetadata::new(MsgMetadata::new(id), "sender@example.com", false);
        meta.to = vec!["rcpt@example.org".to_string()];
        meta
    }

    fn test_header() -> Header {
        let mut header = Header::new();
        header.append("From", "sender@example.com");
        header.append("Subject", "test");
        header
    }

    async fn test_store() -> (tempfile::TempDir, DiskStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = DiskStore::open(dir.path()).await.expect("open store");
        (dir, store)
    }

    #[tokio::test]
    async fn store_and_open_round_trip() {
        let (_dir, store) = test_store().await;
        let meta = test_meta("msg1");
        let body = BodyBuffer::from(b"foobar".as_slice());

        let stored = store
            .store_new_message(&meta, &test_header(), &body)
            .await
            .expect("store");

        // The returned buffer is file-backed and independent of the original.
        assert!(matches!(stored, BodyBuffer::File(_)));
        assert_eq!(stored.read_to_vec().await.expect("read"), b"foobar");

        let (meta, header, body) = store
            .open_message("msg1")
            .await
            .expect("open")
            .expect("complete triple");
        assert_eq!(meta.msg_meta.id, "msg1");
        assert_eq!(header.get("Subject"), Some("test"));
        assert_eq!(body.read_to_vec().await.expect("read"), b"foobar");
    }

    #[tokio::test]
    async fn remove_deletes_all_three_files() {
        let (dir, store) = test_store().await;
        let meta = test_meta("msg2");
        store
            .store_new_message(&meta, &test_header(), &BodyBuffer::from(b"x".as_slice()))
            .await
            .expect("store");

        store.remove("msg2").await;

        for ext in ["meta", "header", "body"] {
            assert!(
                !dir.path().join(format!("msg2.{ext}")).exists(),
                "{ext} file should be gone"
            );
        }
    }

    #[tokio::test]
    async fn open_message_drops_meta_without_body() {
        let (dir, store) = test_store().await;
        let meta = test_meta("msg3");
        store
            .store_new_message(&meta, &test_header(), &BodyBuffer::from(b"x".as_slice()))
            .await
            .expect("store");
        tokio::fs::remove_file(dir.path().join("msg3.body"))
            .await
            .expect("remove body");

        assert!(store.open_message("msg3").await.expect("open").is_none());
        assert!(!dir.path().join("msg3.meta").exists());
    }

    #[tokio::test]
    async fn open_message_drops_meta_and_body_without_header() {
        let (dir, store) = test_store().await;
        let meta = test_meta("msg4");
        store
            .store_new_message(&meta, &test_header(), &BodyBuffer::from(b"x".as_slice()))
            .await
            .expect("store");
        tokio::fs::remove_file(dir.path().join("msg4.header"))
            .await
            .expect("remove header");

        assert!(store.open_message("msg4").await.expect("open").is_none());
        assert!(!dir.path().join("msg4.meta").exists());
        assert!(!dir.path().join("msg4.body").exists());
    }

    #[tokio::test]
    async fn scan_loads_complete_triples_only() {
        let (dir, store) = test_store().await;
        store
            .store_new_message(
                &test_meta("whole"),
                &test_header(),
                &BodyBuffer::from(b"x".as_slice()),
            )
            .await
            .expect("store");
        store
            .store_new_message(
                &test_meta("fragment"),
                &test_header(),
                &BodyBuffer::from(b"x".as_slice()),
            )
            .await
            .expect("store");
        tokio::fs::remove_file(dir.path().join("fragment.header"))
            .await
            .expect("remove header");
        // A pure orphan without a meta file is ignored entirely.
        tokio::fs::write(dir.path().join("orphan.body"), b"y")
            .await
            .expect("write orphan");

        let loaded = store.scan().await.expect("scan");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].msg_meta.id, "whole");

        assert!(!dir.path().join("fragment.meta").exists());
        assert!(!dir.path().join("fragment.body").exists());
        assert!(dir.path().join("orphan.body").exists());
    }

    #[tokio::test]
    async fn scan_skips_unparseable_metadata() {
        let (dir, store) = test_store().await;
        tokio::fs::write(dir.path().join("broken.meta"), b"{ not json")
            .await
            .expect("write");

        let loaded = store.scan().await.expect("scan");
        assert!(loaded.is_empty());
        // Corrupt metadata is left in place rather than silently destroyed.
        assert!(dir.path().join("broken.meta").exists());
    }

    #[tokio::test]
    async fn non_tcp_source_addr_is_erased_on_save() {
        let (_dir, store) = test_store().await;

        let mut meta = test_meta("addr1");
        meta.msg_meta.src_addr = Some(SourceAddr::Other("/run/ingress.sock".to_string()));
        store
            .store_new_message(&meta, &test_header(), &BodyBuffer::from(b"x".as_slice()))
            .await
            .expect("store");
        let (loaded, _, _) = store
            .open_message("addr1")
            .await
            .expect("open")
            .expect("triple");
        assert!(loaded.msg_meta.src_addr.is_none());

        let mut meta = test_meta("addr2");
        let tcp = SourceAddr::Tcp("198.51.100.3:42887".parse().expect("addr"));
        meta.msg_meta.src_addr = Some(tcp.clone());
        store
            .store_new_message(&meta, &test_header(), &BodyBuffer::from(b"x".as_slice()))
            .await
            .expect("store");
        let (loaded, _, _) = store
            .open_message("addr2")
            .await
            .expect("open")
            .expect("triple");
        assert_eq!(loaded.msg_meta.src_addr, Some(tcp));
    }
}
