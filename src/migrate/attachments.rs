use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::model::source::SourceAttachment;
use crate::model::target::TargetUpload;
use crate::providers::{SourceClient, TargetClient};
use crate::util::filename::sanitize_filename;

/// A card attachment and where it ended up. Lives for one card's migration.
#[derive(Debug, Clone)]
pub struct AttachmentMapping {
    pub attachment: SourceAttachment,
    /// `None` when the attachment could not be (or is not meant to be) rehosted.
    pub upload: Option<TargetUpload>,
    /// Set once `upload.url` appears in migrated text.
    pub replaced: bool,
}

impl AttachmentMapping {
    fn new(attachment: SourceAttachment, upload: Option<TargetUpload>) -> Self {
        Self {
            attachment,
            upload,
            replaced: false,
        }
    }
}

pub struct Rehoster<'a> {
    source: &'a dyn SourceClient,
    target: &'a dyn TargetClient,
}

impl<'a> Rehoster<'a> {
    pub fn new(source: &'a dyn SourceClient, target: &'a dyn TargetClient) -> Self {
        Self { source, target }
    }

    /// Copy one attachment across. Failures degrade to a mapping without upload.
    pub async fn rehost(&self, attachment: SourceAttachment) -> AttachmentMapping {
        if !attachment.is_upload {
            return AttachmentMapping::new(attachment, None);
        }

        let bytes = match self.source.download_attachment(&attachment.url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(url = %attachment.url, "attachment download failed: {e:#}");
                return AttachmentMapping::new(attachment, None);
            }
        };

        let dir = match tempfile::Builder::new().prefix("trellab-").tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                warn!(url = %attachment.url, "could not create temp dir: {e}");
                return AttachmentMapping::new(attachment, None);
            }
        };
        let result = self.store_and_upload(dir.path(), &attachment, &bytes).await;
        let dir_path = dir.path().to_path_buf();
        if let Err(e) = dir.close() {
            warn!(path = %dir_path.display(), "failed to remove temp dir: {e}");
        }

        match result {
            Ok(upload) => {
                debug!(name = %attachment.name, url = %upload.url, "rehosted attachment");
                AttachmentMapping::new(attachment, Some(upload))
            }
            Err(e) => {
                warn!(url = %attachment.url, "attachment upload failed: {e:#}");
                AttachmentMapping::new(attachment, None)
            }
        }
    }

    pub async fn rehost_all(&self, attachments: Vec<SourceAttachment>) -> Vec<AttachmentMapping> {
        let mut mappings = Vec::with_capacity(attachments.len());
        for attachment in attachments {
            mappings.push(self.rehost(attachment).await);
        }
        mappings
    }

    async fn store_and_upload(
        &self,
        dir: &Path,
        attachment: &SourceAttachment,
        bytes: &[u8],
    ) -> Result<TargetUpload> {
        let path = dir.join(sanitize_filename(&attachment.name));
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        self.target
            .upload_file(&path, attachment.mime_type.as_deref())
            .await
    }
}
