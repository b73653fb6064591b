use std::io::{Cursor, Read};

use tabula_core::{base_name, FileFormat, ManifestEntry, Phase, PipelineError};
use tabula_storage::{sha256_hex, HttpFetcher, RecordStore};
use thiserror::Error;
use tracing::{debug, info, warn};
use zip::result::ZipError;
use zip::ZipArchive;

/// A fetched body ready for archiving.
#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub entry: ManifestEntry,
    pub body: Vec<u8>,
    pub checksum_sha256: String,
    pub is_preferred_format: bool,
}

#[derive(Debug, Default)]
pub struct DownloadOutcome {
    pub files: Vec<DownloadedFile>,
    pub errors: Vec<PipelineError>,
    /// Entries whose URL was already archived.
    pub skipped: usize,
}

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("unreadable archive: {0}")]
    Archive(#[from] ZipError),
    #[error("reading archive member `{name}`: {source}")]
    Member {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("archive holds no usable files")]
    Empty,
}

/// Preferred unless a sibling (same publication, same base name) has a
/// strictly better format.
pub fn is_preferred<'a>(
    entry: &ManifestEntry,
    candidates: impl IntoIterator<Item = &'a ManifestEntry>,
) -> bool {
    let stem = base_name(&entry.filename);
    let rank = entry.format.priority();
    !candidates.into_iter().any(|other| {
        other.publication_id == entry.publication_id
            && other.filename != entry.filename
            && base_name(&other.filename) == stem
            && other.format.priority() < rank
    })
}

fn skip_member(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    path.ends_with('/') || path.starts_with("__MACOSX/") || path.starts_with('.') || name.starts_with('.')
}

/// Upper bound on the buffer reserved from a member's declared size. The
/// header is untrusted; `read_to_end` grows past this when the data is real.
const MAX_MEMBER_PREALLOC: u64 = 64 << 20;

fn preallocation(declared: u64) -> usize {
    usize::try_from(declared.min(MAX_MEMBER_PREALLOC)).unwrap_or(0)
}

/// Unpack a zip body into child files that inherit the parent's publication,
/// source and metadata. Preference is decided among the members only.
pub fn expand_container(
    parent: &ManifestEntry,
    body: &[u8],
) -> Result<Vec<DownloadedFile>, ContainerError> {
    let mut archive = ZipArchive::new(Cursor::new(body))?;
    let mut members: Vec<(ManifestEntry, Vec<u8>)> = Vec::new();

    for index in 0..archive.len() {
        let mut member = archive.by_index(index)?;
        let path = member.name().to_string();
        if member.is_dir() || skip_member(&path) || member.size() == 0 {
            continue;
        }

        let mut bytes = Vec::with_capacity(preallocation(member.size()));
        member
            .read_to_end(&mut bytes)
            .map_err(|source| ContainerError::Member {
                name: path.clone(),
                source,
            })?;
        if bytes.is_empty() {
            continue;
        }

        let filename = path.rsplit('/').next().unwrap_or(&path).to_string();
        let child = ManifestEntry {
            url: format!("{}#{filename}", parent.url),
            format: FileFormat::from_filename(&filename),
            filename,
            extracted_from: Some(parent.filename.clone()),
            inline_content: None,
            is_new: true,
            ..parent.clone()
        };
        members.push((child, bytes));
    }

    if members.is_empty() {
        return Err(ContainerError::Empty);
    }

    let entries: Vec<ManifestEntry> = members.iter().map(|(entry, _)| entry.clone()).collect();
    Ok(members
        .into_iter()
        .map(|(entry, body)| DownloadedFile {
            is_preferred_format: is_preferred(&entry, &entries),
            checksum_sha256: sha256_hex(&body),
            entry,
            body,
        })
        .collect())
}

fn download_error(entry: &ManifestEntry, message: impl Into<String>) -> PipelineError {
    PipelineError::new(Phase::Download, message)
        .with_source(entry.source.as_str())
        .with_file(entry.filename.clone())
}

/// Fetch every new entry, skipping URLs that are already archived.
pub async fn download_entries(
    http: &HttpFetcher,
    records: &dyn RecordStore,
    entries: &[ManifestEntry],
) -> DownloadOutcome {
    let mut outcome = DownloadOutcome::default();
    let wanted: Vec<&ManifestEntry> = entries.iter().filter(|entry| entry.is_new).collect();

    for entry in &wanted {
        match records.file_by_download_url(&entry.url).await {
            Ok(Some(existing)) => {
                debug!(url = %entry.url, file = %existing.id, "already archived; skipping");
                outcome.skipped += 1;
                continue;
            }
            Ok(None) => {}
            Err(err) => warn!(url = %entry.url, error = %err, "archive lookup failed; downloading anyway"),
        }

        let body = match &entry.inline_content {
            Some(content) => content.clone().into_bytes(),
            None => match http.fetch_binary(&entry.url).await {
                Ok(response) => response.body,
                Err(err) => {
                    warn!(url = %entry.url, error = %err, "download failed");
                    outcome.errors.push(download_error(entry, err.to_string()));
                    continue;
                }
            },
        };

        if body.is_empty() {
            outcome
                .errors
                .push(download_error(entry, format!("downloaded file is 0 bytes: {}", entry.url)));
            continue;
        }

        let file = DownloadedFile {
            entry: (*entry).clone(),
            checksum_sha256: sha256_hex(&body),
            is_preferred_format: is_preferred(entry, wanted.iter().copied()),
            body,
        };

        if file.entry.format != FileFormat::Zip {
            outcome.files.push(file);
            continue;
        }

        match expand_container(&file.entry, &file.body) {
            Ok(children) => {
                info!(file = %file.entry.filename, members = children.len(), "expanded archive");
                outcome.files.extend(children);
            }
            Err(err) => {
                warn!(file = %file.entry.filename, error = %err, "archive expansion failed; keeping container");
                outcome
                    .errors
                    .push(download_error(&file.entry, format!("zip extraction failed: {err}")));
                outcome.files.push(file);
            }
        }
    }

    info!(
        downloaded = outcome.files.len(),
        requested = wanted.len(),
        skipped = outcome.skipped,
        "download phase finished"
    );
    outcome
}
