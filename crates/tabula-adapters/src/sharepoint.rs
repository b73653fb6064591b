//! Minimal client for the CBS SharePoint REST API shared by the publication
//! and media-release discoverers.

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use tabula_core::{FileFormat, ManifestEntry, SourceId};
use tabula_storage::HttpFetcher;
use tracing::{debug, warn};

use crate::AdapterError;

/// SharePoint answers either verbose (`d.results`) or nometadata (`value`).
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    d: Option<Verbose<T>>,
    value: Option<Vec<T>>,
}

#[derive(Debug, Deserialize)]
struct Verbose<T> {
    results: Vec<T>,
}

impl<T> Envelope<T> {
    fn into_items(self) -> Vec<T> {
        match (self.value, self.d) {
            (Some(items), _) => items,
            (None, Some(verbose)) => verbose.results,
            (None, None) => Vec::new(),
        }
    }
}

fn loose_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) if !s.is_empty() => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct ListItem {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub cbs_english_title: Option<String>,
    #[serde(default, deserialize_with = "loose_text")]
    pub cbs_publishing_folder_level1: Option<String>,
    #[serde(default, deserialize_with = "loose_text")]
    pub cbs_publishing_folder_level2: Option<String>,
    #[serde(default)]
    pub created: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct FileFields {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub cbs_english_title: Option<String>,
    #[serde(default)]
    pub cbs_order_field: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct SpFile {
    pub name: String,
    pub server_relative_url: String,
    #[serde(default, deserialize_with = "loose_text")]
    pub length: Option<String>,
    #[serde(default)]
    pub list_item_all_fields: Option<FileFields>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SpFolder {
    name: String,
}

/// One `DocLib/<year>/<folder>` publication folder plus whatever page
/// metadata the listing strategy could attach to it.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct FolderRef {
    pub year: String,
    pub folder: String,
    pub publish_date: String,
    pub title: Option<String>,
    pub title_en: Option<String>,
}

impl FolderRef {
    pub fn bare(year: impl Into<String>, folder: impl Into<String>) -> Self {
        Self {
            year: year.into(),
            folder: folder.into(),
            ..Self::default()
        }
    }

    /// Cursor ordering key, `year/folder`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.year, self.folder)
    }
}

impl ListItem {
    /// The DocLib folder a page item points at, when both levels are set.
    pub fn into_folder(self) -> Option<FolderRef> {
        Some(FolderRef {
            year: self.cbs_publishing_folder_level1?,
            folder: self.cbs_publishing_folder_level2?,
            publish_date: self.created.unwrap_or_default(),
            title: self.title,
            title_en: self.cbs_english_title,
        })
    }
}

/// Entries found in a set of folders and the highest key that is safe to
/// store as the new cursor.
#[derive(Debug, Default)]
pub(crate) struct FolderScan {
    pub entries: Vec<ManifestEntry>,
    pub cursor_key: Option<String>,
}

pub(crate) struct SharePointSection<'a> {
    http: &'a HttpFetcher,
    base_url: &'a str,
    section: &'static str,
    source: SourceId,
}

impl<'a> SharePointSection<'a> {
    pub fn new(
        http: &'a HttpFetcher,
        base_url: &'a str,
        section: &'static str,
        source: SourceId,
    ) -> Self {
        Self {
            http,
            base_url,
            section,
            source,
        }
    }

    fn api_root(&self) -> String {
        format!("{}/he/{}/Madad/_api", self.base_url, self.section)
    }

    fn doclib_path(&self, year: &str) -> String {
        format!("/he/{}/Madad/DocLib/{year}", self.section)
    }

    pub async fn list_items(&self, year: i32) -> Result<Vec<ListItem>, AdapterError> {
        let url = format!(
            "{}/Web/Lists/Items?$filter=CbsPublishingFolderLevel1 eq '{year}'\
             &$orderby=Created desc&$top=50\
             &$select=Id,Title,CbsEnglishTitle,CbsPublishingFolderLevel1,CbsPublishingFolderLevel2,Created",
            self.api_root()
        );
        let envelope: Envelope<ListItem> = self.http.fetch_json(&url).await?;
        Ok(envelope.into_items())
    }

    pub async fn list_folders(&self, year: &str) -> Result<Vec<String>, AdapterError> {
        let url = format!(
            "{}/web/GetFolderByServerRelativeUrl('{}')/Folders",
            self.api_root(),
            self.doclib_path(year)
        );
        let envelope: Envelope<SpFolder> = self.http.fetch_json(&url).await?;
        Ok(envelope
            .into_items()
            .into_iter()
            .map(|folder| folder.name)
            .filter(|name| !name.is_empty() && name != "Forms")
            .collect())
    }

    pub async fn list_files(&self, year: &str, folder: &str) -> Result<Vec<SpFile>, AdapterError> {
        let url = format!(
            "{}/web/GetFolderByServerRelativeUrl('{}/{folder}')/Files?$expand=ListItemAllFields",
            self.api_root(),
            self.doclib_path(year)
        );
        let envelope: Envelope<SpFile> = self.http.fetch_json(&url).await?;
        Ok(envelope.into_items())
    }

    /// Enumerate every folder newer than `known`, oldest first. A folder whose
    /// listing fails is skipped and pins the cursor below it so the next run
    /// retries it.
    pub async fn scan(&self, mut folders: Vec<FolderRef>, known: Option<&str>) -> FolderScan {
        folders.retain(|folder| known.map_or(true, |known| folder.key().as_str() > known));
        folders.sort_by_key(FolderRef::key);
        folders.dedup_by_key(|folder| folder.key());

        let mut scan = FolderScan::default();
        let mut blocked = false;
        for folder in &folders {
            match self.list_files(&folder.year, &folder.folder).await {
                Ok(files) => {
                    let before = scan.entries.len();
                    scan.entries.extend(
                        files
                            .iter()
                            .filter_map(|file| self.manifest_entry(folder, file)),
                    );
                    debug!(
                        source = %self.source,
                        folder = %folder.key(),
                        files = scan.entries.len() - before,
                        "listed folder"
                    );
                    if !blocked {
                        scan.cursor_key = Some(folder.key());
                    }
                }
                Err(err) => {
                    warn!(
                        source = %self.source,
                        folder = %folder.key(),
                        error = %err,
                        "folder listing failed, will retry next run"
                    );
                    blocked = true;
                }
            }
        }
        scan
    }

    fn manifest_entry(&self, folder: &FolderRef, file: &SpFile) -> Option<ManifestEntry> {
        let format = FileFormat::from_filename(&file.name);
        if !format.is_known() {
            return None;
        }

        let fields = file.list_item_all_fields.clone().unwrap_or_default();
        let mut metadata = Map::new();
        insert_text(&mut metadata, "title", folder.title.clone());
        insert_text(&mut metadata, "title_en", folder.title_en.clone());
        insert_text(&mut metadata, "year", Some(folder.year.clone()));
        let folder_key = match self.source {
            SourceId::CbsMedia => "release_number",
            _ => "folder",
        };
        insert_text(&mut metadata, folder_key, Some(folder.folder.clone()));
        insert_text(&mut metadata, "file_title", fields.title);
        insert_text(&mut metadata, "file_title_en", fields.cbs_english_title);
        if let Some(order) = fields.cbs_order_field.filter(|v| !v.is_null()) {
            metadata.insert("order".into(), order);
        }
        if let Some(size) = file.length.as_deref().and_then(|s| s.parse::<u64>().ok()) {
            metadata.insert("size".into(), Value::from(size));
        }

        Some(ManifestEntry {
            source: self.source,
            url: format!("{}{}", self.base_url, file.server_relative_url),
            filename: file.name.clone(),
            format,
            publication_id: format!(
                "{}{}-{}",
                self.source.publication_prefix(),
                folder.year,
                folder.folder
            ),
            publish_date: folder.publish_date.clone(),
            metadata,
            is_new: true,
            inline_content: None,
            extracted_from: None,
        })
    }
}

fn insert_text(metadata: &mut Map<String, Value>, key: &str, value: Option<String>) {
    if let Some(value) = value.filter(|v| !v.is_empty()) {
        metadata.insert(key.to_string(), Value::String(value));
    }
}
