use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::model::{AnnotationPage, PageKey, key_segment};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub new: u64,
    pub updated: u64,
    pub unchanged: u64,
}

/// Document store for annotation pages, keyed by [`PageKey`].
#[async_trait]
pub trait AnnotationStore: Send + Sync {
    /// Writes the whole batch or nothing. Pages whose content matches the
    /// stored document are left untouched.
    async fn upsert_pages(&self, pages: &[AnnotationPage]) -> Result<UpsertOutcome, StoreError>;

    /// Flags every live page whose `source` is in `sources`. Returns how many
    /// pages changed state.
    async fn deprecate_by_sources(
        &self,
        sources: &[String],
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;

    async fn get_page(&self, key: &PageKey) -> Result<Option<AnnotationPage>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Change {
    New,
    Updated,
    Unchanged,
}

fn classify(existing: Option<&AnnotationPage>, incoming: &AnnotationPage) -> Change {
    match existing {
        None => Change::New,
        Some(existing) if existing.same_content(incoming) => Change::Unchanged,
        Some(_) => Change::Updated,
    }
}

fn tally(outcome: &mut UpsertOutcome, change: Change) {
    match change {
        Change::New => outcome.new += 1,
        Change::Updated => outcome.updated += 1,
        Change::Unchanged => outcome.unchanged += 1,
    }
}

fn batch_ids(pages: &[AnnotationPage]) -> Vec<String> {
    pages
        .iter()
        .map(|page| {
            page.source
                .clone()
                .unwrap_or_else(|| page.key().to_string())
        })
        .collect()
}

/// Keeps pages in memory. Backs dry runs.
#[derive(Debug, Default)]
pub struct InMemoryAnnotationStore {
    pages: Mutex<BTreeMap<PageKey, AnnotationPage>>,
}

impl InMemoryAnnotationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.pages.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pages.lock().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<AnnotationPage> {
        self.pages.lock().await.values().cloned().collect()
    }
}

#[async_trait]
impl AnnotationStore for InMemoryAnnotationStore {
    async fn upsert_pages(&self, pages: &[AnnotationPage]) -> Result<UpsertOutcome, StoreError> {
        let mut stored = self.pages.lock().await;
        let mut outcome = UpsertOutcome::default();
        for page in pages {
            let key = page.key();
            let change = classify(stored.get(&key), page);
            tally(&mut outcome, change);
            if change != Change::Unchanged {
                stored.insert(key, page.clone());
            }
        }
        Ok(outcome)
    }

    async fn deprecate_by_sources(
        &self,
        sources: &[String],
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let sources = sources.iter().map(String::as_str).collect::<HashSet<_>>();
        let mut stored = self.pages.lock().await;
        let mut count = 0;
        for page in stored.values_mut() {
            if should_deprecate(page, &sources) {
                page.deprecated = true;
                page.last_modified = at;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn get_page(&self, key: &PageKey) -> Result<Option<AnnotationPage>, StoreError> {
        Ok(self.pages.lock().await.get(key).cloned())
    }
}

fn should_deprecate(page: &AnnotationPage, sources: &HashSet<&str>) -> bool {
    !page.deprecated
        && page
            .source
            .as_deref()
            .is_some_and(|source| sources.contains(source))
}

/// One JSON document per page under `<base>/pages/<dataset>/<local>/<page>/<lang>.json`.
#[derive(Debug)]
pub struct LocalFsAnnotationStore {
    base_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl LocalFsAnnotationStore {
    pub async fn open(base_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let base_dir = base_dir.into();
        fs::create_dir_all(base_dir.join("pages"))
            .await
            .map_err(|err| {
                StoreError::Connectivity(format!("open store at {}: {err}", base_dir.display()))
            })?;
        Ok(Self {
            base_dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn pages_dir(&self) -> PathBuf {
        self.base_dir.join("pages")
    }

    fn page_path(&self, key: &PageKey) -> Result<PathBuf, String> {
        let mut path = self.pages_dir();
        for segment in [&key.dataset_id, &key.local_id, &key.page_id] {
            path = path.join(key_segment(segment)?);
        }
        Ok(path.join(format!("{}.json", key_segment(&key.language)?)))
    }

    async fn ensure_reachable(&self) -> Result<(), StoreError> {
        match fs::metadata(self.pages_dir()).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(StoreError::Connectivity(format!(
                "{} is not a directory",
                self.pages_dir().display()
            ))),
            Err(err) => Err(StoreError::Connectivity(format!(
                "{}: {err}",
                self.pages_dir().display()
            ))),
        }
    }
}

#[async_trait]
impl AnnotationStore for LocalFsAnnotationStore {
    async fn upsert_pages(&self, pages: &[AnnotationPage]) -> Result<UpsertOutcome, StoreError> {
        let _guard = self.write_lock.lock().await;
        self.ensure_reachable().await?;

        let write_error = |message: String| StoreError::Write {
            ids: batch_ids(pages),
            message,
        };

        // Later duplicates of a key in the same batch win; each one is
        // classified against the one before it.
        let mut pending: HashMap<PathBuf, (Option<AnnotationPage>, &AnnotationPage)> =
            HashMap::new();
        let mut order = Vec::new();
        let mut outcome = UpsertOutcome::default();
        for page in pages {
            let path = self.page_path(&page.key()).map_err(write_error)?;
            let change = match pending.get_mut(&path) {
                Some((_, previous)) => {
                    let change = classify(Some(*previous), page);
                    *previous = page;
                    change
                }
                None => {
                    let existing = read_json::<AnnotationPage>(&path)
                        .await
                        .map_err(|err| classify_io(pages, err))?;
                    let change = classify(existing.as_ref(), page);
                    pending.insert(path.clone(), (existing, page));
                    order.push(path);
                    change
                }
            };
            tally(&mut outcome, change);
        }

        let mut staged = Vec::new();
        for path in order {
            let Some((existing, page)) = pending.remove(&path) else {
                continue;
            };
            if existing.as_ref().is_some_and(|e| e.same_content(page)) {
                continue;
            }
            match stage_json(&path, page).await {
                Ok(tmp) => staged.push(Staged {
                    tmp,
                    path,
                    previous: existing,
                }),
                Err(err) => {
                    discard_staged(&staged).await;
                    return Err(classify_io(pages, err));
                }
            }
        }

        commit_staged(&staged)
            .await
            .map_err(|err| classify_io(pages, err))?;
        Ok(outcome)
    }

    async fn deprecate_by_sources(
        &self,
        sources: &[String],
        at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;
        self.ensure_reachable().await?;

        let wanted = sources.iter().map(String::as_str).collect::<HashSet<_>>();
        let io_error = |err: io::Error| {
            if is_connectivity(&err) {
                StoreError::Connectivity(err.to_string())
            } else {
                StoreError::Write {
                    ids: sources.to_vec(),
                    message: err.to_string(),
                }
            }
        };

        let mut count = 0;
        for path in list_json_files(&self.pages_dir()).await.map_err(io_error)? {
            let Some(mut page) = read_json::<AnnotationPage>(&path).await.map_err(io_error)? else {
                continue;
            };
            if !should_deprecate(&page, &wanted) {
                continue;
            }
            page.deprecated = true;
            page.last_modified = at;
            let tmp = stage_json(&path, &page).await.map_err(io_error)?;
            fs::rename(&tmp, &path).await.map_err(io_error)?;
            count += 1;
        }
        Ok(count)
    }

    async fn get_page(&self, key: &PageKey) -> Result<Option<AnnotationPage>, StoreError> {
        self.ensure_reachable().await?;
        let path = self.page_path(key).map_err(StoreError::Corrupt)?;
        read_json(&path).await.map_err(|err| {
            if is_connectivity(&err) {
                StoreError::Connectivity(err.to_string())
            } else {
                StoreError::Corrupt(format!("{}: {err}", path.display()))
            }
        })
    }
}

fn is_connectivity(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
    )
}

fn classify_io(pages: &[AnnotationPage], err: io::Error) -> StoreError {
    if is_connectivity(&err) {
        return StoreError::Connectivity(err.to_string());
    }
    StoreError::Write {
        ids: batch_ids(pages),
        message: err.to_string(),
    }
}

/// A page written under a temporary name, waiting to replace `path`.
#[derive(Debug)]
struct Staged {
    tmp: PathBuf,
    path: PathBuf,
    previous: Option<AnnotationPage>,
}

async fn discard_staged(staged: &[Staged]) {
    for Staged { tmp, .. } in staged {
        if let Err(err) = fs::remove_file(tmp).await {
            tracing::debug!(?err, tmp = %tmp.display(), "remove staged page");
        }
    }
}

/// Moves every staged page into place. If one move fails, the pages already
/// moved get their previous content back and the rest are discarded, so the
/// batch lands whole or not at all.
async fn commit_staged(staged: &[Staged]) -> io::Result<()> {
    for (index, entry) in staged.iter().enumerate() {
        if let Err(err) = fs::rename(&entry.tmp, &entry.path).await {
            discard_staged(&staged[index..]).await;
            roll_back(&staged[..index]).await;
            return Err(err);
        }
    }
    Ok(())
}

async fn roll_back(committed: &[Staged]) {
    for entry in committed.iter().rev() {
        let restored = match &entry.previous {
            Some(previous) => write_json_atomic(&entry.path, previous).await,
            None => fs::remove_file(&entry.path).await,
        };
        if let Err(err) = restored {
            tracing::error!(?err, path = %entry.path.display(), "failed to roll back page");
        }
    }
}

pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    let value = serde_json::from_slice(&bytes).map_err(|err| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("parse {}: {err}", path.display()),
        )
    })?;
    Ok(Some(value))
}

/// Writes `value` next to `path` under a unique temporary name.
pub(crate) async fn stage_json<T: serde::Serialize>(path: &Path, value: &T) -> io::Result<PathBuf> {
    let parent = path.parent().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path has no parent: {}", path.display()),
        )
    })?;
    fs::create_dir_all(parent).await?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    fs::write(&tmp_path, &data).await?;
    Ok(tmp_path)
}

pub(crate) async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let tmp_path = stage_json(path, value).await?;
    fs::rename(&tmp_path, path).await
}

async fn list_json_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut entries = fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_dir() {
                stack.push(path);
                continue;
            }
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::build_page;
    use crate::preview::AnnotationPreview;

    fn page(local_id: &str, language: &str, text: &str) -> anyhow::Result<AnnotationPage> {
        let preview = AnnotationPreview::builder()
            .record_id(format!("/9200/{local_id}"))
            .media(format!("https://media.example/{local_id}.mp4"))
            .language(language)
            .format("text/plain")
            .payload(text)
            .source(format!("https://annotations.example/{local_id}"))
            .build()?;
        Ok(build_page(&preview, Utc::now())?)
    }

    async fn exercise_store(store: &dyn AnnotationStore) -> anyhow::Result<()> {
        let first = vec![page("a", "en", "hello")?, page("b", "en", "world")?];
        let outcome = store.upsert_pages(&first).await?;
        assert_eq!(outcome, UpsertOutcome { new: 2, updated: 0, unchanged: 0 });

        let again = vec![page("a", "en", "hello")?, page("b", "en", "changed")?];
        let outcome = store.upsert_pages(&again).await?;
        assert_eq!(outcome, UpsertOutcome { new: 0, updated: 1, unchanged: 1 });

        let stored = store
            .get_page(&again[1].key())
            .await?
            .ok_or_else(|| anyhow::anyhow!("page b missing"))?;
        assert_eq!(stored.resource.value, "changed");

        let sources = vec!["https://annotations.example/a".to_owned()];
        assert_eq!(store.deprecate_by_sources(&sources, Utc::now()).await?, 1);
        assert_eq!(store.deprecate_by_sources(&sources, Utc::now()).await?, 0);
        let deprecated = store
            .get_page(&first[0].key())
            .await?
            .ok_or_else(|| anyhow::anyhow!("page a missing"))?;
        assert!(deprecated.deprecated);

        // Reappearing in the changed feed revives the page.
        let outcome = store.upsert_pages(&[page("a", "en", "hello")?]).await?;
        assert_eq!(outcome.updated, 1);
        Ok(())
    }

    #[tokio::test]
    async fn in_memory_store_upserts_and_deprecates() -> anyhow::Result<()> {
        exercise_store(&InMemoryAnnotationStore::new()).await
    }

    #[tokio::test]
    async fn local_fs_store_upserts_and_deprecates() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = LocalFsAnnotationStore::open(temp.path().join("store")).await?;
        exercise_store(&store).await?;

        let documents = list_json_files(&store.pages_dir()).await?;
        assert_eq!(documents.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn duplicate_keys_in_one_batch_count_once_as_new() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = LocalFsAnnotationStore::open(temp.path()).await?;
        let batch = vec![page("a", "en", "one")?, page("a", "en", "two")?];
        let outcome = store.upsert_pages(&batch).await?;
        assert_eq!(outcome, UpsertOutcome { new: 1, updated: 1, unchanged: 0 });
        let stored = store.get_page(&batch[0].key()).await?;
        assert_eq!(stored.map(|p| p.resource.value), Some("two".to_owned()));
        Ok(())
    }

    #[tokio::test]
    async fn languages_are_separate_documents() -> anyhow::Result<()> {
        let store = InMemoryAnnotationStore::new();
        let outcome = store
            .upsert_pages(&[page("a", "en", "hello")?, page("a", "de", "hallo")?])
            .await?;
        assert_eq!(outcome.new, 2);
        assert_eq!(store.len().await, 2);
        Ok(())
    }

    fn leftover_tmp_files(dir: &Path) -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if name.contains(".tmp.") {
                names.push(name);
            }
        }
        Ok(names)
    }

    #[tokio::test]
    async fn failed_move_restores_earlier_pages_and_cleans_up() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = LocalFsAnnotationStore::open(temp.path()).await?;
        let old = page("a", "en", "old")?;
        store.upsert_pages(std::slice::from_ref(&old)).await?;

        let replaced = store.page_path(&old.key()).map_err(anyhow::Error::msg)?;
        let fresh = page("b", "en", "new")?;
        let blocked = store.page_path(&fresh.key()).map_err(anyhow::Error::msg)?;
        let staged = vec![
            Staged {
                tmp: stage_json(&replaced, &page("a", "en", "changed")?).await?,
                path: replaced.clone(),
                previous: Some(old),
            },
            Staged {
                tmp: stage_json(&blocked, &fresh).await?,
                path: blocked.clone(),
                previous: None,
            },
        ];
        // A non-empty directory sits where the second document should go.
        std::fs::create_dir_all(blocked.join("occupied"))?;

        assert!(commit_staged(&staged).await.is_err());
        let kept = read_json::<AnnotationPage>(&replaced).await?;
        assert_eq!(kept.map(|p| p.resource.value), Some("old".to_owned()));
        for path in [&replaced, &blocked] {
            let parent = path.parent().ok_or_else(|| anyhow::anyhow!("no parent"))?;
            assert_eq!(leftover_tmp_files(parent)?, Vec::<String>::new());
        }
        Ok(())
    }

    #[tokio::test]
    async fn failed_move_of_a_new_page_removes_it_again() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = LocalFsAnnotationStore::open(temp.path()).await?;
        let first = page("a", "en", "one")?;
        let second = page("b", "en", "two")?;
        let first_path = store.page_path(&first.key()).map_err(anyhow::Error::msg)?;
        let second_path = store.page_path(&second.key()).map_err(anyhow::Error::msg)?;
        let staged = vec![
            Staged {
                tmp: stage_json(&first_path, &first).await?,
                path: first_path.clone(),
                previous: None,
            },
            Staged {
                tmp: second_path.with_extension("tmp.missing"),
                path: second_path,
                previous: None,
            },
        ];

        assert!(commit_staged(&staged).await.is_err());
        assert!(store.get_page(&first.key()).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn missing_store_directory_is_connectivity_error() -> anyhow::Result<()> {
        let temp = tempfile::TempDir::new()?;
        let store = LocalFsAnnotationStore::open(temp.path().join("gone")).await?;
        std::fs::remove_dir_all(temp.path().join("gone"))?;

        let err = store.upsert_pages(&[page("a", "en", "x")?]).await.unwrap_err();
        assert!(err.is_connectivity());
        let err = store
            .deprecate_by_sources(&["x".to_owned()], Utc::now())
            .await
            .unwrap_err();
        assert!(err.is_connectivity());
        Ok(())
    }
}
