//! Contact Directory
//!
//! The engine only needs a thin view of a contact: tags, engagement, purchases,
//! and a few timestamps for time-based conditions. The CRM behind it is external;
//! [`MemoryDirectory`] stands in for it and can be seeded from a YAML fixture.
//!
//! Several processes may share one fixture, so a directory never writes its
//! whole copy back. [`MemoryDirectory::merge_into`] replays only the tag
//! edits this directory made onto whatever the file holds now.
//!
//! # Example YAML Format
//!
//! ```yaml
//! contacts:
//!   - contact_id: c1
//!     email: ada@example.com
//!     tags: [vip]
//!     opened_count: 2
//!     clicked_links: ["https://example.com/pricing"]
//!     purchased: [course_rust]
//!     timestamps:
//!       subscribedAt: 2026-01-01T09:00:00Z
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard};

use chrono::{DateTime, Utc};
use fd_lock::RwLock as FileLock;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::DirectoryError;

/// Contact data visible to condition predicates and tag actions.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ContactProfile {
    pub contact_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(default)]
    pub tags: BTreeSet<String>,

    /// Number of recorded email opens
    #[serde(default)]
    pub opened_count: u32,

    /// URLs of recorded link clicks
    #[serde(default)]
    pub clicked_links: Vec<String>,

    /// Product and course ids with a completed purchase
    #[serde(default)]
    pub purchased: BTreeSet<String>,

    /// Named timestamps such as `subscribedAt` or `lastActivityAt`
    #[serde(default)]
    pub timestamps: BTreeMap<String, DateTime<Utc>>,
}

impl ContactProfile {
    pub fn new(contact_id: impl Into<String>) -> Self {
        Self {
            contact_id: contact_id.into(),
            ..Self::default()
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_opens(mut self, count: u32) -> Self {
        self.opened_count = count;
        self
    }

    pub fn with_click(mut self, url: impl Into<String>) -> Self {
        self.clicked_links.push(url.into());
        self
    }

    pub fn with_purchase(mut self, product_id: impl Into<String>) -> Self {
        self.purchased.insert(product_id.into());
        self
    }

    pub fn with_timestamp(mut self, field: impl Into<String>, at: DateTime<Utc>) -> Self {
        self.timestamps.insert(field.into(), at);
        self
    }
}

/// Lookup and tag mutation against the contact store.
pub trait ContactDirectory: Send + Sync {
    /// Returns the profile, or [`DirectoryError::UnknownContact`].
    fn profile(&self, contact_id: &str) -> Result<ContactProfile, DirectoryError>;

    /// Adds a tag. Returns false if the contact already had it.
    fn add_tag(&self, contact_id: &str, tag: &str) -> Result<bool, DirectoryError>;

    /// Removes a tag. Returns false if the contact did not have it.
    fn remove_tag(&self, contact_id: &str, tag: &str) -> Result<bool, DirectoryError>;
}

#[derive(Serialize, Deserialize, Default)]
struct ContactFixture {
    #[serde(default)]
    contacts: Vec<ContactProfile>,
}

#[derive(Debug, Clone, PartialEq)]
struct TagEdit {
    contact_id: String,
    tag: String,
    added: bool,
}

/// In-memory directory keyed by contact id.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    contacts: RwLock<HashMap<String, ContactProfile>>,
    /// Tag changes not yet merged into a fixture
    edits: Mutex<Vec<TagEdit>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a directory from profiles.
    pub fn with_contacts(profiles: impl IntoIterator<Item = ContactProfile>) -> Self {
        let contacts = profiles
            .into_iter()
            .map(|p| (p.contact_id.clone(), p))
            .collect();
        Self {
            contacts: RwLock::new(contacts),
            edits: Mutex::new(Vec::new()),
        }
    }

    /// Loads a YAML fixture.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DirectoryError> {
        let path = path.as_ref();
        let fixture = read_fixture(path)?;
        info!(
            "Loaded {} contacts from {}",
            fixture.contacts.len(),
            path.display()
        );
        Ok(Self::with_contacts(fixture.contacts))
    }

    /// Writes the whole directory as a YAML fixture, replacing the file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), DirectoryError> {
        let contacts: Vec<ContactProfile> = self.read()?.values().cloned().collect();
        write_fixture(path.as_ref(), contacts)
    }

    /// Replays this directory's unmerged tag edits onto the fixture at
    /// `path` and returns how many were applied.
    ///
    /// The file is re-read under an exclusive lock, so edits written by
    /// other processes since this directory was loaded survive. A contact
    /// missing from the file is added with this directory's profile.
    pub fn merge_into(&self, path: impl AsRef<Path>) -> Result<usize, DirectoryError> {
        let path = path.as_ref();
        let edits = self.lock_edits()?.clone();
        if edits.is_empty() {
            return Ok(0);
        }

        let lock_path = sidecar(path, ".lock");
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| io_error(path, e))?;
        }
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| io_error(&lock_path, e))?;
        let mut lock = FileLock::new(lock_file);
        let _guard = lock.write().map_err(|e| io_error(&lock_path, e))?;

        let on_disk = if path.exists() {
            read_fixture(path)?.contacts
        } else {
            Vec::new()
        };
        let mut merged: HashMap<String, ContactProfile> = on_disk
            .into_iter()
            .map(|p| (p.contact_id.clone(), p))
            .collect();
        {
            let ours = self.read()?;
            for edit in &edits {
                match merged.get_mut(&edit.contact_id) {
                    Some(profile) if edit.added => {
                        profile.tags.insert(edit.tag.clone());
                    }
                    Some(profile) => {
                        profile.tags.remove(&edit.tag);
                    }
                    None => {
                        if let Some(profile) = ours.get(&edit.contact_id) {
                            merged.insert(edit.contact_id.clone(), profile.clone());
                        }
                    }
                }
            }
        }
        write_fixture(path, merged.into_values().collect())?;

        self.lock_edits()?.drain(..edits.len());
        info!("Merged {} tag edits into {}", edits.len(), path.display());
        Ok(edits.len())
    }

    /// Inserts or replaces a profile.
    pub fn upsert(&self, profile: ContactProfile) -> Result<(), DirectoryError> {
        self.contacts
            .write()
            .map_err(|_| poisoned())?
            .insert(profile.contact_id.clone(), profile);
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, ContactProfile>>, DirectoryError> {
        self.contacts.read().map_err(|_| poisoned())
    }

    fn lock_edits(&self) -> Result<MutexGuard<'_, Vec<TagEdit>>, DirectoryError> {
        self.edits.lock().map_err(|_| poisoned())
    }

    fn update_tags(
        &self,
        contact_id: &str,
        tag: &str,
        added: bool,
    ) -> Result<bool, DirectoryError> {
        let mut contacts = self.contacts.write().map_err(|_| poisoned())?;
        let profile = contacts
            .get_mut(contact_id)
            .ok_or_else(|| DirectoryError::UnknownContact(contact_id.to_string()))?;
        let changed = if added {
            profile.tags.insert(tag.to_string())
        } else {
            profile.tags.remove(tag)
        };
        if changed {
            self.lock_edits()?.push(TagEdit {
                contact_id: contact_id.to_string(),
                tag: tag.to_string(),
                added,
            });
        }
        Ok(changed)
    }
}

fn poisoned() -> DirectoryError {
    DirectoryError::Unavailable("lock poisoned".to_string())
}

fn io_error(path: &Path, e: impl ToString) -> DirectoryError {
    DirectoryError::Save {
        path: path.display().to_string(),
        message: e.to_string(),
    }
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

fn read_fixture(path: &Path) -> Result<ContactFixture, DirectoryError> {
    let load_error = |message: String| DirectoryError::Load {
        path: path.display().to_string(),
        message,
    };
    let content = fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;
    serde_yaml::from_str(&content).map_err(|e| load_error(e.to_string()))
}

/// Sorted by contact id, written to a temp file and renamed over `path`.
fn write_fixture(path: &Path, mut contacts: Vec<ContactProfile>) -> Result<(), DirectoryError> {
    contacts.sort_by(|a, b| a.contact_id.cmp(&b.contact_id));
    let yaml =
        serde_yaml::to_string(&ContactFixture { contacts }).map_err(|e| io_error(path, e))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|e| io_error(path, e))?;
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| io_error(path, e))?;
    tmp.write_all(yaml.as_bytes()).map_err(|e| io_error(path, e))?;
    tmp.as_file().sync_all().map_err(|e| io_error(path, e))?;
    tmp.persist(path).map_err(|e| io_error(path, e.error))?;
    Ok(())
}

impl ContactDirectory for MemoryDirectory {
    fn profile(&self, contact_id: &str) -> Result<ContactProfile, DirectoryError> {
        self.read()?
            .get(contact_id)
            .cloned()
            .ok_or_else(|| DirectoryError::UnknownContact(contact_id.to_string()))
    }

    fn add_tag(&self, contact_id: &str, tag: &str) -> Result<bool, DirectoryError> {
        let added = self.update_tags(contact_id, tag, true)?;
        debug!("add_tag {} on {}: changed={}", tag, contact_id, added);
        Ok(added)
    }

    fn remove_tag(&self, contact_id: &str, tag: &str) -> Result<bool, DirectoryError> {
        let removed = self.update_tags(contact_id, tag, false)?;
        debug!("remove_tag {} on {}: changed={}", tag, contact_id, removed);
        Ok(removed)
    }
}
