use rusqlite::{params, Connection, ErrorCode};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::cipher::EntryCipher;
use crate::error::{StoreError, StoreResult};

const DB_FILE_EXTENSION: &str = "sqlite";
/// Names the exported database a key change is about to commit
const COMMIT_MARKER: &str = "COMMIT";

/// Whose stores a manager or registry entry refers to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreScope {
    /// Stores shared by every user of the app
    Global,
    User(String),
}

impl std::fmt::Display for StoreScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreScope::Global => f.write_str("global"),
            StoreScope::User(user) => write!(f, "user:{}", user),
        }
    }
}

/// Maps store names to encrypted database files for one scope.
///
/// Layout under the root directory:
/// `users/<user>/stores/<name>/<name>.sqlite` for user stores and
/// `global/stores/<name>/<name>.sqlite` for global ones.
#[derive(Debug, Clone)]
pub struct DatabaseManager {
    root: PathBuf,
    scope: StoreScope,
}

impl DatabaseManager {
    pub fn new<P: AsRef<Path>>(root: P, scope: StoreScope) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            scope,
        }
    }

    pub fn scope(&self) -> &StoreScope {
        &self.scope
    }

    /// Directory holding every store of this scope
    pub fn stores_dir(&self) -> PathBuf {
        match &self.scope {
            StoreScope::Global => self.root.join("global").join("stores"),
            StoreScope::User(user) => self.root.join("users").join(user).join("stores"),
        }
    }

    pub fn store_dir(&self, store_name: &str) -> PathBuf {
        self.stores_dir().join(store_name)
    }

    pub fn full_db_file_path(&self, store_name: &str) -> PathBuf {
        self.store_dir(store_name)
            .join(format!("{}.{}", store_name, DB_FILE_EXTENSION))
    }

    /// Directory of the store's externally stored entries
    pub fn blob_root(&self, store_name: &str) -> PathBuf {
        self.store_dir(store_name)
            .join(format!("{}_soupdata", store_name))
    }

    /// Entry files re-encrypted for a key change that has not been committed yet.
    /// Sits beside the blob root so entry listings never see it.
    fn staging_dir(&self, store_name: &str) -> PathBuf {
        self.store_dir(store_name)
            .join(format!(".{}_soupdata.staging", store_name))
    }

    pub fn persistent_store_exists(&self, store_name: &str) -> bool {
        self.full_db_file_path(store_name).is_file()
    }

    /// Create the store directory (and parents) with restricted permissions
    pub fn create_store_dir(&self, store_name: &str) -> StoreResult<PathBuf> {
        validate_store_name(store_name)?;
        let dir = self.store_dir(store_name);
        fs::create_dir_all(&dir)?;
        self.protect_store_dir_if_needed(store_name)?;
        Ok(dir)
    }

    /// Owner-only permissions on the store directory and its files, and
    /// exclusion from device backups where the platform supports it
    pub fn protect_store_dir_if_needed(&self, store_name: &str) -> StoreResult<()> {
        let dir = self.store_dir(store_name);
        if !dir.exists() {
            return Ok(());
        }
        restrict_permissions(&dir, 0o700)?;
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                restrict_permissions(&entry.path(), 0o600)?;
            }
        }
        if let Err(e) = exclude_from_backup(&dir) {
            warn!("Could not exclude {} from backup: {}", dir.display(), e);
        }
        Ok(())
    }

    /// Open (creating if needed) the store's database, keyed when `key` is given.
    ///
    /// An existing file that cannot be read with the key is reported as
    /// `KeyMismatch` and left untouched.
    pub fn open_store_database(
        &self,
        store_name: &str,
        key: Option<&str>,
    ) -> StoreResult<Connection> {
        self.create_store_dir(store_name)?;
        self.recover_interrupted_export(store_name)?;
        let path = self.full_db_file_path(store_name);
        let existed = path.exists();

        let conn = open_connection(&path, key)?;
        check_access(&conn, store_name)?;
        if !existed {
            info!("Created store database {}", path.display());
            self.protect_store_dir_if_needed(store_name)?;
        } else {
            debug!("Opened store database {}", path.display());
        }
        Ok(conn)
    }

    /// Check that the store file opens with `key` without keeping it open
    pub fn verify_database_access(&self, store_name: &str, key: Option<&str>) -> StoreResult<()> {
        let path = self.full_db_file_path(store_name);
        if !path.is_file() {
            return Err(StoreError::StoreNotFound(store_name.to_string()));
        }
        let conn = open_connection(&path, key)?;
        check_access(&conn, store_name)
    }

    /// Encrypt a plaintext store with `key`. The store must not be open.
    pub fn encrypt_db(&self, store_name: &str, key: &str) -> StoreResult<()> {
        self.export_db(store_name, None, Some(key))?;
        info!("Encrypted store '{}'", store_name);
        Ok(())
    }

    /// Decrypt a store keyed with `old_key` back to plaintext. The store must not be open.
    pub fn unencrypt_db(&self, store_name: &str, old_key: &str) -> StoreResult<()> {
        self.export_db(store_name, Some(old_key), None)?;
        info!("Unencrypted store '{}'", store_name);
        Ok(())
    }

    /// Move a store from `old_key` to `new_key`. The store must not be open.
    pub fn rekey_db(&self, store_name: &str, old_key: &str, new_key: &str) -> StoreResult<()> {
        self.export_db(store_name, Some(old_key), Some(new_key))?;
        info!("Rekeyed store '{}'", store_name);
        Ok(())
    }

    /// Change the key of a store and its entry files.
    ///
    /// Entry files are re-encrypted into a staging directory and the database is
    /// exported into a sibling temp file. Renaming that file over the original is
    /// the commit point; staged files are moved in afterwards. A failure before
    /// the rename leaves the store untouched, and a crash after it is finished
    /// on the next open.
    fn export_db(
        &self,
        store_name: &str,
        source_key: Option<&str>,
        target_key: Option<&str>,
    ) -> StoreResult<()> {
        let path = self.full_db_file_path(store_name);
        if !path.is_file() {
            return Err(StoreError::StoreNotFound(store_name.to_string()));
        }
        self.recover_interrupted_export(store_name)?;

        let conn = open_connection(&path, source_key)?;
        check_access(&conn, store_name)?;

        let staging = self.staging_dir(store_name);
        let exported = match self.prepare_export(store_name, conn, source_key, target_key) {
            Ok(exported) => exported,
            Err(e) => {
                if let Err(cleanup) = fs::remove_dir_all(&staging) {
                    warn!("Could not remove {}: {}", staging.display(), cleanup);
                }
                return Err(e);
            }
        };

        fs::rename(&exported, &path)?;
        let moved = self.swap_in_staged_files(store_name)?;
        if moved > 0 {
            debug!("Re-encrypted {} entry files of '{}'", moved, store_name);
        }
        self.protect_store_dir_if_needed(store_name)?;
        Ok(())
    }

    /// Stage entry files and the exported database, then write the commit
    /// marker. Returns the exported database path.
    fn prepare_export(
        &self,
        store_name: &str,
        conn: Connection,
        source_key: Option<&str>,
        target_key: Option<&str>,
    ) -> StoreResult<PathBuf> {
        let staging = self.staging_dir(store_name);
        fs::create_dir_all(&staging)?;
        stage_entry_files(&self.blob_root(store_name), &staging, source_key, target_key)?;

        let tmp = tempfile::Builder::new()
            .prefix(&self.export_prefix(store_name))
            .suffix(&format!(".{}", DB_FILE_EXTENSION))
            .tempfile_in(self.store_dir(store_name))?
            .into_temp_path();
        let tmp_str = tmp.to_str().ok_or_else(|| {
            StoreError::InternalError(format!("non UTF-8 path {}", tmp.display()))
        })?;

        conn.execute(
            "ATTACH DATABASE ?1 AS export KEY ?2",
            params![tmp_str, target_key.unwrap_or("")],
        )?;
        conn.query_row("SELECT sqlcipher_export('export')", [], |_| Ok(()))?;
        conn.execute("DETACH DATABASE export", [])?;
        conn.close().map_err(|(_, e)| e)?;

        let file_name = tmp
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| StoreError::InternalError(format!("bad temp path {}", tmp.display())))?;
        let exported = tmp.keep().map_err(io::Error::from)?;
        let marker_tmp = staging.join(format!("{}.tmp", COMMIT_MARKER));
        fs::write(&marker_tmp, file_name)?;
        fs::rename(&marker_tmp, staging.join(COMMIT_MARKER))?;
        Ok(exported)
    }

    fn export_prefix(&self, store_name: &str) -> String {
        format!(".{}-export-", store_name)
    }

    /// Move staged entry files over the live ones and drop the staging directory
    fn swap_in_staged_files(&self, store_name: &str) -> StoreResult<usize> {
        let staging = self.staging_dir(store_name);
        let blob_root = self.blob_root(store_name);
        let mut moved = 0;
        for soup_dir in fs::read_dir(&staging)? {
            let soup_dir = soup_dir?;
            if !soup_dir.file_type()?.is_dir() {
                continue;
            }
            let target_dir = blob_root.join(soup_dir.file_name());
            fs::create_dir_all(&target_dir)?;
            for file in fs::read_dir(soup_dir.path())? {
                let file = file?;
                fs::rename(file.path(), target_dir.join(file.file_name()))?;
                moved += 1;
            }
        }
        fs::remove_dir_all(&staging)?;
        Ok(moved)
    }

    /// Finish or discard a key change a crash left behind. The change committed
    /// when the marker's exported database no longer exists (it was renamed).
    fn recover_interrupted_export(&self, store_name: &str) -> StoreResult<()> {
        let staging = self.staging_dir(store_name);
        if !staging.is_dir() {
            return Ok(());
        }
        let store_dir = self.store_dir(store_name);
        let committed = match fs::read_to_string(staging.join(COMMIT_MARKER)) {
            Ok(name) => !store_dir.join(name.trim()).exists(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        if committed {
            warn!("Finishing interrupted key change of store '{}'", store_name);
            self.swap_in_staged_files(store_name)?;
            return Ok(());
        }

        warn!("Discarding interrupted key change of store '{}'", store_name);
        let prefix = self.export_prefix(store_name);
        for entry in fs::read_dir(&store_dir)? {
            let entry = entry?;
            let leftover = entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(&prefix));
            if leftover && entry.file_type()?.is_file() {
                fs::remove_file(entry.path())?;
            }
        }
        fs::remove_dir_all(&staging)?;
        Ok(())
    }

    pub fn remove_store_dir(&self, store_name: &str) -> StoreResult<()> {
        validate_store_name(store_name)?;
        let dir = self.store_dir(store_name);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            info!("Removed store directory {}", dir.display());
        }
        Ok(())
    }

    /// Names of stores with a database file in this scope, sorted
    pub fn all_store_names(&self) -> StoreResult<Vec<String>> {
        let dir = self.stores_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                if self.persistent_store_exists(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

fn validate_store_name(store_name: &str) -> StoreResult<()> {
    let bad = store_name.is_empty()
        || store_name == "."
        || store_name == ".."
        || store_name.contains(['/', '\\', '\0']);
    if bad {
        return Err(StoreError::InvalidStoreName(store_name.to_string()));
    }
    Ok(())
}

/// Re-encrypt every entry file under `blob_root` into the same layout under
/// `staging`. Live files are only read.
fn stage_entry_files(
    blob_root: &Path,
    staging: &Path,
    old_key: Option<&str>,
    new_key: Option<&str>,
) -> StoreResult<usize> {
    if !blob_root.is_dir() {
        return Ok(0);
    }
    let old = old_key.filter(|k| !k.is_empty()).map(EntryCipher::from_store_key);
    let new = new_key.filter(|k| !k.is_empty()).map(EntryCipher::from_store_key);

    let mut count = 0;
    for soup_dir in fs::read_dir(blob_root)? {
        let soup_dir = soup_dir?;
        if !soup_dir.file_type()?.is_dir() {
            continue;
        }
        let staged_dir = staging.join(soup_dir.file_name());
        fs::create_dir_all(&staged_dir)?;
        for file in fs::read_dir(soup_dir.path())? {
            let file = file?;
            if !file.file_type()?.is_file() {
                continue;
            }
            let bytes = fs::read(file.path())?;
            let plain = match &old {
                Some(cipher) => cipher.decrypt(&bytes)?,
                None => bytes,
            };
            let out = match &new {
                Some(cipher) => cipher.encrypt(&plain)?,
                None => plain,
            };
            fs::write(staged_dir.join(file.file_name()), out)?;
            count += 1;
        }
    }
    Ok(count)
}

fn open_connection(path: &Path, key: Option<&str>) -> StoreResult<Connection> {
    let conn = Connection::open(path)?;
    if let Some(key) = key {
        conn.pragma_update(None, "key", key)?;
    }
    Ok(conn)
}

/// The first read of a keyed database is where a wrong key shows up
fn check_access(conn: &Connection, store_name: &str) -> StoreResult<()> {
    match conn.query_row("SELECT count(*) FROM sqlite_master", [], |r| {
        r.get::<_, i64>(0)
    }) {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::NotADatabase => {
            Err(StoreError::KeyMismatch(store_name.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
fn exclude_from_backup(path: &Path) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())?;
    let name = CString::new("com.apple.MobileBackup")?;
    let value: u8 = 1;
    let rc = unsafe {
        libc::setxattr(
            c_path.as_ptr(),
            name.as_ptr(),
            &value as *const u8 as *const libc::c_void,
            1,
            0,
            0,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(target_os = "macos", target_os = "ios")))]
fn exclude_from_backup(_path: &Path) -> io::Result<()> {
    Ok(())
}
