use super::*;

const ENTRY_FILE_PREFIX: &str = "soupelm_";

impl SmartStore {
    // ==================== External Storage ====================

    /// Total bytes of the soup's external entry files
    pub fn external_file_storage_size(&self, soup_name: &str) -> StoreResult<u64> {
        self.with_inner(|inner| {
            let schema = inner.require_soup(soup_name)?;
            let mut total = 0;
            for file in inner.entry_files(&schema.table_name)? {
                total += fs::metadata(file)?.len();
            }
            Ok(total)
        })
    }

    pub fn external_files_count(&self, soup_name: &str) -> StoreResult<usize> {
        self.with_inner(|inner| {
            let schema = inner.require_soup(soup_name)?;
            Ok(inner.entry_files(&schema.table_name)?.len())
        })
    }
}

impl StoreInner {
    pub(crate) fn soup_blob_dir(&self, table_name: &str) -> PathBuf {
        self.blob_root.join(table_name)
    }

    fn entry_file_path(&self, table_name: &str, entry_id: i64) -> PathBuf {
        self.soup_blob_dir(table_name)
            .join(format!("{}{}", ENTRY_FILE_PREFIX, entry_id))
    }

    fn entry_files(&self, table_name: &str) -> StoreResult<Vec<PathBuf>> {
        let dir = self.soup_blob_dir(table_name);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let is_entry_file = entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.starts_with(ENTRY_FILE_PREFIX));
            if is_entry_file && entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        Ok(files)
    }

    /// Write an entry file, encrypted when the store has a key
    pub(crate) fn save_external_entry(
        &self,
        table_name: &str,
        entry_id: i64,
        entry: &Value,
    ) -> StoreResult<()> {
        fs::create_dir_all(self.soup_blob_dir(table_name))?;
        let bytes = serde_json::to_vec(entry)?;
        let bytes = match &self.cipher {
            Some(cipher) => cipher.encrypt(&bytes)?,
            None => bytes,
        };
        fs::write(self.entry_file_path(table_name, entry_id), bytes)?;
        Ok(())
    }

    pub(crate) fn load_external_entry(&self, table_name: &str, entry_id: i64) -> StoreResult<Value> {
        let bytes = fs::read(self.entry_file_path(table_name, entry_id))?;
        let bytes = match &self.cipher {
            Some(cipher) => cipher.decrypt(&bytes)?,
            None => bytes,
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub(crate) fn delete_external_entries(&self, table_name: &str, entry_ids: &[i64]) {
        for id in entry_ids {
            let path = self.entry_file_path(table_name, *id);
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to delete {}: {}", path.display(), e);
                }
            }
        }
    }

    pub(crate) fn remove_soup_blob_dir(&self, table_name: &str) -> StoreResult<()> {
        let dir = self.soup_blob_dir(table_name);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    /// Entry JSON for one id, from the table or from its file
    pub(crate) fn load_entry(
        &self,
        conn: &Connection,
        schema: &SoupSchema,
        entry_id: i64,
    ) -> StoreResult<Option<Value>> {
        let raw: Option<Option<String>> = conn
            .query_row(
                &format!(
                    "SELECT soup FROM {} WHERE _soupEntryId = ?1",
                    schema.table_name
                ),
                [entry_id],
                |r| r.get(0),
            )
            .optional()?;
        match raw {
            None => Ok(None),
            Some(_) if schema.external_storage => self
                .load_external_entry(&schema.table_name, entry_id)
                .map(Some),
            Some(Some(json)) => Ok(Some(serde_json::from_str(&json)?)),
            Some(None) => Ok(None),
        }
    }

    /// Storage mode change during alter: files back into the `soup` column
    pub(crate) fn move_entries_into_table(&self, conn: &Connection, table_name: &str) -> StoreResult<()> {
        let ids = all_entry_ids(conn, table_name)?;
        for id in ids {
            let entry = self.load_external_entry(table_name, id)?;
            conn.execute(
                &format!("UPDATE {} SET soup = ?1 WHERE _soupEntryId = ?2", table_name),
                params![serde_json::to_string(&entry)?, id],
            )?;
        }
        Ok(())
    }

    /// Storage mode change during alter: `soup` column out to files
    pub(crate) fn move_entries_out_of_table(
        &self,
        conn: &Connection,
        table_name: &str,
    ) -> StoreResult<()> {
        let rows: Vec<(i64, Option<String>)> = {
            let mut stmt =
                conn.prepare(&format!("SELECT _soupEntryId, soup FROM {}", table_name))?;
            let rows = stmt
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows
        };
        for (id, soup) in rows {
            if let Some(json) = soup {
                let entry: Value = serde_json::from_str(&json)?;
                self.save_external_entry(table_name, id, &entry)?;
            }
        }
        conn.execute(&format!("UPDATE {} SET soup = NULL", table_name), [])?;
        Ok(())
    }
}

fn all_entry_ids(conn: &Connection, table_name: &str) -> StoreResult<Vec<i64>> {
    let mut stmt = conn.prepare(&format!("SELECT _soupEntryId FROM {}", table_name))?;
    let ids = stmt
        .query_map([], |r| r.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}
