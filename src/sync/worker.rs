//! Sync run loops
//!
//! Handles:
//! - Sync down: paged fetch, merge into the soup, resumable cursor
//! - Sync up: push dirty records one at a time
//! - Ghost cleanup: drop local records the server no longer has
//!
//! Every run reports progress through an unbounded channel. The final
//! update (DONE, FAILED or STOPPED) is always the last one sent.

use serde_json::Value;
use smartsql_core::{QuerySpec, SOUP_ENTRY_ID};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::down::{RemoteRecord, SyncDownTarget};
use super::state::{MergeMode, SyncOptions, SyncState, SyncStatus};
use super::target::{
    clean_record, dirty_record_ids, is_dirty, is_locally_created, is_locally_deleted, record_id,
    set_last_error, LOCAL, SYNC_ID,
};
use super::up::SyncUpTarget;
use crate::error::{StoreError, StoreResult};
use crate::storage::SmartStore;

/// Progress updates of one run
pub type UpdateSender = mpsc::UnboundedSender<SyncState>;

/// How a run loop ended without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    Done,
    Stopped,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Run store work on the blocking pool; SQLite and entry file I/O are synchronous
async fn blocking<T, F>(store: &Arc<SmartStore>, work: F) -> StoreResult<T>
where
    F: FnOnce(&SmartStore) -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || work(&store)).await?
}

async fn save_state(store: &Arc<SmartStore>, state: &SyncState) -> StoreResult<()> {
    let mut snapshot = state.clone();
    blocking(store, move |store| snapshot.save(store)).await
}

async fn publish(
    store: &Arc<SmartStore>,
    state: &mut SyncState,
    updates: &UpdateSender,
) -> StoreResult<()> {
    save_state(store, state).await?;
    // A dropped receiver only means nobody is listening
    let _ = updates.send(state.clone());
    Ok(())
}

/// Persist and send the terminal state of a run
async fn finish(
    store: &Arc<SmartStore>,
    mut state: SyncState,
    result: StoreResult<RunOutcome>,
    updates: &UpdateSender,
) -> SyncState {
    match result {
        Ok(RunOutcome::Done) => {
            state.status = SyncStatus::Done;
            state.progress = 100;
            state.page_cursor = None;
            info!("Sync {} done", state.id);
        }
        Ok(RunOutcome::Stopped) => {
            state.status = SyncStatus::Stopped;
            info!("Sync {} stopped at {}%", state.id, state.progress);
        }
        Err(e) => {
            state.status = SyncStatus::Failed;
            state.error = Some(e.to_string());
            error!("Sync {} failed: {}", state.id, e);
        }
    }
    state.end_time = now_millis();
    if let Err(e) = save_state(store, &state).await {
        error!("Failed to persist final state of sync {}: {}", state.id, e);
    }
    let _ = updates.send(state.clone());
    state
}

// ==================== Sync down ====================

pub(crate) async fn run_sync_down(
    store: &Arc<SmartStore>,
    mut state: SyncState,
    target: Arc<dyn SyncDownTarget>,
    updates: &UpdateSender,
    stop_requested: &(dyn Fn() -> bool + Send + Sync),
) -> SyncState {
    let result = sync_down_pages(store, &mut state, target.as_ref(), updates, stop_requested).await;
    finish(store, state, result, updates).await
}

async fn sync_down_pages(
    store: &Arc<SmartStore>,
    state: &mut SyncState,
    target: &dyn SyncDownTarget,
    updates: &UpdateSender,
    stop_requested: &(dyn Fn() -> bool + Send + Sync),
) -> StoreResult<RunOutcome> {
    let soup_name = state.soup_name.clone();
    let id_field = target.id_field_name().to_string();
    let skip: Arc<HashSet<String>> = match state.options.merge_mode {
        MergeMode::LeaveIfChanged => {
            let (soup, field) = (soup_name.clone(), id_field.clone());
            let ids = blocking(store, move |store| dirty_record_ids(store, &soup, &field)).await?;
            Arc::new(ids.into_iter().collect())
        }
        MergeMode::Overwrite => Arc::new(HashSet::new()),
    };

    // Every page of one fetch uses the same high-water mark, including pages
    // fetched after a resume
    let fetch_since = state.max_time_stamp;
    let mut max_seen = state.max_time_stamp;
    let mut processed = 0i64;
    let mut cursor = state.page_cursor.clone();
    debug!(
        "Sync {} down into '{}' since {} (resuming: {})",
        state.id,
        soup_name,
        fetch_since,
        cursor.is_some()
    );

    loop {
        if stop_requested() {
            return Ok(RunOutcome::Stopped);
        }
        let page = target.fetch(fetch_since, cursor.as_deref()).await?;
        let batch_max = target.latest_modification_time_stamp(
            &page.records.iter().map(|r| r.record.clone()).collect::<Vec<_>>(),
        );
        processed += page.records.len() as i64;
        let records = page.records;
        let (sync_id, soup, field, keep) = (state.id, soup_name.clone(), id_field.clone(), skip.clone());
        blocking(store, move |store| {
            save_records(store, sync_id, &soup, &field, records, &keep)
        })
        .await?;

        max_seen = max_seen.max(batch_max);
        if target.is_sorted_by_latest_modification() {
            state.max_time_stamp = max_seen;
        }
        state.total_size = page.total_size;
        state.page_cursor = page.next_cursor.clone();
        state.set_progress(processed, page.total_size);
        cursor = page.next_cursor;
        if cursor.is_none() {
            break;
        }
        publish(store, state, updates).await?;
    }

    state.max_time_stamp = max_seen;
    Ok(RunOutcome::Done)
}

/// Merge one page into the soup, matching existing entries on the id field
fn save_records(
    store: &SmartStore,
    sync_id: i64,
    soup_name: &str,
    id_field: &str,
    records: Vec<RemoteRecord>,
    skip: &HashSet<String>,
) -> StoreResult<()> {
    let mut to_upsert = Vec::with_capacity(records.len());
    let mut to_delete = Vec::new();
    for remote in records {
        let id = record_id(&remote.record, id_field);
        if id.as_ref().is_some_and(|id| skip.contains(id)) {
            continue;
        }
        if remote.is_deleted {
            if let Some(id) = id {
                if let Some(entry_id) =
                    store.lookup_soup_entry_id(soup_name, id_field, &Value::String(id))?
                {
                    to_delete.push(entry_id);
                }
            }
            continue;
        }
        let mut record = remote.record;
        clean_record(&mut record, Some(sync_id))?;
        to_upsert.push(record);
    }

    if !to_upsert.is_empty() {
        store.upsert_entries(soup_name, &to_upsert, Some(id_field))?;
    }
    store.remove_entries(soup_name, &to_delete)?;
    debug!(
        "Sync {}: saved {} and removed {} records in '{}'",
        sync_id,
        to_upsert.len(),
        to_delete.len(),
        soup_name
    );
    Ok(())
}

/// Delete local records written by this sync that the server no longer
/// returns. Dirty records are kept. Returns how many were removed.
pub(crate) async fn clean_ghosts(
    store: &Arc<SmartStore>,
    state: &SyncState,
    target: &dyn SyncDownTarget,
) -> StoreResult<usize> {
    let soup_name = state.soup_name.clone();
    let id_field = target.id_field_name();
    let sql = format!(
        "SELECT {{{soup}:{entry_id}}}, {{{soup}:_soup}} FROM {{{soup}}} WHERE {{{soup}:{local}}} = 0",
        soup = soup_name,
        entry_id = SOUP_ENTRY_ID,
        local = LOCAL
    );
    let rows = blocking(store, move |store| store.query(&QuerySpec::smart(&sql, 0), 0)).await?;

    let mut local: Vec<(i64, String)> = Vec::new();
    for row in rows {
        let Some(cells) = row.as_array() else {
            continue;
        };
        let (Some(entry_id), Some(record)) = (cells.first().and_then(Value::as_i64), cells.get(1)) else {
            continue;
        };
        let written_by_this_sync = match record.get(SYNC_ID).and_then(Value::as_i64) {
            Some(id) => id == state.id,
            None => true,
        };
        if !written_by_this_sync || is_dirty(record) {
            continue;
        }
        if let Some(id) = record_id(record, id_field) {
            local.push((entry_id, id));
        }
    }

    let local_ids: Vec<String> = local.iter().map(|(_, id)| id.clone()).collect();
    let remote = target.remote_ids(&local_ids).await?;
    let ghosts: Vec<i64> = local
        .into_iter()
        .filter(|(_, id)| !remote.contains(id))
        .map(|(entry_id, _)| entry_id)
        .collect();
    let removed = ghosts.len();
    let soup = soup_name.clone();
    blocking(store, move |store| store.remove_entries(&soup, &ghosts)).await?;
    info!(
        "Sync {}: removed {} ghost records from '{}'",
        state.id,
        removed,
        soup_name
    );
    Ok(removed)
}

// ==================== Sync up ====================

pub(crate) async fn run_sync_up(
    store: &Arc<SmartStore>,
    mut state: SyncState,
    target: Arc<dyn SyncUpTarget>,
    updates: &UpdateSender,
    stop_requested: &(dyn Fn() -> bool + Send + Sync),
) -> SyncState {
    let result = sync_up_records(store, &mut state, &target, updates, stop_requested).await;
    finish(store, state, result, updates).await
}

async fn sync_up_records(
    store: &Arc<SmartStore>,
    state: &mut SyncState,
    target: &Arc<dyn SyncUpTarget>,
    updates: &UpdateSender,
    stop_requested: &(dyn Fn() -> bool + Send + Sync),
) -> StoreResult<RunOutcome> {
    let soup_name = state.soup_name.clone();
    let entry_ids = {
        let (target, soup) = (target.clone(), soup_name.clone());
        blocking(store, move |store| target.ids_of_records_to_sync_up(store, &soup)).await?
    };
    let total = entry_ids.len() as i64;
    state.total_size = total;
    state.set_progress(0, total);
    publish(store, state, updates).await?;
    debug!("Sync {} up from '{}': {} dirty records", state.id, soup_name, total);

    for (i, entry_id) in entry_ids.into_iter().enumerate() {
        if stop_requested() {
            return Ok(RunOutcome::Stopped);
        }
        let soup = soup_name.clone();
        let retrieved = blocking(store, move |store| store.retrieve_entries(&soup, &[entry_id])).await?;
        let Some(record) = retrieved.into_iter().next() else {
            continue;
        };
        let synced =
            sync_up_record(store, &soup_name, &state.options, target.as_ref(), record.clone()).await;
        if let Err(e) = synced {
            if matches!(e, StoreError::StoreClosed(_)) {
                return Err(e);
            }
            warn!("Sync {}: record {} not synced: {}", state.id, entry_id, e);
            state.error = Some(e.to_string());
            let mut failed = record;
            set_last_error(&mut failed, &e.to_string())?;
            let soup = soup_name.clone();
            blocking(store, move |store| store.upsert_entry(&soup, failed).map(|_| ())).await?;
        }
        state.set_progress(i as i64 + 1, total);
        if (i as i64 + 1) < total {
            publish(store, state, updates).await?;
        }
    }
    Ok(RunOutcome::Done)
}

async fn sync_up_record(
    store: &Arc<SmartStore>,
    soup_name: &str,
    options: &SyncOptions,
    target: &dyn SyncUpTarget,
    record: Value,
) -> StoreResult<()> {
    if !is_dirty(&record) {
        return Ok(());
    }
    let entry_id = record
        .get(SOUP_ENTRY_ID)
        .and_then(Value::as_i64)
        .ok_or_else(|| StoreError::InternalError("soup entry without id".to_string()))?;
    let created = is_locally_created(&record);
    let deleted = is_locally_deleted(&record);

    // Never reached the server
    if created && deleted {
        return remove_entry(store, soup_name, entry_id).await;
    }
    if options.merge_mode == MergeMode::LeaveIfChanged
        && !created
        && !target.is_newer_than_server(&record).await?
    {
        debug!("Record {} changed on the server, leaving it", entry_id);
        return Ok(());
    }

    if deleted {
        let outcome = target.delete_on_server(&record).await?;
        if outcome.is_success() || outcome.is_not_found() {
            return remove_entry(store, soup_name, entry_id).await;
        }
        return Err(outcome.into_error());
    }
    if created {
        return create_on_server(store, soup_name, options, target, record).await;
    }

    let outcome = target
        .update_on_server(&record, options.fields_for_update())
        .await?;
    if outcome.is_success() {
        save_clean(store, soup_name, record).await
    } else if outcome.is_not_found() && options.merge_mode == MergeMode::Overwrite {
        // Deleted on the server; bring it back
        create_on_server(store, soup_name, options, target, record).await
    } else {
        Err(outcome.into_error())
    }
}

async fn create_on_server(
    store: &Arc<SmartStore>,
    soup_name: &str,
    options: &SyncOptions,
    target: &dyn SyncUpTarget,
    mut record: Value,
) -> StoreResult<()> {
    let outcome = target
        .create_on_server(&record, options.fields_for_create())
        .await?;
    if !outcome.is_success() {
        return Err(outcome.into_error());
    }
    if let (Some(id), Some(obj)) = (outcome.created_id, record.as_object_mut()) {
        obj.insert(target.id_field_name().to_string(), Value::String(id));
    }
    save_clean(store, soup_name, record).await
}

async fn remove_entry(store: &Arc<SmartStore>, soup_name: &str, entry_id: i64) -> StoreResult<()> {
    let soup = soup_name.to_string();
    blocking(store, move |store| store.remove_entries(&soup, &[entry_id])).await
}

async fn save_clean(store: &Arc<SmartStore>, soup_name: &str, mut record: Value) -> StoreResult<()> {
    let sync_id = record.get(SYNC_ID).and_then(Value::as_i64);
    clean_record(&mut record, sync_id)?;
    let soup = soup_name.to_string();
    blocking(store, move |store| store.upsert_entry(&soup, record).map(|_| ())).await
}
