//! VM Store (spec §4.5/§3). Generalizes `features/vms::repo`
//! (`VmRow` + `insert/list/get/update_state/delete_row`, with a
//! `#[cfg(test)]` in-memory `HashMap` swap guarded by a `OnceLock<Mutex<_>>`)
//! to the full `VmRecord` column set plus a sibling `snapshot` table.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::model::{SnapshotMeta, VmRecord};
use sandbox_types::{ProvisionMode, SnapshotKind, VmState};

#[derive(Clone, sqlx::FromRow)]
struct VmRow {
    id: Uuid,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    cpu: i32,
    mem_mb: i32,
    vsock_cid: i32,
    tap_name: String,
    guest_ip: String,
    outbound_internet: bool,
    allow_ips: Vec<String>,
    rootfs_path: String,
    kernel_path: String,
    logs_dir: String,
    image_id: Option<String>,
    state: String,
    provision_mode: Option<String>,
}

impl VmRow {
    fn from_record(r: &VmRecord) -> Self {
        Self {
            id: r.id,
            created_at: r.created_at,
            updated_at: r.updated_at,
            cpu: r.cpu as i32,
            mem_mb: r.mem_mb as i32,
            vsock_cid: r.vsock_cid as i32,
            tap_name: r.tap_name.clone(),
            guest_ip: r.guest_ip.clone(),
            outbound_internet: r.outbound_internet,
            allow_ips: r.allow_ips.clone(),
            rootfs_path: r.rootfs_path.clone(),
            kernel_path: r.kernel_path.clone(),
            logs_dir: r.logs_dir.clone(),
            image_id: r.image_id.clone(),
            state: r.state.as_str().to_string(),
            provision_mode: r.provision_mode.map(|m| m.as_str().to_string()),
        }
    }

    fn into_record(self) -> CoreResult<VmRecord> {
        Ok(VmRecord {
            id: self.id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            cpu: self.cpu as u32,
            mem_mb: self.mem_mb as u32,
            vsock_cid: self.vsock_cid as u32,
            tap_name: self.tap_name,
            guest_ip: self.guest_ip,
            outbound_internet: self.outbound_internet,
            allow_ips: self.allow_ips,
            rootfs_path: self.rootfs_path,
            kernel_path: self.kernel_path,
            logs_dir: self.logs_dir,
            image_id: self.image_id,
            state: VmState::from_str(&self.state)
                .map_err(|e| CoreError::StorageFailure(format!("corrupt vm.state: {e}")))?,
            provision_mode: self
                .provision_mode
                .map(|m| ProvisionMode::from_str(&m))
                .transpose()
                .map_err(|e| CoreError::StorageFailure(format!("corrupt vm.provision_mode: {e}")))?,
        })
    }
}

#[derive(Clone, sqlx::FromRow)]
struct SnapshotRow {
    id: String,
    kind: String,
    created_at: DateTime<Utc>,
    cpu: i32,
    mem_mb: i32,
    image_id: Option<String>,
    source_vm_id: Option<Uuid>,
    has_disk: bool,
}

impl SnapshotRow {
    fn from_meta(m: &SnapshotMeta) -> Self {
        Self {
            id: m.id.clone(),
            kind: m.kind.as_str().to_string(),
            created_at: m.created_at,
            cpu: m.cpu as i32,
            mem_mb: m.mem_mb as i32,
            image_id: m.image_id.clone(),
            source_vm_id: m.source_vm_id,
            has_disk: m.has_disk,
        }
    }

    fn into_meta(self) -> CoreResult<SnapshotMeta> {
        Ok(SnapshotMeta {
            id: self.id,
            kind: SnapshotKind::from_str(&self.kind)
                .map_err(|e| CoreError::StorageFailure(format!("corrupt snapshot.kind: {e}")))?,
            created_at: self.created_at,
            cpu: self.cpu as u32,
            mem_mb: self.mem_mb as u32,
            image_id: self.image_id,
            source_vm_id: self.source_vm_id,
            has_disk: self.has_disk,
        })
    }
}

pub struct Store {
    db: PgPool,
}

impl Store {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn create(&self, vm: &VmRecord) -> CoreResult<()> {
        insert(&self.db, &VmRow::from_record(vm)).await?;
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> CoreResult<VmRecord> {
        get(&self.db, id).await?.into_record()
    }

    pub async fn list(&self) -> CoreResult<Vec<VmRecord>> {
        let rows = list(&self.db).await?;
        rows.into_iter()
            .filter(|r| r.state != VmState::Deleted.as_str())
            .map(VmRow::into_record)
            .collect()
    }

    pub async fn count_active(&self) -> CoreResult<usize> {
        Ok(self.list().await?.len())
    }

    /// Read-modify-write within a single logical step (spec §4.5/§9 "Opaque
    /// database access" — preserve the create/update/get/list/delete
    /// contract; races are prevented by orchestrator per-VM locking, not here).
    pub async fn update<F>(&self, id: Uuid, mutate: F) -> CoreResult<VmRecord>
    where
        F: FnOnce(&mut VmRecord),
    {
        let mut record = self.get(id).await?;
        mutate(&mut record);
        record.updated_at = Utc::now();
        update_row(&self.db, &VmRow::from_record(&record)).await?;
        Ok(record)
    }

    pub async fn delete(&self, id: Uuid) -> CoreResult<()> {
        delete_row(&self.db, id).await?;
        Ok(())
    }

    pub async fn create_snapshot_meta(&self, meta: &SnapshotMeta) -> CoreResult<()> {
        insert_snapshot(&self.db, &SnapshotRow::from_meta(meta)).await?;
        Ok(())
    }

    pub async fn get_snapshot_meta(&self, id: &str) -> CoreResult<SnapshotMeta> {
        get_snapshot(&self.db, id).await?.into_meta()
    }

    pub async fn list_snapshot_meta(&self) -> CoreResult<Vec<SnapshotMeta>> {
        list_snapshots(&self.db)
            .await?
            .into_iter()
            .map(SnapshotRow::into_meta)
            .collect()
    }

    /// Invariant 6: on restart, transient states imply a dead hypervisor.
    /// Normalize them to STOPPED in a single startup pass rather than the
    /// periodic reconciler tick, since there is no remote agent
    /// inventory to reconcile against in this single-process layout.
    pub async fn normalize_on_startup(&self) -> CoreResult<usize> {
        let rows = list(&self.db).await?;
        let mut fixed = 0;
        for row in rows {
            if matches!(
                row.state.as_str(),
                "starting" | "running" | "stopping"
            ) {
                let id = row.id;
                update_state(&self.db, id, VmState::Stopped.as_str()).await?;
                fixed += 1;
            }
        }
        Ok(fixed)
    }

    pub async fn all_guest_ips(&self) -> CoreResult<Vec<String>> {
        Ok(self.list().await?.into_iter().map(|v| v.guest_ip).collect())
    }
}

#[cfg(not(test))]
async fn insert(db: &PgPool, row: &VmRow) -> sqlx::Result<()> {
    sqlx::query(
        r#"INSERT INTO vm
           (id, created_at, updated_at, cpu, mem_mb, vsock_cid, tap_name, guest_ip,
            outbound_internet, allow_ips, rootfs_path, kernel_path, logs_dir, image_id,
            state, provision_mode)
           VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16)"#,
    )
    .bind(row.id)
    .bind(row.created_at)
    .bind(row.updated_at)
    .bind(row.cpu)
    .bind(row.mem_mb)
    .bind(row.vsock_cid)
    .bind(&row.tap_name)
    .bind(&row.guest_ip)
    .bind(row.outbound_internet)
    .bind(&row.allow_ips)
    .bind(&row.rootfs_path)
    .bind(&row.kernel_path)
    .bind(&row.logs_dir)
    .bind(&row.image_id)
    .bind(&row.state)
    .bind(&row.provision_mode)
    .execute(db)
    .await?;
    Ok(())
}

#[cfg(not(test))]
async fn list(db: &PgPool) -> sqlx::Result<Vec<VmRow>> {
    sqlx::query_as::<_, VmRow>(r#"SELECT * FROM vm ORDER BY created_at DESC"#)
        .fetch_all(db)
        .await
}

#[cfg(not(test))]
async fn get(db: &PgPool, id: Uuid) -> sqlx::Result<VmRow> {
    sqlx::query_as::<_, VmRow>(r#"SELECT * FROM vm WHERE id=$1"#)
        .bind(id)
        .fetch_one(db)
        .await
}

#[cfg(not(test))]
async fn update_row(db: &PgPool, row: &VmRow) -> sqlx::Result<()> {
    sqlx::query(
        r#"UPDATE vm SET
             updated_at=$2, cpu=$3, mem_mb=$4, vsock_cid=$5, tap_name=$6, guest_ip=$7,
             outbound_internet=$8, allow_ips=$9, rootfs_path=$10, kernel_path=$11,
             logs_dir=$12, image_id=$13, state=$14, provision_mode=$15
           WHERE id=$1"#,
    )
    .bind(row.id)
    .bind(row.updated_at)
    .bind(row.cpu)
    .bind(row.mem_mb)
    .bind(row.vsock_cid)
    .bind(&row.tap_name)
    .bind(&row.guest_ip)
    .bind(row.outbound_internet)
    .bind(&row.allow_ips)
    .bind(&row.rootfs_path)
    .bind(&row.kernel_path)
    .bind(&row.logs_dir)
    .bind(&row.image_id)
    .bind(&row.state)
    .bind(&row.provision_mode)
    .execute(db)
    .await?;
    Ok(())
}

#[cfg(not(test))]
async fn update_state(db: &PgPool, id: Uuid, state: &str) -> sqlx::Result<()> {
    sqlx::query(r#"UPDATE vm SET state=$2, updated_at=now() WHERE id=$1"#)
        .bind(id)
        .bind(state)
        .execute(db)
        .await?;
    Ok(())
}

#[cfg(not(test))]
async fn delete_row(db: &PgPool, id: Uuid) -> sqlx::Result<()> {
    sqlx::query(r#"UPDATE vm SET state=$2, updated_at=now() WHERE id=$1"#)
        .bind(id)
        .bind(VmState::Deleted.as_str())
        .execute(db)
        .await?;
    Ok(())
}

#[cfg(not(test))]
async fn insert_snapshot(db: &PgPool, row: &SnapshotRow) -> sqlx::Result<()> {
    sqlx::query(
        r#"INSERT INTO snapshot (id, kind, created_at, cpu, mem_mb, image_id, source_vm_id, has_disk)
           VALUES ($1,$2,$3,$4,$5,$6,$7,$8)"#,
    )
    .bind(&row.id)
    .bind(&row.kind)
    .bind(row.created_at)
    .bind(row.cpu)
    .bind(row.mem_mb)
    .bind(&row.image_id)
    .bind(row.source_vm_id)
    .bind(row.has_disk)
    .execute(db)
    .await?;
    Ok(())
}

#[cfg(not(test))]
async fn get_snapshot(db: &PgPool, id: &str) -> sqlx::Result<SnapshotRow> {
    sqlx::query_as::<_, SnapshotRow>(r#"SELECT * FROM snapshot WHERE id=$1"#)
        .bind(id)
        .fetch_one(db)
        .await
}

#[cfg(not(test))]
async fn list_snapshots(db: &PgPool) -> sqlx::Result<Vec<SnapshotRow>> {
    sqlx::query_as::<_, SnapshotRow>(r#"SELECT * FROM snapshot ORDER BY created_at DESC"#)
        .fetch_all(db)
        .await
}

#[cfg(test)]
async fn insert(_: &PgPool, row: &VmRow) -> sqlx::Result<()> {
    vm_store().lock().unwrap().insert(row.id, row.clone());
    Ok(())
}

#[cfg(test)]
async fn list(_: &PgPool) -> sqlx::Result<Vec<VmRow>> {
    let mut rows: Vec<VmRow> = vm_store().lock().unwrap().values().cloned().collect();
    rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(rows)
}

#[cfg(test)]
async fn get(_: &PgPool, id: Uuid) -> sqlx::Result<VmRow> {
    vm_store()
        .lock()
        .unwrap()
        .get(&id)
        .cloned()
        .ok_or(sqlx::Error::RowNotFound)
}

#[cfg(test)]
async fn update_row(_: &PgPool, row: &VmRow) -> sqlx::Result<()> {
    vm_store().lock().unwrap().insert(row.id, row.clone());
    Ok(())
}

#[cfg(test)]
async fn update_state(_: &PgPool, id: Uuid, state: &str) -> sqlx::Result<()> {
    let mut guard = vm_store().lock().unwrap();
    let row = guard.get_mut(&id).ok_or(sqlx::Error::RowNotFound)?;
    row.state = state.to_string();
    row.updated_at = Utc::now();
    Ok(())
}

#[cfg(test)]
async fn delete_row(_: &PgPool, id: Uuid) -> sqlx::Result<()> {
    let mut guard = vm_store().lock().unwrap();
    let row = guard.get_mut(&id).ok_or(sqlx::Error::RowNotFound)?;
    row.state = VmState::Deleted.as_str().to_string();
    row.updated_at = Utc::now();
    Ok(())
}

#[cfg(test)]
async fn insert_snapshot(_: &PgPool, row: &SnapshotRow) -> sqlx::Result<()> {
    snapshot_store().lock().unwrap().insert(row.id.clone(), row.clone());
    Ok(())
}

#[cfg(test)]
async fn get_snapshot(_: &PgPool, id: &str) -> sqlx::Result<SnapshotRow> {
    snapshot_store()
        .lock()
        .unwrap()
        .get(id)
        .cloned()
        .ok_or(sqlx::Error::RowNotFound)
}

#[cfg(test)]
async fn list_snapshots(_: &PgPool) -> sqlx::Result<Vec<SnapshotRow>> {
    let mut rows: Vec<SnapshotRow> = snapshot_store().lock().unwrap().values().cloned().collect();
    rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(rows)
}

#[cfg(test)]
fn vm_store() -> &'static Mutex<HashMap<Uuid, VmRow>> {
    static STORE: OnceLock<Mutex<HashMap<Uuid, VmRow>>> = OnceLock::new();
    STORE.get_or_init(|| Mutex::new(HashMap::new()))
}

#[cfg(test)]
fn snapshot_store() -> &'static Mutex<HashMap<String, SnapshotRow>> {
    static STORE: OnceLock<Mutex<HashMap<String, SnapshotRow>>> = OnceLock::new();
    STORE.get_or_init(|| Mutex::new(HashMap::new()))
}

#[cfg(test)]
pub fn reset_store() {
    vm_store().lock().unwrap().clear();
    snapshot_store().lock().unwrap().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_types::VmState;

    fn sample() -> VmRecord {
        VmRecord {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            cpu: 1,
            mem_mb: 256,
            vsock_cid: 10,
            tap_name: "tap-2".into(),
            guest_ip: "10.42.0.2".into(),
            outbound_internet: true,
            allow_ips: vec!["1.2.3.4/32".into()],
            rootfs_path: "/x".into(),
            kernel_path: "/y".into(),
            logs_dir: "/z".into(),
            image_id: None,
            state: VmState::Starting,
            provision_mode: Some(ProvisionMode::Boot),
        }
    }

    fn fake_pool() -> PgPool {
        // never touched in #[cfg(test)] query paths above, but a Store
        // needs *a* PgPool value to hold.
        PgPool::connect_lazy("postgres://unused/unused").unwrap()
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        reset_store();
        let store = Store::new(fake_pool());
        let vm = sample();
        store.create(&vm).await.unwrap();
        let fetched = store.get(vm.id).await.unwrap();
        assert_eq!(fetched.guest_ip, vm.guest_ip);
        assert_eq!(fetched.state, VmState::Starting);
    }

    #[tokio::test]
    async fn normalize_on_startup_clears_transient_states() {
        reset_store();
        let store = Store::new(fake_pool());
        let vm = sample();
        store.create(&vm).await.unwrap();
        let fixed = store.normalize_on_startup().await.unwrap();
        assert_eq!(fixed, 1);
        let after = store.get(vm.id).await.unwrap();
        assert_eq!(after.state, VmState::Stopped);
    }

    #[tokio::test]
    async fn delete_marks_deleted_and_excludes_from_list() {
        reset_store();
        let store = Store::new(fake_pool());
        let vm = sample();
        store.create(&vm).await.unwrap();
        store.delete(vm.id).await.unwrap();
        let listed = store.list().await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn update_applies_mutator_and_bumps_updated_at() {
        reset_store();
        let store = Store::new(fake_pool());
        let vm = sample();
        store.create(&vm).await.unwrap();
        let updated = store
            .update(vm.id, |r| r.state = VmState::Running)
            .await
            .unwrap();
        assert_eq!(updated.state, VmState::Running);
    }
}
