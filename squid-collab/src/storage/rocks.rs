//! RocksDB-backed board store.
//!
//! Column families:
//! - `items`: ordered items, keyed `<kind:1><scope_id:16><item_id:16>`
//! - `index`: child id → parent id, keyed `<tag:1><id:16>`
//! - `projects`: project records, keyed `<project_id:16>`
//! - `labels`: labels, keyed `<project_id:16><label_id:16>`
//! - `sections`: comment sections, keyed `<section_id:16>`
//! - `comments`: comments, keyed `<section_id:16><comment_id:16>`
//! - `checklists`: checklists, keyed `<row_id:16>`
//! - `points`: checklist points, keyed `<checklist_id:16><point_id:16>`
//!
//! Values are bincode-encoded records. Each [`WriteSet`] becomes one
//! `WriteBatch`, so a shift and the write that motivated it are never
//! visible separately.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

use super::{
    decode_record, encode_record, sort_points, sort_scope, BoardStore, ScopeStore, StoreError, StoreResult,
    WriteOp, WriteSet,
};
use crate::model::{
    Checklist, ChecklistId, Comment, CommentId, CommentSection, CommentSectionId, ItemBody, Label,
    LabelId, OrderedItem, Point, PointId, Project, ProjectId, RowId, ScopeKind, ScopeRef, UserId,
};

const CF_ITEMS: &str = "items";
const CF_INDEX: &str = "index";
const CF_PROJECTS: &str = "projects";
const CF_LABELS: &str = "labels";
const CF_SECTIONS: &str = "sections";
const CF_COMMENTS: &str = "comments";
const CF_CHECKLISTS: &str = "checklists";
const CF_POINTS: &str = "points";

const COLUMN_FAMILIES: &[&str] = &[
    CF_ITEMS,
    CF_INDEX,
    CF_PROJECTS,
    CF_LABELS,
    CF_SECTIONS,
    CF_COMMENTS,
    CF_CHECKLISTS,
    CF_POINTS,
];

/// Index tags. Item tags reuse the `ScopeKind` discriminants.
const TAG_LABEL: u8 = 3;
const TAG_COMMENT: u8 = 4;
const TAG_CHECKLIST: u8 = 5;
const TAG_POINT: u8 = 6;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every batch (default: true, mutations are user-facing)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("squid_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 512,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// RocksDB-backed implementation of [`BoardStore`].
pub struct RocksStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes batch construction so cascade scans see a stable tree.
    commit_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store, creating the database and column families if missing.
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened board store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            commit_lock: Mutex::new(()),
        })
    }

    fn cf_options(config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_compression_type(DBCompressionType::Lz4);
        opts
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> StoreResult<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family '{name}' not found")))
    }

    fn get<T: serde::de::DeserializeOwned>(&self, cf: &str, key: &[u8]) -> StoreResult<Option<T>> {
        match self.db.get_cf(self.cf(cf)?, key)? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All `(key, value)` pairs whose key starts with `prefix`.
    fn scan_prefix(&self, cf: &str, prefix: &[u8]) -> StoreResult<Vec<(Box<[u8]>, Box<[u8]>)>> {
        let iter = self
            .db
            .iterator_cf(self.cf(cf)?, IteratorMode::From(prefix, Direction::Forward));
        let mut out = Vec::new();
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key, value));
        }
        Ok(out)
    }

    fn index_parent(&self, tag: u8, id: Uuid) -> StoreResult<Option<Uuid>> {
        match self.db.get_cf(self.cf(CF_INDEX)?, index_key(tag, id))? {
            Some(bytes) => Ok(Some(uuid_from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    // ─── Batch staging ────────────────────────────────────────────────

    fn stage(&self, batch: &mut WriteBatch, op: WriteOp) -> StoreResult<()> {
        match op {
            WriteOp::PutItem(item) => {
                let tag = item.body.kind() as u8;
                batch.put_cf(
                    self.cf(CF_ITEMS)?,
                    item_key(item.scope(), item.id),
                    encode_record(&item)?,
                );
                batch.put_cf(
                    self.cf(CF_INDEX)?,
                    index_key(tag, item.id),
                    item.scope_id.as_bytes(),
                );
            }
            WriteOp::DeleteItem { kind, id } => {
                if let Some(item) = self.load_item(kind, id)? {
                    self.stage_delete_item(batch, &item)?;
                }
            }
            WriteOp::PutProject(project) => {
                batch.put_cf(self.cf(CF_PROJECTS)?, project.id.as_bytes(), encode_record(&project)?);
            }
            WriteOp::DeleteProject(id) => self.stage_delete_project(batch, id)?,
            WriteOp::PutLabel(label) => {
                batch.put_cf(
                    self.cf(CF_LABELS)?,
                    pair_key(label.project_id, label.id),
                    encode_record(&label)?,
                );
                batch.put_cf(
                    self.cf(CF_INDEX)?,
                    index_key(TAG_LABEL, label.id),
                    label.project_id.as_bytes(),
                );
            }
            WriteOp::DeleteLabel(id) => {
                if let Some(project_id) = self.index_parent(TAG_LABEL, id)? {
                    batch.delete_cf(self.cf(CF_LABELS)?, pair_key(project_id, id));
                    batch.delete_cf(self.cf(CF_INDEX)?, index_key(TAG_LABEL, id));
                }
            }
            WriteOp::PutCommentSection(section) => {
                batch.put_cf(self.cf(CF_SECTIONS)?, section.id.as_bytes(), encode_record(&section)?);
            }
            WriteOp::DeleteCommentSection(id) => self.stage_delete_section(batch, id)?,
            WriteOp::PutComment(comment) => {
                batch.put_cf(
                    self.cf(CF_COMMENTS)?,
                    pair_key(comment.section_id, comment.id),
                    encode_record(&comment)?,
                );
                batch.put_cf(
                    self.cf(CF_INDEX)?,
                    index_key(TAG_COMMENT, comment.id),
                    comment.section_id.as_bytes(),
                );
            }
            WriteOp::DeleteComment(id) => {
                if let Some(section_id) = self.index_parent(TAG_COMMENT, id)? {
                    batch.delete_cf(self.cf(CF_COMMENTS)?, pair_key(section_id, id));
                    batch.delete_cf(self.cf(CF_INDEX)?, index_key(TAG_COMMENT, id));
                }
            }
            WriteOp::PutChecklist(checklist) => {
                batch.put_cf(
                    self.cf(CF_CHECKLISTS)?,
                    checklist.row_id.as_bytes(),
                    encode_record(&checklist)?,
                );
                batch.put_cf(
                    self.cf(CF_INDEX)?,
                    index_key(TAG_CHECKLIST, checklist.id),
                    checklist.row_id.as_bytes(),
                );
            }
            WriteOp::DeleteChecklist(id) => {
                if let Some(checklist) = self.load_checklist(id)? {
                    self.stage_delete_checklist(batch, &checklist)?;
                }
            }
            WriteOp::PutPoint(point) => {
                batch.put_cf(
                    self.cf(CF_POINTS)?,
                    pair_key(point.checklist_id, point.id),
                    encode_record(&point)?,
                );
                batch.put_cf(
                    self.cf(CF_INDEX)?,
                    index_key(TAG_POINT, point.id),
                    point.checklist_id.as_bytes(),
                );
            }
            WriteOp::DeletePoint(id) => {
                if let Some(checklist_id) = self.index_parent(TAG_POINT, id)? {
                    batch.delete_cf(self.cf(CF_POINTS)?, pair_key(checklist_id, id));
                    batch.delete_cf(self.cf(CF_INDEX)?, index_key(TAG_POINT, id));
                }
            }
        }
        Ok(())
    }

    fn stage_delete_item(&self, batch: &mut WriteBatch, item: &OrderedItem) -> StoreResult<()> {
        batch.delete_cf(self.cf(CF_ITEMS)?, item_key(item.scope(), item.id));
        batch.delete_cf(self.cf(CF_INDEX)?, index_key(item.body.kind() as u8, item.id));
        match &item.body {
            ItemBody::Column(_) => {
                for row in self.load_scope(ScopeRef::rows_of(item.id))? {
                    self.stage_delete_item(batch, &row)?;
                }
            }
            ItemBody::Row(row) => {
                self.stage_delete_section(batch, row.comment_section_id)?;
                if let Some(checklist) = self.checklist_of_row(item.id)? {
                    self.stage_delete_checklist(batch, &checklist)?;
                }
            }
        }
        Ok(())
    }

    fn stage_delete_checklist(&self, batch: &mut WriteBatch, checklist: &Checklist) -> StoreResult<()> {
        batch.delete_cf(self.cf(CF_CHECKLISTS)?, checklist.row_id.as_bytes());
        batch.delete_cf(self.cf(CF_INDEX)?, index_key(TAG_CHECKLIST, checklist.id));
        for (key, _) in self.scan_prefix(CF_POINTS, checklist.id.as_bytes())? {
            let point_id = uuid_from_slice(&key[16..])?;
            batch.delete_cf(self.cf(CF_INDEX)?, index_key(TAG_POINT, point_id));
            batch.delete_cf(self.cf(CF_POINTS)?, &key);
        }
        Ok(())
    }

    fn stage_delete_section(&self, batch: &mut WriteBatch, id: CommentSectionId) -> StoreResult<()> {
        batch.delete_cf(self.cf(CF_SECTIONS)?, id.as_bytes());
        for (key, _) in self.scan_prefix(CF_COMMENTS, id.as_bytes())? {
            let comment_id = uuid_from_slice(&key[16..])?;
            batch.delete_cf(self.cf(CF_INDEX)?, index_key(TAG_COMMENT, comment_id));
            batch.delete_cf(self.cf(CF_COMMENTS)?, &key);
        }
        Ok(())
    }

    fn stage_delete_project(&self, batch: &mut WriteBatch, id: ProjectId) -> StoreResult<()> {
        batch.delete_cf(self.cf(CF_PROJECTS)?, id.as_bytes());
        for column in self.load_scope(ScopeRef::columns_of(id))? {
            self.stage_delete_item(batch, &column)?;
        }
        for (key, _) in self.scan_prefix(CF_LABELS, id.as_bytes())? {
            let label_id = uuid_from_slice(&key[16..])?;
            batch.delete_cf(self.cf(CF_INDEX)?, index_key(TAG_LABEL, label_id));
            batch.delete_cf(self.cf(CF_LABELS)?, &key);
        }
        Ok(())
    }
}

impl ScopeStore for RocksStore {
    fn load_scope(&self, scope: ScopeRef) -> StoreResult<Vec<OrderedItem>> {
        let prefix = scope_prefix(scope);
        let mut items = self
            .scan_prefix(CF_ITEMS, &prefix)?
            .into_iter()
            .map(|(_, value)| decode_record::<OrderedItem>(&value))
            .collect::<StoreResult<Vec<_>>>()?;
        sort_scope(&mut items);
        Ok(items)
    }

    fn load_item(&self, kind: ScopeKind, id: Uuid) -> StoreResult<Option<OrderedItem>> {
        let Some(scope_id) = self.index_parent(kind as u8, id)? else {
            return Ok(None);
        };
        let scope = ScopeRef { kind, id: scope_id };
        self.get(CF_ITEMS, &item_key(scope, id))
    }

    fn commit(&self, writes: WriteSet) -> StoreResult<()> {
        let _guard = self
            .commit_lock
            .lock()
            .map_err(|_| StoreError::Database("commit lock poisoned".into()))?;

        let op_count = writes.len();
        let mut batch = WriteBatch::default();
        for op in writes.into_ops() {
            self.stage(&mut batch, op)?;
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        log::trace!("Committed batch of {op_count} ops");
        Ok(())
    }
}

impl BoardStore for RocksStore {
    fn load_project(&self, id: ProjectId) -> StoreResult<Option<Project>> {
        self.get(CF_PROJECTS, id.as_bytes())
    }

    fn list_projects_for(&self, user: UserId) -> StoreResult<Vec<Project>> {
        let iter = self.db.iterator_cf(self.cf(CF_PROJECTS)?, IteratorMode::Start);
        let mut projects = Vec::new();
        for item in iter {
            let (_, value) = item?;
            let project: Project = decode_record(&value)?;
            if project.creator_id == user
                || project.admin_ids.contains(&user)
                || project.member_ids.contains(&user)
            {
                projects.push(project);
            }
        }
        projects.sort_by_key(|p| (p.created_at, p.id));
        Ok(projects)
    }

    fn load_label(&self, id: LabelId) -> StoreResult<Option<Label>> {
        match self.index_parent(TAG_LABEL, id)? {
            Some(project_id) => self.get(CF_LABELS, &pair_key(project_id, id)),
            None => Ok(None),
        }
    }

    fn list_labels(&self, project_id: ProjectId) -> StoreResult<Vec<Label>> {
        self.scan_prefix(CF_LABELS, project_id.as_bytes())?
            .into_iter()
            .map(|(_, value)| decode_record(&value))
            .collect()
    }

    fn load_comment_section(&self, id: CommentSectionId) -> StoreResult<Option<CommentSection>> {
        self.get(CF_SECTIONS, id.as_bytes())
    }

    fn load_comment(&self, id: CommentId) -> StoreResult<Option<Comment>> {
        match self.index_parent(TAG_COMMENT, id)? {
            Some(section_id) => self.get(CF_COMMENTS, &pair_key(section_id, id)),
            None => Ok(None),
        }
    }

    fn list_comments(&self, section_id: CommentSectionId) -> StoreResult<Vec<Comment>> {
        let mut comments = self
            .scan_prefix(CF_COMMENTS, section_id.as_bytes())?
            .into_iter()
            .map(|(_, value)| decode_record::<Comment>(&value))
            .collect::<StoreResult<Vec<_>>>()?;
        comments.sort_by_key(|c| (c.created_at, c.id));
        Ok(comments)
    }

    fn load_checklist(&self, id: ChecklistId) -> StoreResult<Option<Checklist>> {
        match self.index_parent(TAG_CHECKLIST, id)? {
            Some(row_id) => self.checklist_of_row(row_id),
            None => Ok(None),
        }
    }

    fn checklist_of_row(&self, row_id: RowId) -> StoreResult<Option<Checklist>> {
        self.get(CF_CHECKLISTS, row_id.as_bytes())
    }

    fn load_point(&self, id: PointId) -> StoreResult<Option<Point>> {
        match self.index_parent(TAG_POINT, id)? {
            Some(checklist_id) => self.get(CF_POINTS, &pair_key(checklist_id, id)),
            None => Ok(None),
        }
    }

    fn list_points(&self, checklist_id: ChecklistId) -> StoreResult<Vec<Point>> {
        let mut points = self
            .scan_prefix(CF_POINTS, checklist_id.as_bytes())?
            .into_iter()
            .map(|(_, value)| decode_record::<Point>(&value))
            .collect::<StoreResult<Vec<_>>>()?;
        sort_points(&mut points);
        Ok(points)
    }
}

fn scope_prefix(scope: ScopeRef) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.push(scope.kind as u8);
    key.extend_from_slice(scope.id.as_bytes());
    key
}

fn item_key(scope: ScopeRef, id: Uuid) -> Vec<u8> {
    let mut key = scope_prefix(scope);
    key.extend_from_slice(id.as_bytes());
    key
}

fn index_key(tag: u8, id: Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(17);
    key.push(tag);
    key.extend_from_slice(id.as_bytes());
    key
}

fn pair_key(parent: Uuid, id: Uuid) -> Vec<u8> {
    let mut key = Vec::with_capacity(32);
    key.extend_from_slice(parent.as_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

fn uuid_from_slice(bytes: &[u8]) -> StoreResult<Uuid> {
    Uuid::from_slice(bytes).map_err(|_| StoreError::Corrupt(format!("invalid uuid key of {} bytes", bytes.len())))
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
