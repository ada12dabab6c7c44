//! Persistent storage for board entities.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐   WriteSet (atomic)   ┌──────────────────────────────┐
//! │ OrderCoordinator │ ────────────────────► │ ScopeStore / BoardStore       │
//! │ BoardService     │ ◄──────────────────── │  RocksStore  (column families)│
//! └──────────────────┘   sorted scope reads  │  MemoryStore (tests)          │
//!                                            └──────────────────────────────┘
//! ```
//!
//! A [`WriteSet`] is the transactional unit: every op in it lands together or
//! not at all. Deletes cascade the way foreign keys would: a project takes its
//! columns and labels, a column its rows, a row its comment section and
//! checklist, a section its comments, a checklist its points.

pub mod memory;
pub mod rocks;

use thiserror::Error;
use uuid::Uuid;

use crate::model::{
    Checklist, ChecklistId, Comment, CommentId, CommentSection, CommentSectionId, Label, LabelId,
    OrderedItem, Point, PointId, Project, ProjectId, RowId, ScopeKind, ScopeRef, UserId,
};

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One staged mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    PutItem(OrderedItem),
    DeleteItem { kind: ScopeKind, id: Uuid },
    PutProject(Project),
    DeleteProject(ProjectId),
    PutLabel(Label),
    DeleteLabel(LabelId),
    PutCommentSection(CommentSection),
    DeleteCommentSection(CommentSectionId),
    PutComment(Comment),
    DeleteComment(CommentId),
    PutChecklist(Checklist),
    DeleteChecklist(ChecklistId),
    PutPoint(Point),
    DeletePoint(PointId),
}

/// Ordered list of mutations committed atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteSet {
    ops: Vec<WriteOp>,
}

impl WriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    pub fn extend(&mut self, other: WriteSet) {
        self.ops.extend(other.ops);
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Ordered-collection persistence consumed by the order coordinator.
pub trait ScopeStore: Send + Sync {
    /// All live items of a scope sorted by `order`, ties broken by id.
    fn load_scope(&self, scope: ScopeRef) -> StoreResult<Vec<OrderedItem>>;

    /// Single item lookup by kind and id.
    fn load_item(&self, kind: ScopeKind, id: Uuid) -> StoreResult<Option<OrderedItem>>;

    /// Apply every op in `writes` atomically.
    fn commit(&self, writes: WriteSet) -> StoreResult<()>;
}

/// Full board persistence: ordered scopes plus the unordered entities.
pub trait BoardStore: ScopeStore {
    fn load_project(&self, id: ProjectId) -> StoreResult<Option<Project>>;

    /// Projects where `user` is creator, admin or member.
    fn list_projects_for(&self, user: UserId) -> StoreResult<Vec<Project>>;

    fn load_label(&self, id: LabelId) -> StoreResult<Option<Label>>;

    fn list_labels(&self, project_id: ProjectId) -> StoreResult<Vec<Label>>;

    fn load_comment_section(&self, id: CommentSectionId) -> StoreResult<Option<CommentSection>>;

    fn load_comment(&self, id: CommentId) -> StoreResult<Option<Comment>>;

    /// Comments of a section, oldest first.
    fn list_comments(&self, section_id: CommentSectionId) -> StoreResult<Vec<Comment>>;

    fn load_checklist(&self, id: ChecklistId) -> StoreResult<Option<Checklist>>;

    fn checklist_of_row(&self, row_id: RowId) -> StoreResult<Option<Checklist>>;

    fn load_point(&self, id: PointId) -> StoreResult<Option<Point>>;

    /// Open points first, then completed ones; oldest first within each.
    fn list_points(&self, checklist_id: ChecklistId) -> StoreResult<Vec<Point>>;
}

pub(crate) fn sort_scope(items: &mut [OrderedItem]) {
    items.sort_by(|a, b| a.order.cmp(&b.order).then(a.id.cmp(&b.id)));
}

pub(crate) fn sort_points(points: &mut [Point]) {
    points.sort_by_key(|p| (p.completed, p.created_at, p.id));
}

pub(crate) fn encode_record<T: serde::Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

pub(crate) fn decode_record<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(value)
}
