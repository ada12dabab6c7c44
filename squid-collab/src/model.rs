//! Board entities and the ordered-item representation shared by columns and rows.
//!
//! Columns live in a dense `1..=N` sequence per project, rows in a dense
//! sequence per column. Both are persisted as [`OrderedItem`]s; the typed
//! [`Column`] / [`Row`] views are what handlers and subscribers see.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use uuid::Uuid;

pub type UserId = Uuid;
pub type ProjectId = Uuid;
pub type ColumnId = Uuid;
pub type RowId = Uuid;
pub type LabelId = Uuid;
pub type CommentSectionId = Uuid;
pub type CommentId = Uuid;
pub type ChecklistId = Uuid;
pub type PointId = Uuid;

/// Which kind of children a scope holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ScopeKind {
    /// Columns inside a project
    Columns = 1,
    /// Rows inside a column
    Rows = 2,
}

/// A parent entity that owns one dense ordered sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeRef {
    pub kind: ScopeKind,
    pub id: Uuid,
}

impl ScopeRef {
    pub fn columns_of(project_id: ProjectId) -> Self {
        Self {
            kind: ScopeKind::Columns,
            id: project_id,
        }
    }

    pub fn rows_of(column_id: ColumnId) -> Self {
        Self {
            kind: ScopeKind::Rows,
            id: column_id,
        }
    }
}

impl std::fmt::Display for ScopeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            ScopeKind::Columns => write!(f, "columns of project {}", self.id),
            ScopeKind::Rows => write!(f, "rows of column {}", self.id),
        }
    }
}

/// Row priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    Medium,
    High,
}

/// Column-specific attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnBody {
    pub name: String,
    pub label_id: Option<LabelId>,
}

/// Row-specific attributes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowBody {
    pub name: String,
    pub description: Option<String>,
    pub creator_id: UserId,
    pub priority: Option<Priority>,
    pub label_id: Option<LabelId>,
    pub assignee_ids: Vec<UserId>,
    /// Seconds since epoch
    pub due_date: Option<u64>,
    pub comment_section_id: CommentSectionId,
}

/// Entity payload carried by an ordered item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemBody {
    Column(ColumnBody),
    Row(RowBody),
}

impl ItemBody {
    pub fn kind(&self) -> ScopeKind {
        match self {
            ItemBody::Column(_) => ScopeKind::Columns,
            ItemBody::Row(_) => ScopeKind::Rows,
        }
    }

    pub fn label_id(&self) -> Option<LabelId> {
        match self {
            ItemBody::Column(c) => c.label_id,
            ItemBody::Row(r) => r.label_id,
        }
    }

    pub fn clear_label(&mut self) {
        match self {
            ItemBody::Column(c) => c.label_id = None,
            ItemBody::Row(r) => r.label_id = None,
        }
    }
}

/// Any entity living in a dense per-scope sequence.
///
/// Only the scope store assigns `order`; callers request logical positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderedItem {
    pub id: Uuid,
    pub scope_id: Uuid,
    pub order: i64,
    pub body: ItemBody,
}

impl OrderedItem {
    pub fn new(scope: ScopeRef, body: ItemBody) -> Self {
        debug_assert_eq!(scope.kind, body.kind());
        Self {
            id: Uuid::new_v4(),
            scope_id: scope.id,
            order: 0,
            body,
        }
    }

    pub fn scope(&self) -> ScopeRef {
        ScopeRef {
            kind: self.body.kind(),
            id: self.scope_id,
        }
    }
}

/// Column view sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub id: ColumnId,
    pub project_id: ProjectId,
    pub name: String,
    pub order: i64,
    pub label_id: Option<LabelId>,
}

impl Column {
    pub fn from_item(item: &OrderedItem) -> Option<Self> {
        match &item.body {
            ItemBody::Column(body) => Some(Self {
                id: item.id,
                project_id: item.scope_id,
                name: body.name.clone(),
                order: item.order,
                label_id: body.label_id,
            }),
            ItemBody::Row(_) => None,
        }
    }
}

/// Row view sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    pub id: RowId,
    pub column_id: ColumnId,
    pub name: String,
    pub description: Option<String>,
    pub order: i64,
    pub creator_id: UserId,
    pub priority: Option<Priority>,
    pub label_id: Option<LabelId>,
    pub assignee_ids: Vec<UserId>,
    pub due_date: Option<u64>,
    pub comment_section_id: CommentSectionId,
}

impl Row {
    pub fn from_item(item: &OrderedItem) -> Option<Self> {
        match &item.body {
            ItemBody::Row(body) => Some(Self {
                id: item.id,
                column_id: item.scope_id,
                name: body.name.clone(),
                description: body.description.clone(),
                order: item.order,
                creator_id: body.creator_id,
                priority: body.priority,
                label_id: body.label_id,
                assignee_ids: body.assignee_ids.clone(),
                due_date: body.due_date,
                comment_section_id: body.comment_section_id,
            }),
            ItemBody::Column(_) => None,
        }
    }
}

/// Project record. Creator, admins and members are disjoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub description: Option<String>,
    pub creator_id: UserId,
    pub admin_ids: Vec<UserId>,
    pub member_ids: Vec<UserId>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// What a label can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LabelTarget {
    Column,
    Row,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub id: LabelId,
    pub project_id: ProjectId,
    pub target: LabelTarget,
    pub name: String,
    pub color: String,
}

/// Discussion thread attached to exactly one row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentSection {
    pub id: CommentSectionId,
    pub row_id: RowId,
    pub can_comment: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: CommentId,
    pub section_id: CommentSectionId,
    pub author_id: UserId,
    pub text: String,
    pub created_at: u64,
}

/// At most one per row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checklist {
    pub id: ChecklistId,
    pub row_id: RowId,
}

/// One checklist entry. `completed_at`/`completed_by` are set only while
/// `completed` is true.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub id: PointId,
    pub checklist_id: ChecklistId,
    pub name: String,
    pub description: Option<String>,
    pub completed: bool,
    pub completed_at: Option<u64>,
    pub completed_by: Option<UserId>,
    pub created_at: u64,
}

impl Point {
    /// Flip completion on behalf of `user`.
    pub fn toggle(&mut self, user: UserId, now: u64) {
        self.completed = !self.completed;
        if self.completed {
            self.completed_at = Some(now);
            self.completed_by = Some(user);
        } else {
            self.completed_at = None;
            self.completed_by = None;
        }
    }
}

/// Seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
