//! In-memory board store.
//!
//! Same cascade semantics as [`super::RocksStore`]. Commits apply to a copy
//! of the tables and swap it in, so a failed commit leaves nothing behind.
//! `fail_next_commit` injects a single `StoreFailure` for rollback tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use uuid::Uuid;

use super::{sort_points, sort_scope, BoardStore, ScopeStore, StoreError, StoreResult, WriteOp, WriteSet};
use crate::model::{
    Checklist, ChecklistId, Comment, CommentId, CommentSection, CommentSectionId, ItemBody, Label,
    LabelId, OrderedItem, Point, PointId, Project, ProjectId, RowId, ScopeKind, ScopeRef, UserId,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    items: BTreeMap<(ScopeKind, Uuid), OrderedItem>,
    projects: BTreeMap<ProjectId, Project>,
    labels: BTreeMap<LabelId, Label>,
    sections: BTreeMap<CommentSectionId, CommentSection>,
    comments: BTreeMap<CommentId, Comment>,
    checklists: BTreeMap<ChecklistId, Checklist>,
    points: BTreeMap<PointId, Point>,
}

impl Tables {
    fn scope(&self, scope: ScopeRef) -> Vec<OrderedItem> {
        let mut items: Vec<OrderedItem> = self
            .items
            .values()
            .filter(|item| item.scope() == scope)
            .cloned()
            .collect();
        sort_scope(&mut items);
        items
    }

    fn apply(&mut self, op: WriteOp) {
        match op {
            WriteOp::PutItem(item) => {
                self.items.insert((item.body.kind(), item.id), item);
            }
            WriteOp::DeleteItem { kind, id } => self.delete_item(kind, id),
            WriteOp::PutProject(project) => {
                self.projects.insert(project.id, project);
            }
            WriteOp::DeleteProject(id) => {
                self.projects.remove(&id);
                for column in self.scope(ScopeRef::columns_of(id)) {
                    self.delete_item(ScopeKind::Columns, column.id);
                }
                self.labels.retain(|_, label| label.project_id != id);
            }
            WriteOp::PutLabel(label) => {
                self.labels.insert(label.id, label);
            }
            WriteOp::DeleteLabel(id) => {
                self.labels.remove(&id);
            }
            WriteOp::PutCommentSection(section) => {
                self.sections.insert(section.id, section);
            }
            WriteOp::DeleteCommentSection(id) => self.delete_section(id),
            WriteOp::PutComment(comment) => {
                self.comments.insert(comment.id, comment);
            }
            WriteOp::DeleteComment(id) => {
                self.comments.remove(&id);
            }
            WriteOp::PutChecklist(checklist) => {
                self.checklists.insert(checklist.id, checklist);
            }
            WriteOp::DeleteChecklist(id) => self.delete_checklist(id),
            WriteOp::PutPoint(point) => {
                self.points.insert(point.id, point);
            }
            WriteOp::DeletePoint(id) => {
                self.points.remove(&id);
            }
        }
    }

    fn checklist_of_row(&self, row_id: RowId) -> Option<&Checklist> {
        self.checklists.values().find(|c| c.row_id == row_id)
    }

    fn delete_checklist(&mut self, id: ChecklistId) {
        self.checklists.remove(&id);
        self.points.retain(|_, point| point.checklist_id != id);
    }

    fn delete_item(&mut self, kind: ScopeKind, id: Uuid) {
        let Some(item) = self.items.remove(&(kind, id)) else {
            return;
        };
        match item.body {
            ItemBody::Column(_) => {
                for row in self.scope(ScopeRef::rows_of(id)) {
                    self.delete_item(ScopeKind::Rows, row.id);
                }
            }
            ItemBody::Row(row) => {
                self.delete_section(row.comment_section_id);
                let checklist = self.checklist_of_row(id).map(|c| c.id);
                if let Some(checklist) = checklist {
                    self.delete_checklist(checklist);
                }
            }
        }
    }

    fn delete_section(&mut self, id: CommentSectionId) {
        self.sections.remove(&id);
        self.comments.retain(|_, comment| comment.section_id != id);
    }
}

/// Volatile [`BoardStore`] used by tests and benchmarks.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_next: AtomicBool,
    commits: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `commit` fail without applying anything.
    pub fn fail_next_commit(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Number of successful commits so far.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    fn tables(&self) -> StoreResult<std::sync::MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }
}

impl ScopeStore for MemoryStore {
    fn load_scope(&self, scope: ScopeRef) -> StoreResult<Vec<OrderedItem>> {
        Ok(self.tables()?.scope(scope))
    }

    fn load_item(&self, kind: ScopeKind, id: Uuid) -> StoreResult<Option<OrderedItem>> {
        Ok(self.tables()?.items.get(&(kind, id)).cloned())
    }

    fn commit(&self, writes: WriteSet) -> StoreResult<()> {
        let mut tables = self.tables()?;
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Database("injected commit failure".into()));
        }
        let mut staged = tables.clone();
        for op in writes.into_ops() {
            staged.apply(op);
        }
        *tables = staged;
        self.commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl BoardStore for MemoryStore {
    fn load_project(&self, id: ProjectId) -> StoreResult<Option<Project>> {
        Ok(self.tables()?.projects.get(&id).cloned())
    }

    fn list_projects_for(&self, user: UserId) -> StoreResult<Vec<Project>> {
        let mut projects: Vec<Project> = self
            .tables()?
            .projects
            .values()
            .filter(|p| {
                p.creator_id == user || p.admin_ids.contains(&user) || p.member_ids.contains(&user)
            })
            .cloned()
            .collect();
        projects.sort_by_key(|p| (p.created_at, p.id));
        Ok(projects)
    }

    fn load_label(&self, id: LabelId) -> StoreResult<Option<Label>> {
        Ok(self.tables()?.labels.get(&id).cloned())
    }

    fn list_labels(&self, project_id: ProjectId) -> StoreResult<Vec<Label>> {
        Ok(self
            .tables()?
            .labels
            .values()
            .filter(|l| l.project_id == project_id)
            .cloned()
            .collect())
    }

    fn load_comment_section(&self, id: CommentSectionId) -> StoreResult<Option<CommentSection>> {
        Ok(self.tables()?.sections.get(&id).cloned())
    }

    fn load_comment(&self, id: CommentId) -> StoreResult<Option<Comment>> {
        Ok(self.tables()?.comments.get(&id).cloned())
    }

    fn list_comments(&self, section_id: CommentSectionId) -> StoreResult<Vec<Comment>> {
        let mut comments: Vec<Comment> = self
            .tables()?
            .comments
            .values()
            .filter(|c| c.section_id == section_id)
            .cloned()
            .collect();
        comments.sort_by_key(|c| (c.created_at, c.id));
        Ok(comments)
    }

    fn load_checklist(&self, id: ChecklistId) -> StoreResult<Option<Checklist>> {
        Ok(self.tables()?.checklists.get(&id).cloned())
    }

    fn checklist_of_row(&self, row_id: RowId) -> StoreResult<Option<Checklist>> {
        Ok(self.tables()?.checklist_of_row(row_id).cloned())
    }

    fn load_point(&self, id: PointId) -> StoreResult<Option<Point>> {
        Ok(self.tables()?.points.get(&id).cloned())
    }

    fn list_points(&self, checklist_id: ChecklistId) -> StoreResult<Vec<Point>> {
        let mut points: Vec<Point> = self
            .tables()?
            .points
            .values()
            .filter(|p| p.checklist_id == checklist_id)
            .cloned()
            .collect();
        sort_points(&mut points);
        Ok(points)
    }
}
